//! Background thread that drains the capture queue during quiet periods.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};

use crate::archive::{DocumentArchive, IdAllocator};
use crate::constants::{
    DEFAULT_MAX_DECODED_BYTES, DEFAULT_MAX_URI_LEN, DEFAULT_POLL_SECS, DEFAULT_SIMILARITY_DAYS,
    MAX_POLL_SECS,
};
use crate::distill::Distiller;
use crate::error::{Result, TrawlError};
use crate::index::SearchIndex;
use crate::pipeline::index::IndexStage;
use crate::pipeline::transform::TransformStage;
use crate::pipeline::trigger::{IndexTrigger, TriggerThresholds, decide_index, proxy_idle};
use crate::queue::{QueueKind, SequenceCounter};
use crate::shutdown::Shutdown;
use crate::types::StageCounts;

/// Longest uninterrupted sleep; bounds shutdown latency.
const SLEEP_SLICE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerSettings {
    pub poll: Duration,
    /// Ceiling for `poll` after repeated failures.
    pub max_poll: Duration,
    pub thresholds: TriggerThresholds,
    pub similarity: chrono::Duration,
    pub max_uri_len: usize,
    /// Largest decoded body the distiller will read.
    pub max_decoded_bytes: u64,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            poll: Duration::from_secs(DEFAULT_POLL_SECS),
            max_poll: Duration::from_secs(MAX_POLL_SECS),
            thresholds: TriggerThresholds::default(),
            similarity: chrono::Duration::days(DEFAULT_SIMILARITY_DAYS),
            max_uri_len: DEFAULT_MAX_URI_LEN,
            max_decoded_bytes: DEFAULT_MAX_DECODED_BYTES,
        }
    }
}

/// What one tick did. A stage that did not run is `None`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TickReport {
    pub transformed: Option<StageCounts>,
    pub indexed: Option<StageCounts>,
    pub trigger: IndexTrigger,
}

/// Transform and index stages with the collaborators they run against.
pub struct Pipeline {
    counter: Arc<SequenceCounter>,
    distiller: Box<dyn Distiller + Send>,
    index: Box<dyn SearchIndex + Send>,
    archive: DocumentArchive,
    allocator: IdAllocator,
    settings: SchedulerSettings,
}

impl Pipeline {
    pub fn new(
        counter: Arc<SequenceCounter>,
        distiller: Box<dyn Distiller + Send>,
        index: Box<dyn SearchIndex + Send>,
        archive: DocumentArchive,
        settings: SchedulerSettings,
    ) -> Self {
        let allocator = IdAllocator::new(archive.path());
        Self {
            counter,
            distiller,
            index,
            archive,
            allocator,
            settings,
        }
    }

    #[must_use]
    pub fn settings(&self) -> &SchedulerSettings {
        &self.settings
    }

    pub fn archive_mut(&mut self) -> &mut DocumentArchive {
        &mut self.archive
    }

    pub fn run_tick(&mut self, force: bool) -> Result<TickReport> {
        self.run_tick_at(Utc::now(), force)
    }

    /// One scheduling decision at `now`. Transform runs when forced or the
    /// proxy is quiet; index additionally needs the trigger to fire.
    pub fn run_tick_at(&mut self, now: DateTime<Utc>, force: bool) -> Result<TickReport> {
        let queue = self.counter.queue().clone();
        let last_issued = self.counter.last_issued_at();
        let thresholds = self.settings.thresholds;
        let idle = proxy_idle(now, last_issued, thresholds.interval);

        let mut transformed = None;
        if force || idle {
            if !queue.list(QueueKind::Captured)?.is_empty() {
                transformed = Some(
                    TransformStage::new(&queue, self.distiller.as_ref(), self.settings.max_uri_len)
                        .with_max_decoded_bytes(self.settings.max_decoded_bytes)
                        .run()?,
                );
            }
        }

        let distilled = queue.list(QueueKind::Distilled)?;
        let oldest = distilled.iter().map(|entry| entry.modified).min();
        let trigger = decide_index(now, last_issued, distilled.len(), oldest, &thresholds);
        tracing::debug!(queued = distilled.len(), ?trigger, idle, force, "index decision");

        let mut indexed = None;
        if !distilled.is_empty() && (force || (idle && trigger.should_index())) {
            indexed = Some(
                IndexStage::new(
                    &queue,
                    &mut self.archive,
                    &self.allocator,
                    self.index.as_mut(),
                    self.settings.similarity,
                )
                .run()?,
            );
        }

        Ok(TickReport {
            transformed,
            indexed,
            trigger,
        })
    }
}

/// Control surface of a running scheduler thread.
pub struct SchedulerHandle {
    force: Arc<AtomicBool>,
    shutdown: Shutdown,
    thread: JoinHandle<()>,
}

impl SchedulerHandle {
    /// Makes the next tick run now and ignore the quiet-period checks.
    pub fn force_index(&self) {
        self.force.store(true, Ordering::SeqCst);
    }

    pub fn shutdown(&self) {
        self.shutdown.trigger();
    }

    pub fn join(self) -> Result<()> {
        self.thread.join().map_err(|_| TrawlError::ThreadPanicked {
            thread: "pipeline-scheduler",
        })
    }
}

/// Starts the scheduler thread. It stops when `shutdown` triggers.
pub fn spawn(mut pipeline: Pipeline, shutdown: Shutdown) -> Result<SchedulerHandle> {
    let force = Arc::new(AtomicBool::new(false));
    let thread = {
        let force = force.clone();
        let shutdown = shutdown.clone();
        thread::Builder::new()
            .name("pipeline-scheduler".into())
            .spawn(move || scheduler_loop(&mut pipeline, &force, &shutdown))?
    };
    Ok(SchedulerHandle {
        force,
        shutdown,
        thread,
    })
}

fn scheduler_loop(pipeline: &mut Pipeline, force: &AtomicBool, shutdown: &Shutdown) {
    let base = pipeline.settings.poll.min(pipeline.settings.max_poll);
    let ceiling = pipeline.settings.max_poll;
    let mut delay = base;
    tracing::info!(poll_secs = base.as_secs(), "scheduler started");

    loop {
        wait(delay, force, shutdown);
        if shutdown.is_triggered() {
            break;
        }
        let forced = force.swap(false, Ordering::SeqCst);
        match catch_unwind(AssertUnwindSafe(|| pipeline.run_tick(forced))) {
            Ok(Ok(report)) => {
                if report.transformed.is_some() || report.indexed.is_some() {
                    tracing::debug!(?report, "tick finished");
                }
                delay = base;
            }
            Ok(Err(err)) => {
                delay = (delay * 2).min(ceiling);
                tracing::error!(error = %error_chain(&err), next_secs = delay.as_secs(), "scheduler tick failed");
            }
            Err(_) => {
                delay = (delay * 2).min(ceiling);
                tracing::error!(next_secs = delay.as_secs(), "scheduler tick panicked");
            }
        }
    }
    tracing::info!("scheduler stopped");
}

/// Sleeps up to `delay` in short slices, returning early on shutdown or a
/// forced tick.
fn wait(delay: Duration, force: &AtomicBool, shutdown: &Shutdown) {
    let deadline = Instant::now() + delay;
    loop {
        if shutdown.is_triggered() || force.load(Ordering::SeqCst) {
            return;
        }
        let now = Instant::now();
        if now >= deadline {
            return;
        }
        thread::sleep((deadline - now).min(SLEEP_SLICE));
    }
}

fn error_chain(err: &TrawlError) -> String {
    let mut chain = err.to_string();
    let mut source = std::error::Error::source(err);
    while let Some(cause) = source {
        chain.push_str(": ");
        chain.push_str(&cause.to_string());
        source = cause.source();
    }
    chain
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distill::HtmlDistiller;
    use crate::index::MemoryIndex;
    use crate::pipeline::transform::DistilledDocument;
    use crate::queue::QueueDirectory;
    use crate::types::{DocMeta, SequenceId};
    use tempfile::TempDir;

    fn pipeline(dir: &TempDir, settings: SchedulerSettings) -> (Pipeline, Arc<SequenceCounter>) {
        let queue = QueueDirectory::open(dir.path().join("logs")).unwrap();
        let counter = Arc::new(SequenceCounter::new(queue));
        let archive = DocumentArchive::open(dir.path().join("archive")).unwrap();
        let pipeline = Pipeline::new(
            counter.clone(),
            Box::new(HtmlDistiller::default()),
            Box::new(MemoryIndex::new()),
            archive,
            settings,
        );
        (pipeline, counter)
    }

    fn enqueue_distilled(counter: &SequenceCounter, uri: &str) -> SequenceId {
        let id = counter.issue().unwrap();
        let queue = counter.queue();
        let document = DistilledDocument {
            meta: DocMeta::new(uri, Utc::now()),
            text: "text".into(),
        };
        let file = document.write_to(queue.temp_file().unwrap()).unwrap();
        file.persist(queue.path_for(id, QueueKind::Distilled)).unwrap();
        id
    }

    #[test]
    fn busy_proxy_defers_index_until_forced() {
        let dir = TempDir::new().unwrap();
        let (mut pipeline, counter) = pipeline(&dir, SchedulerSettings::default());
        enqueue_distilled(&counter, "http://a/");

        // a capture was issued just now, so the proxy is not idle
        let report = pipeline.run_tick(false).unwrap();
        assert_eq!(report.indexed, None);
        assert_eq!(report.trigger, IndexTrigger::Wait);

        let report = pipeline.run_tick(true).unwrap();
        assert_eq!(report.indexed, Some(StageCounts { processed: 1, discarded: 0 }));
        assert!(counter.queue().list(QueueKind::Distilled).unwrap().is_empty());
    }

    #[test]
    fn quiet_proxy_indexes_once_threshold_reached() {
        let dir = TempDir::new().unwrap();
        let mut settings = SchedulerSettings::default();
        settings.thresholds.num_doc = 2;
        let (mut pipeline, counter) = pipeline(&dir, settings);
        enqueue_distilled(&counter, "http://a/");

        let later = Utc::now() + chrono::Duration::minutes(5);
        let report = pipeline.run_tick_at(later, false).unwrap();
        assert_eq!(report.trigger, IndexTrigger::Wait);
        assert_eq!(report.indexed, None);

        enqueue_distilled(&counter, "http://b/");
        let later = Utc::now() + chrono::Duration::minutes(5);
        let report = pipeline.run_tick_at(later, false).unwrap();
        assert_eq!(report.trigger, IndexTrigger::Threshold);
        assert_eq!(report.indexed, Some(StageCounts { processed: 2, discarded: 0 }));
    }

    #[test]
    fn thread_honours_force_and_shutdown() {
        let dir = TempDir::new().unwrap();
        let settings = SchedulerSettings {
            poll: Duration::from_secs(3600),
            ..SchedulerSettings::default()
        };
        let (pipeline, counter) = pipeline(&dir, settings);
        enqueue_distilled(&counter, "http://a/");

        let shutdown = Shutdown::new();
        let handle = spawn(pipeline, shutdown.clone()).unwrap();
        handle.force_index();
        let deadline = Instant::now() + Duration::from_secs(10);
        while !counter.queue().list(QueueKind::Distilled).unwrap().is_empty() {
            assert!(Instant::now() < deadline, "forced tick never ran");
            thread::sleep(Duration::from_millis(20));
        }
        handle.shutdown();
        handle.join().unwrap();
        assert!(shutdown.is_triggered());
    }

    #[test]
    fn error_chain_includes_sources() {
        let err = TrawlError::from(std::io::Error::other("disk gone"));
        assert!(error_chain(&err).contains("disk gone"));
    }
}
