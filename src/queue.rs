//! Queue directory naming, listing, and the capture sequence counter.
//!
//! Captured exchanges land as `{id}.qlog`, optional debug copies as
//! `{id}.mlog`, distilled documents as `{id}.qtxt`. Name order is processing
//! order; files are written under a temporary name and renamed into place.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use tempfile::NamedTempFile;

use crate::constants::{MLOG_EXT, QLOG_EXT, QTXT_EXT};
use crate::error::Result;
use crate::types::SequenceId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueKind {
    /// Captured exchange awaiting transform.
    Captured,
    /// Debug copy of an exchange; never consumed by the pipeline.
    Debug,
    /// Distilled document awaiting index.
    Distilled,
}

impl QueueKind {
    #[must_use]
    pub fn extension(self) -> &'static str {
        match self {
            Self::Captured => QLOG_EXT,
            Self::Debug => MLOG_EXT,
            Self::Distilled => QTXT_EXT,
        }
    }

    fn from_extension(ext: &str) -> Option<Self> {
        match ext {
            QLOG_EXT => Some(Self::Captured),
            MLOG_EXT => Some(Self::Debug),
            QTXT_EXT => Some(Self::Distilled),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueEntry {
    pub id: SequenceId,
    pub path: PathBuf,
    pub modified: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct QueueDirectory {
    dir: PathBuf,
}

impl QueueDirectory {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs_err::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.dir
    }

    #[must_use]
    pub fn path_for(&self, id: SequenceId, kind: QueueKind) -> PathBuf {
        self.dir.join(format!("{id}.{}", kind.extension()))
    }

    /// Fresh temporary file inside the queue directory, deleted on drop.
    pub fn temp_file(&self) -> Result<NamedTempFile> {
        Ok(tempfile::Builder::new()
            .prefix("pending-")
            .suffix(".tmp")
            .tempfile_in(&self.dir)?)
    }

    /// Entries of `kind` in ascending id order. Names that are not a
    /// 9-digit id are skipped.
    pub fn list(&self, kind: QueueKind) -> Result<Vec<QueueEntry>> {
        let mut entries = Vec::new();
        for dirent in fs_err::read_dir(&self.dir)? {
            let dirent = dirent?;
            let path = dirent.path();
            let Some((id, entry_kind)) = parse_queue_name(&path) else {
                continue;
            };
            if entry_kind != kind {
                continue;
            }
            let modified = match dirent.metadata().and_then(|meta| meta.modified()) {
                Ok(time) => DateTime::<Utc>::from(time),
                Err(err) => {
                    // raced with a concurrent removal
                    tracing::debug!(path = %path.display(), error = %err, "queue entry vanished");
                    continue;
                }
            };
            entries.push(QueueEntry { id, path, modified });
        }
        entries.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(entries)
    }

    /// Highest id present under any queue extension.
    pub fn max_id(&self) -> Result<Option<SequenceId>> {
        let mut max = None;
        for dirent in fs_err::read_dir(&self.dir)? {
            if let Some((id, _)) = parse_queue_name(&dirent?.path()) {
                max = max.max(Some(id));
            }
        }
        Ok(max)
    }
}

fn parse_queue_name(path: &Path) -> Option<(SequenceId, QueueKind)> {
    let kind = QueueKind::from_extension(path.extension()?.to_str()?)?;
    let id = path.file_stem()?.to_str()?.parse().ok()?;
    Some((id, kind))
}

#[derive(Debug, Default)]
struct CounterState {
    last: Option<SequenceId>,
    initialised: bool,
    last_issued_at: Option<DateTime<Utc>>,
}

/// Process-wide capture counter, shared by every proxy worker.
///
/// The first call scans the queue directory for the highest existing id.
#[derive(Debug)]
pub struct SequenceCounter {
    queue: QueueDirectory,
    state: Mutex<CounterState>,
}

impl SequenceCounter {
    #[must_use]
    pub fn new(queue: QueueDirectory) -> Self {
        Self {
            queue,
            state: Mutex::new(CounterState::default()),
        }
    }

    pub fn issue(&self) -> Result<SequenceId> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if !state.initialised {
            state.last = self.queue.max_id()?;
            state.initialised = true;
            tracing::debug!(last = ?state.last, "sequence counter initialised");
        }
        let next = state.last.map_or(SequenceId(1), SequenceId::next);
        state.last = Some(next);
        state.last_issued_at = Some(Utc::now());
        Ok(next)
    }

    /// Wall-clock time of the most recent `issue`, `None` if nothing was
    /// captured in this process yet.
    #[must_use]
    pub fn last_issued_at(&self) -> Option<DateTime<Utc>> {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .last_issued_at
    }

    #[must_use]
    pub fn queue(&self) -> &QueueDirectory {
        &self.queue
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn list_filters_kind_and_bad_names() {
        let dir = TempDir::new().unwrap();
        let queue = QueueDirectory::open(dir.path()).unwrap();
        for name in [
            "000000003.qlog",
            "000000001.qlog",
            "000000002.qtxt",
            "000000004.mlog",
            "12.qlog",
            "abcdefghi.qlog",
            ".qlog",
            "000000009.tmp",
        ] {
            std::fs::write(dir.path().join(name), b"x").unwrap();
        }
        let ids: Vec<u64> = queue
            .list(QueueKind::Captured)
            .unwrap()
            .into_iter()
            .map(|entry| entry.id.0)
            .collect();
        assert_eq!(ids, vec![1, 3]);
        assert_eq!(queue.list(QueueKind::Distilled).unwrap().len(), 1);
        assert_eq!(queue.max_id().unwrap(), Some(SequenceId(4)));
    }

    #[test]
    fn counter_resumes_after_existing_files() {
        let dir = TempDir::new().unwrap();
        let queue = QueueDirectory::open(dir.path()).unwrap();
        std::fs::write(queue.path_for(SequenceId(41), QueueKind::Distilled), b"x").unwrap();

        let counter = SequenceCounter::new(queue);
        assert!(counter.last_issued_at().is_none());
        assert_eq!(counter.issue().unwrap(), SequenceId(42));
        assert_eq!(counter.issue().unwrap(), SequenceId(43));
        assert!(counter.last_issued_at().is_some());
    }

    #[test]
    fn counter_starts_at_one_in_empty_queue() {
        let dir = TempDir::new().unwrap();
        let counter = SequenceCounter::new(QueueDirectory::open(dir.path()).unwrap());
        assert_eq!(counter.issue().unwrap(), SequenceId(1));
    }

    #[test]
    fn counter_is_shared_across_threads() {
        let dir = TempDir::new().unwrap();
        let counter = std::sync::Arc::new(SequenceCounter::new(
            QueueDirectory::open(dir.path()).unwrap(),
        ));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let counter = counter.clone();
                std::thread::spawn(move || {
                    (0..25).map(|_| counter.issue().unwrap().0).collect::<Vec<_>>()
                })
            })
            .collect();
        let mut all: Vec<u64> = handles.into_iter().flat_map(|h| h.join().unwrap()).collect();
        all.sort_unstable();
        assert_eq!(all, (1..=100).collect::<Vec<_>>());
    }
}
