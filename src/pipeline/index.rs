//! Distilled documents (`.qtxt`) into the archive and search index.

use std::collections::HashMap;

use chrono::Duration;

use crate::archive::{DocumentArchive, IdAllocator};
use crate::error::Result;
use crate::index::SearchIndex;
use crate::pipeline::transform::DistilledDocument;
use crate::queue::{QueueDirectory, QueueEntry, QueueKind};
use crate::types::{DocMeta, DocumentId, StageCounts};

/// True when `candidate` adds nothing over `prior`: same version key, or
/// captured within `window` of it.
#[must_use]
pub fn is_similar(prior: &DocMeta, candidate: &DocMeta, window: Duration) -> bool {
    if candidate.same_version(prior) {
        return true;
    }
    (candidate.timestamp - prior.timestamp).abs() < window
}

pub struct IndexStage<'a, I: SearchIndex + ?Sized> {
    queue: &'a QueueDirectory,
    archive: &'a mut DocumentArchive,
    allocator: &'a IdAllocator,
    index: &'a mut I,
    similarity: Duration,
    /// Newest version archived during this run, by URI.
    written: HashMap<String, DocMeta>,
}

impl<'a, I: SearchIndex + ?Sized> IndexStage<'a, I> {
    pub fn new(
        queue: &'a QueueDirectory,
        archive: &'a mut DocumentArchive,
        allocator: &'a IdAllocator,
        index: &'a mut I,
        similarity: Duration,
    ) -> Self {
        Self {
            queue,
            archive,
            allocator,
            index,
            similarity,
            written: HashMap::new(),
        }
    }

    /// Indexes every queued document, then closes the archive shard and
    /// commits the index. Each source file is removed whatever its outcome.
    pub fn run(mut self) -> Result<StageCounts> {
        let mut counts = StageCounts::default();
        for entry in self.queue.list(QueueKind::Distilled)? {
            match self.index_one(&entry) {
                Ok(Some(id)) => {
                    tracing::debug!(exchange.id = %entry.id, doc.id = %id, "indexed");
                    counts.processed += 1;
                }
                Ok(None) => counts.discarded += 1,
                Err(err) => {
                    tracing::warn!(exchange.id = %entry.id, error = %err, "index failed");
                    counts.discarded += 1;
                }
            }
            if let Err(err) = fs_err::remove_file(&entry.path) {
                tracing::warn!(exchange.id = %entry.id, error = %err, "could not remove distilled file");
            }
        }

        self.archive.close();
        self.index.close()?;
        if counts.processed + counts.discarded > 0 {
            tracing::info!(
                indexed = counts.processed,
                discarded = counts.discarded,
                "index stage finished"
            );
        }
        Ok(counts)
    }

    fn index_one(&mut self, entry: &QueueEntry) -> Result<Option<DocumentId>> {
        let raw = fs_err::read(&entry.path)?;
        let document = DistilledDocument::parse(&raw)?;
        let meta = &document.meta;

        let prior = match self.written.get(&meta.uri) {
            Some(prior) => Some(prior.clone()),
            None => self.index.latest_by_uri(&meta.uri)?,
        };
        if let Some(prior) = prior {
            if is_similar(&prior, meta, self.similarity) {
                tracing::debug!(uri = %meta.uri, "similar version already archived");
                return Ok(None);
            }
        }

        let id = self.allocator.new_id()?;
        self.archive.add(id, &raw)?;
        self.index.add(id, meta, &document.text)?;
        self.written.insert(meta.uri.clone(), document.meta);
        Ok(Some(id))
    }
}
