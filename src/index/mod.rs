//! Search index collaborator used by the index stage.
//!
//! The pipeline only needs to add documents, look up the newest archived
//! version of a URI, and commit. [`MemoryIndex`] is always available;
//! [`TantivyIndex`] is built with the `lex` feature.

#[cfg(feature = "lex")]
mod tantivy;

#[cfg(feature = "lex")]
pub use self::tantivy::TantivyIndex;

use crate::error::Result;
use crate::types::{DocMeta, DocumentId};

pub trait SearchIndex {
    /// Adds a document. It need not be visible to queries until `close`.
    fn add(&mut self, id: DocumentId, meta: &DocMeta, text: &str) -> Result<()>;

    /// Newest committed document with exactly this URI.
    fn latest_by_uri(&self, uri: &str) -> Result<Option<DocMeta>>;

    /// Documents added so far, committed or not.
    fn count(&self) -> Result<u64>;

    /// Commits pending documents.
    fn close(&mut self) -> Result<()>;
}

impl<T: SearchIndex + ?Sized> SearchIndex for Box<T> {
    fn add(&mut self, id: DocumentId, meta: &DocMeta, text: &str) -> Result<()> {
        (**self).add(id, meta, text)
    }

    fn latest_by_uri(&self, uri: &str) -> Result<Option<DocMeta>> {
        (**self).latest_by_uri(uri)
    }

    fn count(&self) -> Result<u64> {
        (**self).count()
    }

    fn close(&mut self) -> Result<()> {
        (**self).close()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexedDocument {
    pub id: DocumentId,
    pub meta: DocMeta,
    pub text: String,
}

/// In-process index; documents become queryable on `close`.
#[derive(Debug, Default)]
pub struct MemoryIndex {
    committed: Vec<IndexedDocument>,
    pending: Vec<IndexedDocument>,
    closes: usize,
}

impl MemoryIndex {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn documents(&self) -> &[IndexedDocument] {
        &self.committed
    }

    /// Number of times `close` ran.
    #[must_use]
    pub fn closes(&self) -> usize {
        self.closes
    }
}

impl SearchIndex for MemoryIndex {
    fn add(&mut self, id: DocumentId, meta: &DocMeta, text: &str) -> Result<()> {
        self.pending.push(IndexedDocument {
            id,
            meta: meta.clone(),
            text: text.to_string(),
        });
        Ok(())
    }

    fn latest_by_uri(&self, uri: &str) -> Result<Option<DocMeta>> {
        Ok(self
            .committed
            .iter()
            .filter(|doc| doc.meta.uri == uri)
            .max_by_key(|doc| doc.meta.timestamp)
            .map(|doc| doc.meta.clone()))
    }

    fn count(&self) -> Result<u64> {
        Ok((self.committed.len() + self.pending.len()) as u64)
    }

    fn close(&mut self) -> Result<()> {
        self.committed.append(&mut self.pending);
        self.closes += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    #[test]
    fn latest_by_uri_sees_only_committed_newest() {
        let mut index = MemoryIndex::new();
        let now = Utc::now();
        let older = DocMeta::new("http://a/", now - Duration::days(3));
        let newer = DocMeta::new("http://a/", now);
        index.add(DocumentId(0), &newer, "new").unwrap();
        index.add(DocumentId(1), &older, "old").unwrap();
        assert_eq!(index.latest_by_uri("http://a/").unwrap(), None);
        assert_eq!(index.count().unwrap(), 2);

        index.close().unwrap();
        assert_eq!(index.latest_by_uri("http://a/").unwrap(), Some(newer));
        assert_eq!(index.latest_by_uri("http://b/").unwrap(), None);
        assert_eq!(index.closes(), 1);
    }
}
