//! Tantivy-backed [`SearchIndex`].

use std::path::Path;

use tantivy::collector::DocSetCollector;
use tantivy::directory::MmapDirectory;
use tantivy::query::TermQuery;
use tantivy::schema::{
    Field, INDEXED, IndexRecordOption, STORED, STRING, Schema, TEXT, Value,
};
use tantivy::{Index, IndexReader, IndexWriter, ReloadPolicy, TantivyDocument, Term, doc};

use super::SearchIndex;
use crate::error::{Result, TrawlError};
use crate::types::{DocMeta, DocumentId};

const WRITER_HEAP_BYTES: usize = 50_000_000;

#[derive(Clone, Copy)]
struct Fields {
    uri: Field,
    doc_id: Field,
    title: Field,
    body: Field,
    meta: Field,
}

fn build_schema() -> (Schema, Fields) {
    let mut builder = Schema::builder();
    let fields = Fields {
        uri: builder.add_text_field("uri", STRING | STORED),
        doc_id: builder.add_u64_field("doc_id", INDEXED | STORED),
        title: builder.add_text_field("title", TEXT | STORED),
        body: builder.add_text_field("body", TEXT),
        meta: builder.add_text_field("meta", STORED),
    };
    (builder.build(), fields)
}

pub struct TantivyIndex {
    index: Index,
    reader: IndexReader,
    writer: Option<IndexWriter>,
    fields: Fields,
    pending: u64,
}

impl TantivyIndex {
    /// Opens the index in `dir`, creating it if needed.
    pub fn open(dir: &Path) -> Result<Self> {
        fs_err::create_dir_all(dir)?;
        let (schema, fields) = build_schema();
        let directory = MmapDirectory::open(dir).map_err(|err| TrawlError::Index {
            reason: err.to_string(),
        })?;
        let index = Index::open_or_create(directory, schema)?;
        let reader = index
            .reader_builder()
            .reload_policy(ReloadPolicy::Manual)
            .try_into()?;
        tracing::debug!(dir = %dir.display(), "search index opened");
        Ok(Self {
            index,
            reader,
            writer: None,
            fields,
            pending: 0,
        })
    }

    fn writer(&mut self) -> Result<&mut IndexWriter> {
        let writer = match self.writer.take() {
            Some(writer) => writer,
            None => self.index.writer(WRITER_HEAP_BYTES)?,
        };
        Ok(self.writer.insert(writer))
    }
}

impl SearchIndex for TantivyIndex {
    fn add(&mut self, id: DocumentId, meta: &DocMeta, text: &str) -> Result<()> {
        let fields = self.fields;
        let document = doc!(
            fields.uri => meta.uri.as_str(),
            fields.doc_id => id.0,
            fields.title => meta.title.as_deref().unwrap_or_default(),
            fields.body => text,
            fields.meta => serde_json::to_string(meta)?,
        );
        self.writer()?.add_document(document)?;
        self.pending += 1;
        Ok(())
    }

    fn latest_by_uri(&self, uri: &str) -> Result<Option<DocMeta>> {
        let searcher = self.reader.searcher();
        let query = TermQuery::new(
            Term::from_field_text(self.fields.uri, uri),
            IndexRecordOption::Basic,
        );
        let mut latest: Option<DocMeta> = None;
        for address in searcher.search(&query, &DocSetCollector)? {
            let stored: TantivyDocument = searcher.doc(address)?;
            let Some(json) = stored.get_first(self.fields.meta).and_then(|v| v.as_str()) else {
                continue;
            };
            let meta: DocMeta = serde_json::from_str(json)?;
            if latest.as_ref().is_none_or(|best| meta.timestamp > best.timestamp) {
                latest = Some(meta);
            }
        }
        Ok(latest)
    }

    fn count(&self) -> Result<u64> {
        Ok(self.reader.searcher().num_docs() + self.pending)
    }

    /// Commits, waits for background merges, and refreshes the reader.
    fn close(&mut self) -> Result<()> {
        if let Some(mut writer) = self.writer.take() {
            writer.commit()?;
            writer.wait_merging_threads()?;
            self.reader.reload()?;
            tracing::debug!(committed = self.pending, "search index committed");
            self.pending = 0;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use tempfile::TempDir;

    #[test]
    fn newest_version_wins_and_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let now = Utc::now();
        let mut older = DocMeta::new("http://example.com/a", now - Duration::days(10));
        older.etag = Some("\"v1\"".into());
        let mut newer = DocMeta::new("http://example.com/a", now);
        newer.etag = Some("\"v2\"".into());

        {
            let mut index = TantivyIndex::open(dir.path()).unwrap();
            index.add(DocumentId(0), &older, "first body").unwrap();
            index.add(DocumentId(1), &newer, "second body").unwrap();
            index
                .add(DocumentId(2), &DocMeta::new("http://example.com/b", now), "other")
                .unwrap();
            assert_eq!(index.count().unwrap(), 3);
            index.close().unwrap();
            assert_eq!(index.count().unwrap(), 3);
        }

        let index = TantivyIndex::open(dir.path()).unwrap();
        let found = index.latest_by_uri("http://example.com/a").unwrap().unwrap();
        assert_eq!(found.etag.as_deref(), Some("\"v2\""));
        assert!(index.latest_by_uri("http://example.com/c").unwrap().is_none());
    }
}
