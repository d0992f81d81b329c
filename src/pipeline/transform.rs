//! Captured exchanges (`.qlog`) to distilled documents (`.qtxt`).

use std::io::Write;

use chrono::{DateTime, Utc};
use url::Url;

use crate::constants::DEFAULT_MAX_DECODED_BYTES;
use crate::distill::Distiller;
use crate::error::{Result, TrawlError};
use crate::io::{BoundedReader, decode_body, read_frames, write_frame};
use crate::queue::{QueueDirectory, QueueEntry, QueueKind};
use crate::types::{DistillOutcome, DocMeta, ExchangeMetadata, RequestHead, ResponseHead, StageCounts};

/// Parsed content of a `.qlog` file.
#[derive(Debug, Clone)]
pub struct CapturedExchange {
    pub request: RequestHead,
    pub response: ResponseHead,
    pub metadata: ExchangeMetadata,
    /// Body exactly as received, still transfer and content encoded.
    pub body: Vec<u8>,
}

impl CapturedExchange {
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let mut frames = read_frames(std::io::Cursor::new(bytes))?;
        if frames.len() != 3 {
            return Err(TrawlError::malformed(
                0,
                format!("expected 3 frames, found {}", frames.len()),
            ));
        }
        let body = frames.pop().unwrap_or_default();
        let header = frames.pop().unwrap_or_default();
        let request = RequestHead::parse(&frames[0])?;
        let response = ResponseHead::parse(&header)?;
        let metadata = ExchangeMetadata::derive(&request, Some(&response), body.len() as u64, false);
        Ok(Self {
            request,
            response,
            metadata,
            body,
        })
    }

    /// Document metadata for this exchange captured at `timestamp`.
    #[must_use]
    pub fn doc_meta(&self, timestamp: DateTime<Utc>, max_uri_len: usize) -> DocMeta {
        let mut meta = DocMeta::new(canonical_uri(&self.metadata.uri, max_uri_len), timestamp);
        meta.last_modified = self.metadata.header("last-modified").map(str::to_string);
        meta.etag = self
            .metadata
            .header("etag")
            .map(str::to_string)
            .or_else(|| meta.last_modified.clone())
            .or_else(|| Some(format!("W/\"len-{}\"", self.metadata.bytes_received)));
        meta.content_type = self.metadata.ctype.clone();
        meta.referer = self.request.headers.get("referer").map(str::to_string);
        meta.content_length = self.metadata.content_length.unwrap_or(self.metadata.bytes_received);
        meta
    }
}

/// Canonical form of `uri`, at most `max_len` bytes.
///
/// Drops the fragment and default port and lowercases scheme and host;
/// unparseable input is only truncated.
#[must_use]
pub fn canonical_uri(uri: &str, max_len: usize) -> String {
    let canonical = match Url::parse(uri) {
        Ok(mut url) => {
            url.set_fragment(None);
            url.to_string()
        }
        Err(_) => uri.to_string(),
    };
    truncate_at_char_boundary(canonical, max_len)
}

fn truncate_at_char_boundary(mut s: String, max_len: usize) -> String {
    if s.len() > max_len {
        let mut cut = max_len;
        while !s.is_char_boundary(cut) {
            cut -= 1;
        }
        s.truncate(cut);
    }
    s
}

/// One `.qtxt` document: metadata frame then text frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DistilledDocument {
    pub meta: DocMeta,
    pub text: String,
}

impl DistilledDocument {
    pub fn write_to<W: Write + std::io::Seek>(&self, inner: W) -> Result<W> {
        let inner = write_frame(inner, &serde_json::to_vec(&self.meta)?)?;
        write_frame(inner, self.text.as_bytes())
    }

    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let frames = read_frames(std::io::Cursor::new(bytes))?;
        let [meta, text] = <[Vec<u8>; 2]>::try_from(frames).map_err(|frames| {
            TrawlError::malformed(0, format!("expected 2 frames, found {}", frames.len()))
        })?;
        Ok(Self {
            meta: serde_json::from_slice(&meta)?,
            text: String::from_utf8_lossy(&text).into_owned(),
        })
    }
}

pub struct TransformStage<'a, D: Distiller + ?Sized> {
    queue: &'a QueueDirectory,
    distiller: &'a D,
    max_uri_len: usize,
    max_decoded_bytes: u64,
}

impl<'a, D: Distiller + ?Sized> TransformStage<'a, D> {
    pub fn new(queue: &'a QueueDirectory, distiller: &'a D, max_uri_len: usize) -> Self {
        Self {
            queue,
            distiller,
            max_uri_len,
            max_decoded_bytes: DEFAULT_MAX_DECODED_BYTES,
        }
    }

    /// Caps the decoded body handed to the distiller; reading past it fails.
    #[must_use]
    pub fn with_max_decoded_bytes(mut self, limit: u64) -> Self {
        self.max_decoded_bytes = limit;
        self
    }

    /// Transforms every queued capture. Each source file is removed
    /// whatever its outcome.
    pub fn run(&self) -> Result<StageCounts> {
        let mut counts = StageCounts::default();
        for entry in self.queue.list(QueueKind::Captured)? {
            match self.transform_one(&entry) {
                Ok(true) => counts.processed += 1,
                Ok(false) => counts.discarded += 1,
                Err(err) => {
                    tracing::warn!(exchange.id = %entry.id, error = %err, "transform failed");
                    counts.discarded += 1;
                }
            }
            if let Err(err) = fs_err::remove_file(&entry.path) {
                tracing::warn!(exchange.id = %entry.id, error = %err, "could not remove capture");
            }
        }
        if counts.processed + counts.discarded > 0 {
            tracing::info!(
                transformed = counts.processed,
                discarded = counts.discarded,
                "transform stage finished"
            );
        }
        Ok(counts)
    }

    /// True when a `.qtxt` was written.
    fn transform_one(&self, entry: &QueueEntry) -> Result<bool> {
        let exchange = CapturedExchange::parse(&fs_err::read(&entry.path)?)?;
        let metadata = &exchange.metadata;
        let wanted = (200..300).contains(&metadata.status)
            && (metadata.ctype == "html" || metadata.ctype == "txt");
        if !wanted {
            tracing::debug!(exchange.id = %entry.id, status = metadata.status, ctype = %metadata.ctype, "skipped by filter");
            return Ok(false);
        }

        let meta = exchange.doc_meta(entry.modified, self.max_uri_len);
        let mut body = BoundedReader::new(
            decode_body(
                exchange.body.as_slice(),
                metadata.header("transfer-encoding"),
                metadata.header("content-encoding"),
            )?,
            self.max_decoded_bytes,
        );
        match self.distiller.distill(&mut body, meta)? {
            DistillOutcome::Accept { text, meta } => {
                let document = DistilledDocument { meta, text };
                let file = document.write_to(self.queue.temp_file()?)?;
                file.persist(self.queue.path_for(entry.id, QueueKind::Distilled))
                    .map_err(|err| err.error)?;
                tracing::debug!(exchange.id = %entry.id, uri = %document.meta.uri, "distilled");
                Ok(true)
            }
            DistillOutcome::Reject(reason) => {
                tracing::debug!(exchange.id = %entry.id, %reason, "distiller rejected");
                Ok(false)
            }
        }
    }
}
