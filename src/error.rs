//! Error type shared by every component of the capture pipeline.

use std::path::PathBuf;

use thiserror::Error;

use crate::types::DocumentId;

pub type Result<T> = std::result::Result<T, TrawlError>;

#[derive(Debug, Error)]
pub enum TrawlError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed frame at offset {offset}: {reason}")]
    MalformedFrame { offset: u64, reason: String },

    #[error("frame length {length} does not fit a {width}-byte header")]
    FrameTooLarge { length: u64, width: usize },

    #[error("archive already holds document {id}")]
    DuplicateEntry { id: DocumentId },

    #[error("document {id} not found in archive")]
    NotFound { id: DocumentId },

    #[error("archive shard error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("metadata encoding error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid configuration {path:?}: {reason}")]
    Config { path: PathBuf, reason: String },

    #[error("unsupported encoding: {encoding}")]
    UnsupportedEncoding { encoding: String },

    #[error("invalid request: {reason}")]
    InvalidRequest { reason: String },

    #[error("search index error: {reason}")]
    Index { reason: String },

    #[error("distiller error: {reason}")]
    Distill { reason: String },

    #[error("{thread} thread panicked")]
    ThreadPanicked { thread: &'static str },
}

impl TrawlError {
    pub(crate) fn malformed(offset: u64, reason: impl Into<String>) -> Self {
        Self::MalformedFrame {
            offset,
            reason: reason.into(),
        }
    }

    pub(crate) fn invalid_request(reason: impl Into<String>) -> Self {
        Self::InvalidRequest {
            reason: reason.into(),
        }
    }
}

#[cfg(feature = "lex")]
impl From<tantivy::TantivyError> for TrawlError {
    fn from(err: tantivy::TantivyError) -> Self {
        Self::Index {
            reason: err.to_string(),
        }
    }
}
