use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Metadata carried alongside distilled text from transform to index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocMeta {
    pub uri: String,
    pub timestamp: DateTime<Utc>,
    /// Version key: origin etag, else last-modified, else a weak etag from the length.
    #[serde(default)]
    pub etag: Option<String>,
    #[serde(default)]
    pub last_modified: Option<String>,
    #[serde(default)]
    pub content_type: String,
    #[serde(default)]
    pub referer: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub content_length: u64,
}

impl DocMeta {
    #[must_use]
    pub fn new(uri: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            uri: uri.into(),
            timestamp,
            etag: None,
            last_modified: None,
            content_type: String::new(),
            referer: None,
            title: None,
            description: None,
            content_length: 0,
        }
    }

    /// True when both versions carry the same etag, or, lacking etags, the
    /// same last-modified stamp.
    #[must_use]
    pub fn same_version(&self, other: &Self) -> bool {
        match (&self.etag, &other.etag) {
            (Some(a), Some(b)) => a == b,
            _ => matches!(
                (&self.last_modified, &other.last_modified),
                (Some(a), Some(b)) if a == b
            ),
        }
    }
}

/// Why the distiller declined a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RejectReason {
    NonHtml,
    Frameset,
    ExcludedDomain,
    LowContent,
    ParseError,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::NonHtml => "non-html",
            Self::Frameset => "frameset",
            Self::ExcludedDomain => "excluded-domain",
            Self::LowContent => "low-content",
            Self::ParseError => "parse-error",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DistillOutcome {
    Accept { text: String, meta: DocMeta },
    Reject(RejectReason),
}

/// Per-run tallies reported by the pipeline stages.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StageCounts {
    pub processed: usize,
    pub discarded: usize,
}
