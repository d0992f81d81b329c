//! TOML configuration.
//!
//! Every field has a default, so an empty file (or no file) is a valid
//! configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constants::{
    DEFAULT_INDEX_INTERVAL_SECS, DEFAULT_MAX_BODY_BYTES, DEFAULT_MAX_INDEX_INTERVAL_SECS,
    DEFAULT_MAX_REQUEST_BYTES, DEFAULT_MAX_URI_LEN, DEFAULT_NUM_DOC, DEFAULT_POLL_SECS,
    DEFAULT_PROXY_PORT, DEFAULT_SIMILARITY_DAYS, DEFAULT_WORKERS, MAX_DECODE_EXPANSION,
    MAX_POLL_SECS,
};
use crate::distill::{DEFAULT_MIN_TEXT_CHARS, HtmlDistiller};
use crate::error::{Result, TrawlError};
use crate::pipeline::{SchedulerSettings, TriggerThresholds};
use crate::proxy::Destination;
use crate::recorder::CaptureSettings;

/// A century; longer spans overflow timestamp arithmetic.
const MAX_INTERVAL_SECS: i64 = 100 * 365 * 86_400;
const MAX_SIMILARITY_DAYS: i64 = 100 * 365;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    /// Root for `logs/`, `archive/` and `index/`.
    pub data_dir: PathBuf,
    pub proxy: ProxySection,
    pub capture: CaptureSection,
    pub scheduler: SchedulerSection,
    pub index: IndexSection,
    pub archive: ArchiveSection,
    pub distill: DistillSection,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("trawl-data"),
            proxy: ProxySection::default(),
            capture: CaptureSection::default(),
            scheduler: SchedulerSection::default(),
            index: IndexSection::default(),
            archive: ArchiveSection::default(),
            distill: DistillSection::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ProxySection {
    pub listen: String,
    pub port: u16,
    pub workers: usize,
    /// `host:port` of a proxy to forward everything through.
    pub upstream: Option<String>,
}

impl Default for ProxySection {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1".to_string(),
            port: DEFAULT_PROXY_PORT,
            workers: DEFAULT_WORKERS,
            upstream: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CaptureSection {
    pub max_request_bytes: u64,
    pub max_body_bytes: u64,
    pub debug_mlog: bool,
}

impl Default for CaptureSection {
    fn default() -> Self {
        Self {
            max_request_bytes: DEFAULT_MAX_REQUEST_BYTES,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
            debug_mlog: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SchedulerSection {
    pub poll_secs: u64,
    pub max_poll_secs: u64,
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            poll_secs: DEFAULT_POLL_SECS,
            max_poll_secs: MAX_POLL_SECS,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum IndexEngine {
    #[default]
    Tantivy,
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct IndexSection {
    pub engine: IndexEngine,
    pub num_doc: usize,
    pub interval_secs: i64,
    pub max_interval_secs: i64,
}

impl Default for IndexSection {
    fn default() -> Self {
        Self {
            engine: IndexEngine::default(),
            num_doc: DEFAULT_NUM_DOC,
            interval_secs: DEFAULT_INDEX_INTERVAL_SECS,
            max_interval_secs: DEFAULT_MAX_INDEX_INTERVAL_SECS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ArchiveSection {
    pub similarity_days: i64,
    pub max_uri_len: usize,
}

impl Default for ArchiveSection {
    fn default() -> Self {
        Self {
            similarity_days: DEFAULT_SIMILARITY_DAYS,
            max_uri_len: DEFAULT_MAX_URI_LEN,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DistillSection {
    pub excluded_domains: Vec<String>,
    pub min_text_chars: usize,
}

impl Default for DistillSection {
    fn default() -> Self {
        Self {
            excluded_domains: Vec::new(),
            min_text_chars: DEFAULT_MIN_TEXT_CHARS,
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs_err::read_to_string(path)?;
        let config = Self::parse(&text).map_err(|reason| TrawlError::Config {
            path: path.to_path_buf(),
            reason,
        })?;
        tracing::debug!(path = %path.display(), "configuration loaded");
        Ok(config)
    }

    fn parse(text: &str) -> std::result::Result<Self, String> {
        let config: Self = toml::from_str(text).map_err(|err| err.to_string())?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> std::result::Result<(), String> {
        if self.proxy.workers == 0 {
            return Err("proxy.workers must be at least 1".into());
        }
        for (name, secs) in [
            ("index.interval_secs", self.index.interval_secs),
            ("index.max_interval_secs", self.index.max_interval_secs),
        ] {
            if !(0..=MAX_INTERVAL_SECS).contains(&secs) {
                return Err(format!("{name} must be between 0 and {MAX_INTERVAL_SECS}"));
            }
        }
        if !(0..=MAX_SIMILARITY_DAYS).contains(&self.archive.similarity_days) {
            return Err(format!(
                "archive.similarity_days must be between 0 and {MAX_SIMILARITY_DAYS}"
            ));
        }
        if self.archive.max_uri_len == 0 {
            return Err("archive.max_uri_len must be positive".into());
        }
        if let Some(upstream) = &self.proxy.upstream {
            Destination::parse(upstream).map_err(|err| err.to_string())?;
        }
        Ok(())
    }

    #[must_use]
    pub fn logs_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }

    #[must_use]
    pub fn archive_dir(&self) -> PathBuf {
        self.data_dir.join("archive")
    }

    #[must_use]
    pub fn index_dir(&self) -> PathBuf {
        self.data_dir.join("index")
    }

    #[must_use]
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.proxy.listen, self.proxy.port)
    }

    pub fn upstream(&self) -> Result<Option<Destination>> {
        self.proxy.upstream.as_deref().map(Destination::parse).transpose()
    }

    #[must_use]
    pub fn capture_settings(&self) -> CaptureSettings {
        CaptureSettings {
            max_request_bytes: self.capture.max_request_bytes,
            max_body_bytes: self.capture.max_body_bytes,
            debug_mlog: self.capture.debug_mlog,
        }
    }

    #[must_use]
    pub fn scheduler_settings(&self) -> SchedulerSettings {
        let max_poll = self.scheduler.max_poll_secs.min(MAX_POLL_SECS);
        SchedulerSettings {
            poll: Duration::from_secs(self.scheduler.poll_secs.clamp(1, max_poll.max(1))),
            max_poll: Duration::from_secs(max_poll.max(1)),
            thresholds: TriggerThresholds {
                num_doc: self.index.num_doc,
                interval: chrono::Duration::seconds(self.index.interval_secs),
                max_interval: chrono::Duration::seconds(self.index.max_interval_secs),
            },
            similarity: chrono::Duration::days(self.archive.similarity_days),
            max_uri_len: self.archive.max_uri_len,
            max_decoded_bytes: self.capture.max_body_bytes.saturating_mul(MAX_DECODE_EXPANSION),
        }
    }

    #[must_use]
    pub fn distiller(&self) -> HtmlDistiller {
        HtmlDistiller {
            excluded_domains: self.distill.excluded_domains.clone(),
            min_text_chars: self.distill.min_text_chars,
        }
    }
}
