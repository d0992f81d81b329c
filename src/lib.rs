#![deny(clippy::all, clippy::pedantic)]
#![cfg_attr(not(test), deny(clippy::unwrap_used, clippy::expect_used))]
#![cfg_attr(test, allow(clippy::cast_precision_loss))]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::doc_markdown)]
// body and frame lengths move between usize and u64
#![allow(clippy::cast_possible_truncation)]
// client_bytes / origin_bytes, read_side / write_side
#![allow(clippy::similar_names)]
#![allow(clippy::needless_pass_by_value)]

/// The trawl-core crate version (matches `Cargo.toml`).
pub const TRAWL_CORE_VERSION: &str = env!("CARGO_PKG_VERSION");

pub mod archive;
pub mod config;
pub mod constants;
pub mod distill;
pub mod error;
pub mod index;
pub mod io;
pub mod pipeline;
pub mod proxy;
pub mod queue;
pub mod recorder;
pub mod shutdown;
pub mod types;

pub use archive::{DocumentArchive, IdAllocator};
pub use config::Config;
pub use distill::{Distiller, HtmlDistiller};
pub use error::{Result, TrawlError};
#[cfg(feature = "lex")]
pub use index::TantivyIndex;
pub use index::{MemoryIndex, SearchIndex};
pub use io::{FrameReader, FrameWriter, decode_body, read_frames, write_frame};
pub use pipeline::{Pipeline, SchedulerHandle, SchedulerSettings};
pub use proxy::{ProxyContext, ProxyServer};
pub use queue::{QueueDirectory, QueueKind, SequenceCounter};
pub use recorder::{CaptureSettings, ExchangeRecorder};
pub use shutdown::Shutdown;
pub use types::{DistillOutcome, DocMeta, DocumentId, RejectReason, SequenceId, StageCounts};
