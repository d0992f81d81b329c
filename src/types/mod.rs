//! Public types exposed by the `trawl-core` crate.

pub mod document;
pub mod exchange;
pub mod ids;

pub use document::{DistillOutcome, DocMeta, RejectReason, StageCounts};
pub use exchange::{
    ExchangeMetadata, FlagCode, Headers, RequestHead, ResponseHead, abbreviate_content_type,
};
pub use ids::{DocumentId, SequenceId};
