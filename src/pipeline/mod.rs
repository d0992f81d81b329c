//! Background pipeline: captured exchanges to distilled text to archived,
//! indexed documents.

pub mod index;
pub mod scheduler;
pub mod transform;
pub mod trigger;

pub use index::{IndexStage, is_similar};
pub use scheduler::{Pipeline, SchedulerHandle, SchedulerSettings, TickReport, spawn};
pub use transform::{CapturedExchange, DistilledDocument, TransformStage, canonical_uri};
pub use trigger::{IndexTrigger, TriggerThresholds, decide_index, proxy_idle};
