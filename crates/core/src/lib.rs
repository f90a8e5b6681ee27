//! `kurisu-core`: message pipeline building blocks.
//!
//! This crate contains the **pure** data model shared by the workers: queue
//! items, analysis jobs and their error types (no I/O, no clients).

pub mod analysis;
pub mod error;
pub mod id;
pub mod queue_item;

pub use analysis::{AnalysisJob, Annotation, analysis_text};
pub use error::{ItemError, ItemResult};
pub use id::{CorrelationId, MessageId, RecordId};
pub use queue_item::QueueItem;
