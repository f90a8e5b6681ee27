//! Batching, persistence and failure routing used by the message worker.

pub mod backoff;
pub mod batcher;
pub mod router;
pub mod spill;

pub use backoff::{BackoffStrategy, RetryPolicy};
pub use batcher::{Batcher, FlushReason};
pub use router::{PersistOutcome, RetryRouter, RouteDecision, RoutingReport, persist};
pub use spill::{SpillError, SpillFile};
