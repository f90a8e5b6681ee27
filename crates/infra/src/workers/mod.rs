//! Long-running worker tasks.
//!
//! - [`MessageWorker`]: drains the message queues into the store in batches
//! - [`BackfillScanner`]: one-shot sweep enqueueing unanalyzed records
//! - [`AnalysisWorker`]: annotates records from the analysis queue
//!
//! All of them stop cooperatively through [`Shutdown`].

pub mod analysis_worker;
pub mod backfill_scanner;
pub mod connect;
pub mod message_worker;
pub mod shutdown;

pub use analysis_worker::{AnalysisStats, AnalysisWorker, AnalysisWorkerConfig};
pub use backfill_scanner::{BackfillScanner, ScanConfig, ScanError, ScanReport};
pub use connect::connect_with_retry;
pub use message_worker::{MessageWorker, MessageWorkerConfig, WorkerState, WorkerStats};
pub use shutdown::{Shutdown, ShutdownTrigger};

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("could not connect to {dependency} after {attempts} attempts: {last_error}")]
    ConnectExhausted {
        dependency: &'static str,
        attempts: u32,
        last_error: String,
    },

    #[error("shutdown requested while connecting")]
    Interrupted,
}
