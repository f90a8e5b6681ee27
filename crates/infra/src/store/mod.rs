//! Message store abstraction (the MongoDB `messages` collection).

use async_trait::async_trait;
use serde_json::Value as JsonValue;

use kurisu_core::{AnalysisJob, RecordId};

pub mod in_memory;
#[cfg(feature = "mongodb")]
pub mod mongo;

pub use in_memory::InMemoryStore;
#[cfg(feature = "mongodb")]
pub use mongo::MongoMessageStore;

/// Collection holding message records.
pub const MESSAGES_COLLECTION: &str = "messages";

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("store connection error: {0}")]
    Connection(String),

    #[error("bulk write failed: {0}")]
    Write(String),

    #[error("store query failed: {0}")]
    Query(String),

    #[error("invalid record id: {0}")]
    InvalidId(String),
}

impl StoreError {
    pub fn is_connection(&self) -> bool {
        matches!(self, StoreError::Connection(_))
    }
}

/// Selects records that still need sentiment analysis.
///
/// The candidate criteria themselves are fixed (see
/// [`kurisu_core::analysis_text`]); `after` pages through them in ascending
/// id order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CandidateQuery {
    /// Only return records with an id strictly greater than this one.
    pub after: Option<RecordId>,
}

impl CandidateQuery {
    pub fn after(id: RecordId) -> Self {
        Self { after: Some(id) }
    }
}

/// Store client shared by the worker tasks.
#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn ping(&self) -> StoreResult<()>;

    /// Best-effort unordered bulk insert.
    ///
    /// Either all records are reported as written (ids in input order) or the
    /// whole call is reported as failed, even if some records were written.
    async fn insert_many(&self, records: Vec<JsonValue>) -> StoreResult<Vec<RecordId>>;

    /// Up to `limit` analysis candidates (id and text), ascending by id.
    async fn find_candidates(
        &self,
        query: &CandidateQuery,
        limit: usize,
    ) -> StoreResult<Vec<AnalysisJob>>;

    /// Set the record's `sentiment` annotation.
    async fn update_annotation(&self, id: &RecordId, fields: JsonValue) -> StoreResult<()>;

    async fn close(&self) {}
}
