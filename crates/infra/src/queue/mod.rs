//! Durable queue abstraction (Redis lists and sets).
//!
//! Lists are used as FIFO queues: producers push on the left, consumers pop
//! from the right. Sets hold the dedup markers of in-flight analysis jobs.
//!
//! Every single operation is atomic on the backend; sequences of operations
//! are not, and callers are written to tolerate that.

use std::time::Duration;

use async_trait::async_trait;

pub mod in_memory;
#[cfg(feature = "redis")]
pub mod redis_queue;

pub use in_memory::InMemoryQueue;
#[cfg(feature = "redis")]
pub use redis_queue::RedisQueue;

/// Incoming chat messages pushed by the bot.
pub const MESSAGES_QUEUE: &str = "telegram_messages";
/// Messages whose persistence failed and will be attempted again.
pub const RETRY_QUEUE: &str = "telegram_messages_retry";
/// Messages that exhausted their retries. Never read by the worker.
pub const DEAD_LETTER_QUEUE: &str = "telegram_messages_dead_letter";
/// Sentiment analysis jobs.
pub const ANALYSIS_QUEUE: &str = "sentiment_analysis_queue";
/// Ids of records whose analysis job is queued but not yet processed.
pub const DEDUP_SET: &str = "sentiment_jobs_in_queue";

pub type QueueResult<T> = Result<T, QueueError>;

#[derive(Debug, Clone, thiserror::Error)]
pub enum QueueError {
    #[error("queue connection error: {0}")]
    Connection(String),

    #[error("queue command error: {0}")]
    Command(String),

    #[error("queue serialization error: {0}")]
    Serialization(String),
}

impl QueueError {
    /// True when the backend is unreachable (as opposed to rejecting a command).
    pub fn is_connection(&self) -> bool {
        matches!(self, QueueError::Connection(_))
    }
}

/// A payload taken off one of the queues passed to [`MessageQueue::blocking_pop`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Popped {
    pub queue: String,
    pub payload: String,
}

/// Names of the queues and sets the pipeline works with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueNames {
    pub messages: String,
    pub retry: String,
    pub dead_letter: String,
    pub analysis: String,
    pub dedup_set: String,
}

impl Default for QueueNames {
    fn default() -> Self {
        Self {
            messages: MESSAGES_QUEUE.to_string(),
            retry: RETRY_QUEUE.to_string(),
            dead_letter: DEAD_LETTER_QUEUE.to_string(),
            analysis: ANALYSIS_QUEUE.to_string(),
            dedup_set: DEDUP_SET.to_string(),
        }
    }
}

/// Queue client shared by the worker tasks.
#[async_trait]
pub trait MessageQueue: Send + Sync {
    /// Round-trip to the backend; used by connect-with-retry.
    async fn ping(&self) -> QueueResult<()>;

    /// Push one payload to the tail of `queue`.
    async fn push(&self, queue: &str, payload: String) -> QueueResult<()>;

    /// Push several payloads in one call, preserving their order.
    async fn push_many(&self, queue: &str, payloads: Vec<String>) -> QueueResult<()>;

    /// Pop the oldest payload from the first non-empty queue in `queues`
    /// (earlier names have priority), waiting up to `timeout`.
    async fn blocking_pop(&self, queues: &[&str], timeout: Duration)
    -> QueueResult<Option<Popped>>;

    /// Pop up to `count` of the oldest payloads without waiting.
    async fn pop_many(&self, queue: &str, count: usize) -> QueueResult<Vec<String>>;

    async fn add_to_set(&self, set: &str, ids: &[String]) -> QueueResult<()>;

    /// Membership of each id, in the order given.
    async fn are_members(&self, set: &str, ids: &[String]) -> QueueResult<Vec<bool>>;

    async fn is_member(&self, set: &str, id: &str) -> QueueResult<bool> {
        let found = self.are_members(set, &[id.to_string()]).await?;
        Ok(found.first().copied().unwrap_or(false))
    }

    async fn remove_from_set(&self, set: &str, ids: &[String]) -> QueueResult<()>;

    /// Release connections. Further calls may reconnect.
    async fn close(&self) {}
}
