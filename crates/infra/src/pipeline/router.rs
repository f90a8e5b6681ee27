//! Persistence attempts and routing of failed batches.

use std::sync::Arc;

use tracing::{error, warn};

use kurisu_core::{CorrelationId, QueueItem};

use crate::queue::MessageQueue;
use crate::store::MessageStore;

use super::spill::SpillFile;

/// Result of one bulk insert of a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PersistOutcome {
    Persisted { inserted: usize },
    /// The store rejected the write; items count a failed attempt.
    Failed { reason: String },
    /// The store could not be reached. No attempt is counted; the caller keeps
    /// the batch and reconnects.
    Unavailable { reason: String },
}

impl PersistOutcome {
    pub fn is_persisted(&self) -> bool {
        matches!(self, PersistOutcome::Persisted { .. })
    }
}

/// Insert the whole batch in one unordered bulk write.
///
/// Success and failure are whole-batch: a partially applied write is
/// reported as failed and every item goes through the router. Connection
/// errors are reported separately as [`PersistOutcome::Unavailable`].
pub async fn persist(store: &dyn MessageStore, batch: &[QueueItem]) -> PersistOutcome {
    let documents = match batch
        .iter()
        .map(QueueItem::to_document)
        .collect::<Result<Vec<_>, _>>()
    {
        Ok(documents) => documents,
        Err(e) => {
            return PersistOutcome::Failed {
                reason: e.to_string(),
            };
        }
    };

    match store.insert_many(documents).await {
        Ok(ids) => PersistOutcome::Persisted {
            inserted: ids.len(),
        },
        Err(e) if e.is_connection() => PersistOutcome::Unavailable {
            reason: e.to_string(),
        },
        Err(e) => PersistOutcome::Failed {
            reason: e.to_string(),
        },
    }
}

/// Where a failed item goes next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteDecision {
    Retry,
    DeadLetter,
}

impl RouteDecision {
    /// `retry_count` is the count after incrementing for the failure at hand.
    pub fn for_retry_count(retry_count: u32, max_retry_attempts: u32) -> Self {
        if retry_count > max_retry_attempts {
            RouteDecision::DeadLetter
        } else {
            RouteDecision::Retry
        }
    }
}

/// Per-batch routing counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RoutingReport {
    pub retried: usize,
    pub dead_lettered: usize,
    /// Items whose push failed and were written to the spill file instead.
    pub spilled: usize,
    /// Items whose push failed with no spill file to fall back on.
    pub lost: usize,
}

pub struct RetryRouter {
    queue: Arc<dyn MessageQueue>,
    retry_queue: String,
    dead_letter_queue: String,
    max_retry_attempts: u32,
    spill: Option<SpillFile>,
}

impl RetryRouter {
    pub fn new(
        queue: Arc<dyn MessageQueue>,
        retry_queue: impl Into<String>,
        dead_letter_queue: impl Into<String>,
        max_retry_attempts: u32,
    ) -> Self {
        Self {
            queue,
            retry_queue: retry_queue.into(),
            dead_letter_queue: dead_letter_queue.into(),
            max_retry_attempts,
            spill: None,
        }
    }

    pub fn with_spill(mut self, spill: Option<SpillFile>) -> Self {
        self.spill = spill;
        self
    }

    /// Count one more failed attempt on every item and push it to the retry
    /// or dead-letter queue.
    pub async fn route_failed_batch(
        &self,
        batch: Vec<QueueItem>,
        correlation_id: &CorrelationId,
    ) -> RoutingReport {
        let mut report = RoutingReport::default();

        for mut item in batch {
            let retry_count = item.record_failed_attempt();
            let decision = RouteDecision::for_retry_count(retry_count, self.max_retry_attempts);
            let target = match decision {
                RouteDecision::Retry => &self.retry_queue,
                RouteDecision::DeadLetter => &self.dead_letter_queue,
            };

            let pushed = match item.to_payload() {
                Ok(payload) => self
                    .queue
                    .push(target, payload)
                    .await
                    .map_err(|e| e.to_string()),
                Err(e) => Err(e.to_string()),
            };

            match (pushed, decision) {
                (Ok(()), RouteDecision::Retry) => {
                    report.retried += 1;
                    warn!(
                        %correlation_id,
                        item_id = %item.id,
                        retry_count,
                        max_retry_attempts = self.max_retry_attempts,
                        "persistence failed, item queued for retry"
                    );
                }
                (Ok(()), RouteDecision::DeadLetter) => {
                    report.dead_lettered += 1;
                    let first_attempt_at = item
                        .first_attempt_at()
                        .map(|at| at.to_rfc3339())
                        .unwrap_or_default();
                    error!(
                        %correlation_id,
                        item_id = %item.id,
                        retry_count,
                        %first_attempt_at,
                        "retries exhausted, item moved to dead-letter queue"
                    );
                }
                (Err(reason), _) => {
                    self.spill_or_lose(&item, target, &reason, correlation_id, &mut report)
                        .await;
                }
            }
        }

        report
    }

    async fn spill_or_lose(
        &self,
        item: &QueueItem,
        target: &str,
        reason: &str,
        correlation_id: &CorrelationId,
        report: &mut RoutingReport,
    ) {
        let Some(spill) = &self.spill else {
            report.lost += 1;
            error!(
                %correlation_id,
                item_id = %item.id,
                queue = target,
                error = reason,
                "failed to route item, item lost"
            );
            return;
        };

        match spill.append(target, item).await {
            Ok(()) => {
                report.spilled += 1;
                error!(
                    %correlation_id,
                    item_id = %item.id,
                    queue = target,
                    error = reason,
                    spill_path = %spill.path().display(),
                    "failed to route item, written to spill file"
                );
            }
            Err(spill_err) => {
                report.lost += 1;
                error!(
                    %correlation_id,
                    item_id = %item.id,
                    queue = target,
                    error = reason,
                    spill_error = %spill_err,
                    "failed to route or spill item, item lost"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{DEAD_LETTER_QUEUE, InMemoryQueue, RETRY_QUEUE};
    use crate::store::InMemoryStore;
    use chrono::Utc;

    fn item(id: &str, retry_count: u32) -> QueueItem {
        let payload = format!(r#"{{"id": "{id}", "retry_count": {retry_count}}}"#);
        QueueItem::from_payload(&payload, Utc::now()).unwrap()
    }

    fn router(queue: &Arc<InMemoryQueue>, max: u32) -> RetryRouter {
        RetryRouter::new(queue.clone(), RETRY_QUEUE, DEAD_LETTER_QUEUE, max)
    }

    #[test]
    fn dead_letters_only_past_the_limit() {
        assert_eq!(RouteDecision::for_retry_count(1, 2), RouteDecision::Retry);
        assert_eq!(RouteDecision::for_retry_count(2, 2), RouteDecision::Retry);
        assert_eq!(RouteDecision::for_retry_count(3, 2), RouteDecision::DeadLetter);
        assert_eq!(RouteDecision::for_retry_count(1, 0), RouteDecision::DeadLetter);
    }

    #[tokio::test]
    async fn persist_reports_inserted_count() {
        let store = InMemoryStore::new();
        let outcome = persist(&store, &[item("a", 0), item("b", 0)]).await;

        assert_eq!(outcome, PersistOutcome::Persisted { inserted: 2 });
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn persist_failure_is_a_value() {
        let store = InMemoryStore::new();
        store.fail_all_inserts();

        let outcome = persist(&store, &[item("a", 0)]).await;
        assert!(!outcome.is_persisted());
    }

    #[tokio::test]
    async fn unreachable_store_is_not_a_write_failure() {
        let store = InMemoryStore::new();
        store.set_unavailable(true);

        let outcome = persist(&store, &[item("a", 0)]).await;
        assert!(matches!(outcome, PersistOutcome::Unavailable { .. }));
    }

    #[tokio::test]
    async fn failed_items_are_split_between_retry_and_dead_letter() {
        let queue = InMemoryQueue::arc();
        let router = router(&queue, 2);

        let report = router
            .route_failed_batch(vec![item("fresh", 0), item("last", 2)], &CorrelationId::generate())
            .await;

        assert_eq!(report.retried, 1);
        assert_eq!(report.dead_lettered, 1);

        let retried = QueueItem::from_payload(&queue.items(RETRY_QUEUE)[0], Utc::now()).unwrap();
        assert_eq!(retried.id, "fresh");
        assert_eq!(retried.retry_count, 1);

        let dead = QueueItem::from_payload(&queue.items(DEAD_LETTER_QUEUE)[0], Utc::now()).unwrap();
        assert_eq!(dead.id, "last");
        assert_eq!(dead.retry_count, 3);
    }

    #[tokio::test]
    async fn routing_failure_without_spill_counts_as_lost() {
        let queue = InMemoryQueue::arc();
        queue.fail_pushes_to(RETRY_QUEUE);

        let report = router(&queue, 3)
            .route_failed_batch(vec![item("a", 0)], &CorrelationId::generate())
            .await;

        assert_eq!(report.lost, 1);
        assert_eq!(report.retried, 0);
    }

    #[tokio::test]
    async fn routing_failure_falls_back_to_spill_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("spill.jsonl");
        let queue = InMemoryQueue::arc();
        queue.fail_pushes_to(RETRY_QUEUE);

        let report = router(&queue, 3)
            .with_spill(Some(SpillFile::new(&path)))
            .route_failed_batch(vec![item("a", 0)], &CorrelationId::generate())
            .await;

        assert_eq!(report.spilled, 1);
        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains(r#""queue":"telegram_messages_retry""#));
        assert!(contents.contains(r#""retry_count":1"#));
    }
}
