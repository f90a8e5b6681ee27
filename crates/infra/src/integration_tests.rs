//! Integration tests for the ingestion pipeline.
//!
//! Tests: Queue → MessageWorker → Batcher → Store / RetryRouter, and
//! Store → BackfillScanner → analysis queue → AnalysisWorker → Store
//!
//! Verifies:
//! - Batches flush on size and on age
//! - Failed items are retried, then dead-lettered, never dropped
//! - Malformed payloads do not affect their neighbours
//! - Backfill pages terminate and never enqueue a record twice

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::Utc;
    use serde_json::json;

    use kurisu_core::{AnalysisJob, Annotation, QueueItem};

    use crate::analyzer::{AnalyzerError, TextAnalyzer};
    use crate::queue::{
        ANALYSIS_QUEUE, DEAD_LETTER_QUEUE, DEDUP_SET, InMemoryQueue, MESSAGES_QUEUE,
        MessageQueue, RETRY_QUEUE,
    };
    use crate::store::{InMemoryStore, MessageStore};
    use crate::workers::{
        AnalysisWorker, AnalysisWorkerConfig, BackfillScanner, MessageWorker,
        MessageWorkerConfig, ScanConfig, WorkerStats, shutdown,
    };

    fn setup() -> (Arc<InMemoryQueue>, Arc<InMemoryStore>) {
        (InMemoryQueue::arc(), InMemoryStore::arc())
    }

    async fn push_messages(queue: &InMemoryQueue, ids: std::ops::Range<u32>) {
        for id in ids {
            let payload = json!({"id": id, "text": format!("message {id}")});
            queue.push(MESSAGES_QUEUE, payload.to_string()).await.unwrap();
        }
    }

    /// Run the worker for `duration` of (paused) time, then shut it down.
    async fn run_for(
        queue: &Arc<InMemoryQueue>,
        store: &Arc<InMemoryStore>,
        config: MessageWorkerConfig,
        duration: Duration,
    ) -> WorkerStats {
        let (trigger, shutdown) = shutdown::channel();
        let worker = MessageWorker::new(queue.clone(), store.clone(), config);
        let task = tokio::spawn(worker.run(shutdown));

        tokio::time::sleep(duration).await;
        trigger.trigger();
        task.await.unwrap().unwrap()
    }

    fn stored_ids(store: &InMemoryStore) -> Vec<String> {
        store
            .records()
            .into_iter()
            .map(|(_, record)| record["id"].as_str().unwrap().to_string())
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn batches_flush_on_size_then_on_timeout() {
        let (queue, store) = setup();
        push_messages(&queue, 0..25).await;

        let (trigger, shutdown) = shutdown::channel();
        let worker = MessageWorker::new(queue.clone(), store.clone(), MessageWorkerConfig::default());
        let task = tokio::spawn(worker.run(shutdown));

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(store.insert_attempts(), vec![10, 10]);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(store.insert_attempts(), vec![10, 10, 5]);

        trigger.trigger();
        let stats = task.await.unwrap().unwrap();
        assert_eq!(stats.persisted, 25);

        let expected: Vec<String> = (0..25).map(|n| n.to_string()).collect();
        assert_eq!(stored_ids(&store), expected);
    }

    #[tokio::test(start_paused = true)]
    async fn persistent_failure_dead_letters_after_retries() {
        let (queue, store) = setup();
        store.fail_all_inserts();
        let payload = json!({"id": "m-1", "text": "hello", "first_attempt_time": 1_700_000_000.0});
        queue.push(MESSAGES_QUEUE, payload.to_string()).await.unwrap();

        let config = MessageWorkerConfig::default().with_max_retry_attempts(2);
        let stats = run_for(&queue, &store, config, Duration::from_secs(30)).await;

        assert_eq!(store.insert_attempts(), vec![1, 1, 1]);
        assert_eq!(stats.retried, 2);
        assert_eq!(stats.dead_lettered, 1);
        assert_eq!(queue.len(RETRY_QUEUE), 0);

        let dead = queue.items(DEAD_LETTER_QUEUE);
        assert_eq!(dead.len(), 1);
        let item = QueueItem::from_payload(&dead[0], Utc::now()).unwrap();
        assert_eq!(item.id, "m-1");
        assert_eq!(item.retry_count, 3);
        assert_eq!(item.first_attempt_time, 1_700_000_000.0);
        assert_eq!(item.content["text"], "hello");
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_items_do_not_affect_neighbours() {
        let (queue, store) = setup();
        queue.push(MESSAGES_QUEUE, json!({"id": 1}).to_string()).await.unwrap();
        queue.push(MESSAGES_QUEUE, "not json at all".to_string()).await.unwrap();
        queue.push(MESSAGES_QUEUE, json!({"id": 2}).to_string()).await.unwrap();
        queue.push(MESSAGES_QUEUE, json!({"text": "no id"}).to_string()).await.unwrap();
        queue.push(MESSAGES_QUEUE, json!({"id": 3}).to_string()).await.unwrap();

        let config = MessageWorkerConfig::default().with_batch_size(3);
        let stats = run_for(&queue, &store, config, Duration::from_secs(1)).await;

        assert_eq!(stats.malformed, 2);
        assert_eq!(store.insert_attempts(), vec![3]);
        assert_eq!(stored_ids(&store), vec!["1", "2", "3"]);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failure_loses_nothing() {
        let (queue, store) = setup();
        store.fail_next_inserts(1);
        push_messages(&queue, 0..5).await;

        let config = MessageWorkerConfig::default().with_batch_size(5);
        let stats = run_for(&queue, &store, config, Duration::from_secs(10)).await;

        assert_eq!(store.insert_attempts(), vec![5, 5]);
        assert_eq!(stats.retried, 5);
        assert_eq!(stats.persisted, 5);

        let ids: HashSet<String> = stored_ids(&store).into_iter().collect();
        assert_eq!(ids.len(), 5);
        for (_, record) in store.records() {
            assert_eq!(record["retry_count"], 1);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn items_are_spilled_when_the_retry_queue_rejects_them() {
        let dir = tempfile::tempdir().unwrap();
        let spill_path = dir.path().join("spill.jsonl");
        let (queue, store) = setup();
        store.fail_all_inserts();
        queue.fail_pushes_to(RETRY_QUEUE);
        push_messages(&queue, 0..2).await;

        let config = MessageWorkerConfig::default()
            .with_batch_size(2)
            .with_spill_path(&spill_path);
        let stats = run_for(&queue, &store, config, Duration::from_millis(500)).await;

        assert_eq!(stats.spilled, 2);
        assert_eq!(stats.lost, 0);
        let spilled = std::fs::read_to_string(&spill_path).unwrap();
        assert_eq!(spilled.lines().count(), 2);
        assert!(spilled.contains(r#""queue":"telegram_messages_retry""#));
    }

    #[tokio::test(start_paused = true)]
    async fn queue_outage_keeps_the_pending_batch() {
        let (queue, store) = setup();
        push_messages(&queue, 0..3).await;

        let (trigger, shutdown) = shutdown::channel();
        let worker = MessageWorker::new(queue.clone(), store.clone(), MessageWorkerConfig::default());
        let task = tokio::spawn(worker.run(shutdown));

        tokio::time::sleep(Duration::from_millis(500)).await;
        queue.set_unavailable(true);
        tokio::time::sleep(Duration::from_secs(3)).await;
        queue.set_unavailable(false);
        tokio::time::sleep(Duration::from_secs(10)).await;

        trigger.trigger();
        let stats = task.await.unwrap().unwrap();
        assert_eq!(stats.reconnects, 1);
        assert_eq!(stats.persisted, 3);
        assert_eq!(store.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn store_outage_keeps_the_batch_until_reconnected() {
        let (queue, store) = setup();
        queue
            .push(MESSAGES_QUEUE, json!({"id": 1, "text": "hi"}).to_string())
            .await
            .unwrap();

        let (trigger, shutdown) = shutdown::channel();
        let worker = MessageWorker::new(queue.clone(), store.clone(), MessageWorkerConfig::default());
        let task = tokio::spawn(worker.run(shutdown));

        tokio::time::sleep(Duration::from_millis(500)).await;
        store.set_unavailable(true);
        tokio::time::sleep(Duration::from_secs(40)).await;
        store.set_unavailable(false);
        tokio::time::sleep(Duration::from_secs(20)).await;

        trigger.trigger();
        let stats = task.await.unwrap().unwrap();

        assert_eq!(stats.reconnects, 1);
        assert_eq!(stats.failed_flushes, 0);
        assert_eq!(stats.persisted, 1);
        assert_eq!(store.insert_attempts(), vec![1, 1]);
        assert_eq!(queue.len(RETRY_QUEUE), 0);
        assert_eq!(queue.len(DEAD_LETTER_QUEUE), 0);

        let records = store.records();
        assert_eq!(records.len(), 1);
        let (_, stored) = &records[0];
        assert_eq!(stored["retry_count"], json!(0));
        assert_eq!(stored["id"], json!(1));
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_flushes_the_partial_batch() {
        let (queue, store) = setup();
        push_messages(&queue, 0..4).await;

        let stats = run_for(&queue, &store, MessageWorkerConfig::default(), Duration::from_secs(2)).await;

        assert_eq!(store.insert_attempts(), vec![4]);
        assert_eq!(stats.flushes, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_queue_is_consumed_after_new_messages() {
        let (queue, store) = setup();
        let retried = json!({"id": "old", "retry_count": 1});
        queue.push(RETRY_QUEUE, retried.to_string()).await.unwrap();
        push_messages(&queue, 0..2).await;

        let config = MessageWorkerConfig::default().with_batch_size(3);
        run_for(&queue, &store, config, Duration::from_secs(1)).await;

        assert_eq!(stored_ids(&store), vec!["0", "1", "old"]);
    }

    fn group_message(n: usize) -> serde_json::Value {
        json!({
            "_": "Message",
            "chat": {"type": "ChatType.SUPERGROUP"},
            "from_user": {"is_bot": false},
            "text": format!("historical message {n}"),
        })
    }

    #[tokio::test(start_paused = true)]
    async fn backfill_pages_through_history_once() {
        let (queue, store) = setup();
        for n in 0..1500 {
            store.seed(group_message(n));
        }
        let scanner = BackfillScanner::new(queue.clone(), store.clone(), ScanConfig::default());

        let (_trigger, shutdown) = shutdown::channel();
        let first = scanner.run(shutdown.clone()).await;
        assert!(first.completed);
        assert_eq!(first.pages, 2);
        assert_eq!(first.enqueued, 1500);
        assert_eq!(store.candidate_queries(), 3);
        assert_eq!(queue.len(ANALYSIS_QUEUE), 1500);
        assert_eq!(queue.members(DEDUP_SET).len(), 1500);

        let second = scanner.run(shutdown).await;
        assert!(second.completed);
        assert_eq!(second.enqueued, 0);
        assert_eq!(second.skipped, 1500);
        assert_eq!(queue.len(ANALYSIS_QUEUE), 1500);

        let ids: HashSet<String> = queue
            .items(ANALYSIS_QUEUE)
            .iter()
            .map(|p| AnalysisJob::from_payload(p).unwrap().id.to_string())
            .collect();
        assert_eq!(ids.len(), 1500);
    }

    #[tokio::test(start_paused = true)]
    async fn worker_launches_backfill_after_connecting() {
        let (queue, store) = setup();
        for n in 0..3 {
            store.seed(group_message(n));
        }
        let scanner = BackfillScanner::new(queue.clone(), store.clone(), ScanConfig::default());

        let (trigger, shutdown) = shutdown::channel();
        let worker = MessageWorker::new(queue.clone(), store.clone(), MessageWorkerConfig::default())
            .with_backfill(scanner);
        let task = tokio::spawn(worker.run(shutdown));
        tokio::time::sleep(Duration::from_secs(2)).await;
        trigger.trigger();

        let stats = task.await.unwrap().unwrap();
        let backfill = stats.backfill.expect("backfill report");
        assert!(backfill.completed);
        assert_eq!(backfill.enqueued, 3);
    }

    struct NeutralAnalyzer;

    #[async_trait]
    impl TextAnalyzer for NeutralAnalyzer {
        async fn analyze(&self, texts: &[String]) -> Result<Vec<Annotation>, AnalyzerError> {
            Ok(texts
                .iter()
                .map(|_| Annotation {
                    sentiment: [("neutral".to_string(), 1.0)].into(),
                    sensitive_topics: Default::default(),
                })
                .collect())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn scanned_records_are_annotated_and_released() {
        let (queue, store) = setup();
        for n in 0..40 {
            store.seed(group_message(n));
        }

        let (_trigger, shutdown) = shutdown::channel();
        let scanner = BackfillScanner::new(queue.clone(), store.clone(), ScanConfig::default());
        assert_eq!(scanner.run(shutdown).await.enqueued, 40);

        let (trigger, shutdown) = shutdown::channel();
        let worker = AnalysisWorker::new(
            queue.clone(),
            store.clone(),
            Arc::new(NeutralAnalyzer),
            AnalysisWorkerConfig::default(),
        );
        let task = tokio::spawn(worker.run(shutdown));
        tokio::time::sleep(Duration::from_secs(3)).await;
        trigger.trigger();

        let stats = task.await.unwrap().unwrap();
        assert_eq!(stats.annotated, 40);
        assert_eq!(stats.batches, 2);
        assert!(queue.members(DEDUP_SET).is_empty());
        assert_eq!(queue.len(ANALYSIS_QUEUE), 0);

        let remaining = store
            .find_candidates(&Default::default(), 100)
            .await
            .unwrap();
        assert!(remaining.is_empty());
    }
}
