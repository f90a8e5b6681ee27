//! One-shot sweep of stored messages that still lack sentiment analysis.
//!
//! Each page is checked against the dedup marker set; unmarked records are
//! marked first and then pushed as analysis jobs, so a job is never queued
//! without its marker. Pages are read in ascending id order behind an
//! in-process cursor, which makes every run terminate. The cursor is not
//! persisted: a restarted process scans from the beginning and relies on the
//! marker set (and the records' `sentiment` field) to skip finished work.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, instrument};

use kurisu_core::{AnalysisJob, ItemError, RecordId};

use crate::queue::{ANALYSIS_QUEUE, DEDUP_SET, MessageQueue, QueueError};
use crate::store::{CandidateQuery, MessageStore, StoreError};

use super::Shutdown;

#[derive(Debug, thiserror::Error)]
pub enum ScanError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Item(#[from] ItemError),
}

#[derive(Debug, Clone)]
pub struct ScanConfig {
    pub analysis_queue: String,
    pub dedup_set: String,
    /// Candidates read per page
    pub page_size: usize,
    /// Pause between pages, to keep the scan from starving the worker loop
    pub page_pause: Duration,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            analysis_queue: ANALYSIS_QUEUE.to_string(),
            dedup_set: DEDUP_SET.to_string(),
            page_size: 1000,
            page_pause: Duration::from_millis(500),
        }
    }
}

impl ScanConfig {
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn with_page_pause(mut self, pause: Duration) -> Self {
        self.page_pause = pause;
        self
    }
}

/// Summary of one scan run.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct ScanReport {
    /// Pages that returned at least one candidate
    pub pages: usize,
    pub candidates: usize,
    /// Candidates already marked as queued
    pub skipped: usize,
    pub enqueued: usize,
    /// True when the scan ran until a page came back empty.
    pub completed: bool,
    pub error: Option<String>,
}

enum Page {
    Exhausted,
    Advanced { last: RecordId },
}

pub struct BackfillScanner {
    queue: Arc<dyn MessageQueue>,
    store: Arc<dyn MessageStore>,
    config: ScanConfig,
}

impl BackfillScanner {
    pub fn new(
        queue: Arc<dyn MessageQueue>,
        store: Arc<dyn MessageStore>,
        config: ScanConfig,
    ) -> Self {
        Self {
            queue,
            store,
            config,
        }
    }

    /// Scan until the candidates run out, shutdown is triggered or a page
    /// fails. Errors end the run and are reported, never retried.
    pub async fn run(&self, mut shutdown: Shutdown) -> ScanReport {
        let mut report = ScanReport::default();
        let mut cursor: Option<RecordId> = None;

        info!(page_size = self.config.page_size, "backfill scan started");

        loop {
            if shutdown.is_triggered() {
                info!(pages = report.pages, "backfill scan stopped by shutdown");
                break;
            }

            match self.scan_page(cursor.take(), &mut report).await {
                Ok(Page::Exhausted) => {
                    report.completed = true;
                    info!(
                        pages = report.pages,
                        candidates = report.candidates,
                        enqueued = report.enqueued,
                        skipped = report.skipped,
                        "backfill scan complete"
                    );
                    break;
                }
                Ok(Page::Advanced { last }) => cursor = Some(last),
                Err(e) => {
                    error!(error = %e, pages = report.pages, "backfill scan aborted");
                    report.error = Some(e.to_string());
                    break;
                }
            }

            if shutdown.sleep(self.config.page_pause).await {
                info!(pages = report.pages, "backfill scan stopped by shutdown");
                break;
            }
        }

        report
    }

    #[instrument(skip(self, report))]
    async fn scan_page(
        &self,
        after: Option<RecordId>,
        report: &mut ScanReport,
    ) -> Result<Page, ScanError> {
        let query = CandidateQuery { after };
        let candidates = self
            .store
            .find_candidates(&query, self.config.page_size)
            .await?;

        let Some(last) = candidates.last().map(|job| job.id.clone()) else {
            return Ok(Page::Exhausted);
        };
        report.pages += 1;
        report.candidates += candidates.len();

        let ids: Vec<String> = candidates.iter().map(|job| job.id.to_string()).collect();
        let marked = self.queue.are_members(&self.config.dedup_set, &ids).await?;

        let fresh: Vec<&AnalysisJob> = candidates
            .iter()
            .zip(&marked)
            .filter(|(_, marked)| !**marked)
            .map(|(job, _)| job)
            .collect();
        let skipped = candidates.len() - fresh.len();
        report.skipped += skipped;

        if fresh.is_empty() {
            debug!(skipped, "page fully marked, nothing to enqueue");
            return Ok(Page::Advanced { last });
        }

        let payloads = fresh
            .iter()
            .map(|job| job.to_payload())
            .collect::<Result<Vec<_>, _>>()?;
        let fresh_ids: Vec<String> = fresh.iter().map(|job| job.id.to_string()).collect();

        // Marker first: a crash between the two calls leaves a marker
        // without a job, never a job without a marker.
        self.queue
            .add_to_set(&self.config.dedup_set, &fresh_ids)
            .await?;
        self.queue
            .push_many(&self.config.analysis_queue, payloads)
            .await?;

        report.enqueued += fresh_ids.len();
        info!(
            count = fresh_ids.len(),
            skipped,
            "enqueued batch of historical messages"
        );

        Ok(Page::Advanced { last })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::InMemoryQueue;
    use crate::store::InMemoryStore;
    use crate::workers::shutdown;
    use serde_json::json;

    fn candidate(n: usize) -> serde_json::Value {
        json!({"_": "Message", "chat": {"type": "ChatType.SUPERGROUP"}, "text": format!("message {n}")})
    }

    fn scanner(queue: &Arc<InMemoryQueue>, store: &Arc<InMemoryStore>, page: usize) -> BackfillScanner {
        BackfillScanner::new(
            queue.clone(),
            store.clone(),
            ScanConfig::default().with_page_size(page),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn marks_then_enqueues_every_candidate() {
        let queue = InMemoryQueue::arc();
        let store = InMemoryStore::arc();
        for n in 0..5 {
            store.seed(candidate(n));
        }
        store.seed(json!({"_": "Message", "chat": {"type": "ChatType.PRIVATE"}, "text": "dm"}));

        let (_trigger, shutdown) = shutdown::channel();
        let report = scanner(&queue, &store, 2).run(shutdown).await;

        assert!(report.completed);
        assert_eq!(report.pages, 3);
        assert_eq!(report.enqueued, 5);
        assert_eq!(queue.len(ANALYSIS_QUEUE), 5);
        assert_eq!(queue.members(DEDUP_SET).len(), 5);

        let first = AnalysisJob::from_payload(&queue.items(ANALYSIS_QUEUE)[0]).unwrap();
        assert_eq!(first.text, "message 0");
    }

    #[tokio::test(start_paused = true)]
    async fn records_without_text_do_not_end_the_scan() {
        let queue = InMemoryQueue::arc();
        let store = InMemoryStore::arc();
        for _ in 0..4 {
            store.seed(json!({"_": "Message", "chat": {"type": "ChatType.GROUP"}, "text": null}));
        }
        for n in 0..3 {
            store.seed(candidate(n));
        }

        let (_trigger, shutdown) = shutdown::channel();
        let report = scanner(&queue, &store, 2).run(shutdown).await;

        assert!(report.completed);
        assert_eq!(report.enqueued, 3);
        assert_eq!(queue.len(ANALYSIS_QUEUE), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn already_marked_records_are_skipped() {
        let queue = InMemoryQueue::arc();
        let store = InMemoryStore::arc();
        let marked = store.seed(candidate(0));
        store.seed(candidate(1));
        queue
            .add_to_set(DEDUP_SET, &[marked.to_string()])
            .await
            .unwrap();

        let (_trigger, shutdown) = shutdown::channel();
        let report = scanner(&queue, &store, 10).run(shutdown).await;

        assert_eq!(report.skipped, 1);
        assert_eq!(report.enqueued, 1);
        assert_eq!(queue.len(ANALYSIS_QUEUE), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn store_failure_aborts_the_run() {
        let queue = InMemoryQueue::arc();
        let store = InMemoryStore::arc();
        store.seed(candidate(0));
        store.set_unavailable(true);

        let (_trigger, shutdown) = shutdown::channel();
        let report = scanner(&queue, &store, 10).run(shutdown).await;

        assert!(!report.completed);
        assert!(report.error.is_some());
        assert_eq!(queue.len(ANALYSIS_QUEUE), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_stops_after_the_current_page() {
        let queue = InMemoryQueue::arc();
        let store = InMemoryStore::arc();
        for n in 0..4 {
            store.seed(candidate(n));
        }

        let (trigger, shutdown) = shutdown::channel();
        let scanner = scanner(&queue, &store, 2);
        let task = tokio::spawn(async move { scanner.run(shutdown).await });
        // First page is done before the 500ms pause ends.
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.trigger();

        let report = task.await.unwrap();
        assert_eq!(report.pages, 1);
        assert_eq!(report.enqueued, 2);
        assert!(!report.completed);
    }
}
