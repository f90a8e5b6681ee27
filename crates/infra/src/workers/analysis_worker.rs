//! Consumer of the sentiment analysis queue.
//!
//! Pops jobs in small batches, annotates them through a [`TextAnalyzer`] and
//! writes the annotation back to the store. Every popped job's dedup marker
//! is released once the job is done with, whether it succeeded or not, so
//! the backfill scanner can pick the record up again on a later run if it is
//! still unannotated.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use kurisu_core::AnalysisJob;

use crate::analyzer::{AnalyzerError, TextAnalyzer, check_len};
use crate::pipeline::RetryPolicy;
use crate::queue::{ANALYSIS_QUEUE, DEDUP_SET, MessageQueue, QueueError};
use crate::store::MessageStore;

use super::{Shutdown, WorkerError, connect_with_retry};

#[derive(Debug, Clone)]
pub struct AnalysisWorkerConfig {
    pub analysis_queue: String,
    pub dedup_set: String,
    /// Jobs popped per batch
    pub batch_size: usize,
    /// Sleep when the queue is empty
    pub idle_pause: Duration,
    /// Sleep after a failed batch
    pub error_pause: Duration,
    pub connect_policy: RetryPolicy,
}

impl Default for AnalysisWorkerConfig {
    fn default() -> Self {
        Self {
            analysis_queue: ANALYSIS_QUEUE.to_string(),
            dedup_set: DEDUP_SET.to_string(),
            batch_size: 32,
            idle_pause: Duration::from_secs(1),
            error_pause: Duration::from_secs(5),
            connect_policy: RetryPolicy::linear(10, Duration::from_secs(2)),
        }
    }
}

impl AnalysisWorkerConfig {
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_connect_policy(mut self, policy: RetryPolicy) -> Self {
        self.connect_policy = policy;
        self
    }
}

#[derive(Debug, thiserror::Error)]
enum BatchError {
    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Analyzer(#[from] AnalyzerError),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct AnalysisStats {
    pub batches: u64,
    /// Jobs whose annotation was written
    pub annotated: u64,
    /// Jobs dropped after an analyzer or store failure
    pub failed: u64,
    /// Payloads that could not be decoded
    pub malformed: u64,
}

pub struct AnalysisWorker {
    queue: Arc<dyn MessageQueue>,
    store: Arc<dyn MessageStore>,
    analyzer: Arc<dyn TextAnalyzer>,
    config: AnalysisWorkerConfig,
    stats: AnalysisStats,
}

impl AnalysisWorker {
    pub fn new(
        queue: Arc<dyn MessageQueue>,
        store: Arc<dyn MessageStore>,
        analyzer: Arc<dyn TextAnalyzer>,
        config: AnalysisWorkerConfig,
    ) -> Self {
        Self {
            queue,
            store,
            analyzer,
            config,
            stats: AnalysisStats::default(),
        }
    }

    /// Connect, then process batches until shutdown.
    pub async fn run(mut self, mut shutdown: Shutdown) -> Result<AnalysisStats, WorkerError> {
        match self.connect(&mut shutdown).await {
            Ok(()) => {}
            Err(WorkerError::Interrupted) => return Ok(self.stats),
            Err(e) => return Err(e),
        }
        info!(
            queue = %self.config.analysis_queue,
            batch_size = self.config.batch_size,
            "analysis worker started"
        );

        while !shutdown.is_triggered() {
            let pause = match self.process_batch().await {
                Ok(0) => self.config.idle_pause,
                Ok(_) => continue,
                Err(e) => {
                    error!(error = %e, "analysis batch failed");
                    self.config.error_pause
                }
            };
            if shutdown.sleep(pause).await {
                break;
            }
        }

        self.queue.close().await;
        self.store.close().await;
        info!(
            annotated = self.stats.annotated,
            failed = self.stats.failed,
            "analysis worker stopped"
        );
        Ok(self.stats)
    }

    async fn connect(&self, shutdown: &mut Shutdown) -> Result<(), WorkerError> {
        let policy = &self.config.connect_policy;
        connect_with_retry("redis", policy, shutdown, || self.queue.ping()).await?;
        connect_with_retry("mongodb", policy, shutdown, || self.store.ping()).await
    }

    /// Process one batch; returns the number of payloads popped.
    async fn process_batch(&mut self) -> Result<usize, BatchError> {
        let payloads = self
            .queue
            .pop_many(&self.config.analysis_queue, self.config.batch_size)
            .await?;
        if payloads.is_empty() {
            return Ok(0);
        }
        let popped = payloads.len();
        self.stats.batches += 1;

        let mut jobs = Vec::with_capacity(popped);
        let mut release = Vec::with_capacity(popped);
        for payload in &payloads {
            match AnalysisJob::from_payload(payload) {
                Ok(job) => {
                    release.push(job.id.to_string());
                    jobs.push(job);
                }
                Err(e) => {
                    self.stats.malformed += 1;
                    warn!(error = %e, "dropping malformed analysis job");
                    if let Some(id) = job_id(payload) {
                        release.push(id);
                    }
                }
            }
        }

        let result = self.annotate(jobs).await;

        // Markers are released even when the batch failed; the record stays
        // unannotated and is picked up again by a later scan.
        if let Err(e) = self
            .queue
            .remove_from_set(&self.config.dedup_set, &release)
            .await
        {
            error!(error = %e, count = release.len(), "failed to release dedup markers");
        }

        result.map(|()| popped)
    }

    async fn annotate(&mut self, mut jobs: Vec<AnalysisJob>) -> Result<(), BatchError> {
        if jobs.is_empty() {
            return Ok(());
        }
        // Similar lengths together keep the model's padding small.
        jobs.sort_by_key(|job| job.text.chars().count());
        let texts: Vec<String> = jobs.iter().map(|job| job.text.clone()).collect();

        let annotations = match self.analyzer.analyze(&texts).await {
            Ok(annotations) => annotations,
            Err(e) => {
                self.stats.failed += jobs.len() as u64;
                return Err(e.into());
            }
        };
        if let Err(e) = check_len(jobs.len(), &annotations) {
            self.stats.failed += jobs.len() as u64;
            return Err(e.into());
        }

        for (job, annotation) in jobs.iter().zip(annotations) {
            let written = match annotation.to_fields() {
                Ok(fields) => self
                    .store
                    .update_annotation(&job.id, fields)
                    .await
                    .map_err(|e| e.to_string()),
                Err(e) => Err(e.to_string()),
            };
            match written {
                Ok(()) => {
                    self.stats.annotated += 1;
                    debug!(record_id = %job.id, "annotation stored");
                }
                Err(e) => {
                    self.stats.failed += 1;
                    error!(record_id = %job.id, error = %e, "failed to store annotation");
                }
            }
        }
        Ok(())
    }
}

/// Best-effort `_id` of a payload that did not decode as a job.
fn job_id(payload: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(payload).ok()?;
    match value.get("_id")? {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
