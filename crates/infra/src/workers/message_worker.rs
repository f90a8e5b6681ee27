//! Message worker: queue → batch → store.
//!
//! Lifecycle: `Disconnected → Connecting → Running → Draining → Disconnected`.
//!
//! - **Connecting**: pings queue and store with linear backoff; running out
//!   of attempts is fatal
//! - **Running**: blocking pop (1s) from the message queue, then the retry
//!   queue; flush on size or age
//! - **Draining**: on shutdown the current batch is flushed once, then the
//!   clients are released
//!
//! A lost queue or store connection sends the worker back to `Connecting`
//! with its in-memory batch intact and no retry counted. A flush the store
//! rejects routes every item of the batch to the retry or dead-letter queue
//! and pauses the loop with exponential backoff.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use kurisu_core::{CorrelationId, QueueItem};

use crate::pipeline::{
    Batcher, FlushReason, PersistOutcome, RetryPolicy, RetryRouter, SpillFile, persist,
};
use crate::queue::{MessageQueue, Popped, QueueNames};
use crate::store::MessageStore;

use super::{BackfillScanner, ScanReport, Shutdown, WorkerError, connect_with_retry};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Disconnected,
    Connecting,
    Running,
    Draining,
}

/// Message worker configuration.
#[derive(Debug, Clone)]
pub struct MessageWorkerConfig {
    pub queues: QueueNames,
    /// Flush once this many items are batched
    pub batch_size: usize,
    /// Flush a non-empty batch this long after the previous flush
    pub batch_timeout: Duration,
    /// Upper bound on one blocking pop
    pub pop_timeout: Duration,
    /// Failed persistence attempts before an item is dead-lettered
    pub max_retry_attempts: u32,
    /// Pause after consecutive failed flushes or pops
    pub failure_backoff: RetryPolicy,
    pub connect_policy: RetryPolicy,
    /// JSON-lines fallback for items that cannot be routed
    pub spill_path: Option<PathBuf>,
}

impl Default for MessageWorkerConfig {
    fn default() -> Self {
        Self {
            queues: QueueNames::default(),
            batch_size: 10,
            batch_timeout: Duration::from_secs(5),
            pop_timeout: Duration::from_secs(1),
            max_retry_attempts: 3,
            failure_backoff: RetryPolicy::exponential(
                u32::MAX,
                Duration::from_secs(1),
                Duration::from_secs(60),
            ),
            connect_policy: RetryPolicy::linear(10, Duration::from_secs(2)),
            spill_path: None,
        }
    }
}

impl MessageWorkerConfig {
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_batch_timeout(mut self, timeout: Duration) -> Self {
        self.batch_timeout = timeout;
        self
    }

    pub fn with_max_retry_attempts(mut self, attempts: u32) -> Self {
        self.max_retry_attempts = attempts;
        self
    }

    pub fn with_failure_backoff(mut self, policy: RetryPolicy) -> Self {
        self.failure_backoff = policy;
        self
    }

    pub fn with_connect_policy(mut self, policy: RetryPolicy) -> Self {
        self.connect_policy = policy;
        self
    }

    pub fn with_spill_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.spill_path = Some(path.into());
        self
    }
}

/// Counters for one worker run.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct WorkerStats {
    pub flushes: u64,
    pub failed_flushes: u64,
    pub persisted: u64,
    pub retried: u64,
    pub dead_lettered: u64,
    pub spilled: u64,
    pub lost: u64,
    pub malformed: u64,
    pub reconnects: u64,
    /// Set once the backfill scan launched by this worker has finished.
    pub backfill: Option<ScanReport>,
}

enum Tick {
    Continue,
    Stop,
}

enum Flush {
    Done,
    Failed,
    /// The store was unreachable; the batch is back in the batcher.
    StoreUnavailable,
}

pub struct MessageWorker {
    queue: Arc<dyn MessageQueue>,
    store: Arc<dyn MessageStore>,
    config: MessageWorkerConfig,
    router: RetryRouter,
    batcher: Batcher,
    state: WorkerState,
    stats: WorkerStats,
    failed_flushes_in_row: u32,
    failed_pops_in_row: u32,
    backfill: Option<BackfillScanner>,
    backfill_task: Option<JoinHandle<ScanReport>>,
}

impl MessageWorker {
    pub fn new(
        queue: Arc<dyn MessageQueue>,
        store: Arc<dyn MessageStore>,
        config: MessageWorkerConfig,
    ) -> Self {
        let router = RetryRouter::new(
            queue.clone(),
            config.queues.retry.clone(),
            config.queues.dead_letter.clone(),
            config.max_retry_attempts,
        )
        .with_spill(config.spill_path.clone().map(SpillFile::new));
        let batcher = Batcher::new(config.batch_size, config.batch_timeout, Instant::now());

        Self {
            queue,
            store,
            config,
            router,
            batcher,
            state: WorkerState::Disconnected,
            stats: WorkerStats::default(),
            failed_flushes_in_row: 0,
            failed_pops_in_row: 0,
            backfill: None,
            backfill_task: None,
        }
    }

    /// Launch `scanner` as a separate task once the first connection is up.
    pub fn with_backfill(mut self, scanner: BackfillScanner) -> Self {
        self.backfill = Some(scanner);
        self
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    /// Run until shutdown.
    ///
    /// Returns an error only when a dependency stays unreachable past the
    /// connect policy; the in-flight batch is flushed (and so routed or
    /// spilled) before returning in that case too.
    pub async fn run(mut self, mut shutdown: Shutdown) -> Result<WorkerStats, WorkerError> {
        match self.connect(&mut shutdown).await {
            Ok(()) => {}
            Err(WorkerError::Interrupted) => {
                self.transition(WorkerState::Disconnected);
                return Ok(self.stats);
            }
            Err(e) => {
                self.transition(WorkerState::Disconnected);
                return Err(e);
            }
        }
        self.start_backfill(&shutdown);

        let mut fatal = None;
        while !shutdown.is_triggered() {
            match self.tick(&mut shutdown).await {
                Ok(Tick::Continue) => {}
                Ok(Tick::Stop) => break,
                Err(e) => {
                    error!(error = %e, pending = self.batcher.len(), "giving up on reconnect");
                    fatal = Some(e);
                    break;
                }
            }
        }

        self.drain().await;
        self.disconnect().await;

        match fatal {
            Some(e) => Err(e),
            None => Ok(self.stats),
        }
    }

    fn transition(&mut self, to: WorkerState) {
        if self.state != to {
            debug!(from = ?self.state, to = ?to, "worker state change");
            self.state = to;
        }
    }

    async fn connect(&mut self, shutdown: &mut Shutdown) -> Result<(), WorkerError> {
        self.transition(WorkerState::Connecting);
        let policy = &self.config.connect_policy;
        connect_with_retry("redis", policy, shutdown, || self.queue.ping()).await?;
        connect_with_retry("mongodb", policy, shutdown, || self.store.ping()).await?;

        self.transition(WorkerState::Running);
        info!(
            batch_size = self.batcher.max_size(),
            batch_timeout_secs = self.config.batch_timeout.as_secs_f64(),
            max_retry_attempts = self.config.max_retry_attempts,
            "message worker running"
        );
        Ok(())
    }

    fn start_backfill(&mut self, shutdown: &Shutdown) {
        if let Some(scanner) = self.backfill.take() {
            let shutdown = shutdown.clone();
            self.backfill_task = Some(tokio::spawn(async move { scanner.run(shutdown).await }));
        }
    }

    /// One pop, one flush check. A batch kept through a store outage can
    /// already be full, in which case the pop is skipped.
    async fn tick(&mut self, shutdown: &mut Shutdown) -> Result<Tick, WorkerError> {
        if !self.batcher.is_full() {
            let queues = [
                self.config.queues.messages.as_str(),
                self.config.queues.retry.as_str(),
            ];
            match self.queue.blocking_pop(&queues, self.config.pop_timeout).await {
                Ok(popped) => {
                    self.failed_pops_in_row = 0;
                    if let Some(popped) = popped {
                        self.accept(popped);
                    }
                }
                Err(e) => {
                    self.failed_pops_in_row += 1;
                    let delay = self
                        .config
                        .failure_backoff
                        .delay_for_attempt(self.failed_pops_in_row);
                    error!(
                        error = %e,
                        pending = self.batcher.len(),
                        delay_ms = delay.as_millis() as u64,
                        "failed to pop from queue"
                    );
                    if shutdown.sleep(delay).await {
                        return Ok(Tick::Stop);
                    }
                    if e.is_connection() {
                        return self.reconnect(shutdown).await;
                    }
                }
            }
        }

        let Some(reason) = self.batcher.flush_reason(Instant::now()) else {
            return Ok(Tick::Continue);
        };
        match self.flush(reason).await {
            Flush::Done => Ok(Tick::Continue),
            Flush::Failed => {
                let delay = self
                    .config
                    .failure_backoff
                    .delay_for_attempt(self.failed_flushes_in_row);
                warn!(
                    failed_flushes = self.failed_flushes_in_row,
                    delay_ms = delay.as_millis() as u64,
                    "pausing after failed flush"
                );
                if shutdown.sleep(delay).await {
                    return Ok(Tick::Stop);
                }
                Ok(Tick::Continue)
            }
            Flush::StoreUnavailable => {
                let delay = self
                    .config
                    .failure_backoff
                    .delay_for_attempt(self.failed_flushes_in_row);
                if shutdown.sleep(delay).await {
                    return Ok(Tick::Stop);
                }
                self.reconnect(shutdown).await
            }
        }
    }

    async fn reconnect(&mut self, shutdown: &mut Shutdown) -> Result<Tick, WorkerError> {
        self.stats.reconnects += 1;
        match self.connect(shutdown).await {
            Ok(()) => Ok(Tick::Continue),
            Err(WorkerError::Interrupted) => Ok(Tick::Stop),
            Err(e) => Err(e),
        }
    }

    fn accept(&mut self, popped: Popped) {
        match QueueItem::from_payload(&popped.payload, Utc::now()) {
            Ok(item) => {
                debug!(
                    queue = %popped.queue,
                    item_id = %item.id,
                    retry_count = item.retry_count,
                    "item dequeued"
                );
                self.batcher.append(item);
            }
            Err(e) => {
                self.stats.malformed += 1;
                warn!(
                    queue = %popped.queue,
                    error = %e,
                    payload_len = popped.payload.len(),
                    "dropping malformed queue item"
                );
            }
        }
    }

    /// Persist the current batch.
    ///
    /// A rejected write routes the batch. An unreachable store keeps it in
    /// the batcher, except when draining, where it is routed as well.
    async fn flush(&mut self, reason: FlushReason) -> Flush {
        let batch = self.batcher.take_and_clear();
        if batch.is_empty() {
            self.batcher.mark_flushed(Instant::now());
            return Flush::Done;
        }

        let batch_size = batch.len();
        let correlation_id = batch
            .first()
            .map(|item| item.correlation_id.clone())
            .unwrap_or_else(CorrelationId::generate);
        let started = Instant::now();

        let outcome = persist(self.store.as_ref(), &batch).await;
        self.batcher.mark_flushed(Instant::now());
        self.stats.flushes += 1;

        match outcome {
            PersistOutcome::Persisted { inserted } => {
                self.failed_flushes_in_row = 0;
                self.stats.persisted += inserted as u64;
                info!(
                    %correlation_id,
                    batch_size,
                    inserted,
                    ?reason,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "batch persisted"
                );
                Flush::Done
            }
            PersistOutcome::Unavailable { reason: failure } if reason != FlushReason::Shutdown => {
                self.failed_flushes_in_row += 1;
                warn!(
                    %correlation_id,
                    batch_size,
                    error = %failure,
                    "store unreachable, keeping batch and reconnecting"
                );
                self.batcher.restore(batch);
                Flush::StoreUnavailable
            }
            PersistOutcome::Failed { reason: failure }
            | PersistOutcome::Unavailable { reason: failure } => {
                self.failed_flushes_in_row += 1;
                self.stats.failed_flushes += 1;
                error!(
                    %correlation_id,
                    batch_size,
                    ?reason,
                    error = %failure,
                    "batch persistence failed, routing items"
                );

                let report = self.router.route_failed_batch(batch, &correlation_id).await;
                self.stats.retried += report.retried as u64;
                self.stats.dead_lettered += report.dead_lettered as u64;
                self.stats.spilled += report.spilled as u64;
                self.stats.lost += report.lost as u64;
                info!(
                    %correlation_id,
                    batch_size,
                    retried = report.retried,
                    dead_lettered = report.dead_lettered,
                    spilled = report.spilled,
                    lost = report.lost,
                    "failed batch routed"
                );
                Flush::Failed
            }
        }
    }

    async fn drain(&mut self) {
        self.transition(WorkerState::Draining);
        if !self.batcher.is_empty() {
            info!(pending = self.batcher.len(), "flushing final batch");
            self.flush(FlushReason::Shutdown).await;
        }

        if let Some(task) = self.backfill_task.take() {
            match task.await {
                Ok(report) => self.stats.backfill = Some(report),
                Err(e) => error!(error = %e, "backfill task failed"),
            }
        }
    }

    async fn disconnect(&mut self) {
        self.queue.close().await;
        self.store.close().await;
        self.transition(WorkerState::Disconnected);
        info!(
            flushes = self.stats.flushes,
            persisted = self.stats.persisted,
            retried = self.stats.retried,
            dead_lettered = self.stats.dead_lettered,
            "message worker stopped"
        );
    }
}
