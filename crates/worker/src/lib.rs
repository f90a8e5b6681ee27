//! Process wiring for the worker binaries.
//!
//! Clients are built here from configuration and handed to the workers as
//! trait objects, so the same entry points run against Redis/MongoDB in
//! production and against the in-memory backends in tests.

use std::sync::Arc;

use anyhow::Context;
use tokio::task::JoinHandle;
use tracing::info;

use kurisu_infra::analyzer::{HttpAnalyzer, TextAnalyzer};
use kurisu_infra::config::{AnalysisConfig, ConnectionConfig, WorkerConfig};
use kurisu_infra::queue::{MessageQueue, RedisQueue};
use kurisu_infra::store::{MessageStore, MongoMessageStore};
use kurisu_infra::workers::{
    AnalysisStats, AnalysisWorker, BackfillScanner, MessageWorker, Shutdown, ShutdownTrigger,
    WorkerError, WorkerStats,
};

pub struct Clients {
    pub queue: Arc<dyn MessageQueue>,
    pub store: Arc<dyn MessageStore>,
}

/// Build the Redis and MongoDB clients. Nothing is contacted yet; the
/// workers ping both with retry when they start.
pub async fn build_clients(config: &ConnectionConfig) -> anyhow::Result<Clients> {
    let queue = RedisQueue::new(&config.redis_url, config.redis_password.as_deref())
        .context("failed to create redis client")?;
    let store = MongoMessageStore::new(&config.mongodb_url, &config.mongo_database)
        .await
        .context("failed to create mongodb client")?;

    Ok(Clients {
        queue: Arc::new(queue),
        store: Arc::new(store),
    })
}

pub fn build_analyzer(config: &AnalysisConfig) -> anyhow::Result<Arc<dyn TextAnalyzer>> {
    let analyzer =
        HttpAnalyzer::new(config.api_url.as_str()).context("failed to create analyzer client")?;
    Ok(Arc::new(analyzer))
}

/// Message worker with the backfill scan running beside it.
pub async fn run_message_pipeline(
    clients: Clients,
    config: &WorkerConfig,
    shutdown: Shutdown,
) -> Result<WorkerStats, WorkerError> {
    let scanner = BackfillScanner::new(clients.queue.clone(), clients.store.clone(), config.scan());
    MessageWorker::new(clients.queue, clients.store, config.message_worker())
        .with_backfill(scanner)
        .run(shutdown)
        .await
}

pub async fn run_analysis(
    clients: Clients,
    analyzer: Arc<dyn TextAnalyzer>,
    config: &AnalysisConfig,
    shutdown: Shutdown,
) -> Result<AnalysisStats, WorkerError> {
    AnalysisWorker::new(clients.queue, clients.store, analyzer, config.analysis_worker())
        .run(shutdown)
        .await
}

/// Trigger shutdown on Ctrl-C or SIGTERM.
pub fn spawn_signal_handler(trigger: ShutdownTrigger) -> JoinHandle<()> {
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("shutdown signal received, draining");
        trigger.trigger();
    })
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(stream) => stream,
        Err(e) => {
            tracing::warn!(error = %e, "cannot listen for SIGTERM, using Ctrl-C only");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = terminate.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
