use std::process::ExitCode;

use kurisu_infra::config::WorkerConfig;
use kurisu_infra::workers::shutdown;

#[tokio::main]
async fn main() -> ExitCode {
    let _ = dotenvy::dotenv();

    let config = match WorkerConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("kurisu-worker: {e}");
            return ExitCode::FAILURE;
        }
    };
    kurisu_observability::init(config.connection.json_logs);

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = ?e, "message worker failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: WorkerConfig) -> anyhow::Result<()> {
    let clients = kurisu_worker::build_clients(&config.connection).await?;
    let (trigger, shutdown) = shutdown::channel();
    kurisu_worker::spawn_signal_handler(trigger);

    let stats = kurisu_worker::run_message_pipeline(clients, &config, shutdown).await?;
    tracing::info!(
        persisted = stats.persisted,
        retried = stats.retried,
        dead_lettered = stats.dead_lettered,
        malformed = stats.malformed,
        "message worker exited"
    );
    Ok(())
}
