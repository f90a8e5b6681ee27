use std::process::ExitCode;

use kurisu_infra::config::AnalysisConfig;
use kurisu_infra::workers::shutdown;

#[tokio::main]
async fn main() -> ExitCode {
    let _ = dotenvy::dotenv();

    let config = match AnalysisConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("kurisu-sentiment: {e}");
            return ExitCode::FAILURE;
        }
    };
    kurisu_observability::init(config.connection.json_logs);

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = ?e, "analysis worker failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: AnalysisConfig) -> anyhow::Result<()> {
    let clients = kurisu_worker::build_clients(&config.connection).await?;
    let analyzer = kurisu_worker::build_analyzer(&config)?;
    let (trigger, shutdown) = shutdown::channel();
    kurisu_worker::spawn_signal_handler(trigger);

    let stats = kurisu_worker::run_analysis(clients, analyzer, &config, shutdown).await?;
    tracing::info!(
        annotated = stats.annotated,
        failed = stats.failed,
        malformed = stats.malformed,
        "analysis worker exited"
    );
    Ok(())
}
