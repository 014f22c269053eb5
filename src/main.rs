use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

use transcribe_fanout::config::load_config;
use transcribe_fanout::providers::HistoryStore;
use transcribe_fanout::providers::in_memory::InMemoryHistoryStore;
use transcribe_fanout::runtime::{Runtime, RuntimeOptions};
use transcribe_fanout::transcripts::{FAN_OUT_ORCHESTRATION, TranscriptResult, TranscriptionSettings};
use transcribe_fanout::worker::{Services, activity_registry, orchestration_registry};

/// Worker that transcribes conference session videos with a container apps job.
#[derive(Debug, Parser)]
#[command(name = "transcribe-worker", version, about)]
struct Cli {
    /// TOML configuration file; environment variables override its values.
    #[arg(long, env = "TRANSCRIBE_CONFIG")]
    config: Option<PathBuf>,

    /// Session codes to transcribe once the worker is up.
    sessions: Vec<String>,
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        error!("Fatal error: {:#}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    info!("Starting Fan Out/Fan In pattern worker...");

    let config = load_config(cli.config.as_deref()).context("Failed to load configuration")?;
    info!(
        taskhub = %config.taskhub,
        endpoint = %config.endpoint,
        credential_mode = ?config.credential_mode(),
        job = %config.job_target(),
        "configuration loaded"
    );

    let services = Services::from_config(&config).context("Failed to build HTTP clients")?;
    let settings = TranscriptionSettings {
        target: config.job_target(),
        poll: config.poll_policy(),
    };
    let orchestrations = orchestration_registry(settings)
        .map_err(anyhow::Error::msg)
        .context("Failed to register orchestrations")?;
    let activities = Arc::new(activity_registry(&services));

    let store: Arc<dyn HistoryStore> = Arc::new(InMemoryHistoryStore::default());
    let options = RuntimeOptions {
        activity_retry: config.retry_policy(),
    };
    let rt = Runtime::start_with_options(store, activities, orchestrations, options).await;
    info!("Worker started");

    if !cli.sessions.is_empty() {
        let instance = format!("transcribe-{}", Uuid::new_v4());
        let handle = rt
            .clone()
            .start_orchestration_typed::<Vec<String>, Vec<TranscriptResult>>(
                &instance,
                FAN_OUT_ORCHESTRATION,
                cli.sessions.clone(),
            )
            .await
            .map_err(anyhow::Error::msg)
            .context("Failed to start fan-out orchestration")?;
        info!(instance = %instance, sessions = cli.sessions.len(), "fan-out scheduled");

        tokio::spawn(async move {
            match handle.await {
                Ok((_, Ok(results))) => match serde_json::to_string(&results) {
                    Ok(json) => info!(instance = %instance, results = %json, "fan-out completed"),
                    Err(e) => error!(instance = %instance, error = %e, "fan-out result not serializable"),
                },
                Ok((_, Err(e))) => error!(instance = %instance, error = %e, "fan-out failed"),
                Err(e) => error!(instance = %instance, error = %e, "fan-out task failed"),
            }
        });
    }

    shutdown_signal().await;
    info!("Worker shutdown initiated");
    rt.shutdown().await;
    info!("Worker stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
