use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use dbcritic_daemon::config::Config;
use dbcritic_daemon::github::GithubClient;
use dbcritic_daemon::inference::{InferenceGate, LlamaCppEngine};
use dbcritic_daemon::reconciliation::reconcile_stale_attempts;
use dbcritic_daemon::scheduler;
use dbcritic_daemon::store::MetricsStore;
use dbcritic_daemon::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Starting database performance review daemon");

    let config =
        Config::from_env().context("Failed to load configuration from environment variables")?;

    let store = MetricsStore::open(&config.db_path)
        .await
        .context("Failed to open metrics store")?;
    info!("Using metrics store: {}", config.db_path.display());

    reconcile_stale_attempts(&store).await?;

    let engine = LlamaCppEngine::new(
        config.llama_bin.clone(),
        config.model_path.clone(),
        config.engine,
    );
    let gate = InferenceGate::new(Box::new(engine), config.inference_timeout_secs);

    let github = Arc::new(GithubClient::new(
        config.github_token.clone(),
        config.repo_owner.clone(),
        config.repo_name.clone(),
    ));
    info!(
        "Reviewing {}/{} every {}s (model: {})",
        config.repo_owner,
        config.repo_name,
        config.check_interval_secs,
        config.model_path.display()
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for shutdown signal: {}", e);
            return;
        }
        info!("Shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    let state = Arc::new(AppState {
        config,
        github,
        gate,
        store,
    });

    scheduler::run(state, shutdown_rx).await
}
