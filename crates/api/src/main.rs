use anyhow::Context;

use playreport_api::app::{build_app, services, AppState};
use playreport_infra::WorkerConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    playreport_observability::init("report-api");

    let config = WorkerConfig::from_env()?;
    if config.cron_secret.is_none() {
        tracing::warn!("CRON_SECRET not set; internal endpoints will refuse every call");
    }

    let runner = services::build_postgres_runner(&config).await?;
    let state = AppState::new(runner, config.worker_id.clone(), config.cron_secret.clone());
    let app = build_app(state);

    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;

    tracing::info!(addr = %listener.local_addr()?, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for shutdown signal");
    }
    tracing::info!("shutting down");
}
