//! Production wiring: Postgres-backed store and session facts, OpenAI generator.

use std::sync::Arc;

use anyhow::Context;

use playreport_ai::OpenAiReportGenerator;
use playreport_infra::{
    db,
    jobs::{PostgresJobStore, ReportJobRunner},
    sessions::PostgresSessionFacts,
    WorkerConfig,
};

/// Build a runner over the configured database and report generator.
pub async fn build_postgres_runner(config: &WorkerConfig) -> anyhow::Result<ReportJobRunner> {
    let pool = db::connect(config)
        .await
        .context("failed to connect to DATABASE_URL")?;

    if config.openai_api_key.is_none() {
        tracing::warn!("OPENAI_API_KEY not set; every report attempt will fail until configured");
    }
    let generator = OpenAiReportGenerator::new(config.openai_config())
        .context("failed to build report generator")?;

    Ok(ReportJobRunner::new(
        Arc::new(PostgresJobStore::new(pool.clone())),
        Arc::new(PostgresSessionFacts::new(pool)),
        Arc::new(generator),
        config.runner_settings(),
    ))
}
