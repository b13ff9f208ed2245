//! Local polling worker: runs batches until the queue is drained or the
//! iteration budget is spent.

use std::time::Duration;

use chrono::Utc;

use playreport_api::app::services;
use playreport_infra::jobs::{JobStore, ReportJobRunner, RunRequest};
use playreport_infra::WorkerConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    playreport_observability::init("report-worker");

    let config = WorkerConfig::from_env()?;
    let runner = services::build_postgres_runner(&config).await?;

    tracing::info!(
        worker_id = %config.worker_id,
        batch_limit = config.batch_limit,
        poll_interval_ms = config.poll_interval.as_millis() as u64,
        max_iterations = config.max_iterations,
        "report worker starting"
    );

    let mut total_processed = 0usize;
    let mut iteration = 0u32;
    let mut drained = false;
    while iteration < config.max_iterations {
        iteration += 1;
        warn_stale_jobs(runner.store().as_ref(), config.stale_after).await;

        let summary = runner
            .run_jobs(RunRequest::new(config.batch_limit, config.worker_id.clone()))
            .await?;
        total_processed += summary.processed;

        tracing::info!(
            iteration,
            processed = summary.processed,
            succeeded = summary.succeeded,
            failed = summary.failed,
            "worker iteration finished"
        );

        if summary.processed == 0 {
            tracing::info!("no jobs queued, exiting");
            drained = true;
            break;
        }

        tokio::time::sleep(config.poll_interval).await;
    }

    if !drained {
        tracing::info!(max_iterations = config.max_iterations, "reached max iterations, exiting");
    }
    log_totals(&runner, total_processed).await;
    Ok(())
}

/// Jobs stuck in `PROCESSING` are never reclaimed automatically; surface them.
async fn warn_stale_jobs(store: &dyn JobStore, stale_after: Duration) {
    let Ok(stale_after) = chrono::Duration::from_std(stale_after) else {
        return;
    };
    match store.stale_processing(Utc::now() - stale_after).await {
        Ok(stale) => {
            for job in stale {
                tracing::warn!(
                    job_id = %job.job_id,
                    session_id = %job.session_id,
                    locked_by = job.locked_by.as_deref().unwrap_or("unknown"),
                    locked_at = ?job.locked_at,
                    "report job stuck in PROCESSING; needs manual requeue"
                );
            }
        }
        Err(err) => tracing::warn!(error = %err, "stale job scan failed"),
    }
}

async fn log_totals(runner: &ReportJobRunner, total_processed: usize) {
    match runner.store().stats().await {
        Ok(stats) => tracing::info!(
            total_processed,
            queued = stats.queued,
            processing = stats.processing,
            done = stats.done,
            failed = stats.failed,
            "report worker done"
        ),
        Err(err) => tracing::info!(total_processed, error = %err, "report worker done"),
    }
}
