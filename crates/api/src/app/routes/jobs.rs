use axum::{
    body::Bytes,
    extract::{Extension, Path},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use uuid::Uuid;

use playreport_core::SessionId;
use playreport_infra::jobs::{EnqueueOutcome, RunRequest};

use crate::app::dto::{EnqueueResponse, RunJobsBody, RunJobsResponse};
use crate::app::errors::{json_error, run_error_to_response, store_error_to_response};
use crate::app::AppState;

/// `POST /internal/jobs/run`: process one batch and report what happened.
///
/// An empty body runs with defaults; a non-empty one must be valid JSON.
pub async fn run(Extension(state): Extension<AppState>, raw: Bytes) -> Response {
    let body = match parse_run_body(&raw) {
        Ok(body) => body,
        Err(err) => return json_error(StatusCode::BAD_REQUEST, "invalid_body", err.to_string()),
    };
    let ran_at = Utc::now();
    let locked_by = format!("{}:{}", state.worker_id, Uuid::now_v7());

    let request = RunRequest::new(body.limit(), locked_by).dry_run(body.dry_run);
    match state.runner.run_jobs(request).await {
        Ok(summary) => Json(RunJobsResponse {
            ran_at,
            dry_run: body.dry_run,
            summary,
        })
        .into_response(),
        Err(err) => run_error_to_response(err),
    }
}

fn parse_run_body(raw: &[u8]) -> Result<RunJobsBody, serde_json::Error> {
    if raw.iter().all(u8::is_ascii_whitespace) {
        return Ok(RunJobsBody::default());
    }
    serde_json::from_slice(raw)
}

/// `GET /internal/jobs/stats`: job counts per status.
pub async fn stats(Extension(state): Extension<AppState>) -> Response {
    match state.runner.store().stats().await {
        Ok(stats) => Json(stats).into_response(),
        Err(err) => store_error_to_response(err),
    }
}

/// `POST /internal/reports/:session_id/enqueue`: idempotently queue report generation.
pub async fn enqueue(
    Extension(state): Extension<AppState>,
    Path(session_id): Path<String>,
) -> Response {
    let session_id: SessionId = match session_id.parse() {
        Ok(id) => id,
        Err(err) => return json_error(StatusCode::BAD_REQUEST, "invalid_id", format!("{err}")),
    };

    let outcome = match state
        .runner
        .store()
        .enqueue(session_id, state.runner.default_max_attempts())
        .await
    {
        Ok(outcome) => outcome,
        Err(err) => return store_error_to_response(err),
    };

    tracing::info!(session_id = %session_id, ?outcome, "report enqueue requested");

    let status = match outcome {
        EnqueueOutcome::Created => StatusCode::CREATED,
        EnqueueOutcome::Requeued | EnqueueOutcome::Unchanged(_) => StatusCode::OK,
    };
    (status, Json(EnqueueResponse { session_id, outcome })).into_response()
}
