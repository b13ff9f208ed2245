use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use playreport_infra::jobs::{JobStoreError, RunError};

/// Longest message echoed back in an error body.
const MAX_MESSAGE_LEN: usize = 200;

pub fn run_error_to_response(err: RunError) -> axum::response::Response {
    tracing::error!(error = %err, "report job run failed");
    json_error(StatusCode::INTERNAL_SERVER_ERROR, "run_failed", err.to_string())
}

pub fn store_error_to_response(err: JobStoreError) -> axum::response::Response {
    match err {
        JobStoreError::NotFound(id) => {
            json_error(StatusCode::NOT_FOUND, "not_found", format!("job {id} not found"))
        }
        JobStoreError::Conflict(msg) => json_error(StatusCode::CONFLICT, "conflict", msg),
        err @ JobStoreError::LostClaim { .. } => {
            json_error(StatusCode::CONFLICT, "conflict", err.to_string())
        }
        JobStoreError::Storage(msg) => {
            tracing::error!(error = %msg, "job store error");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "store_error", msg)
        }
    }
}

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    let message: String = message.into().chars().take(MAX_MESSAGE_LEN).collect();
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message,
        })),
    )
        .into_response()
}
