use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::HeaderMap,
    middleware::Next,
    response::Response,
};
use axum::http::StatusCode;
use subtle::ConstantTimeEq;

use crate::app::errors::json_error;

/// Header carrying the shared trigger secret.
pub const CRON_SECRET_HEADER: &str = "x-cron-secret";

#[derive(Clone)]
pub struct CronAuthState {
    /// `None` means no secret is configured: every call is refused.
    pub secret: Option<Arc<str>>,
}

/// Guard for internal endpoints: the `x-cron-secret` header must match the configured secret.
pub async fn cron_secret_middleware(
    State(state): State<CronAuthState>,
    req: Request,
    next: Next,
) -> Response {
    let Some(expected) = state.secret.as_deref() else {
        tracing::error!("CRON_SECRET is not configured; refusing internal call");
        return json_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "config_error",
            "CRON_SECRET is not configured",
        );
    };

    if !secret_matches(req.headers(), expected) {
        return json_error(
            StatusCode::FORBIDDEN,
            "forbidden",
            "Invalid or missing x-cron-secret",
        );
    }

    next.run(req).await
}

fn secret_matches(headers: &HeaderMap, expected: &str) -> bool {
    headers
        .get(CRON_SECRET_HEADER)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|provided| bool::from(provided.as_bytes().ct_eq(expected.as_bytes())))
}
