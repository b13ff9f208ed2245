//! HTTP API application wiring (Axum router + service wiring).
//!
//! - `services.rs`: production wiring (Postgres store, session facts, OpenAI generator)
//! - `routes/`: HTTP handlers
//! - `dto.rs`: request/response bodies
//! - `errors.rs`: consistent error responses

use std::sync::Arc;

use axum::{
    routing::{get, post},
    Extension, Router,
};
use tower::ServiceBuilder;

use playreport_infra::jobs::ReportJobRunner;

use crate::middleware::{self, CronAuthState};

pub mod dto;
pub mod errors;
pub mod routes;
pub mod services;

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub runner: Arc<ReportJobRunner>,
    /// Prefix for per-run claimant identities (`<worker_id>:<run uuid>`).
    pub worker_id: Arc<str>,
    pub cron_secret: Option<Arc<str>>,
}

impl AppState {
    pub fn new(
        runner: ReportJobRunner,
        worker_id: impl Into<Arc<str>>,
        cron_secret: Option<String>,
    ) -> Self {
        Self {
            runner: Arc::new(runner),
            worker_id: worker_id.into(),
            cron_secret: cron_secret.map(Arc::from),
        }
    }
}

/// Build the full HTTP router (public entrypoint used by `main.rs`).
pub fn build_app(state: AppState) -> Router {
    let auth_state = CronAuthState {
        secret: state.cron_secret.clone(),
    };

    // Internal routes: require x-cron-secret.
    let internal = Router::new()
        .route("/jobs/run", post(routes::jobs::run))
        .route("/jobs/stats", get(routes::jobs::stats))
        .route("/reports/:session_id/enqueue", post(routes::jobs::enqueue))
        .layer(Extension(state))
        .layer(axum::middleware::from_fn_with_state(
            auth_state,
            middleware::cron_secret_middleware,
        ));

    Router::new()
        .route("/health", get(routes::system::health))
        .nest("/internal", internal)
        .layer(ServiceBuilder::new())
}
