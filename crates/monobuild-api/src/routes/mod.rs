//! API routes.

pub mod health;
pub mod logs;
pub mod run;
pub mod webhook;

use axum::Router;
use axum::routing::{get, post};
use tower_http::trace::TraceLayer;

use crate::AppState;

/// Build the API router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/run", post(run::run))
        .route("/webhook", post(webhook::webhook))
        .route("/liveness", get(health::liveness))
        .route("/readiness", get(health::readiness))
        .route("/logs/{job_id}/{file}", get(logs::fetch))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
