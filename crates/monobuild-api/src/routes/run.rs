//! Synchronous build endpoint.

use axum::Json;
use axum::extract::{Query, State};
use monobuild_core::request::BuildRequest;
use monobuild_core::task::Via;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::info;

use crate::AppState;
use crate::error::ApiError;

#[derive(Debug, Deserialize)]
pub struct RunQuery {
    pub job_id: i32,
    pub rev: Option<String>,
    /// GitHub user id of the caller. When present it is checked against
    /// the trusted-user allow-list.
    pub github_id: Option<i64>,
}

/// `POST /run?job_id=<id>[&rev=<sha>]` — enqueue a build and return the
/// created task ids.
pub async fn run(
    State(state): State<AppState>,
    Query(query): Query<RunQuery>,
) -> Result<Json<Value>, ApiError> {
    if let Some(github_id) = query.github_id {
        let trusted = state.dao.trusted_user.get_by_github_id(github_id).await?;
        if trusted.is_none() {
            return Err(ApiError::Forbidden(format!(
                "github user {} is not trusted",
                github_id
            )));
        }
    }

    let mut request = BuildRequest::for_job(query.job_id, Via::Api);
    request.actor = query.github_id;
    if let Some(rev) = query.rev {
        request = request.with_revision(rev);
    }

    let tasks = state.builder.build(request).await?;
    info!(job = query.job_id, count = tasks.len(), "Enqueued build via api");

    let ids: Vec<i32> = tasks.iter().map(|t| t.id).collect();
    let logs: Vec<String> = tasks
        .iter()
        .map(|t| {
            format!(
                "{}/logs/{}/{}.log",
                state.builder_api_url.trim_end_matches('/'),
                t.job_id,
                t.id
            )
        })
        .collect();
    Ok(Json(json!({ "tasks": ids, "logs": logs })))
}
