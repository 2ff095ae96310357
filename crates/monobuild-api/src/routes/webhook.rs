//! GitHub webhook intake.

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use hmac::{Hmac, Mac};
use monobuild_core::Error;
use monobuild_core::request::BuildRequest;
use monobuild_core::task::Via;
use sha2::Sha256;
use tracing::{error, info, warn};

use crate::AppState;
use crate::error::ApiError;

/// Parsed subset of a GitHub push payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushEvent {
    pub repository: String,
    pub r#ref: String,
    /// Head revision after the push.
    pub after: String,
    /// Every pushed revision, oldest first.
    pub commits: Vec<String>,
    pub pusher: String,
}

impl PushEvent {
    pub fn from_payload(payload: &serde_json::Value) -> Option<Self> {
        let repository = payload
            .get("repository")?
            .get("name")?
            .as_str()?
            .to_string();
        let r#ref = payload.get("ref")?.as_str()?.to_string();
        let after = payload.get("after")?.as_str()?.to_string();
        let commits = payload
            .get("commits")
            .and_then(|c| c.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|c| c.get("id").and_then(|id| id.as_str()).map(String::from))
                    .collect()
            })
            .unwrap_or_default();
        let pusher = payload
            .get("pusher")
            .and_then(|p| p.get("name"))
            .and_then(|n| n.as_str())
            .unwrap_or("unknown")
            .to_string();

        Some(PushEvent {
            repository,
            r#ref,
            after,
            commits,
            pusher,
        })
    }
}

/// `POST /webhook` — HMAC-verified GitHub events. A push fans out into one
/// task per affected revision.
pub async fn webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, ApiError> {
    if let Some(secret) = &state.webhook_secret {
        let signature = headers
            .get("X-Hub-Signature-256")
            .and_then(|v| v.to_str().ok());
        if !verify_signature(secret, &body, signature) {
            warn!("Webhook signature verification failed");
            return Err(ApiError::Unauthorized("invalid signature".to_string()));
        }
    }

    let event_type = headers
        .get("X-GitHub-Event")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("unknown");
    let payload: serde_json::Value = serde_json::from_slice(&body)
        .map_err(|e| ApiError::BadRequest(format!("invalid json: {}", e)))?;

    match event_type {
        "push" => {
            let Some(push) = PushEvent::from_payload(&payload) else {
                return Err(ApiError::BadRequest("malformed push payload".to_string()));
            };
            handle_push(&state, push).await?;
        }
        "ping" => {
            info!("Webhook configured correctly");
        }
        other => {
            info!(event = %other, "Ignoring webhook event");
        }
    }

    Ok(StatusCode::OK)
}

async fn handle_push(state: &AppState, push: PushEvent) -> Result<(), ApiError> {
    info!(
        repository = %push.repository,
        r#ref = %push.r#ref,
        after = %push.after,
        commits = push.commits.len(),
        "Received push"
    );

    let Some(repository) = state.dao.repository.get_by_name(&push.repository).await? else {
        info!(repository = %push.repository, "Push for unknown repository");
        return Ok(());
    };

    let jobs = state.dao.job.list_by_repository(repository.id).await?;
    for job in jobs {
        let revisions = if job.all_revision {
            push.commits.clone()
        } else {
            vec![push.after.clone()]
        };

        let request = BuildRequest {
            job_id: Some(job.id),
            repository: None,
            command: None,
            target: None,
            revisions,
            via: Via::Webhook,
            actor: None,
        };
        match state.builder.build(request).await {
            Ok(tasks) => {
                info!(job = job.id, tasks = tasks.len(), "Triggered build from push");
            }
            Err(Error::Conflict(msg)) => {
                info!(job = job.id, %msg, "Skipped exclusive job");
            }
            Err(e) => {
                error!(job = job.id, error = %e, "Failed to trigger build");
            }
        }
    }

    Ok(())
}

/// Verify the `X-Hub-Signature-256` header.
pub fn verify_signature(secret: &str, body: &[u8], signature: Option<&str>) -> bool {
    let Some(signature) = signature else {
        return false;
    };
    let Some(sig_hex) = signature.strip_prefix("sha256=") else {
        return false;
    };
    let Ok(sig_bytes) = hex::decode(sig_hex) else {
        return false;
    };

    let mut mac =
        Hmac::<Sha256>::new_from_slice(secret.as_bytes()).expect("HMAC can take any size key");
    mac.update(body);

    mac.verify_slice(&sig_bytes).is_ok()
}
