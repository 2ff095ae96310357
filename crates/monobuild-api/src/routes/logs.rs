//! Log proxy.

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::header;
use axum::response::Response;
use monobuild_core::logs::parse_log_file_key;

use crate::AppState;
use crate::error::ApiError;

/// `GET /logs/{job_id}/{task_id}.log` — stream the log object.
pub async fn fetch(
    State(state): State<AppState>,
    Path((job_id, file)): Path<(i32, String)>,
) -> Result<Response, ApiError> {
    let key = format!("logs/{}/{}", job_id, file);
    if parse_log_file_key(&key).is_none() {
        return Err(ApiError::BadRequest(format!("not a log key: {}", key)));
    }

    let stream = state.storage.get(&key).await?;
    let response = Response::builder()
        .header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(Body::from_stream(stream))
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_validation() {
        assert!(parse_log_file_key("logs/1/2.log").is_some());
        assert!(parse_log_file_key("logs/1/../secret").is_none());
        assert!(parse_log_file_key("logs/1/2.txt").is_none());
    }
}
