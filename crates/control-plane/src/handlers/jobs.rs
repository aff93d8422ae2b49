//! Job queue API handlers.

use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::{Deserialize, Serialize};

use crate::db::models::job::{Job, JobKey};
use crate::error::AppError;
use crate::state::AppState;

/// Query parameters for leasing.
#[derive(Debug, Clone, Deserialize)]
pub struct LeaseQuery {
    /// Capability tag to lease from.
    pub tag: String,

    /// Leasing worker name.
    pub worker: String,

    /// Lease duration override in seconds.
    #[serde(default)]
    pub seconds: Option<u64>,
}

/// Body for lease maintenance operations.
#[derive(Debug, Clone, Deserialize)]
pub struct LeaseOpRequest {
    pub worker: String,

    /// Extension duration for `extend`.
    #[serde(default)]
    pub seconds: Option<u64>,

    /// Reason for `nack`, logged only.
    #[serde(default)]
    pub reason: Option<String>,
}

/// Acknowledgement response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaseOpResponse {
    pub key: String,
    pub applied: bool,
}

/// `GET /api/jobs/lease?tag=...&worker=...`
///
/// Body is `null` when nothing is leasable for the tag.
pub async fn lease(
    State(state): State<AppState>,
    Query(query): Query<LeaseQuery>,
) -> Result<Json<Option<Job>>, AppError> {
    let seconds = query.seconds.unwrap_or(state.config.lease_seconds);
    let job = state.queue.lease(&query.tag, &query.worker, seconds).await?;
    Ok(Json(job))
}

/// `POST /api/jobs/{key}/ack`
pub async fn ack(
    State(state): State<AppState>,
    Path(key): Path<String>,
    Json(request): Json<LeaseOpRequest>,
) -> Result<Json<LeaseOpResponse>, AppError> {
    let key = parse_key(&key)?;
    let applied = state.queue.ack(&key, &request.worker).await?;
    Ok(Json(LeaseOpResponse {
        key: key.encode(),
        applied,
    }))
}

/// `POST /api/jobs/{key}/nack`
pub async fn nack(
    State(state): State<AppState>,
    Path(key): Path<String>,
    Json(request): Json<LeaseOpRequest>,
) -> Result<Json<LeaseOpResponse>, AppError> {
    let key = parse_key(&key)?;
    if let Some(reason) = &request.reason {
        tracing::warn!(key = %key, worker = %request.worker, reason = %reason, "Job nacked");
    }
    let applied = state.queue.nack(&key, &request.worker).await?;
    Ok(Json(LeaseOpResponse {
        key: key.encode(),
        applied,
    }))
}

/// `POST /api/jobs/{key}/extend`
pub async fn extend(
    State(state): State<AppState>,
    Path(key): Path<String>,
    Json(request): Json<LeaseOpRequest>,
) -> Result<Json<LeaseOpResponse>, AppError> {
    let key = parse_key(&key)?;
    let seconds = request.seconds.unwrap_or(state.config.lease_seconds);
    let applied = state.queue.extend(&key, &request.worker, seconds).await?;
    Ok(Json(LeaseOpResponse {
        key: key.encode(),
        applied,
    }))
}

fn parse_key(raw: &str) -> Result<JobKey, AppError> {
    JobKey::decode(raw)
        .ok_or_else(|| AppError::Validation(format!("Invalid job key: {}", raw)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_key() {
        let key = parse_key("12:fetch:1:-1").unwrap();
        assert_eq!(key.step_name, "fetch");
        assert!(key.loop_index.is_none());

        assert!(parse_key("garbage").is_err());
    }

    #[test]
    fn test_lease_op_request_defaults() {
        let request: LeaseOpRequest = serde_json::from_str(r#"{"worker": "w1"}"#).unwrap();
        assert_eq!(request.worker, "w1");
        assert!(request.seconds.is_none());
    }
}
