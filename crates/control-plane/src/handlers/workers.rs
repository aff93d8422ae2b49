//! Worker registry API handlers.

use axum::{
    extract::{Path, State},
    Json,
};
use serde::{Deserialize, Serialize};

use crate::db::models::worker::WorkerRecord;
use crate::error::AppError;
use crate::services::registry::RegisterWorkerRequest;
use crate::state::AppState;

/// Simple acknowledgement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AckResponse {
    pub status: String,
}

/// `POST /api/workers/register`
pub async fn register(
    State(state): State<AppState>,
    Json(request): Json<RegisterWorkerRequest>,
) -> Result<Json<WorkerRecord>, AppError> {
    let record = state.registry.register(&request).await?;
    Ok(Json(record))
}

/// `POST /api/workers/{name}/heartbeat`
pub async fn heartbeat(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<AckResponse>, AppError> {
    state.registry.heartbeat(&name).await?;
    Ok(Json(AckResponse {
        status: "ok".to_string(),
    }))
}

/// `DELETE /api/workers/{name}`
pub async fn deregister(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<AckResponse>, AppError> {
    state.registry.deregister(&name).await?;
    Ok(Json(AckResponse {
        status: "deregistered".to_string(),
    }))
}

/// `GET /api/workers`
pub async fn list(State(state): State<AppState>) -> Result<Json<Vec<WorkerRecord>>, AppError> {
    let workers = state.registry.list().await?;
    Ok(Json(workers))
}
