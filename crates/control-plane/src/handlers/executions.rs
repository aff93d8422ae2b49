//! Execution API handlers.

use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::services::execution::{
    ExecutionStatusResponse, ExecutionSummary, StartExecutionRequest, StartExecutionResponse,
};
use crate::state::AppState;

/// Query parameters for execution listings.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListQuery {
    pub path: Option<String>,
    pub limit: Option<i64>,
}

/// Cancellation acknowledgement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelResponse {
    pub execution_id: String,
    pub status: String,
}

/// Cancellation-check response for workers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancellationCheckResponse {
    pub execution_id: String,
    pub cancelled: bool,
}

/// `POST /api/executions` - start a playbook execution.
pub async fn start(
    State(state): State<AppState>,
    Json(request): Json<StartExecutionRequest>,
) -> Result<Json<StartExecutionResponse>, AppError> {
    let response = state.executions.start(&request).await?;
    // The broker picks the new execution up on its wake.
    state
        .notifier
        .execution_changed(response.execution_id.parse().unwrap_or_default())
        .await;
    Ok(Json(response))
}

/// `GET /api/executions` - list executions.
pub async fn list(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<ExecutionSummary>>, AppError> {
    let limit = query.limit.unwrap_or(50).clamp(1, 200);
    let summaries = state.executions.list(query.path.as_deref(), limit).await?;
    Ok(Json(summaries))
}

/// `GET /api/executions/{id}/status`
pub async fn get_status(
    State(state): State<AppState>,
    Path(execution_id): Path<i64>,
) -> Result<Json<ExecutionStatusResponse>, AppError> {
    let status = state.executions.status(execution_id).await?;
    Ok(Json(status))
}

/// `POST /api/executions/{id}/cancel`
pub async fn cancel(
    State(state): State<AppState>,
    Path(execution_id): Path<i64>,
) -> Result<Json<CancelResponse>, AppError> {
    state.executions.cancel(execution_id).await?;
    Ok(Json(CancelResponse {
        execution_id: execution_id.to_string(),
        status: "cancelled".to_string(),
    }))
}

/// `GET /api/executions/{id}/cancellation-check`
///
/// Workers poll this before publishing results.
pub async fn cancellation_check(
    State(state): State<AppState>,
    Path(execution_id): Path<i64>,
) -> Result<Json<CancellationCheckResponse>, AppError> {
    let cancelled = state.executions.is_cancelled(execution_id).await?;
    Ok(Json(CancellationCheckResponse {
        execution_id: execution_id.to_string(),
        cancelled,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_list_query_defaults() {
        let query: ListQuery = serde_json::from_str("{}").unwrap();
        assert!(query.path.is_none());
        assert!(query.limit.is_none());
    }

    #[test]
    fn test_cancel_response_serialization() {
        let response = CancelResponse {
            execution_id: "42".to_string(),
            status: "cancelled".to_string(),
        };
        let json = serde_json::to_string(&response).unwrap();
        assert!(json.contains("cancelled"));
    }
}
