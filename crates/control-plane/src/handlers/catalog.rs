//! Catalog API handlers.

use axum::{
    extract::{Query, State},
    Json,
};
use serde::{Deserialize, Serialize};

use crate::db::models::catalog::CatalogSummary;
use crate::error::AppError;
use crate::services::catalog::RegisterResponse;
use crate::state::AppState;

/// Request to register a playbook.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRequest {
    /// Raw playbook YAML.
    pub content: String,
}

/// Query parameters for catalog listings.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListQuery {
    pub path: Option<String>,
}

/// Query parameters for fetching one playbook.
#[derive(Debug, Clone, Deserialize)]
pub struct ResourceQuery {
    pub path: String,
    pub version: Option<i32>,
}

/// Playbook content response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceResponse {
    pub catalog_id: String,
    pub path: String,
    pub version: i32,
    pub content: String,
    pub content_hash: String,
}

/// `POST /api/catalog/register`
pub async fn register(
    State(state): State<AppState>,
    Json(request): Json<RegisterRequest>,
) -> Result<Json<RegisterResponse>, AppError> {
    let response = state.catalog.register(&request.content).await?;
    Ok(Json(response))
}

/// `GET /api/catalog/list`
pub async fn list(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<CatalogSummary>>, AppError> {
    let entries = state.catalog.list(query.path.as_deref()).await?;
    Ok(Json(entries))
}

/// `GET /api/catalog/resource`
pub async fn get_resource(
    State(state): State<AppState>,
    Query(query): Query<ResourceQuery>,
) -> Result<Json<ResourceResponse>, AppError> {
    let (entry, _) = state.catalog.load(&query.path, query.version).await?;
    Ok(Json(ResourceResponse {
        catalog_id: entry.catalog_id.to_string(),
        path: entry.path,
        version: entry.version,
        content: entry.content,
        content_hash: entry.content_hash,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_request_deserialization() {
        let json = r#"{"content": "apiVersion: noetl.io/v2"}"#;
        let request: RegisterRequest = serde_json::from_str(json).unwrap();
        assert!(request.content.contains("noetl.io"));
    }
}
