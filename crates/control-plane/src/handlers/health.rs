//! Health check endpoints.

use axum::{extract::State, Json};
use serde::{Deserialize, Serialize};

use crate::db::pool::health_check as db_health_check;
use crate::state::AppState;

/// Basic health response.
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthCheckResponse {
    pub status: String,
}

/// Detailed health response.
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiHealthResponse {
    pub status: String,
    pub database: String,
    pub nats: String,
    pub uptime_seconds: u64,
    pub version: String,
}

/// `GET /health` - load-balancer probe.
pub async fn health_check() -> Json<HealthCheckResponse> {
    Json(HealthCheckResponse {
        status: "ok".to_string(),
    })
}

/// `GET /api/health` - dependency-aware health.
pub async fn api_health(State(state): State<AppState>) -> Json<ApiHealthResponse> {
    let database_ok = db_health_check(&state.db).await;

    Json(ApiHealthResponse {
        status: if database_ok { "ok" } else { "degraded" }.to_string(),
        database: if database_ok { "connected" } else { "unreachable" }.to_string(),
        nats: if state.notifier.has_nats() {
            "connected"
        } else {
            "disabled"
        }
        .to_string(),
        uptime_seconds: state.uptime_seconds(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}
