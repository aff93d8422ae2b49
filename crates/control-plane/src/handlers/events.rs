//! Worker event API handler.
//!
//! `POST /api/events` is the worker side of the event log's
//! compare-and-append: publications go through the guarded path, so a
//! duplicate `step_started` or duplicate terminal for the same
//! `(execution_id, step_name, attempt, loop_index)` comes back `409` and a
//! publication into a closed execution is rejected before anything is
//! written. Workers treat both as "drop and ack".

use axum::{extract::State, http::StatusCode, Json};
use serde::{Deserialize, Serialize};

use crate::db::models::event::{EventKind, NewEvent};
use crate::error::AppError;
use crate::services::event::PublishOutcome;
use crate::state::AppState;

/// Worker-originated event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRequest {
    /// Execution ID (string to survive JSON number precision).
    pub execution_id: String,

    /// Event kind wire name.
    pub kind: String,

    /// Step name.
    #[serde(default)]
    pub step_name: Option<String>,

    /// Attempt number.
    #[serde(default = "default_attempt")]
    pub attempt: i32,

    /// Loop index for iterator children.
    #[serde(default)]
    pub loop_index: Option<i32>,

    /// Kind-specific payload.
    #[serde(default)]
    pub payload: serde_json::Value,

    /// Publishing worker, recorded in the payload.
    #[serde(default)]
    pub worker: Option<String>,
}

fn default_attempt() -> i32 {
    1
}

/// Response for an accepted publication.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventResponse {
    pub outcome: PublishOutcome,
}

/// `POST /api/events`
pub async fn publish(
    State(state): State<AppState>,
    Json(request): Json<EventRequest>,
) -> Result<(StatusCode, Json<EventResponse>), AppError> {
    let execution_id: i64 = request
        .execution_id
        .parse()
        .map_err(|_| AppError::Validation("Invalid execution_id".to_string()))?;

    let kind = EventKind::parse(&request.kind)
        .ok_or_else(|| AppError::Validation(format!("Unknown event kind: {}", request.kind)))?;

    // Workers report step-level facts; execution-level transitions belong
    // to the broker and the cancel endpoint.
    if !matches!(
        kind,
        EventKind::StepStarted
            | EventKind::StepProgress
            | EventKind::StepCompleted
            | EventKind::StepFailed
    ) {
        return Err(AppError::Validation(format!(
            "Workers may not publish '{}' events",
            request.kind
        )));
    }

    if request.step_name.as_deref().unwrap_or("").is_empty() {
        return Err(AppError::Validation(
            "Step events require step_name".to_string(),
        ));
    }

    let mut payload = request.payload;
    if let Some(worker) = &request.worker {
        if let Some(obj) = payload.as_object_mut() {
            obj.insert("worker".to_string(), serde_json::json!(worker));
        } else if payload.is_null() {
            payload = serde_json::json!({"worker": worker});
        }
    }

    let event = NewEvent {
        kind,
        step_name: request.step_name,
        attempt: request.attempt,
        loop_index: request.loop_index,
        payload,
    };

    let outcome = state.events.publish(execution_id, event).await?;

    let status = match &outcome {
        PublishOutcome::Appended { .. } => StatusCode::CREATED,
        // The idempotency guard on the attempt key rejected a duplicate, or
        // the execution is closed: both are 409 so at-least-once delivery
        // collapses to exactly-once progression.
        PublishOutcome::Duplicate | PublishOutcome::ExecutionClosed => StatusCode::CONFLICT,
    };

    Ok((status, Json(EventResponse { outcome })))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_request_defaults() {
        let json = r#"{"execution_id": "7", "kind": "step_started", "step_name": "build"}"#;
        let request: EventRequest = serde_json::from_str(json).unwrap();
        assert_eq!(request.attempt, 1);
        assert!(request.loop_index.is_none());
        assert!(request.payload.is_null());
    }

    #[test]
    fn test_event_response_serialization() {
        let response = EventResponse {
            outcome: PublishOutcome::Appended { seq: 3 },
        };
        let json = serde_json::to_string(&response).unwrap();
        assert!(json.contains("appended"));
    }
}
