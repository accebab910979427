//! Health, liveness, and readiness probes.

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde_json::json;

use super::AppState;
use crate::shutdown::HealthState;

/// Detailed health as JSON. Always 200; `state` carries the verdict.
pub async fn health_handler(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "state": state.shutdown.health_state().as_str(),
        "in_flight": state.shutdown.in_flight_count(),
        "uptime_secs": state.start_time.elapsed().as_secs(),
    }))
}

/// Liveness: the process answers.
pub async fn liveness_handler() -> StatusCode {
    StatusCode::OK
}

/// Readiness: 200 only while the responder is consuming requests.
pub async fn readiness_handler(State(state): State<AppState>) -> StatusCode {
    if state.shutdown.health_state() == HealthState::Ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}
