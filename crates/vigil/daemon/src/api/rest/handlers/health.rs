//! Health handler

use crate::api::rest::state::AppState;
use axum::{extract::State, Json};
use serde::{Deserialize, Serialize};

/// Health check response
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthCheckResponse {
    pub status: String,
    pub version: String,
    pub uptime: String,
    pub streams: usize,
    pub conditions: usize,
    pub escalations_in_flight: usize,
}

/// Health check endpoint
pub async fn health_check(State(state): State<AppState>) -> Json<HealthCheckResponse> {
    Json(HealthCheckResponse {
        status: "healthy".to_string(),
        version: state.version.clone(),
        uptime: state.uptime(),
        streams: state.engine.registry().len(),
        conditions: state.engine.store().len(),
        escalations_in_flight: state.engine.coordinator().in_flight_count(),
    })
}
