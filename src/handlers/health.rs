use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use std::sync::Arc;

use crate::health::ServingStatus;
use crate::state::AppState;

fn probe(status: ServingStatus) -> impl IntoResponse {
    let code = match status {
        ServingStatus::Serving => StatusCode::OK,
        ServingStatus::NotServing => StatusCode::SERVICE_UNAVAILABLE,
    };
    (code, Json(serde_json::json!({ "status": status })))
}

// health handler: full report
pub async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let report = state.health.report(&state.registry);
    let code = match report.ready {
        ServingStatus::Serving => StatusCode::OK,
        ServingStatus::NotServing => StatusCode::SERVICE_UNAVAILABLE,
    };
    (code, Json(report))
}

pub async fn ready_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    probe(state.health.ready())
}

pub async fn alive_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    probe(state.health.alive())
}

pub async fn startup_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    probe(state.health.startup())
}
