use super::AppState;
use crate::models::HealthStatus;
use axum::{extract::State, Json};

pub async fn health_check(State(state): State<AppState>) -> Json<HealthStatus> {
    Json(state.engine.health().await)
}
