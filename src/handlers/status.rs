use super::AppState;
use crate::error::Result;
use crate::models::{ApiResponse, StatusInfo};
use axum::{extract::State, Json};

pub async fn get_status(State(state): State<AppState>) -> Result<Json<ApiResponse<StatusInfo>>> {
    let status = state.engine.status().await?;
    Ok(Json(ApiResponse::ok(status)))
}
