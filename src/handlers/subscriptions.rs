use super::AppState;
use crate::error::{ReconcilerError, Result};
use crate::models::{ApiResponse, Subscription, SubscriptionStatus};
use crate::services::{NewSubscription, SubscriptionFilter};
use axum::{
    extract::{Path, Query, State},
    Json,
};
use chrono::Utc;
use serde::Deserialize;

#[derive(Debug, Default, Deserialize)]
pub struct ListParams {
    pub merchant_id: Option<String>,
    pub client_email: Option<String>,
    pub status: Option<SubscriptionStatus>,
}

pub async fn create_subscription(
    State(state): State<AppState>,
    Json(request): Json<NewSubscription>,
) -> Result<Json<ApiResponse<Subscription>>> {
    let sub = state.engine.subscriptions.create(request).await?;
    Ok(Json(ApiResponse::ok(sub)))
}

pub async fn list_subscriptions(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> Result<Json<ApiResponse<Vec<Subscription>>>> {
    let filter = SubscriptionFilter {
        merchant_id: params.merchant_id,
        client_email: params.client_email,
        status: params.status,
    };
    let subs = state.engine.subscriptions.list(&filter).await?;
    Ok(Json(ApiResponse::ok(subs)))
}

pub async fn get_subscription(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ApiResponse<Subscription>>> {
    Ok(Json(ApiResponse::ok(state.engine.subscriptions.get(&id).await?)))
}

pub async fn subscription_action(
    State(state): State<AppState>,
    Path((id, action)): Path<(String, String)>,
) -> Result<Json<ApiResponse<Subscription>>> {
    let service = &state.engine.subscriptions;
    let sub = match action.as_str() {
        "pause" => service.pause(&id).await?,
        "resume" => service.resume(&id, Utc::now()).await?,
        "cancel" => service.cancel(&id, Utc::now()).await?,
        other => {
            return Err(ReconcilerError::Validation(format!(
                "unknown subscription action: {}",
                other
            )))
        }
    };
    Ok(Json(ApiResponse::ok(sub)))
}
