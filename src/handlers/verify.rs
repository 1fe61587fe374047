use super::AppState;
use crate::error::{ReconcilerError, Result};
use crate::models::TriggerResponse;
use axum::{
    extract::{Query, State},
    Json,
};
use serde::Deserialize;

#[derive(Debug, Default, Deserialize)]
pub struct VerifyParams {
    /// Run the sweep inline and return its report.
    #[serde(default)]
    pub wait: bool,
}

pub async fn verify_pending(
    State(state): State<AppState>,
    Query(params): Query<VerifyParams>,
) -> Result<Json<TriggerResponse>> {
    let engine = state.engine;

    if params.wait {
        let report = engine
            .verify_pending()
            .await
            .ok_or_else(|| ReconcilerError::InternalError("verification sweep panicked".into()))?;
        return Ok(Json(TriggerResponse {
            success: true,
            message: format!(
                "Checked {} transactions, {} completed",
                report.examined, report.completed
            ),
            report: Some(report),
        }));
    }

    if engine.reconciler.is_running().await {
        engine.trigger_verification();
    } else {
        tokio::spawn(async move {
            engine.verify_pending().await;
        });
    }
    tracing::info!("Manual verification triggered");

    Ok(Json(TriggerResponse {
        success: true,
        message: "Verification sweep started".to_string(),
        report: None,
    }))
}
