use super::AppState;
use crate::error::{ReconcilerError, Result};
use crate::models::ApiResponse;
use crate::services::{format_currency, RateTable};
use axum::{
    extract::{Path, Query, State},
    Json,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Default, Deserialize)]
pub struct RatesParams {
    /// Skip the cache and fetch a fresh table.
    #[serde(default)]
    pub refresh: bool,
}

pub async fn get_rates(
    State(state): State<AppState>,
    Query(params): Query<RatesParams>,
) -> Result<Json<ApiResponse<RateTable>>> {
    let exchange = &state.engine.exchange;
    let table = if params.refresh {
        exchange.refresh_rates().await
    } else {
        exchange.rates().await
    }
    .map_err(|e| ReconcilerError::Upstream(e.to_string()))?;
    Ok(Json(ApiResponse::ok(table)))
}

#[derive(Debug, Deserialize)]
pub struct ConvertParams {
    pub amount: Decimal,
    pub from: String,
    pub to: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Conversion {
    pub amount: Decimal,
    pub from: String,
    pub to: String,
    pub result: Decimal,
    pub formatted: String,
}

pub async fn convert(
    State(state): State<AppState>,
    Query(params): Query<ConvertParams>,
) -> Result<Json<ApiResponse<Conversion>>> {
    let result = state
        .engine
        .exchange
        .convert(params.amount, &params.from, &params.to)
        .await
        .ok_or_else(|| {
            ReconcilerError::Upstream(format!("No rate for {} to {}", params.from, params.to))
        })?;
    Ok(Json(ApiResponse::ok(Conversion {
        formatted: format_currency(result, &params.to, None),
        amount: params.amount,
        from: params.from,
        to: params.to,
        result,
    })))
}

pub async fn get_rate(
    State(state): State<AppState>,
    Path((crypto, fiat)): Path<(String, String)>,
) -> Result<Json<ApiResponse<Decimal>>> {
    state
        .engine
        .exchange
        .get_rate(&crypto, &fiat)
        .await
        .map(|rate| Json(ApiResponse::ok(rate)))
        .ok_or_else(|| ReconcilerError::NotFound(format!("rate for {} in {}", crypto, fiat)))
}
