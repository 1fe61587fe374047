use super::{
    exact_address_eq, integer_text, settle, tokens, unix_millis, upstream_message, Candidate,
    LedgerAdapter, TokenContract, VerificationRequest,
};
use crate::models::{Network, VerificationResult};
use crate::services::explorer::{ExplorerClient, ExplorerError, ExplorerRequest};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

const PAGE_SIZE: &str = "30";

/// Tronscan. Native TRX and TRC-20 transfers live behind different
/// endpoints with different field names; timestamps are milliseconds.
pub struct TronAdapter {
    explorer: Arc<ExplorerClient>,
    base_url: String,
    api_key: Option<String>,
    tokens: Vec<TokenContract>,
}

impl TronAdapter {
    pub fn new(
        explorer: Arc<ExplorerClient>,
        base_url: impl Into<String>,
        api_key: Option<String>,
    ) -> Self {
        Self {
            explorer,
            base_url: base_url.into(),
            api_key,
            tokens: tokens::default_tokens(Network::Tron),
        }
    }
}

#[async_trait]
impl LedgerAdapter for TronAdapter {
    fn network(&self) -> Network {
        Network::Tron
    }

    fn token_contract(&self, symbol: &str) -> Option<TokenContract> {
        tokens::lookup(&self.tokens, symbol)
    }

    async fn verify(&self, request: &VerificationRequest) -> VerificationResult {
        match &request.token {
            None => {
                let call = ExplorerRequest::new(
                    Network::Tron,
                    format!("{}/api/transaction", self.base_url),
                )
                .query("address", request.address.as_str())
                .query("count", PAGE_SIZE)
                .query("start", "0")
                .query("sort", "-timestamp")
                .header("TRON-PRO-API-KEY", self.api_key.as_deref());

                let fetched = self
                    .explorer
                    .get_json(call, |p| require_array(p, "data"))
                    .await;
                settle(fetched, parse_native, request, exact_address_eq)
            }
            Some(token) => {
                let call = ExplorerRequest::new(
                    Network::Tron,
                    format!("{}/api/token_trc20/transfers", self.base_url),
                )
                .query("relatedAddress", request.address.as_str())
                .query("contract_address", token.contract_address.as_str())
                .query("limit", PAGE_SIZE)
                .query("start", "0")
                .header("TRON-PRO-API-KEY", self.api_key.as_deref());

                let fetched = self
                    .explorer
                    .get_json(call, |p| require_array(p, "token_transfers"))
                    .await;
                settle(fetched, parse_trc20, request, exact_address_eq)
            }
        }
    }
}

fn require_array(payload: &Value, field: &str) -> Result<(), ExplorerError> {
    if payload.get(field).map(Value::is_array).unwrap_or(false) {
        Ok(())
    } else {
        Err(ExplorerError::Api(upstream_message(payload)))
    }
}

fn parse_native(payload: &Value, _request: &VerificationRequest) -> Result<Vec<Candidate>, String> {
    let rows = payload
        .get("data")
        .and_then(Value::as_array)
        .ok_or_else(|| "API error: missing data".to_string())?;

    Ok(rows
        .iter()
        .filter_map(|row| {
            Some(Candidate {
                tx_hash: row.get("hash")?.as_str()?.to_string(),
                to: row.get("toAddress")?.as_str()?.to_string(),
                raw_value: row.get("amount").and_then(integer_text)?,
                decimals: Network::Tron.native_decimals(),
                timestamp: row.get("timestamp").and_then(unix_millis)?,
            })
        })
        .collect())
}

fn parse_trc20(payload: &Value, request: &VerificationRequest) -> Result<Vec<Candidate>, String> {
    let rows = payload
        .get("token_transfers")
        .and_then(Value::as_array)
        .ok_or_else(|| "API error: missing token_transfers".to_string())?;
    let decimals = request
        .token
        .as_ref()
        .map(|t| t.decimals)
        .unwrap_or(Network::Tron.native_decimals());

    Ok(rows
        .iter()
        .filter_map(|row| {
            Some(Candidate {
                tx_hash: row.get("transaction_id")?.as_str()?.to_string(),
                to: row.get("to_address")?.as_str()?.to_string(),
                raw_value: row.get("quant").and_then(integer_text)?,
                decimals,
                timestamp: row.get("block_ts").and_then(unix_millis)?,
            })
        })
        .collect())
}
