use super::{
    exact_address_eq, integer_text, settle, unix_seconds, upstream_message, Candidate,
    LedgerAdapter, TokenContract, VerificationRequest,
};
use crate::models::{Network, VerificationResult};
use crate::services::explorer::{ExplorerClient, ExplorerError, ExplorerRequest};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

/// Solscan account history. Native SOL moves show up as parsed `transfer`
/// inner instructions carrying lamports.
pub struct SolanaAdapter {
    explorer: Arc<ExplorerClient>,
    base_url: String,
    api_key: Option<String>,
}

impl SolanaAdapter {
    pub fn new(
        explorer: Arc<ExplorerClient>,
        base_url: impl Into<String>,
        api_key: Option<String>,
    ) -> Self {
        Self {
            explorer,
            base_url: base_url.into(),
            api_key,
        }
    }
}

#[async_trait]
impl LedgerAdapter for SolanaAdapter {
    fn network(&self) -> Network {
        Network::Solana
    }

    fn token_contract(&self, _symbol: &str) -> Option<TokenContract> {
        None
    }

    async fn verify(&self, request: &VerificationRequest) -> VerificationResult {
        if let Some(token) = &request.token {
            return VerificationResult::failed(format!(
                "Token {} is not supported on solana",
                token.symbol
            ));
        }

        let call = ExplorerRequest::new(
            Network::Solana,
            format!("{}/account/transactions", self.base_url),
        )
        .query("account", request.address.as_str())
        .query("limit", "20")
        .header("token", self.api_key.as_deref());

        let fetched = self.explorer.get_json(call, validate).await;
        settle(fetched, parse, request, exact_address_eq)
    }
}

fn validate(payload: &Value) -> Result<(), ExplorerError> {
    if payload.is_array() {
        Ok(())
    } else {
        Err(ExplorerError::Api(upstream_message(payload)))
    }
}

fn parse(payload: &Value, _request: &VerificationRequest) -> Result<Vec<Candidate>, String> {
    let txs = payload
        .as_array()
        .ok_or_else(|| "API error: expected a transaction list".to_string())?;

    let mut candidates = Vec::new();
    for tx in txs {
        let (Some(signature), Some(timestamp)) = (
            tx.get("signature").and_then(Value::as_str),
            tx.get("blockTime").and_then(unix_seconds),
        ) else {
            continue;
        };

        let groups = tx
            .pointer("/meta/innerInstructions")
            .and_then(Value::as_array);
        let instructions = groups
            .into_iter()
            .flatten()
            .filter_map(|group| group.get("instructions").and_then(Value::as_array))
            .flatten();

        for instruction in instructions {
            let Some(parsed) = instruction.get("parsed") else {
                continue;
            };
            if parsed.get("type").and_then(Value::as_str) != Some("transfer") {
                continue;
            }
            let (Some(destination), Some(lamports)) = (
                parsed.pointer("/info/destination").and_then(Value::as_str),
                parsed.pointer("/info/lamports").and_then(integer_text),
            ) else {
                continue;
            };
            candidates.push(Candidate {
                tx_hash: signature.to_string(),
                to: destination.to_string(),
                raw_value: lamports,
                decimals: Network::Solana.native_decimals(),
                timestamp,
            });
        }
    }
    Ok(candidates)
}
