use super::{
    hex_address_eq, integer_text, settle, tokens, unix_seconds, Candidate, LedgerAdapter,
    TokenContract, VerificationRequest,
};
use crate::models::{Network, VerificationResult};
use crate::services::explorer::{ExplorerClient, ExplorerError, ExplorerRequest};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

const EMPTY_RESULT_MESSAGE: &str = "No transactions found";

/// Etherscan-family explorers (Etherscan, BscScan, PolygonScan).
pub struct EvmAdapter {
    network: Network,
    explorer: Arc<ExplorerClient>,
    base_url: String,
    api_key: Option<String>,
    tokens: Vec<TokenContract>,
}

impl EvmAdapter {
    pub fn new(
        network: Network,
        explorer: Arc<ExplorerClient>,
        base_url: impl Into<String>,
        api_key: Option<String>,
    ) -> Self {
        Self {
            network,
            explorer,
            base_url: base_url.into(),
            api_key,
            tokens: tokens::default_tokens(network),
        }
    }

    fn build_request(&self, request: &VerificationRequest) -> ExplorerRequest {
        let base = ExplorerRequest::new(self.network, format!("{}/api", self.base_url))
            .query("module", "account");
        let base = match &request.token {
            Some(token) => base
                .query("action", "tokentx")
                .query("contractaddress", token.contract_address.as_str()),
            None => base.query("action", "txlist"),
        };
        base.query("address", request.address.as_str())
            .query("startblock", "0")
            .query("endblock", "99999999")
            .query("sort", "desc")
            .secret("apikey", self.api_key.as_deref())
    }
}

#[async_trait]
impl LedgerAdapter for EvmAdapter {
    fn network(&self) -> Network {
        self.network
    }

    fn token_contract(&self, symbol: &str) -> Option<TokenContract> {
        tokens::lookup(&self.tokens, symbol)
    }

    async fn verify(&self, request: &VerificationRequest) -> VerificationResult {
        let native_decimals = self.network.native_decimals();
        let fetched = self
            .explorer
            .get_json(self.build_request(request), validate)
            .await;

        settle(
            fetched,
            |payload, req| parse(payload, req, native_decimals),
            request,
            hex_address_eq,
        )
    }
}

/// `status: "1"` is success. `status: "0"` is an error unless the explorer
/// is just reporting an empty history.
fn validate(payload: &Value) -> Result<(), ExplorerError> {
    let status = payload.get("status").and_then(Value::as_str).unwrap_or("");
    let message = payload.get("message").and_then(Value::as_str).unwrap_or("");
    match status {
        "1" => Ok(()),
        "0" if message.starts_with(EMPTY_RESULT_MESSAGE) => Ok(()),
        _ => {
            // Etherscan puts the useful detail in `result` on errors.
            let detail = payload
                .get("result")
                .and_then(Value::as_str)
                .filter(|r| !r.is_empty())
                .unwrap_or(if message.is_empty() { "Unknown error" } else { message });
            Err(ExplorerError::Api(detail.to_string()))
        }
    }
}

fn parse(
    payload: &Value,
    request: &VerificationRequest,
    native_decimals: u32,
) -> Result<Vec<Candidate>, String> {
    let Some(rows) = payload.get("result").and_then(Value::as_array) else {
        return Ok(Vec::new());
    };

    let decimals = request
        .token
        .as_ref()
        .map(|t| t.decimals)
        .unwrap_or(native_decimals);

    let mut candidates = Vec::new();
    for row in rows {
        if row.get("isError").and_then(Value::as_str) == Some("1") {
            continue;
        }
        if let (Some(token), Some(contract)) = (
            &request.token,
            row.get("contractAddress").and_then(Value::as_str),
        ) {
            if !hex_address_eq(contract, &token.contract_address) {
                continue;
            }
        }
        let (Some(hash), Some(to), Some(value), Some(timestamp)) = (
            row.get("hash").and_then(Value::as_str),
            row.get("to").and_then(Value::as_str),
            row.get("value").and_then(integer_text),
            row.get("timeStamp").and_then(unix_seconds),
        ) else {
            continue;
        };
        candidates.push(Candidate {
            tx_hash: hash.to_string(),
            to: to.to_string(),
            raw_value: value,
            decimals,
            timestamp,
        });
    }
    Ok(candidates)
}
