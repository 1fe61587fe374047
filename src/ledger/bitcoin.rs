use super::{
    exact_address_eq, integer_text, settle, unix_seconds, upstream_message, Candidate,
    LedgerAdapter, TokenContract, VerificationRequest,
};
use crate::models::{Network, VerificationResult};
use crate::services::explorer::{ExplorerClient, ExplorerError, ExplorerRequest};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

/// blockchain.info `rawaddr` lookups. Every output of every listed
/// transaction is a candidate.
pub struct BitcoinAdapter {
    explorer: Arc<ExplorerClient>,
    base_url: String,
}

impl BitcoinAdapter {
    pub fn new(explorer: Arc<ExplorerClient>, base_url: impl Into<String>) -> Self {
        Self {
            explorer,
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl LedgerAdapter for BitcoinAdapter {
    fn network(&self) -> Network {
        Network::Bitcoin
    }

    fn token_contract(&self, _symbol: &str) -> Option<TokenContract> {
        None
    }

    async fn verify(&self, request: &VerificationRequest) -> VerificationResult {
        if let Some(token) = &request.token {
            return VerificationResult::failed(format!(
                "Token {} is not supported on bitcoin",
                token.symbol
            ));
        }

        let url = format!("{}/rawaddr/{}", self.base_url, request.address);
        let fetched = self
            .explorer
            .get_json(ExplorerRequest::new(Network::Bitcoin, url), validate)
            .await;

        settle(fetched, parse, request, exact_address_eq)
    }
}

fn validate(payload: &Value) -> Result<(), ExplorerError> {
    if payload.get("txs").map(Value::is_array).unwrap_or(false) {
        Ok(())
    } else {
        Err(ExplorerError::Api(upstream_message(payload)))
    }
}

fn parse(payload: &Value, _request: &VerificationRequest) -> Result<Vec<Candidate>, String> {
    let txs = payload
        .get("txs")
        .and_then(Value::as_array)
        .ok_or_else(|| "API error: missing txs".to_string())?;

    let mut candidates = Vec::new();
    for tx in txs {
        let (Some(hash), Some(timestamp)) = (
            tx.get("hash").and_then(Value::as_str),
            tx.get("time").and_then(unix_seconds),
        ) else {
            continue;
        };
        let outputs = tx.get("out").and_then(Value::as_array);
        for output in outputs.into_iter().flatten() {
            // OP_RETURN and similar outputs carry no address.
            let (Some(to), Some(value)) = (
                output.get("addr").and_then(Value::as_str),
                output.get("value").and_then(integer_text),
            ) else {
                continue;
            };
            candidates.push(Candidate {
                tx_hash: hash.to_string(),
                to: to.to_string(),
                raw_value: value,
                decimals: Network::Bitcoin.native_decimals(),
                timestamp,
            });
        }
    }
    Ok(candidates)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::AmountMatchPolicy;
    use chrono::{Duration, Utc};
    use rust_decimal_macros::dec;
    use serde_json::json;

    fn request() -> VerificationRequest {
        VerificationRequest {
            address: "bc1qtarget".to_string(),
            amount: dec!(1.0),
            max_age: Duration::minutes(60),
            token: None,
            policy: AmountMatchPolicy::AtLeast,
        }
    }

    #[test]
    fn flattens_outputs_into_candidates() {
        let now = Utc::now().timestamp();
        let payload = json!({
            "txs": [{
                "hash": "abc",
                "time": now,
                "out": [
                    {"addr": "bc1qchange", "value": 1000},
                    {"script": "6a"},
                    {"addr": "bc1qtarget", "value": 150000000}
                ]
            }]
        });
        let candidates = parse(&payload, &request()).unwrap();
        assert_eq!(candidates.len(), 2);
        assert_eq!(candidates[1].raw_value, "150000000");
        assert_eq!(candidates[1].decimals, 8);
    }

    #[test]
    fn error_payloads_are_rejected_before_caching() {
        let err = validate(&json!({"error": "Invalid Bitcoin Address"})).unwrap_err();
        assert_eq!(err.to_string(), "API error: Invalid Bitcoin Address");
        assert!(validate(&json!({"txs": []})).is_ok());
    }
}
