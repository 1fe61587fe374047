//! Per-network ledger adapters.
//!
//! Each adapter fetches recent activity for an address from a block explorer
//! and turns it into [`Candidate`] transfers. Matching is shared: candidates
//! are scanned in the order the explorer returned them (newest first), stale
//! ones are skipped, and the first transfer to the target address whose
//! normalized value satisfies the [`AmountMatchPolicy`] wins.

pub mod bitcoin;
pub mod evm;
pub mod simulated;
pub mod solana;
pub mod tokens;
pub mod tron;

pub use bitcoin::BitcoinAdapter;
pub use evm::EvmAdapter;
pub use simulated::SimulatedLedger;
pub use solana::SolanaAdapter;
pub use tokens::TokenContract;
pub use tron::TronAdapter;

use crate::config::ExplorerConfig;
use crate::models::{Network, VerificationResult};
use crate::services::explorer::{ExplorerClient, ExplorerError};
use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use ethers::types::{Address, U256};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use tracing::debug;

/// How a transferred value is compared with the expected amount.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AmountMatchPolicy {
    /// Accept overpayment.
    #[default]
    AtLeast,
    Exact,
}

impl AmountMatchPolicy {
    pub fn accepts(self, actual: Decimal, expected: Decimal) -> bool {
        match self {
            AmountMatchPolicy::AtLeast => actual >= expected,
            AmountMatchPolicy::Exact => actual == expected,
        }
    }
}

impl FromStr for AmountMatchPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "at_least" | "atleast" | "floor" | "gte" => Ok(AmountMatchPolicy::AtLeast),
            "exact" | "eq" => Ok(AmountMatchPolicy::Exact),
            other => Err(format!("Unknown amount match policy: {}", other)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct VerificationRequest {
    /// Already trimmed and network-formatted.
    pub address: String,
    pub amount: Decimal,
    pub max_age: Duration,
    /// Set when verifying a token transfer instead of the native coin.
    pub token: Option<TokenContract>,
    pub policy: AmountMatchPolicy,
}

/// One inbound transfer extracted from an explorer payload.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub tx_hash: String,
    pub to: String,
    /// Integer base units as reported by the chain.
    pub raw_value: String,
    pub decimals: u32,
    pub timestamp: DateTime<Utc>,
}

#[async_trait]
pub trait LedgerAdapter: Send + Sync {
    fn network(&self) -> Network;

    /// Contract for a token symbol on this network, if supported.
    fn token_contract(&self, symbol: &str) -> Option<TokenContract>;

    /// Never fails: upstream problems come back as `success: false`.
    async fn verify(&self, request: &VerificationRequest) -> VerificationResult;
}

/// Converts integer base units into a decimal amount.
pub fn to_decimal(raw: &str, decimals: u32) -> Option<Decimal> {
    let value = U256::from_dec_str(raw.trim()).ok()?;
    // Decimal mantissas are 96 bits wide.
    if value.bits() > 96 {
        return None;
    }
    let units = i128::try_from(value.as_u128()).ok()?;
    Decimal::try_from_i128_with_scale(units, decimals)
        .ok()
        .map(|d| d.normalize())
}

/// Exact comparison for base58 and bech32 style addresses.
pub fn exact_address_eq(a: &str, b: &str) -> bool {
    a.trim() == b.trim()
}

/// Hex addresses compare case-insensitively.
pub fn hex_address_eq(a: &str, b: &str) -> bool {
    match (Address::from_str(a.trim()), Address::from_str(b.trim())) {
        (Ok(x), Ok(y)) => x == y,
        _ => a.trim().eq_ignore_ascii_case(b.trim()),
    }
}

pub fn find_match<I>(
    candidates: I,
    request: &VerificationRequest,
    now: DateTime<Utc>,
    address_eq: fn(&str, &str) -> bool,
) -> VerificationResult
where
    I: IntoIterator<Item = Candidate>,
{
    let oldest = now - request.max_age;
    for candidate in candidates {
        if candidate.timestamp < oldest {
            continue;
        }
        if !address_eq(&candidate.to, &request.address) {
            continue;
        }
        let Some(value) = to_decimal(&candidate.raw_value, candidate.decimals) else {
            debug!(
                tx_hash = %candidate.tx_hash,
                raw_value = %candidate.raw_value,
                "Skipping transfer with unreadable value"
            );
            continue;
        };
        if request.policy.accepts(value, request.amount) {
            return VerificationResult::matched(candidate.tx_hash, value, candidate.timestamp);
        }
    }
    VerificationResult::no_match()
}

/// Folds a fetch outcome and a payload parser into a result.
pub(crate) fn settle<F>(
    fetched: Result<Value, ExplorerError>,
    parse: F,
    request: &VerificationRequest,
    address_eq: fn(&str, &str) -> bool,
) -> VerificationResult
where
    F: FnOnce(&Value, &VerificationRequest) -> Result<Vec<Candidate>, String>,
{
    match fetched {
        Err(e) => VerificationResult::failed(e.to_string()),
        Ok(payload) => match parse(&payload, request) {
            Ok(candidates) => find_match(candidates, request, Utc::now(), address_eq),
            Err(message) => VerificationResult::failed(message),
        },
    }
}

/// Reads an integer that explorers send either as a JSON number or a string.
pub(crate) fn integer_text(value: &Value) -> Option<String> {
    match value {
        Value::Number(n) => n.as_u64().map(|v| v.to_string()),
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        _ => None,
    }
}

pub(crate) fn integer_value(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

pub(crate) fn unix_seconds(value: &Value) -> Option<DateTime<Utc>> {
    Utc.timestamp_opt(integer_value(value)?, 0).single()
}

pub(crate) fn unix_millis(value: &Value) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(integer_value(value)?).single()
}

/// Pulls the explorer's own error text out of an unexpected payload.
pub(crate) fn upstream_message(payload: &Value) -> String {
    ["message", "error", "result"]
        .iter()
        .filter_map(|field| payload.get(*field).and_then(Value::as_str))
        .find(|m| !m.is_empty())
        .unwrap_or("Unknown error")
        .to_string()
}

/// Adapters keyed by network.
#[derive(Clone, Default)]
pub struct LedgerRegistry {
    adapters: HashMap<Network, Arc<dyn LedgerAdapter>>,
}

impl LedgerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, adapter: Arc<dyn LedgerAdapter>) {
        debug!(network = %adapter.network(), "Registering ledger adapter");
        self.adapters.insert(adapter.network(), adapter);
    }

    /// Explorer-backed adapters for every network.
    pub fn live(explorer: Arc<ExplorerClient>, config: &ExplorerConfig) -> Self {
        let mut registry = Self::new();
        for network in Network::ALL {
            let endpoint = config.endpoint(network);
            let adapter: Arc<dyn LedgerAdapter> = match network {
                Network::Bitcoin => Arc::new(BitcoinAdapter::new(explorer.clone(), endpoint.base_url)),
                Network::Ethereum | Network::Bnb | Network::Polygon => Arc::new(EvmAdapter::new(
                    network,
                    explorer.clone(),
                    endpoint.base_url,
                    endpoint.api_key,
                )),
                Network::Tron => Arc::new(TronAdapter::new(
                    explorer.clone(),
                    endpoint.base_url,
                    endpoint.api_key,
                )),
                Network::Solana => Arc::new(SolanaAdapter::new(
                    explorer.clone(),
                    endpoint.base_url,
                    endpoint.api_key,
                )),
            };
            registry.register(adapter);
        }
        registry
    }

    /// Synthetic adapters that accept every request.
    pub fn simulated() -> Self {
        let mut registry = Self::new();
        for network in Network::ALL {
            registry.register(Arc::new(SimulatedLedger::new(network)));
        }
        registry
    }

    pub fn get(&self, network: Network) -> Option<Arc<dyn LedgerAdapter>> {
        self.adapters.get(&network).cloned()
    }

    pub fn contract_address(&self, network: Network, symbol: &str) -> Option<TokenContract> {
        self.get(network)?.token_contract(symbol)
    }

    pub fn networks(&self) -> Vec<Network> {
        let mut networks: Vec<Network> = self.adapters.keys().copied().collect();
        networks.sort();
        networks
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn request(address: &str, amount: Decimal) -> VerificationRequest {
        VerificationRequest {
            address: address.to_string(),
            amount,
            max_age: Duration::minutes(30),
            token: None,
            policy: AmountMatchPolicy::AtLeast,
        }
    }

    fn candidate(hash: &str, to: &str, raw: &str, decimals: u32, age_minutes: i64) -> Candidate {
        Candidate {
            tx_hash: hash.to_string(),
            to: to.to_string(),
            raw_value: raw.to_string(),
            decimals,
            timestamp: Utc::now() - Duration::minutes(age_minutes),
        }
    }

    #[test]
    fn converts_base_units() {
        assert_eq!(to_decimal("150000000", 8), Some(dec!(1.5)));
        assert_eq!(to_decimal("100000000000000000", 18), Some(dec!(0.1)));
        assert_eq!(to_decimal("2500000", 6), Some(dec!(2.5)));
        assert_eq!(to_decimal("not a number", 6), None);
        // beyond a 96-bit mantissa
        assert_eq!(to_decimal("100000000000000000000000000000000", 18), None);
    }

    #[test]
    fn skips_stale_transfers() {
        let candidates = vec![candidate("old", "addr", "200000000", 8, 45)];
        let result = find_match(candidates, &request("addr", dec!(1)), Utc::now(), exact_address_eq);
        assert!(!result.success);
        assert_eq!(result.message.as_deref(), Some("No matching transaction found"));
    }

    #[test]
    fn first_qualifying_transfer_wins() {
        let candidates = vec![
            candidate("other-address", "elsewhere", "900000000", 8, 1),
            candidate("too-small", "addr", "50000000", 8, 2),
            candidate("hit", "addr", "120000000", 8, 3),
            candidate("later", "addr", "500000000", 8, 4),
        ];
        let result = find_match(candidates, &request("addr", dec!(1)), Utc::now(), exact_address_eq);
        assert!(result.success);
        assert_eq!(result.tx_hash.as_deref(), Some("hit"));
        assert_eq!(result.matched_amount, Some(dec!(1.2)));
    }

    #[test]
    fn exact_policy_rejects_overpayment() {
        let mut req = request("addr", dec!(1));
        req.policy = AmountMatchPolicy::Exact;
        let candidates = vec![
            candidate("over", "addr", "120000000", 8, 1),
            candidate("exact", "addr", "100000000", 8, 2),
        ];
        let result = find_match(candidates, &req, Utc::now(), exact_address_eq);
        assert_eq!(result.tx_hash.as_deref(), Some("exact"));
    }

    #[test]
    fn hex_addresses_ignore_case() {
        assert!(hex_address_eq(
            "0x742d35Cc6634C0532925a3b844Bc454e4438f44e",
            "0x742d35cc6634c0532925a3b844bc454e4438f44e"
        ));
        assert!(!exact_address_eq("TAbc", "tabc"));
    }

    #[test]
    fn parses_policy_names() {
        assert_eq!("exact".parse::<AmountMatchPolicy>().unwrap(), AmountMatchPolicy::Exact);
        assert_eq!("at_least".parse::<AmountMatchPolicy>().unwrap(), AmountMatchPolicy::AtLeast);
        assert!("sometimes".parse::<AmountMatchPolicy>().is_err());
    }

    #[test]
    fn simulated_registry_covers_every_network() {
        let registry = LedgerRegistry::simulated();
        assert_eq!(registry.networks().len(), Network::ALL.len());
    }
}
