use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Normalized outcome of checking one address on one ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tx_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub matched_amount: Option<Decimal>,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub simulation: bool,
}

impl VerificationResult {
    /// `timestamp` is the matched transaction's on-chain time.
    pub fn matched(tx_hash: impl Into<String>, amount: Decimal, timestamp: DateTime<Utc>) -> Self {
        Self {
            success: true,
            tx_hash: Some(tx_hash.into()),
            matched_amount: Some(amount),
            timestamp,
            message: None,
            simulation: false,
        }
    }

    pub fn simulated(tx_hash: impl Into<String>, amount: Decimal) -> Self {
        Self {
            simulation: true,
            ..Self::matched(tx_hash, amount, Utc::now())
        }
    }

    pub fn no_match() -> Self {
        Self::failed("No matching transaction found")
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            tx_hash: None,
            matched_amount: None,
            timestamp: Utc::now(),
            message: Some(message.into()),
            simulation: false,
        }
    }

    pub fn message_or_default(&self) -> &str {
        self.message.as_deref().unwrap_or("verification failed")
    }
}
