use super::Network;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Receiving address for one (network, token, merchant) combination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletAddress {
    pub network: Network,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merchant_id: Option<String>,
    pub address: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WalletAddress {
    pub fn new(network: Network, address: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            network,
            token_type: None,
            merchant_id: None,
            address: address.into().trim().to_string(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn token(mut self, token_type: impl Into<String>) -> Self {
        self.token_type = Some(token_type.into().to_uppercase());
        self
    }

    pub fn merchant(mut self, merchant_id: impl Into<String>) -> Self {
        self.merchant_id = Some(merchant_id.into());
        self
    }

    /// Composite uniqueness key.
    pub fn key(&self) -> String {
        wallet_key(
            self.network,
            self.token_type.as_deref(),
            self.merchant_id.as_deref(),
        )
    }
}

pub fn wallet_key(network: Network, token_type: Option<&str>, merchant_id: Option<&str>) -> String {
    format!(
        "{}:{}:{}",
        network,
        token_type.map(str::to_uppercase).unwrap_or_else(|| "-".to_string()),
        merchant_id.unwrap_or("-")
    )
}
