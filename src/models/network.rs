use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Blockchain networks a payment can be received on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    Bitcoin,
    Ethereum,
    Bnb,
    Polygon,
    Tron,
    Solana,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("Unsupported network: {0}")]
pub struct UnknownNetwork(pub String);

impl Network {
    pub const ALL: [Network; 6] = [
        Network::Bitcoin,
        Network::Ethereum,
        Network::Bnb,
        Network::Polygon,
        Network::Tron,
        Network::Solana,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Network::Bitcoin => "bitcoin",
            Network::Ethereum => "ethereum",
            Network::Bnb => "bnb",
            Network::Polygon => "polygon",
            Network::Tron => "tron",
            Network::Solana => "solana",
        }
    }

    /// Ticker of the network's native asset.
    pub fn symbol(&self) -> &'static str {
        match self {
            Network::Bitcoin => "BTC",
            Network::Ethereum => "ETH",
            Network::Bnb => "BNB",
            Network::Polygon => "MATIC",
            Network::Tron => "TRX",
            Network::Solana => "SOL",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            Network::Bitcoin => "Bitcoin (BTC)",
            Network::Ethereum => "Ethereum (ETH)",
            Network::Bnb => "Binance Smart Chain (BNB)",
            Network::Polygon => "Polygon (MATIC)",
            Network::Tron => "Tron (TRX)",
            Network::Solana => "Solana (SOL)",
        }
    }

    /// Number of integer units per whole native coin, as a power of ten.
    pub fn native_decimals(&self) -> u32 {
        match self {
            Network::Bitcoin => 8,
            Network::Ethereum | Network::Bnb | Network::Polygon => 18,
            Network::Tron => 6,
            Network::Solana => 9,
        }
    }

    /// Etherscan-family explorers share one response shape.
    pub fn is_evm(&self) -> bool {
        matches!(self, Network::Ethereum | Network::Bnb | Network::Polygon)
    }

    /// How long an explorer response stays fresh, following block cadence.
    pub fn default_cache_ttl(&self) -> Duration {
        match self {
            Network::Bitcoin => Duration::from_secs(600),
            Network::Ethereum => Duration::from_secs(120),
            _ => Duration::from_secs(60),
        }
    }

    pub fn default_explorer_url(&self) -> &'static str {
        match self {
            Network::Bitcoin => "https://blockchain.info",
            Network::Ethereum => "https://api.etherscan.io",
            Network::Bnb => "https://api.bscscan.com",
            Network::Polygon => "https://api.polygonscan.com",
            Network::Tron => "https://apilist.tronscanapi.com",
            Network::Solana => "https://public-api.solscan.io",
        }
    }

    /// Upper-case name used in environment variable keys.
    pub fn env_key(&self) -> &'static str {
        match self {
            Network::Bitcoin => "BITCOIN",
            Network::Ethereum => "ETHEREUM",
            Network::Bnb => "BNB",
            Network::Polygon => "POLYGON",
            Network::Tron => "TRON",
            Network::Solana => "SOLANA",
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Network {
    type Err = UnknownNetwork;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "bitcoin" | "btc" => Ok(Network::Bitcoin),
            "ethereum" | "eth" => Ok(Network::Ethereum),
            "bnb" | "bsc" => Ok(Network::Bnb),
            "polygon" | "matic" => Ok(Network::Polygon),
            "tron" | "trx" => Ok(Network::Tron),
            "solana" | "sol" => Ok(Network::Solana),
            other => Err(UnknownNetwork(other.to_string())),
        }
    }
}
