use crate::models::Network;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenContract {
    pub symbol: String,
    pub contract_address: String,
    pub decimals: u32,
}

impl TokenContract {
    pub fn new(symbol: &str, contract_address: &str, decimals: u32) -> Self {
        Self {
            symbol: symbol.to_uppercase(),
            contract_address: contract_address.to_string(),
            decimals,
        }
    }
}

/// Well-known stable token deployments per network.
pub fn default_tokens(network: Network) -> Vec<TokenContract> {
    match network {
        Network::Ethereum => vec![
            TokenContract::new("USDT", "0xdAC17F958D2ee523a2206206994597C13D831ec7", 6),
            TokenContract::new("USDC", "0xA0b86991c6218b36c1d19D4a2e9Eb0cE3606eB48", 6),
            TokenContract::new("DAI", "0x6B175474E89094C44Da98b954EedeAC495271d0F", 18),
        ],
        // BEP-20 pegged stables use 18 decimals
        Network::Bnb => vec![
            TokenContract::new("USDT", "0x55d398326f99059fF775485246999027B3197955", 18),
            TokenContract::new("USDC", "0x8AC76a51cc950d9822D68b83fE1Ad97B32Cd580d", 18),
            TokenContract::new("BUSD", "0xe9e7CEA3DedcA5984780Bafc599bD69ADd087D56", 18),
        ],
        Network::Polygon => vec![
            TokenContract::new("USDT", "0xc2132D05D31c914a87C6611C10748AEb04B58e8F", 6),
            TokenContract::new("USDC", "0x3c499c542cEF5E3811e1192ce70d8cC03d5c3359", 6),
        ],
        Network::Tron => vec![
            TokenContract::new("USDT", "TR7NHqjeKQxGTCi8q8ZY4pL8otSzgjLj6t", 6),
            TokenContract::new("USDC", "TEkxiTehnzSmSe2XqrBj4w32RUN966rdz8", 6),
        ],
        Network::Bitcoin | Network::Solana => Vec::new(),
    }
}

pub fn lookup(tokens: &[TokenContract], symbol: &str) -> Option<TokenContract> {
    let symbol = symbol.trim().to_uppercase();
    tokens.iter().find(|t| t.symbol == symbol).cloned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_is_case_insensitive() {
        let tokens = default_tokens(Network::Tron);
        let usdt = lookup(&tokens, "usdt").unwrap();
        assert_eq!(usdt.decimals, 6);
        assert!(lookup(&tokens, "DAI").is_none());
    }

    #[test]
    fn bitcoin_has_no_tokens() {
        assert!(default_tokens(Network::Bitcoin).is_empty());
    }
}
