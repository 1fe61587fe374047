use super::{LedgerAdapter, TokenContract, VerificationRequest};
use crate::models::{Network, VerificationResult};
use async_trait::async_trait;
use tracing::debug;
use uuid::Uuid;

/// Accepts every request with a fresh synthetic hash. Selected at startup
/// when simulation mode is on, in place of the explorer-backed adapters.
pub struct SimulatedLedger {
    network: Network,
}

impl SimulatedLedger {
    pub fn new(network: Network) -> Self {
        Self { network }
    }

    pub fn transaction_hash() -> String {
        format!("simulated_tx_{}", hex::encode(Uuid::new_v4().as_bytes()))
    }
}

#[async_trait]
impl LedgerAdapter for SimulatedLedger {
    fn network(&self) -> Network {
        self.network
    }

    /// Any symbol is accepted so token flows can be exercised end to end.
    fn token_contract(&self, symbol: &str) -> Option<TokenContract> {
        Some(TokenContract::new(
            symbol,
            &format!("simulated-{}", symbol.to_lowercase()),
            self.network.native_decimals(),
        ))
    }

    async fn verify(&self, request: &VerificationRequest) -> VerificationResult {
        let hash = Self::transaction_hash();
        debug!(
            network = %self.network,
            address = %request.address,
            tx_hash = %hash,
            "Simulated verification"
        );
        VerificationResult::simulated(hash, request.amount)
    }
}
