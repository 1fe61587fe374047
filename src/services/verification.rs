use crate::config::ExplorerConfig;
use crate::ledger::{AmountMatchPolicy, LedgerRegistry, TokenContract, VerificationRequest};
use crate::models::{Network, VerificationResult};
use crate::services::explorer::ExplorerClient;
use chrono::Duration;
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Network-agnostic entry point in front of the ledger adapters.
pub struct VerificationService {
    registry: LedgerRegistry,
    policy: AmountMatchPolicy,
    simulation: bool,
}

impl VerificationService {
    pub fn new(registry: LedgerRegistry, policy: AmountMatchPolicy, simulation: bool) -> Self {
        Self {
            registry,
            policy,
            simulation,
        }
    }

    pub fn live(explorer: Arc<ExplorerClient>, config: &ExplorerConfig) -> Self {
        Self::new(
            LedgerRegistry::live(explorer, config),
            config.match_policy,
            false,
        )
    }

    pub fn simulated() -> Self {
        Self::new(LedgerRegistry::simulated(), AmountMatchPolicy::default(), true)
    }

    pub fn is_simulation(&self) -> bool {
        self.simulation
    }

    pub fn networks(&self) -> Vec<Network> {
        self.registry.networks()
    }

    pub fn contract_address(&self, network: Network, symbol: &str) -> Option<TokenContract> {
        self.registry.contract_address(network, symbol)
    }

    /// Checks for a payment of at least `amount` (or exactly, per policy) to
    /// `address` within the last `max_age_minutes`.
    ///
    /// Configuration problems (unknown network, unsupported token) come back
    /// as failed results like any upstream error.
    pub async fn verify(
        &self,
        network: Network,
        address: &str,
        amount: Decimal,
        max_age_minutes: i64,
        token_type: Option<&str>,
    ) -> VerificationResult {
        let address = address.trim();
        if address.is_empty() {
            return VerificationResult::failed("No receiving address");
        }
        if amount <= Decimal::ZERO {
            return VerificationResult::failed("Amount must be positive");
        }

        let Some(adapter) = self.registry.get(network) else {
            warn!(network = %network, "No ledger adapter registered");
            return VerificationResult::failed(format!("Unsupported network: {}", network));
        };

        // The native ticker passed as a token means the native coin.
        let token = match token_type.map(str::trim).filter(|t| !t.is_empty()) {
            None => None,
            Some(symbol) if symbol.eq_ignore_ascii_case(network.symbol()) => None,
            Some(symbol) => match adapter.token_contract(symbol) {
                Some(contract) => Some(contract),
                None => {
                    warn!(network = %network, token = symbol, "Unsupported token");
                    return VerificationResult::failed(format!(
                        "Token {} is not supported on {}",
                        symbol.to_uppercase(),
                        network
                    ));
                }
            },
        };

        let request = VerificationRequest {
            address: address.to_string(),
            amount,
            max_age: Duration::minutes(max_age_minutes.max(0)),
            token,
            policy: self.policy,
        };

        let result = adapter.verify(&request).await;
        if result.success {
            info!(
                network = %network,
                tx_hash = result.tx_hash.as_deref().unwrap_or(""),
                simulation = result.simulation,
                "Payment found"
            );
        } else {
            debug!(
                network = %network,
                address = address,
                message = result.message_or_default(),
                "Payment not found"
            );
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{LedgerAdapter, VerificationRequest};
    use async_trait::async_trait;
    use rust_decimal_macros::dec;

    struct Recording;

    #[async_trait]
    impl LedgerAdapter for Recording {
        fn network(&self) -> Network {
            Network::Ethereum
        }

        fn token_contract(&self, symbol: &str) -> Option<TokenContract> {
            (symbol.eq_ignore_ascii_case("usdc")).then(|| TokenContract::new("USDC", "0xc0ffee", 6))
        }

        async fn verify(&self, request: &VerificationRequest) -> VerificationResult {
            let label = match &request.token {
                Some(t) => format!("{}:{}", t.symbol, request.address),
                None => format!("native:{}", request.address),
            };
            VerificationResult::failed(label)
        }
    }

    fn service() -> VerificationService {
        let mut registry = LedgerRegistry::new();
        registry.register(Arc::new(Recording));
        VerificationService::new(registry, AmountMatchPolicy::AtLeast, false)
    }

    #[tokio::test]
    async fn dispatches_native_and_token_requests() {
        let svc = service();
        let native = svc.verify(Network::Ethereum, " 0xabc ", dec!(1), 30, None).await;
        assert_eq!(native.message.as_deref(), Some("native:0xabc"));

        let eth_as_token = svc.verify(Network::Ethereum, "0xabc", dec!(1), 30, Some("eth")).await;
        assert_eq!(eth_as_token.message.as_deref(), Some("native:0xabc"));

        let usdc = svc.verify(Network::Ethereum, "0xabc", dec!(1), 30, Some("usdc")).await;
        assert_eq!(usdc.message.as_deref(), Some("USDC:0xabc"));
    }

    #[tokio::test]
    async fn configuration_problems_are_reported_failures() {
        let svc = service();
        let token = svc.verify(Network::Ethereum, "0xabc", dec!(1), 30, Some("DOGE")).await;
        assert!(!token.success);
        assert_eq!(token.message.as_deref(), Some("Token DOGE is not supported on ethereum"));

        let network = svc.verify(Network::Tron, "T1", dec!(1), 30, None).await;
        assert_eq!(network.message.as_deref(), Some("Unsupported network: tron"));

        let amount = svc.verify(Network::Ethereum, "0xabc", dec!(0), 30, None).await;
        assert!(!amount.success);
    }

    #[tokio::test]
    async fn simulation_succeeds_for_anything() {
        let svc = VerificationService::simulated();
        assert!(svc.is_simulation());
        let result = svc
            .verify(Network::Bitcoin, "garbage", dec!(0.1), 10, Some("NOPE"))
            .await;
        assert!(result.success);
        assert!(result.simulation);
    }
}
