//! Wiring of the record store, verification, caches and background workers.

use crate::config::{Config, Environment, StoreBackend};
use crate::models::{HealthStatus, StatusInfo, TransactionStatus, WalletAddress};
use crate::services::{
    BillingEngine, CacheService, ExchangeService, ExplorerClient, MemoryStore,
    NotificationDispatcher, PeriodicWorker, ReconcileReport, Reconciler, RecordStore, RedisStore,
    StoreResult, SubscriptionService, VerificationService,
};
use anyhow::{Context, Result};
use chrono::Utc;
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Obligations still waiting for money.
const OUTSTANDING: [TransactionStatus; 3] = [
    TransactionStatus::Pending,
    TransactionStatus::Confirmed,
    TransactionStatus::Signed,
];

pub struct Engine {
    pub environment: Environment,
    pub store: Arc<dyn RecordStore>,
    pub cache: Arc<CacheService>,
    pub verification: Arc<VerificationService>,
    pub exchange: Arc<ExchangeService>,
    pub notifier: Arc<NotificationDispatcher>,
    pub subscriptions: SubscriptionService,
    pub reconciler: PeriodicWorker<Reconciler>,
    pub billing: PeriodicWorker<BillingEngine>,
    shutdown_timeout: Duration,
    started_at: Instant,
}

impl Engine {
    pub async fn from_config(config: &Config) -> Result<Self> {
        let cache = Arc::new(CacheService::new(&config.cache).await);

        let store: Arc<dyn RecordStore> = match config.store_backend {
            StoreBackend::Memory => {
                warn!("Using in-memory record store, records do not survive a restart");
                Arc::new(MemoryStore::new())
            }
            StoreBackend::Redis => {
                let url = config
                    .redis_url
                    .as_deref()
                    .context("STORE_BACKEND=redis requires REDIS_URL")?;
                let prefix = format!("{}store:", config.cache.prefix);
                Arc::new(RedisStore::connect(url, prefix).await?)
            }
        };

        let verification = if config.simulation_mode {
            warn!("Simulation mode enabled, every verification succeeds with a synthetic hash");
            VerificationService::simulated()
        } else {
            let explorer = ExplorerClient::new(&config.explorer, cache.clone())?;
            VerificationService::live(Arc::new(explorer), &config.explorer)
        };

        let exchange = ExchangeService::from_config(&config.exchange, cache.clone())?;
        let notifier = NotificationDispatcher::from_config(&config.notifications)?;

        let engine = Self::assemble(
            config,
            store,
            cache,
            Arc::new(verification),
            Arc::new(exchange),
            Arc::new(notifier),
        );
        engine
            .seed_wallets(&config.wallets)
            .await
            .context("Failed to seed receiving wallets")?;
        Ok(engine)
    }

    /// Builds the workers around already constructed services.
    pub fn assemble(
        config: &Config,
        store: Arc<dyn RecordStore>,
        cache: Arc<CacheService>,
        verification: Arc<VerificationService>,
        exchange: Arc<ExchangeService>,
        notifier: Arc<NotificationDispatcher>,
    ) -> Self {
        let reconciler = Reconciler::new(
            store.clone(),
            verification.clone(),
            notifier.clone(),
            &config.reconciler,
        );
        let billing = BillingEngine::new(store.clone(), notifier.clone(), &config.billing);

        Self {
            environment: config.environment,
            subscriptions: SubscriptionService::new(store.clone()),
            reconciler: PeriodicWorker::new(Arc::new(reconciler), config.reconciler.interval),
            billing: PeriodicWorker::new(Arc::new(billing), config.billing.interval),
            store,
            cache,
            verification,
            exchange,
            notifier,
            shutdown_timeout: config.worker_shutdown_timeout,
            started_at: Instant::now(),
        }
    }

    pub async fn seed_wallets(&self, wallets: &[WalletAddress]) -> StoreResult<()> {
        for wallet in wallets {
            self.store.upsert_wallet(wallet.clone()).await?;
            debug!(
                network = %wallet.network,
                token = wallet.token_type.as_deref().unwrap_or("-"),
                "Seeded receiving wallet"
            );
        }
        if !wallets.is_empty() {
            info!(count = wallets.len(), "Receiving wallets loaded");
        }
        Ok(())
    }

    pub async fn start(&self) {
        self.notifier.start().await;
        self.reconciler.start().await;
        self.billing.start().await;
        info!(
            simulation = self.verification.is_simulation(),
            "Background workers started"
        );
    }

    /// Stops producers before the dispatcher so their last notifications
    /// are still queued. Returns `false` if anything had to be aborted.
    pub async fn stop(&self) -> bool {
        let reconciler = self.reconciler.stop(self.shutdown_timeout).await;
        let billing = self.billing.stop(self.shutdown_timeout).await;
        let notifier = self.notifier.stop(self.shutdown_timeout).await;
        let clean = reconciler && billing && notifier;
        if clean {
            info!("Background workers stopped");
        } else {
            warn!("Background workers stopped ungracefully");
        }
        clean
    }

    /// Runs one reconciliation sweep now, after any sweep in flight.
    pub async fn verify_pending(&self) -> Option<ReconcileReport> {
        self.reconciler.run_now().await
    }

    /// Wakes the reconciliation loop without waiting for it.
    pub fn trigger_verification(&self) {
        self.reconciler.trigger();
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    pub async fn health(&self) -> HealthStatus {
        let reconciler_running = self.reconciler.is_running().await;
        let billing_running = self.billing.is_running().await;
        let notifications_running = self.notifier.is_running().await;

        let status = if reconciler_running && billing_running && notifications_running {
            "healthy"
        } else if reconciler_running {
            "degraded"
        } else {
            "unhealthy"
        };

        HealthStatus {
            status: status.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            cache: self.cache.ping().await,
            reconciler_running,
            billing_running,
            notifications_running,
            simulation_mode: self.verification.is_simulation(),
            uptime_seconds: self.uptime_seconds(),
            timestamp: Utc::now(),
        }
    }

    pub async fn status(&self) -> StoreResult<StatusInfo> {
        Ok(StatusInfo {
            environment: self.environment.to_string(),
            simulation_mode: self.verification.is_simulation(),
            reconciler: self.reconciler.status().await,
            billing: self.billing.status().await,
            notifications: self.notifier.status().await,
            transactions: self.store.count_transactions().await?,
            subscriptions: self.store.count_subscriptions().await?,
            wallet_count: self.store.count_wallets().await?,
            cache: self.cache.stats().await,
            outstanding_value_usd: self.outstanding_value_usd().await,
            timestamp: Utc::now(),
        })
    }

    /// USD value of every unpaid obligation. Reporting only: assets without
    /// a rate are left out, and `None` means no rate table was available.
    pub async fn outstanding_value_usd(&self) -> Option<Decimal> {
        let outstanding = match self.store.transactions_with_status(&OUTSTANDING).await {
            Ok(outstanding) => outstanding,
            Err(e) => {
                warn!("Failed to load outstanding transactions: {}", e);
                return None;
            }
        };
        if outstanding.is_empty() {
            return Some(Decimal::ZERO);
        }
        self.exchange.rates().await.ok()?;

        let mut total = Decimal::ZERO;
        for tx in &outstanding {
            let symbol = tx.asset_symbol();
            match self.exchange.convert(tx.amount, &symbol, "usd").await {
                Some(value) => total += value,
                None => debug!(transaction_id = %tx.id, asset = %symbol, "No USD rate"),
            }
        }
        Some(total.round_dp(2))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Network, Transaction};
    use crate::services::exchange::{AssetRate, RateError, RateProvider, RateProviderKind, RateTable};
    use async_trait::async_trait;
    use rust_decimal_macros::dec;

    struct FixedRates;

    #[async_trait]
    impl RateProvider for FixedRates {
        fn kind(&self) -> RateProviderKind {
            RateProviderKind::CoinGecko
        }

        async fn fetch(&self) -> std::result::Result<RateTable, RateError> {
            let mut table = RateTable::new(RateProviderKind::CoinGecko);
            let mut eth = AssetRate::default();
            eth.prices.insert("usd".to_string(), dec!(2000));
            table.rates.insert("ethereum".to_string(), eth);
            Ok(table)
        }
    }

    fn engine() -> Engine {
        let config = Config::from_vars(|_| None).unwrap();
        let cache = Arc::new(CacheService::memory_only("test:"));
        Engine::assemble(
            &config,
            Arc::new(MemoryStore::new()),
            cache.clone(),
            Arc::new(VerificationService::simulated()),
            Arc::new(ExchangeService::new(Arc::new(FixedRates), cache, Duration::from_secs(60))),
            Arc::new(NotificationDispatcher::new(
                Arc::new(crate::services::LogSender),
                1,
                Duration::ZERO,
            )),
        )
    }

    #[tokio::test]
    async fn outstanding_value_converts_unpaid_obligations() {
        let engine = engine();
        engine
            .store
            .insert_transaction(Transaction::new(dec!(0.5), Network::Ethereum, None))
            .await
            .unwrap();
        engine
            .store
            .insert_transaction(Transaction::new(dec!(10), Network::Tron, Some("USDT".into())))
            .await
            .unwrap();
        let mut paid = Transaction::new(dec!(3), Network::Ethereum, None)
            .status(TransactionStatus::Confirmed);
        paid.complete("0xpaid", Some(dec!(3)), Utc::now()).unwrap();
        engine.store.insert_transaction(paid).await.unwrap();

        assert_eq!(engine.outstanding_value_usd().await, Some(dec!(1010)));
    }

    #[tokio::test]
    async fn start_stop_and_health() {
        let engine = engine();
        assert_eq!(engine.health().await.status, "unhealthy");

        engine.start().await;
        let health = engine.health().await;
        assert_eq!(health.status, "healthy");
        assert!(health.simulation_mode);

        let status = engine.status().await.unwrap();
        assert_eq!(status.environment, "development");
        assert_eq!(status.wallet_count, 0);

        assert!(engine.stop().await);
        assert!(!engine.reconciler.is_running().await);
    }
}
