use crate::config::ReconcilerConfig;
use crate::models::{Notification, Transaction, TransactionStatus, VerificationResult};
use crate::services::notifications::NotificationDispatcher;
use crate::services::store::RecordStore;
use crate::services::verification::VerificationService;
use crate::services::worker::Sweep;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::{stream, FutureExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

const NO_MATCH: &str = "No matching transaction found";

/// What happened to one transaction in one sweep.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Completed { tx_hash: String },
    /// Someone else already completed it.
    AlreadyCompleted,
    /// Not pollable any more when re-read.
    Skipped,
    NoMatch,
    UpstreamFailure(String),
    MissingWallet,
    StoreFailure(String),
    Panicked,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconcileReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub examined: usize,
    pub completed: usize,
    pub already_completed: usize,
    pub unmatched: usize,
    pub upstream_failures: usize,
    pub missing_wallet: usize,
    pub store_failures: usize,
    pub panicked: usize,
}

impl ReconcileReport {
    fn begin() -> Self {
        let now = Utc::now();
        Self {
            started_at: now,
            finished_at: now,
            examined: 0,
            completed: 0,
            already_completed: 0,
            unmatched: 0,
            upstream_failures: 0,
            missing_wallet: 0,
            store_failures: 0,
            panicked: 0,
        }
    }

    fn record(&mut self, outcome: &Outcome) {
        self.examined += 1;
        match outcome {
            Outcome::Completed { .. } => self.completed += 1,
            Outcome::AlreadyCompleted | Outcome::Skipped => self.already_completed += 1,
            Outcome::NoMatch => self.unmatched += 1,
            Outcome::UpstreamFailure(_) => self.upstream_failures += 1,
            Outcome::MissingWallet => self.missing_wallet += 1,
            Outcome::StoreFailure(_) => self.store_failures += 1,
            Outcome::Panicked => self.panicked += 1,
        }
    }
}

/// Polls confirmed and signed transactions against their ledgers and
/// completes the ones whose payment has arrived.
pub struct Reconciler {
    store: Arc<dyn RecordStore>,
    verifier: Arc<VerificationService>,
    notifier: Arc<NotificationDispatcher>,
    max_age_minutes: i64,
    concurrency: usize,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn RecordStore>,
        verifier: Arc<VerificationService>,
        notifier: Arc<NotificationDispatcher>,
        config: &ReconcilerConfig,
    ) -> Self {
        Self {
            store,
            verifier,
            notifier,
            max_age_minutes: config.max_age_minutes,
            concurrency: config.concurrency.max(1),
        }
    }

    /// Checks one transaction and, on a match, commits `completed` with the
    /// matched hash. Safe to repeat: a completed record is left untouched.
    pub async fn verify_and_commit(&self, tx: &Transaction) -> Outcome {
        if tx.status.is_terminal() {
            return Outcome::AlreadyCompleted;
        }
        if !tx.status.is_pollable() {
            return Outcome::Skipped;
        }

        let wallet = match self
            .store
            .wallet_for(tx.network, tx.token_type.as_deref(), tx.merchant_id.as_deref())
            .await
        {
            Ok(Some(wallet)) => wallet,
            Ok(None) => {
                warn!(
                    transaction_id = %tx.id,
                    network = %tx.network,
                    token = tx.token_type.as_deref().unwrap_or("-"),
                    "No receiving wallet configured"
                );
                return Outcome::MissingWallet;
            }
            Err(e) => {
                error!(transaction_id = %tx.id, "Wallet lookup failed: {}", e);
                return Outcome::StoreFailure(e.to_string());
            }
        };

        let result = self
            .verifier
            .verify(
                tx.network,
                &wallet.address,
                tx.amount,
                self.max_age_minutes,
                tx.token_type.as_deref(),
            )
            .await;

        if !result.success {
            let message = result.message_or_default().to_string();
            if message == NO_MATCH {
                debug!(transaction_id = %tx.id, "Payment not seen yet");
                return Outcome::NoMatch;
            }
            warn!(
                transaction_id = %tx.id,
                network = %tx.network,
                "Verification failed: {}",
                message
            );
            return Outcome::UpstreamFailure(message);
        }

        self.commit(tx, result).await
    }

    async fn commit(&self, tx: &Transaction, result: VerificationResult) -> Outcome {
        let Some(tx_hash) = result.tx_hash.clone() else {
            return Outcome::UpstreamFailure("Match without transaction hash".to_string());
        };

        // Re-read so a concurrent completion wins and stays untouched.
        let mut current = match self.store.get_transaction(&tx.id).await {
            Ok(Some(current)) => current,
            Ok(None) => {
                error!(transaction_id = %tx.id, "Transaction vanished during reconciliation");
                return Outcome::StoreFailure(format!("transaction {} not found", tx.id));
            }
            Err(e) => {
                error!(transaction_id = %tx.id, "Failed to reload transaction: {}", e);
                return Outcome::StoreFailure(e.to_string());
            }
        };

        match current.complete(tx_hash.clone(), result.matched_amount, Utc::now()) {
            Ok(true) => {}
            Ok(false) => return Outcome::AlreadyCompleted,
            Err(e) => {
                error!(transaction_id = %tx.id, "Refusing transition: {}", e);
                return Outcome::StoreFailure(e.to_string());
            }
        }

        if let Err(e) = self.store.update_transaction(&current).await {
            // Left as it was; the next sweep retries it.
            error!(transaction_id = %tx.id, "Failed to commit completion: {}", e);
            return Outcome::StoreFailure(e.to_string());
        }

        info!(
            transaction_id = %current.id,
            network = %current.network,
            tx_hash = %tx_hash,
            simulation = result.simulation,
            "Transaction completed"
        );

        if let Some(email) = current.client_email.as_deref() {
            self.notifier
                .enqueue(Notification::payment_completed(&current, email));
        }

        Outcome::Completed { tx_hash }
    }

    /// One pass over every pollable transaction.
    pub async fn sweep(&self) -> ReconcileReport {
        let mut report = ReconcileReport::begin();

        let pending = match self
            .store
            .transactions_with_status(&TransactionStatus::POLLABLE)
            .await
        {
            Ok(pending) => pending,
            Err(e) => {
                error!("Failed to select pollable transactions: {}", e);
                report.store_failures += 1;
                report.finished_at = Utc::now();
                return report;
            }
        };

        debug!(count = pending.len(), "Reconciling transactions");

        let outcomes: Vec<Outcome> = stream::iter(pending)
            .map(|tx| async move {
                match AssertUnwindSafe(self.verify_and_commit(&tx)).catch_unwind().await {
                    Ok(outcome) => outcome,
                    Err(_) => {
                        error!(transaction_id = %tx.id, "Reconciliation panicked");
                        Outcome::Panicked
                    }
                }
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        for outcome in &outcomes {
            report.record(outcome);
        }
        report.finished_at = Utc::now();

        if report.examined > 0 {
            info!(
                examined = report.examined,
                completed = report.completed,
                unmatched = report.unmatched,
                failures = report.upstream_failures + report.store_failures + report.missing_wallet,
                "Reconciliation sweep finished"
            );
        }
        report
    }
}

#[async_trait]
impl Sweep for Reconciler {
    type Report = ReconcileReport;

    fn name(&self) -> &'static str {
        "reconciler"
    }

    async fn run_cycle(&self) -> ReconcileReport {
        self.sweep().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Network, WalletAddress};
    use crate::services::notifications::LogSender;
    use crate::services::store::MemoryStore;
    use rust_decimal_macros::dec;
    use std::time::Duration;

    async fn fixture() -> (Reconciler, Arc<MemoryStore>, Arc<NotificationDispatcher>) {
        let store = Arc::new(MemoryStore::new());
        store
            .upsert_wallet(WalletAddress::new(Network::Ethereum, "0xabc"))
            .await
            .unwrap();
        let notifier = Arc::new(NotificationDispatcher::new(
            Arc::new(LogSender),
            1,
            Duration::ZERO,
        ));
        let reconciler = Reconciler::new(
            store.clone(),
            Arc::new(VerificationService::simulated()),
            notifier.clone(),
            &ReconcilerConfig::default(),
        );
        (reconciler, store, notifier)
    }

    #[tokio::test]
    async fn simulated_sweep_completes_confirmed_transaction() {
        let (reconciler, store, notifier) = fixture().await;
        let tx = Transaction::new(dec!(0.1), Network::Ethereum, None)
            .status(TransactionStatus::Confirmed)
            .client_email("payer@example.com");
        store.insert_transaction(tx.clone()).await.unwrap();

        let report = reconciler.sweep().await;
        assert_eq!(report.examined, 1);
        assert_eq!(report.completed, 1);

        let stored = store.get_transaction(&tx.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TransactionStatus::Completed);
        assert!(stored.tx_hash.as_deref().is_some_and(|h| !h.is_empty()));
        assert_eq!(notifier.status().await.enqueued, 1);
    }

    #[tokio::test]
    async fn second_commit_is_a_no_op() {
        let (reconciler, store, notifier) = fixture().await;
        let tx = Transaction::new(dec!(0.1), Network::Ethereum, None)
            .status(TransactionStatus::Signed);
        store.insert_transaction(tx.clone()).await.unwrap();

        assert!(matches!(
            reconciler.verify_and_commit(&tx).await,
            Outcome::Completed { .. }
        ));
        let first = store.get_transaction(&tx.id).await.unwrap().unwrap();

        // Same stale snapshot again: the re-read sees it already completed.
        assert_eq!(reconciler.verify_and_commit(&tx).await, Outcome::AlreadyCompleted);
        assert_eq!(reconciler.verify_and_commit(&first).await, Outcome::AlreadyCompleted);

        let second = store.get_transaction(&tx.id).await.unwrap().unwrap();
        assert_eq!(first.tx_hash, second.tx_hash);
        assert_eq!(second.status, TransactionStatus::Completed);
        assert_eq!(notifier.status().await.enqueued, 0);
    }

    #[tokio::test]
    async fn pending_and_walletless_transactions_stay_put() {
        let (reconciler, store, _) = fixture().await;
        let pending = Transaction::new(dec!(1), Network::Ethereum, None);
        let no_wallet = Transaction::new(dec!(1), Network::Tron, None)
            .status(TransactionStatus::Confirmed);
        store.insert_transaction(pending.clone()).await.unwrap();
        store.insert_transaction(no_wallet.clone()).await.unwrap();

        let report = reconciler.sweep().await;
        assert_eq!(report.examined, 1);
        assert_eq!(report.missing_wallet, 1);

        let pending = store.get_transaction(&pending.id).await.unwrap().unwrap();
        assert_eq!(pending.status, TransactionStatus::Pending);
        let no_wallet = store.get_transaction(&no_wallet.id).await.unwrap().unwrap();
        assert_eq!(no_wallet.status, TransactionStatus::Confirmed);
    }
}
