//! Durable keyed records shared by every worker.
//!
//! The store is the only shared mutable state: each write replaces one
//! record, and backends refuse writes that would move a transaction's status
//! backwards.

use crate::models::{
    wallet_key, Network, Subscription, SubscriptionStatus, Transaction, TransactionStatus,
    TransitionError, WalletAddress,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use thiserror::Error;
use tokio::sync::RwLock;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Write conflict: {0}")]
    Conflict(String),

    #[error("Store backend error: {0}")]
    Backend(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<TransitionError> for StoreError {
    fn from(e: TransitionError) -> Self {
        StoreError::Conflict(e.to_string())
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Clone, Default)]
pub struct SubscriptionFilter {
    pub merchant_id: Option<String>,
    pub client_email: Option<String>,
    pub status: Option<SubscriptionStatus>,
}

impl SubscriptionFilter {
    pub fn matches(&self, sub: &Subscription) -> bool {
        self.merchant_id
            .as_ref()
            .map_or(true, |m| sub.merchant_id.as_ref() == Some(m))
            && self
                .client_email
                .as_ref()
                .map_or(true, |e| sub.client_email.eq_ignore_ascii_case(e))
            && self.status.map_or(true, |s| sub.status == s)
    }
}

/// Rejects an update whose status is behind the stored one.
pub fn check_forward(stored: &Transaction, incoming: &Transaction) -> StoreResult<()> {
    if stored.status.can_advance_to(incoming.status) {
        Ok(())
    } else {
        Err(TransitionError {
            id: stored.id.clone(),
            from: stored.status,
            to: incoming.status,
        }
        .into())
    }
}

#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Fails with `Conflict` when the id already exists.
    async fn insert_transaction(&self, tx: Transaction) -> StoreResult<()>;

    /// Returns `false` and leaves the stored record alone when the id exists.
    async fn create_transaction_if_absent(&self, tx: Transaction) -> StoreResult<bool>;

    async fn get_transaction(&self, id: &str) -> StoreResult<Option<Transaction>>;

    /// Replaces an existing record; never moves its status backwards.
    async fn update_transaction(&self, tx: &Transaction) -> StoreResult<()>;

    /// Oldest first.
    async fn transactions_with_status(
        &self,
        statuses: &[TransactionStatus],
    ) -> StoreResult<Vec<Transaction>>;

    async fn count_transactions(&self) -> StoreResult<BTreeMap<TransactionStatus, usize>>;

    async fn upsert_wallet(&self, wallet: WalletAddress) -> StoreResult<()>;

    /// Exact `(network, token, merchant)` match only.
    async fn find_wallet(
        &self,
        network: Network,
        token_type: Option<&str>,
        merchant_id: Option<&str>,
    ) -> StoreResult<Option<WalletAddress>>;

    async fn count_wallets(&self) -> StoreResult<usize>;

    /// Merchant wallet first, then the shared one for the same network and token.
    async fn wallet_for(
        &self,
        network: Network,
        token_type: Option<&str>,
        merchant_id: Option<&str>,
    ) -> StoreResult<Option<WalletAddress>> {
        if merchant_id.is_some() {
            if let Some(wallet) = self.find_wallet(network, token_type, merchant_id).await? {
                return Ok(Some(wallet));
            }
        }
        self.find_wallet(network, token_type, None).await
    }

    async fn insert_subscription(&self, sub: Subscription) -> StoreResult<()>;

    async fn get_subscription(&self, id: &str) -> StoreResult<Option<Subscription>>;

    async fn update_subscription(&self, sub: &Subscription) -> StoreResult<()>;

    /// Replaces the subscription only while the stored copy is still active
    /// with its next bill at `due_at`. Returns `false` and leaves the record
    /// alone once a pause, cancel or earlier run has changed either.
    async fn update_subscription_if_due(
        &self,
        sub: &Subscription,
        due_at: DateTime<Utc>,
    ) -> StoreResult<bool>;

    async fn list_subscriptions(&self, filter: &SubscriptionFilter) -> StoreResult<Vec<Subscription>>;

    /// Active subscriptions whose next bill is at or before `now`, earliest first.
    async fn due_subscriptions(&self, now: DateTime<Utc>) -> StoreResult<Vec<Subscription>> {
        let filter = SubscriptionFilter {
            status: Some(SubscriptionStatus::Active),
            ..Default::default()
        };
        let mut due: Vec<Subscription> = self
            .list_subscriptions(&filter)
            .await?
            .into_iter()
            .filter(|s| s.is_due(now))
            .collect();
        due.sort_by_key(|s| s.next_payment_date);
        Ok(due)
    }

    async fn count_subscriptions(&self) -> StoreResult<BTreeMap<SubscriptionStatus, usize>> {
        let mut counts: BTreeMap<SubscriptionStatus, usize> =
            SubscriptionStatus::ALL.iter().map(|s| (*s, 0)).collect();
        for sub in self.list_subscriptions(&SubscriptionFilter::default()).await? {
            *counts.entry(sub.status).or_default() += 1;
        }
        Ok(counts)
    }
}

/// In-process store for development, simulation runs and tests.
#[derive(Default)]
pub struct MemoryStore {
    transactions: RwLock<HashMap<String, Transaction>>,
    wallets: RwLock<HashMap<String, WalletAddress>>,
    subscriptions: RwLock<HashMap<String, Subscription>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn insert_transaction(&self, tx: Transaction) -> StoreResult<()> {
        let mut transactions = self.transactions.write().await;
        if transactions.contains_key(&tx.id) {
            return Err(StoreError::Conflict(format!("transaction {} exists", tx.id)));
        }
        transactions.insert(tx.id.clone(), tx);
        Ok(())
    }

    async fn create_transaction_if_absent(&self, tx: Transaction) -> StoreResult<bool> {
        let mut transactions = self.transactions.write().await;
        if transactions.contains_key(&tx.id) {
            return Ok(false);
        }
        transactions.insert(tx.id.clone(), tx);
        Ok(true)
    }

    async fn get_transaction(&self, id: &str) -> StoreResult<Option<Transaction>> {
        Ok(self.transactions.read().await.get(id).cloned())
    }

    async fn update_transaction(&self, tx: &Transaction) -> StoreResult<()> {
        let mut transactions = self.transactions.write().await;
        let stored = transactions
            .get_mut(&tx.id)
            .ok_or_else(|| StoreError::NotFound(format!("transaction {}", tx.id)))?;
        check_forward(stored, tx)?;
        *stored = tx.clone();
        Ok(())
    }

    async fn transactions_with_status(
        &self,
        statuses: &[TransactionStatus],
    ) -> StoreResult<Vec<Transaction>> {
        let mut matching: Vec<Transaction> = self
            .transactions
            .read()
            .await
            .values()
            .filter(|tx| statuses.contains(&tx.status))
            .cloned()
            .collect();
        matching.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(matching)
    }

    async fn count_transactions(&self) -> StoreResult<BTreeMap<TransactionStatus, usize>> {
        let mut counts: BTreeMap<TransactionStatus, usize> =
            TransactionStatus::ALL.iter().map(|s| (*s, 0)).collect();
        for tx in self.transactions.read().await.values() {
            *counts.entry(tx.status).or_default() += 1;
        }
        Ok(counts)
    }

    async fn upsert_wallet(&self, wallet: WalletAddress) -> StoreResult<()> {
        let mut wallets = self.wallets.write().await;
        let key = wallet.key();
        let wallet = match wallets.get(&key) {
            Some(existing) => WalletAddress {
                created_at: existing.created_at,
                updated_at: Utc::now(),
                ..wallet
            },
            None => wallet,
        };
        wallets.insert(key, wallet);
        Ok(())
    }

    async fn find_wallet(
        &self,
        network: Network,
        token_type: Option<&str>,
        merchant_id: Option<&str>,
    ) -> StoreResult<Option<WalletAddress>> {
        let key = wallet_key(network, token_type, merchant_id);
        Ok(self.wallets.read().await.get(&key).cloned())
    }

    async fn count_wallets(&self) -> StoreResult<usize> {
        Ok(self.wallets.read().await.len())
    }

    async fn insert_subscription(&self, sub: Subscription) -> StoreResult<()> {
        let mut subscriptions = self.subscriptions.write().await;
        if subscriptions.contains_key(&sub.id) {
            return Err(StoreError::Conflict(format!("subscription {} exists", sub.id)));
        }
        subscriptions.insert(sub.id.clone(), sub);
        Ok(())
    }

    async fn get_subscription(&self, id: &str) -> StoreResult<Option<Subscription>> {
        Ok(self.subscriptions.read().await.get(id).cloned())
    }

    async fn update_subscription(&self, sub: &Subscription) -> StoreResult<()> {
        let mut subscriptions = self.subscriptions.write().await;
        let stored = subscriptions
            .get_mut(&sub.id)
            .ok_or_else(|| StoreError::NotFound(format!("subscription {}", sub.id)))?;
        if sub.next_payment_date < stored.next_payment_date {
            return Err(StoreError::Conflict(format!(
                "subscription {} next payment date would move backwards",
                sub.id
            )));
        }
        *stored = sub.clone();
        Ok(())
    }

    async fn update_subscription_if_due(
        &self,
        sub: &Subscription,
        due_at: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let mut subscriptions = self.subscriptions.write().await;
        let stored = subscriptions
            .get_mut(&sub.id)
            .ok_or_else(|| StoreError::NotFound(format!("subscription {}", sub.id)))?;
        if stored.status != SubscriptionStatus::Active || stored.next_payment_date != due_at {
            return Ok(false);
        }
        *stored = sub.clone();
        Ok(true)
    }

    async fn list_subscriptions(&self, filter: &SubscriptionFilter) -> StoreResult<Vec<Subscription>> {
        let mut matching: Vec<Subscription> = self
            .subscriptions
            .read()
            .await
            .values()
            .filter(|s| filter.matches(s))
            .cloned()
            .collect();
        matching.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(matching)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Frequency;
    use chrono::Duration;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn refuses_status_regression() {
        let store = MemoryStore::new();
        let tx = Transaction::new(dec!(1), Network::Bitcoin, None).status(TransactionStatus::Signed);
        store.insert_transaction(tx.clone()).await.unwrap();

        let mut stale = tx.clone();
        stale.status = TransactionStatus::Confirmed;
        let err = store.update_transaction(&stale).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));

        let stored = store.get_transaction(&tx.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TransactionStatus::Signed);
    }

    #[tokio::test]
    async fn create_if_absent_keeps_first_write() {
        let store = MemoryStore::new();
        let first = Transaction::with_id("bill-1", dec!(5), Network::Tron, None);
        let second = Transaction::with_id("bill-1", dec!(9), Network::Tron, None);

        assert!(store.create_transaction_if_absent(first).await.unwrap());
        assert!(!store.create_transaction_if_absent(second).await.unwrap());
        let stored = store.get_transaction("bill-1").await.unwrap().unwrap();
        assert_eq!(stored.amount, dec!(5));
    }

    #[tokio::test]
    async fn selects_pollable_transactions() {
        let store = MemoryStore::new();
        for status in TransactionStatus::ALL {
            let tx = Transaction::new(dec!(1), Network::Ethereum, None).status(status);
            store.insert_transaction(tx).await.unwrap();
        }
        let pollable = store
            .transactions_with_status(&TransactionStatus::POLLABLE)
            .await
            .unwrap();
        assert_eq!(pollable.len(), 2);
        assert!(pollable.iter().all(|tx| tx.status.is_pollable()));

        let counts = store.count_transactions().await.unwrap();
        assert_eq!(counts[&TransactionStatus::Completed], 1);
    }

    #[tokio::test]
    async fn merchant_wallet_falls_back_to_shared_wallet() {
        let store = MemoryStore::new();
        store
            .upsert_wallet(WalletAddress::new(Network::Ethereum, "0xshared").token("usdt"))
            .await
            .unwrap();
        store
            .upsert_wallet(
                WalletAddress::new(Network::Ethereum, "0xmerchant")
                    .token("USDT")
                    .merchant("m-1"),
            )
            .await
            .unwrap();

        let own = store
            .wallet_for(Network::Ethereum, Some("usdt"), Some("m-1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(own.address, "0xmerchant");

        let shared = store
            .wallet_for(Network::Ethereum, Some("USDT"), Some("m-2"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(shared.address, "0xshared");

        let native = store.wallet_for(Network::Ethereum, None, None).await.unwrap();
        assert!(native.is_none());
    }

    #[tokio::test]
    async fn due_subscriptions_skip_paused_and_future() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let start = now - Duration::days(40);

        let due = Subscription::new("a@example.com", dec!(1), Network::Bitcoin, Frequency::Monthly, start);
        let mut paused = Subscription::new("b@example.com", dec!(1), Network::Bitcoin, Frequency::Monthly, start);
        paused.status = SubscriptionStatus::Paused;
        let future = Subscription::new("c@example.com", dec!(1), Network::Bitcoin, Frequency::Yearly, start);

        let due_id = due.id.clone();
        for sub in [due, paused, future] {
            store.insert_subscription(sub).await.unwrap();
        }

        let selected = store.due_subscriptions(now).await.unwrap();
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].id, due_id);

        let counts = store.count_subscriptions().await.unwrap();
        assert_eq!(counts[&SubscriptionStatus::Active], 2);
        assert_eq!(counts[&SubscriptionStatus::Paused], 1);
    }

    #[tokio::test]
    async fn conditional_update_respects_cancel() {
        let store = MemoryStore::new();
        let sub = Subscription::new("a@example.com", dec!(1), Network::Tron, Frequency::Daily, Utc::now());
        store.insert_subscription(sub.clone()).await.unwrap();
        let due_at = sub.next_payment_date;

        let mut cancelled = sub.clone();
        cancelled.status = SubscriptionStatus::Cancelled;
        store.update_subscription(&cancelled).await.unwrap();

        let mut advanced = sub.clone();
        advanced.next_payment_date = due_at + Duration::days(1);
        assert!(!store.update_subscription_if_due(&advanced, due_at).await.unwrap());

        let stored = store.get_subscription(&sub.id).await.unwrap().unwrap();
        assert_eq!(stored.status, SubscriptionStatus::Cancelled);
        assert_eq!(stored.next_payment_date, due_at);
    }
}
