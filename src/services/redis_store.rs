use crate::models::{
    wallet_key, Network, Subscription, Transaction, TransactionStatus, WalletAddress,
};
use crate::services::store::{RecordStore, StoreError, StoreResult, SubscriptionFilter};
use anyhow::{Context, Result};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;

/// Status-monotonic replace of one transaction record plus its index sets,
/// executed atomically on the server.
const UPDATE_TRANSACTION: &str = r#"
local current = redis.call('GET', KEYS[1])
if not current then return -1 end
local stored = cjson.decode(current)['status']
local ranks = {pending = 0, confirmed = 1, signed = 2, completed = 3}
if ranks[ARGV[2]] < ranks[stored] then return 0 end
redis.call('SET', KEYS[1], ARGV[1])
redis.call('SREM', KEYS[2] .. stored, ARGV[3])
redis.call('SADD', KEYS[2] .. ARGV[2], ARGV[3])
return 1
"#;

/// Writes a new record and its index entry in one step, or neither when the
/// id is taken.
const CREATE_INDEXED: &str = r#"
if not redis.call('SET', KEYS[1], ARGV[1], 'NX') then return 0 end
redis.call('SADD', KEYS[2], ARGV[2])
return 1
"#;

/// Compare-and-set on a subscription that is still active and due at the
/// given date.
const UPDATE_SUBSCRIPTION_IF_DUE: &str = r#"
local current = redis.call('GET', KEYS[1])
if not current then return -1 end
local stored = cjson.decode(current)
if stored['status'] ~= 'active' or stored['next_payment_date'] ~= ARGV[2] then return 0 end
redis.call('SET', KEYS[1], ARGV[1])
return 1
"#;

impl From<redis::RedisError> for StoreError {
    fn from(e: redis::RedisError) -> Self {
        StoreError::Backend(e.to_string())
    }
}

/// JSON records keyed by id, with set indexes per transaction status and
/// for the wallet and subscription collections.
pub struct RedisStore {
    conn: ConnectionManager,
    prefix: String,
    update_script: redis::Script,
    create_script: redis::Script,
    due_script: redis::Script,
}

impl RedisStore {
    pub async fn connect(url: &str, prefix: impl Into<String>) -> Result<Self> {
        let client = redis::Client::open(url).context("Invalid REDIS_URL")?;
        let conn = client
            .get_connection_manager()
            .await
            .context("Failed to connect record store to Redis")?;
        tracing::info!("Record store connected to Redis");
        Ok(Self {
            conn,
            prefix: prefix.into(),
            update_script: redis::Script::new(UPDATE_TRANSACTION),
            create_script: redis::Script::new(CREATE_INDEXED),
            due_script: redis::Script::new(UPDATE_SUBSCRIPTION_IF_DUE),
        })
    }

    fn tx_key(&self, id: &str) -> String {
        format!("{}tx:{}", self.prefix, id)
    }

    fn status_prefix(&self) -> String {
        format!("{}tx:status:", self.prefix)
    }

    fn status_key(&self, status: TransactionStatus) -> String {
        format!("{}{}", self.status_prefix(), status)
    }

    fn wallet_key(&self, key: &str) -> String {
        format!("{}wallet:{}", self.prefix, key)
    }

    fn wallets_index(&self) -> String {
        format!("{}wallets", self.prefix)
    }

    fn sub_key(&self, id: &str) -> String {
        format!("{}sub:{}", self.prefix, id)
    }

    fn subs_index(&self) -> String {
        format!("{}subs", self.prefix)
    }

    async fn load_many<T: DeserializeOwned>(&self, keys: Vec<String>) -> StoreResult<Vec<T>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        let raw: Vec<Option<String>> = redis::cmd("MGET").arg(&keys).query_async(&mut conn).await?;
        raw.into_iter()
            .flatten()
            .map(|json| serde_json::from_str(&json).map_err(StoreError::from))
            .collect()
    }

    async fn load_one<T: DeserializeOwned>(&self, key: &str) -> StoreResult<Option<T>> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(key).await?;
        raw.map(|json| serde_json::from_str(&json).map_err(StoreError::from))
            .transpose()
    }

    async fn create_indexed(
        &self,
        key: String,
        json: String,
        index: String,
        id: &str,
    ) -> StoreResult<bool> {
        let mut conn = self.conn.clone();
        let created: i64 = self
            .create_script
            .key(key)
            .key(index)
            .arg(json)
            .arg(id)
            .invoke_async(&mut conn)
            .await?;
        Ok(created == 1)
    }

    async fn all_subscriptions(&self) -> StoreResult<Vec<Subscription>> {
        let mut conn = self.conn.clone();
        let ids: Vec<String> = conn.smembers(self.subs_index()).await?;
        let keys = ids.iter().map(|id| self.sub_key(id)).collect();
        self.load_many(keys).await
    }
}

#[async_trait]
impl RecordStore for RedisStore {
    async fn insert_transaction(&self, tx: Transaction) -> StoreResult<()> {
        if !self.create_transaction_if_absent(tx.clone()).await? {
            return Err(StoreError::Conflict(format!("transaction {} exists", tx.id)));
        }
        Ok(())
    }

    async fn create_transaction_if_absent(&self, tx: Transaction) -> StoreResult<bool> {
        let json = serde_json::to_string(&tx)?;
        self.create_indexed(self.tx_key(&tx.id), json, self.status_key(tx.status), &tx.id)
            .await
    }

    async fn get_transaction(&self, id: &str) -> StoreResult<Option<Transaction>> {
        self.load_one(&self.tx_key(id)).await
    }

    async fn update_transaction(&self, tx: &Transaction) -> StoreResult<()> {
        let json = serde_json::to_string(tx)?;
        let mut conn = self.conn.clone();
        let outcome: i64 = self
            .update_script
            .key(self.tx_key(&tx.id))
            .key(self.status_prefix())
            .arg(json)
            .arg(tx.status.as_str())
            .arg(&tx.id)
            .invoke_async(&mut conn)
            .await?;
        match outcome {
            1 => Ok(()),
            0 => Err(StoreError::Conflict(format!(
                "transaction {} cannot move back to {}",
                tx.id, tx.status
            ))),
            _ => Err(StoreError::NotFound(format!("transaction {}", tx.id))),
        }
    }

    async fn transactions_with_status(
        &self,
        statuses: &[TransactionStatus],
    ) -> StoreResult<Vec<Transaction>> {
        let mut conn = self.conn.clone();
        let mut keys = Vec::new();
        for status in statuses {
            let ids: Vec<String> = conn.smembers(self.status_key(*status)).await?;
            keys.extend(ids.iter().map(|id| self.tx_key(id)));
        }
        let mut transactions: Vec<Transaction> = self.load_many(keys).await?;
        // Index sets can trail a concurrent update by one write.
        transactions.retain(|tx| statuses.contains(&tx.status));
        transactions.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        transactions.dedup_by(|a, b| a.id == b.id);
        Ok(transactions)
    }

    async fn count_transactions(&self) -> StoreResult<BTreeMap<TransactionStatus, usize>> {
        let mut conn = self.conn.clone();
        let mut counts = BTreeMap::new();
        for status in TransactionStatus::ALL {
            let n: usize = conn.scard(self.status_key(status)).await?;
            counts.insert(status, n);
        }
        Ok(counts)
    }

    async fn upsert_wallet(&self, wallet: WalletAddress) -> StoreResult<()> {
        let key = wallet.key();
        let wallet = match self.load_one::<WalletAddress>(&self.wallet_key(&key)).await? {
            Some(existing) => WalletAddress {
                created_at: existing.created_at,
                updated_at: chrono::Utc::now(),
                ..wallet
            },
            None => wallet,
        };
        let json = serde_json::to_string(&wallet)?;
        let mut conn = self.conn.clone();
        redis::pipe()
            .set(self.wallet_key(&key), json)
            .ignore()
            .sadd(self.wallets_index(), &key)
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn find_wallet(
        &self,
        network: Network,
        token_type: Option<&str>,
        merchant_id: Option<&str>,
    ) -> StoreResult<Option<WalletAddress>> {
        let key = wallet_key(network, token_type, merchant_id);
        self.load_one(&self.wallet_key(&key)).await
    }

    async fn count_wallets(&self) -> StoreResult<usize> {
        let mut conn = self.conn.clone();
        Ok(conn.scard(self.wallets_index()).await?)
    }

    async fn insert_subscription(&self, sub: Subscription) -> StoreResult<()> {
        let json = serde_json::to_string(&sub)?;
        let created = self
            .create_indexed(self.sub_key(&sub.id), json, self.subs_index(), &sub.id)
            .await?;
        if !created {
            return Err(StoreError::Conflict(format!("subscription {} exists", sub.id)));
        }
        Ok(())
    }

    async fn get_subscription(&self, id: &str) -> StoreResult<Option<Subscription>> {
        self.load_one(&self.sub_key(id)).await
    }

    // Operator writes only. Billing goes through `update_subscription_if_due`.
    async fn update_subscription(&self, sub: &Subscription) -> StoreResult<()> {
        let stored: Subscription = self
            .get_subscription(&sub.id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("subscription {}", sub.id)))?;
        if sub.next_payment_date < stored.next_payment_date {
            return Err(StoreError::Conflict(format!(
                "subscription {} next payment date would move backwards",
                sub.id
            )));
        }
        let json = serde_json::to_string(sub)?;
        let mut conn = self.conn.clone();
        conn.set::<_, _, ()>(self.sub_key(&sub.id), json).await?;
        Ok(())
    }

    async fn update_subscription_if_due(
        &self,
        sub: &Subscription,
        due_at: chrono::DateTime<chrono::Utc>,
    ) -> StoreResult<bool> {
        let json = serde_json::to_string(sub)?;
        // Same text the record was serialized with.
        let due_at = serde_json::to_string(&due_at)?;
        let mut conn = self.conn.clone();
        let outcome: i64 = self
            .due_script
            .key(self.sub_key(&sub.id))
            .arg(json)
            .arg(due_at.trim_matches('"'))
            .invoke_async(&mut conn)
            .await?;
        match outcome {
            -1 => Err(StoreError::NotFound(format!("subscription {}", sub.id))),
            n => Ok(n == 1),
        }
    }

    async fn list_subscriptions(&self, filter: &SubscriptionFilter) -> StoreResult<Vec<Subscription>> {
        let mut subs: Vec<Subscription> = self
            .all_subscriptions()
            .await?
            .into_iter()
            .filter(|s| filter.matches(s))
            .collect();
        subs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(subs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Frequency, SubscriptionStatus};
    use rust_decimal_macros::dec;
    use uuid::Uuid;

    async fn store() -> RedisStore {
        let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".into());
        RedisStore::connect(&url, format!("test:{}:", Uuid::new_v4().simple()))
            .await
            .unwrap()
    }

    #[tokio::test]
    #[ignore = "requires a running Redis"]
    async fn status_index_follows_updates() {
        let store = store().await;
        let mut tx = Transaction::new(dec!(0.1), Network::Ethereum, None)
            .status(TransactionStatus::Confirmed);
        store.insert_transaction(tx.clone()).await.unwrap();

        tx.complete("0xabc", Some(dec!(0.1)), chrono::Utc::now()).unwrap();
        store.update_transaction(&tx).await.unwrap();

        let pollable = store
            .transactions_with_status(&TransactionStatus::POLLABLE)
            .await
            .unwrap();
        assert!(pollable.is_empty());
        let counts = store.count_transactions().await.unwrap();
        assert_eq!(counts[&TransactionStatus::Completed], 1);
    }

    #[tokio::test]
    #[ignore = "requires a running Redis"]
    async fn rejects_regression_atomically() {
        let store = store().await;
        let tx = Transaction::new(dec!(1), Network::Bitcoin, None).status(TransactionStatus::Signed);
        store.insert_transaction(tx.clone()).await.unwrap();

        let mut stale = tx.clone();
        stale.status = TransactionStatus::Pending;
        assert!(matches!(
            store.update_transaction(&stale).await,
            Err(StoreError::Conflict(_))
        ));
    }

    #[tokio::test]
    #[ignore = "requires a running Redis"]
    async fn bill_and_index_are_written_together() {
        let store = store().await;
        let bill = Transaction::with_id("bill-1", dec!(5), Network::Tron, None);
        assert!(store.create_transaction_if_absent(bill.clone()).await.unwrap());
        assert!(!store.create_transaction_if_absent(bill).await.unwrap());

        let pending = store
            .transactions_with_status(&[TransactionStatus::Pending])
            .await
            .unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(store.count_transactions().await.unwrap()[&TransactionStatus::Pending], 1);
    }

    #[tokio::test]
    #[ignore = "requires a running Redis"]
    async fn due_update_loses_to_cancel() {
        let store = store().await;
        let sub = Subscription::new("a@example.com", dec!(1), Network::Tron, Frequency::Daily, chrono::Utc::now());
        store.insert_subscription(sub.clone()).await.unwrap();
        let due_at = sub.next_payment_date;

        let mut advanced = sub.clone();
        advanced.next_payment_date = sub.following_payment_date().unwrap();

        let mut cancelled = sub.clone();
        cancelled.status = SubscriptionStatus::Cancelled;
        store.update_subscription(&cancelled).await.unwrap();
        assert!(!store.update_subscription_if_due(&advanced, due_at).await.unwrap());

        let stored = store.get_subscription(&sub.id).await.unwrap().unwrap();
        assert_eq!(stored.status, SubscriptionStatus::Cancelled);

        let other = Subscription::new("b@example.com", dec!(1), Network::Tron, Frequency::Daily, chrono::Utc::now());
        store.insert_subscription(other.clone()).await.unwrap();
        let mut moved = other.clone();
        moved.next_payment_date = other.following_payment_date().unwrap();
        assert!(store.update_subscription_if_due(&moved, other.next_payment_date).await.unwrap());
    }
}
