use async_trait::async_trait;
use chrono::{Months, Utc};
use payment_reconciler::config::Config;
use payment_reconciler::engine::Engine;
use payment_reconciler::models::{
    Frequency, Network, Notification, NotificationKind, Subscription, Transaction,
    TransactionStatus, WalletAddress,
};
use payment_reconciler::services::{
    CacheService, ExchangeService, MemoryStore, NotificationDispatcher, NotificationSender,
    SendError, VerificationService,
};
use rust_decimal_macros::dec;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

#[derive(Default)]
struct Outbox {
    sent: Mutex<Vec<Notification>>,
}

#[async_trait]
impl NotificationSender for Outbox {
    fn name(&self) -> &'static str {
        "outbox"
    }

    async fn send(&self, notification: &Notification) -> Result<(), SendError> {
        self.sent.lock().await.push(notification.clone());
        Ok(())
    }
}

fn engine(outbox: Arc<Outbox>) -> Engine {
    let mut config = Config::from_vars(|_| None).unwrap();
    config.reconciler.interval = Duration::from_millis(20);
    config.billing.interval = Duration::from_millis(20);
    config.worker_shutdown_timeout = Duration::from_secs(2);

    let cache = Arc::new(CacheService::memory_only("test:"));
    Engine::assemble(
        &config,
        Arc::new(MemoryStore::new()),
        cache.clone(),
        Arc::new(VerificationService::simulated()),
        Arc::new(ExchangeService::from_config(&config.exchange, cache).unwrap()),
        Arc::new(NotificationDispatcher::new(outbox, 2, Duration::ZERO)),
    )
}

async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

#[tokio::test]
async fn workers_reconcile_bill_and_notify() {
    let outbox = Arc::new(Outbox::default());
    let engine = engine(outbox.clone());
    engine
        .seed_wallets(&[
            WalletAddress::new(Network::Ethereum, "0xabc"),
            WalletAddress::new(Network::Polygon, "0xdef").token("USDC"),
        ])
        .await
        .unwrap();

    let tx = Transaction::new(dec!(0.1), Network::Ethereum, None)
        .status(TransactionStatus::Confirmed)
        .client_email("payer@example.com");
    engine.store.insert_transaction(tx.clone()).await.unwrap();

    let now = Utc::now();
    let start = now.checked_sub_months(Months::new(3)).unwrap();
    let sub = Subscription::new(
        "member@example.com",
        dec!(12),
        Network::Polygon,
        Frequency::Monthly,
        start,
    )
    .token("USDC");
    let first_bill = sub.next_payment_date;
    engine.store.insert_subscription(sub.clone()).await.unwrap();

    engine.start().await;

    let (shared, tx_id, sub_id) = (&engine, tx.id.as_str(), sub.id.as_str());
    eventually(move || async move {
        shared
            .store
            .get_transaction(tx_id)
            .await
            .unwrap()
            .is_some_and(|t| t.status == TransactionStatus::Completed)
    })
    .await;

    // Three periods are due; billing catches up one period per cycle.
    eventually(move || async move {
        let stored = shared.store.get_subscription(sub_id).await.unwrap().unwrap();
        stored.next_payment_date > now
    })
    .await;

    // One completion plus three payment requests.
    let sent = &outbox.sent;
    eventually(move || async move { sent.lock().await.len() == 4 }).await;

    assert!(engine.stop().await);

    let stored = engine.store.get_subscription(&sub.id).await.unwrap().unwrap();
    assert!(stored.next_payment_date > first_bill);

    let bills = engine
        .store
        .transactions_with_status(&[TransactionStatus::Pending])
        .await
        .unwrap();
    assert_eq!(bills.len(), 3);
    assert!(bills.iter().all(|b| b.subscription_id.as_deref() == Some(sub.id.as_str())));

    let sent = outbox.sent.lock().await;
    assert_eq!(
        sent.iter()
            .filter(|n| n.kind == NotificationKind::PaymentCompleted)
            .count(),
        1
    );
    assert_eq!(
        sent.iter()
            .filter(|n| n.kind == NotificationKind::PaymentRequest)
            .count(),
        3
    );
}

#[tokio::test]
async fn stop_is_graceful_and_idempotent() {
    let engine = engine(Arc::new(Outbox::default()));
    engine.start().await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(engine.stop().await);
    assert!(engine.stop().await);

    let status = engine.status().await.unwrap();
    assert!(!status.reconciler.running);
    assert!(!status.billing.running);
    assert!(!status.notifications.running);
    assert!(status.reconciler.cycles >= 1);
}
