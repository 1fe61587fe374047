use crate::config::BillingConfig;
use crate::models::{Notification, Subscription, SubscriptionStatus, Transaction};
use crate::services::notifications::NotificationDispatcher;
use crate::services::store::RecordStore;
use crate::services::worker::Sweep;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BillingReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub due: usize,
    pub billed: usize,
    /// Bill already existed from an interrupted earlier run.
    pub resumed: usize,
    pub closed: usize,
    /// Paused or cancelled between selection and billing.
    pub skipped: usize,
    pub failures: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum BillOutcome {
    Billed { transaction_id: String },
    Resumed { transaction_id: String },
    Closed,
    Skipped,
    Failed(String),
}

pub struct BillingEngine {
    store: Arc<dyn RecordStore>,
    notifier: Arc<NotificationDispatcher>,
    payment_link_base_url: String,
}

impl BillingEngine {
    pub fn new(
        store: Arc<dyn RecordStore>,
        notifier: Arc<NotificationDispatcher>,
        config: &BillingConfig,
    ) -> Self {
        Self {
            store,
            notifier,
            payment_link_base_url: config.payment_link_base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn payment_link(&self, tx: &Transaction) -> String {
        let mut link = format!(
            "{}/{}?amount={}&network={}",
            self.payment_link_base_url, tx.id, tx.amount, tx.network
        );
        if let Some(token) = &tx.token_type {
            link.push_str(&format!("&token_type={}", token));
        }
        link
    }

    /// Materializes the bill for the subscription's current period and
    /// advances the schedule by exactly one period.
    ///
    /// The bill is written first under an id derived from the billed date.
    /// If the advance then fails, the next run re-derives the same id, finds
    /// the bill and only retries the advance. The advance is conditional on
    /// the stored subscription still being active and due at the billed
    /// date, so a pause or cancel that lands mid-bill is never undone.
    pub async fn bill(&self, sub: Subscription, now: DateTime<Utc>) -> BillOutcome {
        let due_at = sub.next_payment_date;
        let mut sub = match self.store.get_subscription(&sub.id).await {
            Ok(Some(current)) if current.is_due(now) && current.next_payment_date == due_at => {
                current
            }
            Ok(_) => {
                debug!(subscription_id = %sub.id, "Subscription changed since selection");
                return BillOutcome::Skipped;
            }
            Err(e) => {
                error!(subscription_id = %sub.id, "Failed to reload subscription: {}", e);
                return BillOutcome::Failed(e.to_string());
            }
        };

        if sub.has_ended() {
            return self.close(sub, due_at, now).await;
        }

        let Some(following) = sub.following_payment_date() else {
            error!(subscription_id = %sub.id, "Cannot compute next payment date");
            return BillOutcome::Failed("next payment date out of range".to_string());
        };

        match self
            .store
            .wallet_for(sub.network, sub.token_type.as_deref(), sub.merchant_id.as_deref())
            .await
        {
            Ok(Some(_)) => {}
            Ok(None) => {
                error!(
                    subscription_id = %sub.id,
                    network = %sub.network,
                    token = sub.token_type.as_deref().unwrap_or("native"),
                    merchant_id = sub.merchant_id.as_deref().unwrap_or("-"),
                    "No receiving wallet configured"
                );
                return BillOutcome::Failed(format!("no receiving wallet for {}", sub.network));
            }
            Err(e) => {
                error!(subscription_id = %sub.id, "Failed to look up receiving wallet: {}", e);
                return BillOutcome::Failed(e.to_string());
            }
        }

        let mut tx = Transaction::with_id(
            sub.billing_transaction_id(),
            sub.amount,
            sub.network,
            sub.token_type.clone(),
        )
        .client_email(sub.client_email.clone())
        .description(sub.billing_description());
        tx.subscription_id = Some(sub.id.clone());
        tx.merchant_id = sub.merchant_id.clone();

        let created = match self.store.create_transaction_if_absent(tx.clone()).await {
            Ok(created) => created,
            Err(e) => {
                error!(subscription_id = %sub.id, "Failed to materialize bill: {}", e);
                return BillOutcome::Failed(e.to_string());
            }
        };

        sub.next_payment_date = following;
        sub.updated_at = now;
        match self.store.update_subscription_if_due(&sub, due_at).await {
            Ok(true) => {}
            Ok(false) => {
                warn!(
                    subscription_id = %sub.id,
                    transaction_id = %tx.id,
                    "Subscription changed while billing, bill left unannounced"
                );
                return BillOutcome::Skipped;
            }
            Err(e) => {
                error!(
                    subscription_id = %sub.id,
                    transaction_id = %tx.id,
                    "Failed to advance schedule: {}",
                    e
                );
                return BillOutcome::Failed(e.to_string());
            }
        }

        info!(
            subscription_id = %sub.id,
            transaction_id = %tx.id,
            amount = %tx.amount,
            network = %tx.network,
            next_payment_date = %sub.next_payment_date,
            resumed = !created,
            "Subscription billed"
        );

        // Sent only after the advance is stored, so a resumed bill has not
        // been announced yet either.
        let link = self.payment_link(&tx);
        self.notifier
            .enqueue(Notification::payment_request(&tx, &sub.client_email, &link));

        if created {
            BillOutcome::Billed { transaction_id: tx.id }
        } else {
            BillOutcome::Resumed { transaction_id: tx.id }
        }
    }

    async fn close(
        &self,
        mut sub: Subscription,
        due_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> BillOutcome {
        sub.status = SubscriptionStatus::Cancelled;
        sub.updated_at = now;
        match self.store.update_subscription_if_due(&sub, due_at).await {
            Ok(true) => {
                info!(subscription_id = %sub.id, "Subscription reached its end date");
                BillOutcome::Closed
            }
            Ok(false) => BillOutcome::Skipped,
            Err(e) => {
                error!(subscription_id = %sub.id, "Failed to close subscription: {}", e);
                BillOutcome::Failed(e.to_string())
            }
        }
    }

    /// One pass over every subscription due at `now`.
    pub async fn bill_due(&self, now: DateTime<Utc>) -> BillingReport {
        let started_at = Utc::now();
        let mut report = BillingReport {
            started_at,
            finished_at: started_at,
            due: 0,
            billed: 0,
            resumed: 0,
            closed: 0,
            skipped: 0,
            failures: 0,
        };

        let due = match self.store.due_subscriptions(now).await {
            Ok(due) => due,
            Err(e) => {
                error!("Failed to select due subscriptions: {}", e);
                report.failures += 1;
                report.finished_at = Utc::now();
                return report;
            }
        };
        debug!(count = due.len(), "Billing due subscriptions");

        for sub in due {
            report.due += 1;
            let id = sub.id.clone();
            let outcome = match AssertUnwindSafe(self.bill(sub, now)).catch_unwind().await {
                Ok(outcome) => outcome,
                Err(_) => {
                    error!(subscription_id = %id, "Billing panicked");
                    BillOutcome::Failed("panicked".to_string())
                }
            };
            match outcome {
                BillOutcome::Billed { .. } => report.billed += 1,
                BillOutcome::Resumed { .. } => report.resumed += 1,
                BillOutcome::Closed => report.closed += 1,
                BillOutcome::Skipped => report.skipped += 1,
                BillOutcome::Failed(_) => report.failures += 1,
            }
        }

        report.finished_at = Utc::now();
        if report.due > 0 {
            info!(
                due = report.due,
                billed = report.billed,
                closed = report.closed,
                skipped = report.skipped,
                failures = report.failures,
                "Billing cycle finished"
            );
        }
        report
    }
}

#[async_trait]
impl Sweep for BillingEngine {
    type Report = BillingReport;

    fn name(&self) -> &'static str {
        "billing"
    }

    async fn run_cycle(&self) -> BillingReport {
        self.bill_due(Utc::now()).await
    }
}
