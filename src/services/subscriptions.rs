use crate::error::{ReconcilerError, Result};
use crate::models::{Frequency, Network, Subscription, SubscriptionStatus};
use crate::services::store::{RecordStore, SubscriptionFilter};
use chrono::{DateTime, Datelike, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Clone, Deserialize)]
pub struct NewSubscription {
    pub client_email: String,
    pub amount: Decimal,
    pub network: Network,
    #[serde(default)]
    pub token_type: Option<String>,
    pub frequency: Frequency,
    #[serde(default)]
    pub start_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub merchant_id: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

/// Lifecycle operations on recurring payment templates. Billing itself is
/// done by [`crate::services::BillingEngine`].
pub struct SubscriptionService {
    store: Arc<dyn RecordStore>,
}

impl SubscriptionService {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self { store }
    }

    pub async fn create(&self, request: NewSubscription) -> Result<Subscription> {
        if request.amount <= Decimal::ZERO {
            return Err(ReconcilerError::Validation("amount must be positive".into()));
        }
        if !request.client_email.contains('@') {
            return Err(ReconcilerError::Validation(format!(
                "invalid email: {}",
                request.client_email
            )));
        }

        let start = request.start_date.unwrap_or_else(Utc::now);
        if let Some(end) = request.end_date {
            if end <= start {
                return Err(ReconcilerError::Validation(
                    "end date must be after start date".into(),
                ));
            }
        }

        let mut sub = Subscription::new(
            request.client_email,
            request.amount,
            request.network,
            request.frequency,
            start,
        );
        if let Some(token) = request.token_type.filter(|t| !t.is_empty()) {
            sub = sub.token(token);
        }
        if let Some(merchant) = request.merchant_id {
            sub = sub.merchant(merchant);
        }
        if let Some(description) = request.description {
            sub = sub.description(description);
        }
        sub.end_date = request.end_date;

        self.store.insert_subscription(sub.clone()).await?;
        info!(
            subscription_id = %sub.id,
            frequency = %sub.frequency,
            next_payment_date = %sub.next_payment_date,
            "Subscription created"
        );
        Ok(sub)
    }

    pub async fn get(&self, id: &str) -> Result<Subscription> {
        self.store
            .get_subscription(id)
            .await?
            .ok_or_else(|| ReconcilerError::NotFound(format!("subscription {}", id)))
    }

    pub async fn pause(&self, id: &str) -> Result<Subscription> {
        let mut sub = self.get(id).await?;
        match sub.status {
            SubscriptionStatus::Paused => return Ok(sub),
            SubscriptionStatus::Cancelled => {
                return Err(ReconcilerError::Conflict(format!(
                    "subscription {} is cancelled",
                    id
                )))
            }
            SubscriptionStatus::Active => {}
        }
        sub.status = SubscriptionStatus::Paused;
        sub.updated_at = Utc::now();
        self.store.update_subscription(&sub).await?;
        info!(subscription_id = %id, "Subscription paused");
        Ok(sub)
    }

    /// Reactivates a paused subscription. The next bill falls one period
    /// after `now` on `now`'s day of the month, or stays where it was if that
    /// is later.
    pub async fn resume(&self, id: &str, now: DateTime<Utc>) -> Result<Subscription> {
        let mut sub = self.get(id).await?;
        match sub.status {
            SubscriptionStatus::Active => return Ok(sub),
            SubscriptionStatus::Cancelled => {
                return Err(ReconcilerError::Conflict(format!(
                    "subscription {} is cancelled",
                    id
                )))
            }
            SubscriptionStatus::Paused => {}
        }

        let next = sub
            .frequency
            .advance(now, now.day())
            .ok_or_else(|| ReconcilerError::InternalError("next payment date out of range".into()))?;
        sub.next_payment_date = next.max(sub.next_payment_date);
        sub.status = SubscriptionStatus::Active;
        sub.updated_at = now;
        self.store.update_subscription(&sub).await?;
        info!(
            subscription_id = %id,
            next_payment_date = %sub.next_payment_date,
            "Subscription resumed"
        );
        Ok(sub)
    }

    pub async fn cancel(&self, id: &str, now: DateTime<Utc>) -> Result<Subscription> {
        let mut sub = self.get(id).await?;
        if sub.status == SubscriptionStatus::Cancelled {
            return Ok(sub);
        }
        sub.status = SubscriptionStatus::Cancelled;
        sub.end_date = Some(now);
        sub.updated_at = now;
        self.store.update_subscription(&sub).await?;
        info!(subscription_id = %id, "Subscription cancelled");
        Ok(sub)
    }

    pub async fn list(&self, filter: &SubscriptionFilter) -> Result<Vec<Subscription>> {
        Ok(self.store.list_subscriptions(filter).await?)
    }
}
