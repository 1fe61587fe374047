use super::Transaction;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    PaymentRequest,
    PaymentCompleted,
}

/// One outbound message for the dispatcher queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub id: Uuid,
    pub kind: NotificationKind,
    pub recipient: String,
    pub subject: String,
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Notification {
    pub fn new(
        kind: NotificationKind,
        recipient: impl Into<String>,
        subject: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            recipient: recipient.into(),
            subject: subject.into(),
            body: body.into(),
            transaction_id: None,
            created_at: Utc::now(),
        }
    }

    pub fn payment_completed(tx: &Transaction, recipient: &str) -> Self {
        let symbol = tx.asset_symbol();
        let mut body = format!(
            "Your payment of {} {} on {} has been confirmed.\nReference: {}",
            tx.amount,
            symbol,
            tx.network.display_name(),
            tx.id
        );
        if let Some(hash) = &tx.tx_hash {
            body.push_str(&format!("\nTransaction hash: {}", hash));
        }
        let mut n = Self::new(
            NotificationKind::PaymentCompleted,
            recipient,
            format!("Payment received: {} {}", tx.amount, symbol),
            body,
        );
        n.transaction_id = Some(tx.id.clone());
        n
    }

    pub fn payment_request(tx: &Transaction, recipient: &str, payment_link: &str) -> Self {
        let symbol = tx.asset_symbol();
        let mut body = format!(
            "Amount: {} {}\nNetwork: {}\n",
            tx.amount,
            symbol,
            tx.network.display_name()
        );
        if let Some(description) = &tx.description {
            body.push_str(&format!("Description: {}\n", description));
        }
        body.push_str(&format!("Pay here: {}", payment_link));
        let mut n = Self::new(
            NotificationKind::PaymentRequest,
            recipient,
            format!("Payment Request for {} {}", tx.amount, symbol),
            body,
        );
        n.transaction_id = Some(tx.id.clone());
        n
    }
}
