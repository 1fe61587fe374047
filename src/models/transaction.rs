use super::Network;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Lifecycle of a payment obligation. Only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionStatus {
    Pending,
    Confirmed,
    Signed,
    Completed,
}

impl TransactionStatus {
    pub const ALL: [TransactionStatus; 4] = [
        TransactionStatus::Pending,
        TransactionStatus::Confirmed,
        TransactionStatus::Signed,
        TransactionStatus::Completed,
    ];

    /// Statuses the reconciliation worker polls.
    pub const POLLABLE: [TransactionStatus; 2] =
        [TransactionStatus::Confirmed, TransactionStatus::Signed];

    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Pending => "pending",
            TransactionStatus::Confirmed => "confirmed",
            TransactionStatus::Signed => "signed",
            TransactionStatus::Completed => "completed",
        }
    }

    fn rank(self) -> u8 {
        match self {
            TransactionStatus::Pending => 0,
            TransactionStatus::Confirmed => 1,
            TransactionStatus::Signed => 2,
            TransactionStatus::Completed => 3,
        }
    }

    pub fn is_pollable(self) -> bool {
        Self::POLLABLE.contains(&self)
    }

    pub fn is_terminal(self) -> bool {
        self == TransactionStatus::Completed
    }

    pub fn can_advance_to(self, next: TransactionStatus) -> bool {
        next.rank() >= self.rank()
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("transaction {id} cannot move from {from} back to {to}")]
pub struct TransitionError {
    pub id: String,
    pub from: TransactionStatus,
    pub to: TransactionStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: String,
    pub amount: Decimal,
    pub network: Network,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merchant_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscription_id: Option<String>,
    pub status: TransactionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tx_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub matched_amount: Option<Decimal>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Transaction {
    pub fn new(amount: Decimal, network: Network, token_type: Option<String>) -> Self {
        Self::with_id(Uuid::new_v4().to_string(), amount, network, token_type)
    }

    pub fn with_id(
        id: impl Into<String>,
        amount: Decimal,
        network: Network,
        token_type: Option<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            amount,
            network,
            token_type: token_type.map(|t| t.to_uppercase()),
            client_email: None,
            merchant_id: None,
            description: None,
            subscription_id: None,
            status: TransactionStatus::Pending,
            tx_hash: None,
            matched_amount: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn client_email(mut self, email: impl Into<String>) -> Self {
        self.client_email = Some(email.into());
        self
    }

    pub fn merchant(mut self, merchant_id: impl Into<String>) -> Self {
        self.merchant_id = Some(merchant_id.into());
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn status(mut self, status: TransactionStatus) -> Self {
        self.status = status;
        self
    }

    /// Symbol the payer sends: the token when one is set, else the native coin.
    pub fn asset_symbol(&self) -> String {
        self.token_type
            .clone()
            .unwrap_or_else(|| self.network.symbol().to_string())
    }

    /// Moves the status forward. Returns `Ok(false)` when already there.
    pub fn advance_to(
        &mut self,
        next: TransactionStatus,
        now: DateTime<Utc>,
    ) -> Result<bool, TransitionError> {
        if !self.status.can_advance_to(next) {
            return Err(TransitionError {
                id: self.id.clone(),
                from: self.status,
                to: next,
            });
        }
        if self.status == next {
            return Ok(false);
        }
        self.status = next;
        self.updated_at = now;
        Ok(true)
    }

    /// Records the matched on-chain payment. A completed transaction keeps
    /// its original hash and amount.
    pub fn complete(
        &mut self,
        tx_hash: impl Into<String>,
        matched_amount: Option<Decimal>,
        now: DateTime<Utc>,
    ) -> Result<bool, TransitionError> {
        if self.status.is_terminal() {
            return Ok(false);
        }
        self.advance_to(TransactionStatus::Completed, now)?;
        self.tx_hash = Some(tx_hash.into());
        self.matched_amount = matched_amount;
        Ok(true)
    }
}
