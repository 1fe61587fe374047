use super::{SubscriptionStatus, TransactionStatus};
use crate::services::{
    BillingReport, CacheStats, DispatcherStatus, ReconcileReport, WorkerStatus,
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Serialize, Deserialize, Debug)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: T,
    pub timestamp: DateTime<Utc>,
}

impl<T> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data,
            timestamp: Utc::now(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug)]
pub struct HealthStatus {
    pub status: String,
    pub version: String,
    pub cache: bool,
    pub reconciler_running: bool,
    pub billing_running: bool,
    pub notifications_running: bool,
    pub simulation_mode: bool,
    pub uptime_seconds: u64,
    pub timestamp: DateTime<Utc>,
}

/// Operator view of worker liveness and obligation counts.
#[derive(Serialize, Debug)]
pub struct StatusInfo {
    pub environment: String,
    pub simulation_mode: bool,
    pub reconciler: WorkerStatus<ReconcileReport>,
    pub billing: WorkerStatus<BillingReport>,
    pub notifications: DispatcherStatus,
    pub transactions: BTreeMap<TransactionStatus, usize>,
    pub subscriptions: BTreeMap<SubscriptionStatus, usize>,
    pub wallet_count: usize,
    pub cache: CacheStats,
    /// Reporting only; absent when no rate table could be fetched.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outstanding_value_usd: Option<Decimal>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct TriggerResponse {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub report: Option<ReconcileReport>,
}
