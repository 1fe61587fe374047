use super::Network;
use chrono::{DateTime, Datelike, Duration, Months, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Frequency {
    Daily,
    Weekly,
    Monthly,
    Yearly,
}

impl Frequency {
    pub fn as_str(&self) -> &'static str {
        match self {
            Frequency::Daily => "daily",
            Frequency::Weekly => "weekly",
            Frequency::Monthly => "monthly",
            Frequency::Yearly => "yearly",
        }
    }

    /// Next billing date one period after `from`.
    ///
    /// Monthly and yearly periods land on `anchor_day` when the target month
    /// has that many days, otherwise on the month's last day. `None` only on
    /// calendar overflow.
    pub fn advance(self, from: DateTime<Utc>, anchor_day: u32) -> Option<DateTime<Utc>> {
        match self {
            Frequency::Daily => from.checked_add_signed(Duration::days(1)),
            Frequency::Weekly => from.checked_add_signed(Duration::weeks(1)),
            Frequency::Monthly => add_months_anchored(from, 1, anchor_day),
            Frequency::Yearly => add_months_anchored(from, 12, anchor_day),
        }
    }
}

impl fmt::Display for Frequency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Frequency {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "daily" => Ok(Frequency::Daily),
            "weekly" => Ok(Frequency::Weekly),
            "monthly" => Ok(Frequency::Monthly),
            "yearly" | "annual" | "annually" => Ok(Frequency::Yearly),
            other => Err(format!("Unknown frequency: {}", other)),
        }
    }
}

pub fn days_in_month(year: i32, month: u32) -> u32 {
    let (next_year, next_month) = if month == 12 {
        (year + 1, 1)
    } else {
        (year, month + 1)
    };
    NaiveDate::from_ymd_opt(next_year, next_month, 1)
        .and_then(|first| first.pred_opt())
        .map(|last| last.day())
        .unwrap_or(28)
}

fn add_months_anchored(
    from: DateTime<Utc>,
    months: u32,
    anchor_day: u32,
) -> Option<DateTime<Utc>> {
    let shifted = from.checked_add_months(Months::new(months))?;
    let last_day = days_in_month(shifted.year(), shifted.month());
    shifted.with_day(anchor_day.clamp(1, 31).min(last_day))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionStatus {
    Active,
    Paused,
    Cancelled,
}

impl SubscriptionStatus {
    pub const ALL: [SubscriptionStatus; 3] = [
        SubscriptionStatus::Active,
        SubscriptionStatus::Paused,
        SubscriptionStatus::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::Paused => "paused",
            SubscriptionStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Template for a recurring payment obligation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merchant_id: Option<String>,
    pub client_email: String,
    pub amount: Decimal,
    pub network: Network,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_type: Option<String>,
    pub frequency: Frequency,
    pub start_date: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_date: Option<DateTime<Utc>>,
    pub next_payment_date: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub status: SubscriptionStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Subscription {
    /// Builds an active subscription whose first bill falls one period
    /// after `start_date`.
    pub fn new(
        client_email: impl Into<String>,
        amount: Decimal,
        network: Network,
        frequency: Frequency,
        start_date: DateTime<Utc>,
    ) -> Self {
        let now = Utc::now();
        let next_payment_date = frequency
            .advance(start_date, start_date.day())
            .unwrap_or(start_date);
        Self {
            id: Uuid::new_v4().to_string(),
            merchant_id: None,
            client_email: client_email.into(),
            amount,
            network,
            token_type: None,
            frequency,
            start_date,
            end_date: None,
            next_payment_date,
            description: None,
            status: SubscriptionStatus::Active,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn token(mut self, token_type: impl Into<String>) -> Self {
        self.token_type = Some(token_type.into().to_uppercase());
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

    pub fn ends_at(mut self, end_date: DateTime<Utc>) -> Self {
        self.end_date = Some(end_date);
        self
    }

    pub fn anchor_day(&self) -> u32 {
        self.start_date.day()
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == SubscriptionStatus::Active && self.next_payment_date <= now
    }

    /// True once the next bill would fall after the end date.
    pub fn has_ended(&self) -> bool {
        self.end_date
            .map(|end| self.next_payment_date > end)
            .unwrap_or(false)
    }

    /// The period after the current `next_payment_date`.
    pub fn following_payment_date(&self) -> Option<DateTime<Utc>> {
        self.frequency
            .advance(self.next_payment_date, self.anchor_day())
    }

    /// Stable id of the transaction billed for the current period, so a
    /// retried materialization finds the bill it already wrote.
    pub fn billing_transaction_id(&self) -> String {
        let name = format!("{}:{}", self.id, self.next_payment_date.to_rfc3339());
        Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes()).to_string()
    }

    pub fn billing_description(&self) -> String {
        match &self.description {
            Some(d) => format!("Subscription payment: {}", d),
            None => "Subscription payment".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn at(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 9, 30, 0).unwrap()
    }

    #[test]
    fn monthly_from_jan_31_lands_on_last_day_of_february() {
        assert_eq!(Frequency::Monthly.advance(at(2024, 1, 31), 31), Some(at(2024, 2, 29)));
        assert_eq!(Frequency::Monthly.advance(at(2023, 1, 31), 31), Some(at(2023, 2, 28)));
    }

    #[test]
    fn monthly_returns_to_anchor_day_after_short_month() {
        let feb = Frequency::Monthly.advance(at(2024, 1, 31), 31).unwrap();
        assert_eq!(Frequency::Monthly.advance(feb, 31), Some(at(2024, 3, 31)));
        let apr = Frequency::Monthly.advance(at(2024, 3, 31), 31).unwrap();
        assert_eq!(apr, at(2024, 4, 30));
    }

    #[test]
    fn december_rolls_into_next_year() {
        assert_eq!(Frequency::Monthly.advance(at(2024, 12, 15), 15), Some(at(2025, 1, 15)));
    }

    #[test]
    fn yearly_from_leap_day() {
        assert_eq!(Frequency::Yearly.advance(at(2024, 2, 29), 29), Some(at(2025, 2, 28)));
        assert_eq!(Frequency::Yearly.advance(at(2027, 2, 28), 29), Some(at(2028, 2, 29)));
    }

    #[test]
    fn daily_and_weekly() {
        assert_eq!(Frequency::Daily.advance(at(2024, 2, 28), 28), Some(at(2024, 2, 29)));
        assert_eq!(Frequency::Weekly.advance(at(2024, 12, 28), 28), Some(at(2025, 1, 4)));
    }

    #[test]
    fn days_in_month_handles_leap_years() {
        assert_eq!(days_in_month(2024, 2), 29);
        assert_eq!(days_in_month(1900, 2), 28);
        assert_eq!(days_in_month(2000, 2), 29);
        assert_eq!(days_in_month(2024, 12), 31);
    }

    #[test]
    fn first_bill_is_one_period_after_start() {
        let sub = Subscription::new("a@b.c", dec!(10), Network::Tron, Frequency::Monthly, at(2024, 1, 31));
        assert_eq!(sub.next_payment_date, at(2024, 2, 29));
        assert_eq!(sub.status, SubscriptionStatus::Active);
    }

    #[test]
    fn billing_id_is_stable_per_period() {
        let mut sub = Subscription::new("a@b.c", dec!(10), Network::Tron, Frequency::Weekly, at(2024, 1, 1));
        let first = sub.billing_transaction_id();
        assert_eq!(first, sub.billing_transaction_id());

        sub.next_payment_date = sub.following_payment_date().unwrap();
        assert_ne!(first, sub.billing_transaction_id());
    }

    #[test]
    fn ended_when_next_bill_passes_end_date() {
        let sub = Subscription::new("a@b.c", dec!(1), Network::Bitcoin, Frequency::Monthly, at(2024, 1, 1))
            .ends_at(at(2024, 1, 20));
        assert!(sub.has_ended());
    }
}
