//! Domain entities and their persisted representations.
//!
//! Status fields are stored as TEXT and decoded into the enums below at
//! decision points; rows keep the raw string so reads stay cheap.

use std::collections::HashMap;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use time::OffsetDateTime;
use uuid::Uuid;

/// Unit of isolation: one micro-application.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Tenant {
    pub id: Uuid,
    /// Globally unique external identifier; every other entity carries it.
    pub tenant_id: String,
    pub name: String,
    pub active: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// Sellable bundle of feature codes within a tenant.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Product {
    pub id: Uuid,
    pub tenant_id: String,
    pub name: String,
    pub feature_codes: Vec<String>,
    pub archived: bool,
}

/// Commercial term referencing a product. Immutable once referenced by a
/// subscription or purchase; new terms are new rows.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Price {
    pub id: Uuid,
    pub product_id: Uuid,
    pub provider_price_id: String,
    pub amount_cents: i64,
    pub currency: String,
    pub cadence: String,
    /// One-time purchase access window in days; NULL means lifetime.
    pub access_duration_days: Option<i32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cadence {
    Month,
    Year,
    OneTime,
}

impl Cadence {
    pub fn as_str(&self) -> &'static str {
        match self {
            Cadence::Month => "month",
            Cadence::Year => "year",
            Cadence::OneTime => "one_time",
        }
    }
}

impl FromStr for Cadence {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "month" => Ok(Cadence::Month),
            "year" => Ok(Cadence::Year),
            "one_time" => Ok(Cadence::OneTime),
            other => Err(format!("unknown cadence: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Trialing,
    Active,
    PastDue,
    Canceled,
    Unpaid,
    Incomplete,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Trialing => "trialing",
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::PastDue => "past_due",
            SubscriptionStatus::Canceled => "canceled",
            SubscriptionStatus::Unpaid => "unpaid",
            SubscriptionStatus::Incomplete => "incomplete",
        }
    }
}

impl FromStr for SubscriptionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "trialing" => Ok(SubscriptionStatus::Trialing),
            "active" => Ok(SubscriptionStatus::Active),
            "past_due" => Ok(SubscriptionStatus::PastDue),
            "canceled" => Ok(SubscriptionStatus::Canceled),
            "unpaid" => Ok(SubscriptionStatus::Unpaid),
            "incomplete" => Ok(SubscriptionStatus::Incomplete),
            other => Err(format!("unknown subscription status: {other}")),
        }
    }
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PurchaseStatus {
    Succeeded,
    Pending,
    Failed,
    Refunded,
}

impl PurchaseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PurchaseStatus::Succeeded => "succeeded",
            PurchaseStatus::Pending => "pending",
            PurchaseStatus::Failed => "failed",
            PurchaseStatus::Refunded => "refunded",
        }
    }
}

impl FromStr for PurchaseStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "succeeded" => Ok(PurchaseStatus::Succeeded),
            "pending" => Ok(PurchaseStatus::Pending),
            "failed" => Ok(PurchaseStatus::Failed),
            "refunded" => Ok(PurchaseStatus::Refunded),
            other => Err(format!("unknown purchase status: {other}")),
        }
    }
}

impl std::fmt::Display for PurchaseStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Recurring obligation mirrored from the provider.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Subscription {
    pub id: Uuid,
    pub tenant_id: String,
    pub user_id: String,
    pub provider_subscription_id: String,
    pub price_id: Uuid,
    pub status: String,
    #[serde(with = "time::serde::rfc3339")]
    pub current_period_start: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub current_period_end: OffsetDateTime,
    pub cancel_at_period_end: bool,
    #[serde(with = "time::serde::rfc3339::option")]
    pub canceled_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

/// One-time obligation mirrored from the provider.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Purchase {
    pub id: Uuid,
    pub tenant_id: String,
    pub user_id: String,
    pub provider_charge_id: String,
    pub price_id: Uuid,
    pub amount_cents: i64,
    pub currency: String,
    pub status: String,
    #[serde(with = "time::serde::rfc3339::option")]
    pub refunded_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub valid_from: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub valid_to: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// Operator override. Append-only; revocation is permanent.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct ManualGrant {
    pub id: Uuid,
    pub tenant_id: String,
    pub user_id: String,
    pub feature_code: String,
    #[serde(with = "time::serde::rfc3339")]
    pub valid_from: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub valid_to: Option<OffsetDateTime>,
    pub reason: String,
    pub granted_by: String,
    #[serde(with = "time::serde::rfc3339")]
    pub granted_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub revoked_at: Option<OffsetDateTime>,
    pub revoked_by: Option<String>,
    pub revoke_reason: Option<String>,
}

/// Which source produced an entitlement row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntitlementSource {
    Subscription,
    Purchase,
    Manual,
}

impl EntitlementSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntitlementSource::Subscription => "subscription",
            EntitlementSource::Purchase => "purchase",
            EntitlementSource::Manual => "manual",
        }
    }

    /// Tie-break precedence for the aggregated view: manual > purchase >
    /// subscription.
    pub fn precedence(&self) -> u8 {
        match self {
            EntitlementSource::Manual => 2,
            EntitlementSource::Purchase => 1,
            EntitlementSource::Subscription => 0,
        }
    }
}

impl FromStr for EntitlementSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "subscription" => Ok(EntitlementSource::Subscription),
            "purchase" => Ok(EntitlementSource::Purchase),
            "manual" => Ok(EntitlementSource::Manual),
            other => Err(format!("unknown entitlement source: {other}")),
        }
    }
}

impl std::fmt::Display for EntitlementSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Materialized entitlement row, one per (tenant, user, feature, source,
/// source_ref). Replaced wholesale on recomputation.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct EntitlementRow {
    pub id: Uuid,
    pub tenant_id: String,
    pub user_id: String,
    pub feature_code: String,
    pub source: String,
    pub source_ref: String,
    pub is_active: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub valid_from: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub valid_to: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub computed_at: OffsetDateTime,
}

/// Entitlement produced by the engine, ready for insertion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComputedEntitlement {
    pub feature_code: String,
    pub source: EntitlementSource,
    pub source_ref: String,
    pub valid_from: OffsetDateTime,
    pub valid_to: Option<OffsetDateTime>,
}

/// The per-feature view served to callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatedEntitlement {
    pub feature_code: String,
    pub is_active: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub valid_from: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub valid_to: Option<OffsetDateTime>,
    pub source: EntitlementSource,
}

/// Outcome recorded on a raw event row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventOutcome {
    Pending,
    Succeeded,
    FailedPermanent,
    FailedTransient,
}

impl EventOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventOutcome::Pending => "pending",
            EventOutcome::Succeeded => "succeeded",
            EventOutcome::FailedPermanent => "failed_permanent",
            EventOutcome::FailedTransient => "failed_transient",
        }
    }
}

/// Persisted provider notification, deduplicated by `provider_event_id`.
#[derive(Debug, Clone, FromRow)]
pub struct RawEvent {
    pub id: Uuid,
    pub provider_event_id: String,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub received_at: OffsetDateTime,
    pub processed_at: Option<OffsetDateTime>,
    pub processing_outcome: String,
    pub attempt_count: i32,
    pub last_error: Option<String>,
}

/// Convenience for reading provider metadata maps.
pub fn metadata_value<'a>(metadata: &'a HashMap<String, String>, key: &str) -> Option<&'a str> {
    metadata.get(key).map(String::as_str).filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_text() {
        for status in [
            SubscriptionStatus::Trialing,
            SubscriptionStatus::Active,
            SubscriptionStatus::PastDue,
            SubscriptionStatus::Canceled,
            SubscriptionStatus::Unpaid,
            SubscriptionStatus::Incomplete,
        ] {
            assert_eq!(status.as_str().parse::<SubscriptionStatus>(), Ok(status));
        }
    }

    #[test]
    fn source_precedence_orders_manual_first() {
        assert!(
            EntitlementSource::Manual.precedence() > EntitlementSource::Purchase.precedence()
        );
        assert!(
            EntitlementSource::Purchase.precedence()
                > EntitlementSource::Subscription.precedence()
        );
    }

    #[test]
    fn empty_metadata_values_read_as_absent() {
        let mut metadata = HashMap::new();
        metadata.insert("tenant_id".to_string(), String::new());
        assert_eq!(metadata_value(&metadata, "tenant_id"), None);
        assert_eq!(metadata_value(&metadata, "user_id"), None);

        metadata.insert("user_id".to_string(), "u_1".to_string());
        assert_eq!(metadata_value(&metadata, "user_id"), Some("u_1"));
    }
}
