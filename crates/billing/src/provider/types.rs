//! Serde types for provider webhook payloads and API responses.
//!
//! The provider's objects arrive as JSON; unknown fields are ignored so new
//! provider attributes never break parsing. Timestamps are Unix epoch
//! seconds, converted at the edge.

use std::collections::HashMap;

use serde::Deserialize;
use time::OffsetDateTime;

use crate::error::{BillingError, BillingResult};

/// Envelope for a provider notification.
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    /// Unix timestamp at which the provider created the event.
    pub created: i64,
    pub data: EventData,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventData {
    pub object: serde_json::Value,
}

impl ProviderEvent {
    /// Parse the raw webhook body into an event envelope.
    pub fn from_body(body: &[u8]) -> BillingResult<Self> {
        serde_json::from_slice(body)
            .map_err(|e| BillingError::InvalidPayload(format!("event envelope: {e}")))
    }

    /// Decode `data.object` into a concrete payload type.
    pub fn object<T: serde::de::DeserializeOwned>(&self) -> BillingResult<T> {
        serde_json::from_value(self.data.object.clone())
            .map_err(|e| BillingError::InvalidPayload(format!("event object: {e}")))
    }

    /// Event creation time, clamped into `OffsetDateTime`.
    pub fn created_at(&self) -> BillingResult<OffsetDateTime> {
        OffsetDateTime::from_unix_timestamp(self.created)
            .map_err(|e| BillingError::InvalidPayload(format!("event created: {e}")))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckoutMode {
    Subscription,
    Payment,
    #[serde(other)]
    Other,
}

/// Hosted checkout session. The external checkout component stamps
/// `tenant_id` into the session metadata.
#[derive(Debug, Clone, Deserialize)]
pub struct CheckoutSession {
    pub id: String,
    pub mode: CheckoutMode,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    /// Provider subscription id for `mode=subscription` sessions.
    pub subscription: Option<String>,
    /// Provider payment intent id for `mode=payment` sessions.
    pub payment_intent: Option<String>,
}

/// Provider-side subscription object, from webhook payloads and the API.
/// The checkout component stamps `user_id` into its metadata.
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderSubscription {
    pub id: String,
    pub status: String,
    pub current_period_start: i64,
    pub current_period_end: i64,
    #[serde(default)]
    pub cancel_at_period_end: bool,
    pub canceled_at: Option<i64>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    #[serde(default)]
    pub items: SubscriptionItems,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SubscriptionItems {
    #[serde(default)]
    pub data: Vec<SubscriptionItem>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubscriptionItem {
    pub price: PriceRef,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PriceRef {
    pub id: String,
}

impl ProviderSubscription {
    /// Provider price id of the first subscription item.
    pub fn price_id(&self) -> Option<&str> {
        self.items.data.first().map(|item| item.price.id.as_str())
    }

    pub fn period_start(&self) -> BillingResult<OffsetDateTime> {
        from_unix(self.current_period_start, "current_period_start")
    }

    pub fn period_end(&self) -> BillingResult<OffsetDateTime> {
        from_unix(self.current_period_end, "current_period_end")
    }

    pub fn canceled_at_time(&self) -> Option<OffsetDateTime> {
        self.canceled_at
            .and_then(|ts| OffsetDateTime::from_unix_timestamp(ts).ok())
    }
}

/// Payment intent backing a one-time checkout.
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderPaymentIntent {
    pub id: String,
    pub status: String,
    pub amount: i64,
    pub currency: String,
    pub latest_charge: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

/// Charge object, from `charge.refunded` payloads and the reconciler's
/// listing API.
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderCharge {
    pub id: String,
    pub status: String,
    pub amount: i64,
    pub currency: String,
    #[serde(default)]
    pub refunded: bool,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

/// Invoice object from `invoice.payment_succeeded` payloads.
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderInvoice {
    pub id: String,
    pub subscription: Option<String>,
    pub period_start: i64,
    pub period_end: i64,
}

impl ProviderInvoice {
    pub fn period_start(&self) -> BillingResult<OffsetDateTime> {
        from_unix(self.period_start, "period_start")
    }

    pub fn period_end(&self) -> BillingResult<OffsetDateTime> {
        from_unix(self.period_end, "period_end")
    }
}

/// Checkout session line item; carries the purchased price.
#[derive(Debug, Clone, Deserialize)]
pub struct LineItem {
    pub price: PriceRef,
}

fn from_unix(ts: i64, field: &str) -> BillingResult<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp(ts)
        .map_err(|e| BillingError::InvalidPayload(format!("{field}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_envelope_parses_and_ignores_unknown_fields() {
        let body = br#"{
            "id": "evt_1",
            "type": "customer.subscription.updated",
            "created": 1700000000,
            "livemode": false,
            "data": {"object": {"id": "sub_1", "status": "active",
                     "current_period_start": 1700000000,
                     "current_period_end": 1702592000}}
        }"#;

        let event = ProviderEvent::from_body(body).unwrap();
        assert_eq!(event.event_type, "customer.subscription.updated");

        let sub: ProviderSubscription = event.object().unwrap();
        assert_eq!(sub.id, "sub_1");
        assert!(!sub.cancel_at_period_end);
        assert!(sub.price_id().is_none());
    }

    #[test]
    fn malformed_body_is_invalid_payload() {
        let err = ProviderEvent::from_body(b"not json").unwrap_err();
        assert!(matches!(err, BillingError::InvalidPayload(_)));
    }

    #[test]
    fn checkout_mode_tolerates_unknown_values() {
        let session: CheckoutSession = serde_json::from_value(serde_json::json!({
            "id": "cs_1",
            "mode": "setup",
            "metadata": {"tenant_id": "t_1"}
        }))
        .unwrap();
        assert_eq!(session.mode, CheckoutMode::Other);
    }

    #[test]
    fn subscription_price_id_reads_first_item() {
        let sub: ProviderSubscription = serde_json::from_value(serde_json::json!({
            "id": "sub_2",
            "status": "trialing",
            "current_period_start": 1700000000,
            "current_period_end": 1702592000,
            "metadata": {"user_id": "u_9"},
            "items": {"data": [{"price": {"id": "price_M"}}]}
        }))
        .unwrap();
        assert_eq!(sub.price_id(), Some("price_M"));
        assert_eq!(sub.metadata.get("user_id").map(String::as_str), Some("u_9"));
    }
}
