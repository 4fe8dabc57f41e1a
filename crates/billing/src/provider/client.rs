//! HTTP client for the provider's REST API.
//!
//! Used by the checkout processors (object fetches) and the reconciler
//! (listings). The provider remains the system of record for money movement;
//! this client only reads.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use time::OffsetDateTime;

use crate::error::{BillingError, BillingResult};
use crate::provider::types::{
    LineItem, ProviderCharge, ProviderPaymentIntent, ProviderSubscription,
};

/// Read access to provider-side objects. Implemented by the HTTP client in
/// production and by in-memory fakes in tests.
#[async_trait]
pub trait ProviderApi: Send + Sync {
    async fn get_subscription(&self, id: &str) -> BillingResult<ProviderSubscription>;

    async fn get_payment_intent(&self, id: &str) -> BillingResult<ProviderPaymentIntent>;

    async fn get_checkout_line_items(&self, session_id: &str) -> BillingResult<Vec<LineItem>>;

    /// Subscriptions for a tenant modified at or after `updated_since`.
    async fn list_subscriptions(
        &self,
        tenant_id: &str,
        updated_since: OffsetDateTime,
    ) -> BillingResult<Vec<ProviderSubscription>>;

    /// Charges for a tenant modified at or after `updated_since`.
    async fn list_charges(
        &self,
        tenant_id: &str,
        updated_since: OffsetDateTime,
    ) -> BillingResult<Vec<ProviderCharge>>;
}

/// List responses wrap their items in a `data` array.
#[derive(Debug, Deserialize)]
struct ListEnvelope<T> {
    data: Vec<T>,
}

#[derive(Clone)]
pub struct HttpProviderClient {
    http: reqwest::Client,
    base_url: String,
    secret_key: String,
}

impl HttpProviderClient {
    pub fn new(base_url: &str, secret_key: &str) -> BillingResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| BillingError::Internal(format!("http client: {e}")))?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            secret_key: secret_key.to_string(),
        })
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> BillingResult<T> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .http
            .get(&url)
            .bearer_auth(&self.secret_key)
            .query(query)
            .send()
            .await
            .map_err(|e| BillingError::ProviderApi(format!("GET {path}: {e}")))?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(BillingError::ProviderNotFound(path.to_string()));
        }
        if !status.is_success() {
            return Err(BillingError::ProviderApi(format!(
                "GET {path}: status {status}"
            )));
        }

        response
            .json::<T>()
            .await
            .map_err(|e| BillingError::ProviderApi(format!("GET {path}: decode: {e}")))
    }
}

#[async_trait]
impl ProviderApi for HttpProviderClient {
    async fn get_subscription(&self, id: &str) -> BillingResult<ProviderSubscription> {
        self.get_json(&format!("/v1/subscriptions/{id}"), &[]).await
    }

    async fn get_payment_intent(&self, id: &str) -> BillingResult<ProviderPaymentIntent> {
        self.get_json(&format!("/v1/payment_intents/{id}"), &[]).await
    }

    async fn get_checkout_line_items(&self, session_id: &str) -> BillingResult<Vec<LineItem>> {
        let envelope: ListEnvelope<LineItem> = self
            .get_json(&format!("/v1/checkout/sessions/{session_id}/line_items"), &[])
            .await?;
        Ok(envelope.data)
    }

    async fn list_subscriptions(
        &self,
        tenant_id: &str,
        updated_since: OffsetDateTime,
    ) -> BillingResult<Vec<ProviderSubscription>> {
        let envelope: ListEnvelope<ProviderSubscription> = self
            .get_json(
                "/v1/subscriptions",
                &[
                    ("tenant_id", tenant_id.to_string()),
                    ("updated_since", updated_since.unix_timestamp().to_string()),
                ],
            )
            .await?;
        Ok(envelope.data)
    }

    async fn list_charges(
        &self,
        tenant_id: &str,
        updated_since: OffsetDateTime,
    ) -> BillingResult<Vec<ProviderCharge>> {
        let envelope: ListEnvelope<ProviderCharge> = self
            .get_json(
                "/v1/charges",
                &[
                    ("tenant_id", tenant_id.to_string()),
                    ("updated_since", updated_since.unix_timestamp().to_string()),
                ],
            )
            .await?;
        Ok(envelope.data)
    }
}
