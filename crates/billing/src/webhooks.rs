//! Provider webhook ingestion.
//!
//! Verifies the signature header, persists the raw event exactly once, and
//! drives the per-type processor. The signature scheme is a Unix timestamp
//! plus one or more HMAC-SHA-256 digests over `"{timestamp}.{body}"`; any
//! presented digest may match so the signing key can rotate.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use hmac::{Hmac, Mac};
use sha2::Sha256;
use sqlx::PgPool;
use subtle::ConstantTimeEq;
use time::{Duration, OffsetDateTime};

use crate::cache::EntitlementCache;
use crate::error::{BillingError, BillingResult};
use crate::models::EventOutcome;
use crate::processors::{process_event, Processed, ProcessorContext};
use crate::provider::{ProviderApi, ProviderEvent};
use crate::store::{self, EventClaim};

type HmacSha256 = Hmac<Sha256>;

/// Verification inputs for the webhook endpoint.
#[derive(Debug, Clone)]
pub struct WebhookConfig {
    pub signing_secret: String,
    /// Maximum allowed distance between the header timestamp and now.
    pub skew_tolerance: StdDuration,
}

/// Verify a `signature: t=<unix>,v1=<hex>[,v1=<hex>...]` header against the
/// raw body. Rejects missing/malformed headers, stale timestamps, and
/// digests that do not match under the secret.
pub fn verify_signature(
    secret: &str,
    header: &str,
    body: &[u8],
    now: OffsetDateTime,
    skew_tolerance: StdDuration,
) -> BillingResult<()> {
    let mut timestamp: Option<i64> = None;
    let mut digests: Vec<&str> = Vec::new();

    for part in header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", value)) => timestamp = value.parse().ok(),
            Some(("v1", value)) => digests.push(value),
            _ => {}
        }
    }

    let timestamp = timestamp.ok_or(BillingError::SignatureInvalid)?;
    if digests.is_empty() {
        return Err(BillingError::SignatureInvalid);
    }

    // Bound the replay window before touching the MAC.
    let skew = (now.unix_timestamp() - timestamp).abs();
    if skew > skew_tolerance.as_secs() as i64 {
        return Err(BillingError::StaleTimestamp);
    }

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| BillingError::SignatureInvalid)?;
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(body);
    let expected = mac.finalize().into_bytes();

    for digest in digests {
        let Ok(presented) = hex::decode(digest) else {
            continue;
        };
        if presented.len() == expected.len() && presented.ct_eq(&expected).into() {
            return Ok(());
        }
    }

    Err(BillingError::SignatureInvalid)
}

/// How the endpoint should answer the provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookDisposition {
    /// Processed now, state changed.
    Processed,
    /// No local effect (unknown type, unsupported mode, no-op invoice).
    Acknowledged,
    /// A previous delivery already finished; nothing to do.
    Duplicate,
    /// Recorded as permanently failed; acknowledged so retries stop.
    FailedPermanent,
}

/// Webhook entry point: verify, dedup, dispatch, record the outcome.
pub struct WebhookHandler {
    pool: PgPool,
    cache: EntitlementCache,
    provider: Arc<dyn ProviderApi>,
    config: WebhookConfig,
    past_due_grace: Duration,
}

impl WebhookHandler {
    pub fn new(
        pool: PgPool,
        cache: EntitlementCache,
        provider: Arc<dyn ProviderApi>,
        config: WebhookConfig,
        past_due_grace: Duration,
    ) -> Self {
        Self {
            pool,
            cache,
            provider,
            config,
            past_due_grace,
        }
    }

    /// Handle one delivery.
    ///
    /// Transient errors propagate as `Err` so the endpoint answers 503 and
    /// the provider retries; every other path resolves to a 200-class
    /// disposition.
    pub async fn handle(
        &self,
        body: &[u8],
        signature_header: &str,
    ) -> BillingResult<WebhookDisposition> {
        verify_signature(
            &self.config.signing_secret,
            signature_header,
            body,
            OffsetDateTime::now_utc(),
            self.config.skew_tolerance,
        )?;

        let event = ProviderEvent::from_body(body)?;
        let payload: serde_json::Value = serde_json::from_slice(body)
            .map_err(|e| BillingError::InvalidPayload(format!("payload: {e}")))?;

        let now = OffsetDateTime::now_utc();
        let mut conn = self.pool.acquire().await?;
        let claim =
            store::claim_event(&mut conn, &event.id, &event.event_type, &payload, now).await?;
        drop(conn);

        if let EventClaim::AlreadyProcessed { outcome } = claim {
            tracing::info!(
                event_id = %event.id,
                event_type = %event.event_type,
                outcome = %outcome,
                "Duplicate webhook delivery"
            );
            return Ok(WebhookDisposition::Duplicate);
        }

        tracing::info!(
            event_id = %event.id,
            event_type = %event.event_type,
            "Processing provider event"
        );

        let ctx = ProcessorContext {
            pool: &self.pool,
            provider: self.provider.as_ref(),
            past_due_grace: self.past_due_grace,
        };

        match process_event(&ctx, &event).await {
            Ok(Processed::Applied { tenant_id, user_id }) => {
                // Commit happened inside the processor; evicting afterwards
                // keeps readers from repopulating the cache with pre-commit
                // data. Outcome is marked last: a crash between commit and
                // here re-runs an idempotent processor.
                self.cache.invalidate(&tenant_id, &user_id).await;
                self.mark_outcome(&event.id, EventOutcome::Succeeded, None)
                    .await;
                Ok(WebhookDisposition::Processed)
            }
            Ok(Processed::Ignored(reason)) => {
                self.mark_outcome(&event.id, EventOutcome::Succeeded, Some(reason))
                    .await;
                Ok(WebhookDisposition::Acknowledged)
            }
            Err(e) if e.is_transient() => {
                tracing::warn!(
                    event_id = %event.id,
                    event_type = %event.event_type,
                    error = %e,
                    "Transient failure processing event; inviting retry"
                );
                self.mark_outcome(&event.id, EventOutcome::FailedTransient, Some(&e.to_string()))
                    .await;
                Err(e)
            }
            Err(e) => {
                tracing::error!(
                    event_id = %event.id,
                    event_type = %event.event_type,
                    error = %e,
                    "Permanent failure processing event; acknowledging to stop retries"
                );
                self.mark_outcome(&event.id, EventOutcome::FailedPermanent, Some(&e.to_string()))
                    .await;
                Ok(WebhookDisposition::FailedPermanent)
            }
        }
    }

    async fn mark_outcome(&self, event_id: &str, outcome: EventOutcome, error: Option<&str>) {
        let result = store::mark_event_outcome(
            &self.pool,
            event_id,
            outcome,
            error,
            OffsetDateTime::now_utc(),
        )
        .await;

        if let Err(e) = result {
            tracing::error!(
                event_id = %event_id,
                outcome = outcome.as_str(),
                error = %e,
                "Failed to record event outcome; row stays claimable"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "whsec_test_secret";
    const TOLERANCE: StdDuration = StdDuration::from_secs(300);

    fn now() -> OffsetDateTime {
        OffsetDateTime::from_unix_timestamp(1_700_000_000).unwrap()
    }

    fn sign(secret: &str, timestamp: i64, body: &[u8]) -> String {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(timestamp.to_string().as_bytes());
        mac.update(b".");
        mac.update(body);
        hex::encode(mac.finalize().into_bytes())
    }

    fn header(timestamp: i64, digest: &str) -> String {
        format!("t={timestamp},v1={digest}")
    }

    #[test]
    fn valid_signature_is_accepted() {
        let body = br#"{"type":"charge.refunded"}"#;
        let ts = now().unix_timestamp();
        let digest = sign(SECRET, ts, body);

        assert!(verify_signature(SECRET, &header(ts, &digest), body, now(), TOLERANCE).is_ok());
    }

    #[test]
    fn any_bit_flip_in_body_is_rejected() {
        let body = br#"{"type":"charge.refunded"}"#;
        let ts = now().unix_timestamp();
        let digest = sign(SECRET, ts, body);

        let mut tampered = body.to_vec();
        tampered[5] ^= 0x01;

        let result = verify_signature(SECRET, &header(ts, &digest), &tampered, now(), TOLERANCE);
        assert!(matches!(result, Err(BillingError::SignatureInvalid)));
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let body = b"{}";
        let ts = now().unix_timestamp();
        let digest = sign("other_secret", ts, body);

        let result = verify_signature(SECRET, &header(ts, &digest), body, now(), TOLERANCE);
        assert!(matches!(result, Err(BillingError::SignatureInvalid)));
    }

    #[test]
    fn stale_timestamp_is_rejected_even_with_valid_digest() {
        let body = b"{}";
        let ts = now().unix_timestamp() - 301;
        let digest = sign(SECRET, ts, body);

        let result = verify_signature(SECRET, &header(ts, &digest), body, now(), TOLERANCE);
        assert!(matches!(result, Err(BillingError::StaleTimestamp)));
    }

    #[test]
    fn future_timestamp_beyond_tolerance_is_rejected() {
        let body = b"{}";
        let ts = now().unix_timestamp() + 400;
        let digest = sign(SECRET, ts, body);

        let result = verify_signature(SECRET, &header(ts, &digest), body, now(), TOLERANCE);
        assert!(matches!(result, Err(BillingError::StaleTimestamp)));
    }

    #[test]
    fn rotation_accepts_any_matching_digest() {
        let body = b"{}";
        let ts = now().unix_timestamp();
        let stale = sign("retired_secret", ts, body);
        let current = sign(SECRET, ts, body);
        let header = format!("t={ts},v1={stale},v1={current}");

        assert!(verify_signature(SECRET, &header, body, now(), TOLERANCE).is_ok());
    }

    #[test]
    fn missing_timestamp_or_digest_is_malformed() {
        let body = b"{}";
        let ts = now().unix_timestamp();
        let digest = sign(SECRET, ts, body);

        for header in [
            format!("v1={digest}"),
            format!("t={ts}"),
            "garbage".to_string(),
            String::new(),
        ] {
            let result = verify_signature(SECRET, &header, body, now(), TOLERANCE);
            assert!(
                matches!(result, Err(BillingError::SignatureInvalid)),
                "header {header:?} should be rejected"
            );
        }
    }

    #[test]
    fn non_hex_digest_is_rejected_without_panicking() {
        let body = b"{}";
        let ts = now().unix_timestamp();
        let header = format!("t={ts},v1=zzzz-not-hex");

        let result = verify_signature(SECRET, &header, body, now(), TOLERANCE);
        assert!(matches!(result, Err(BillingError::SignatureInvalid)));
    }
}
