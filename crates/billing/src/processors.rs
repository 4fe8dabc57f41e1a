//! Per-event-type processors.
//!
//! Each processor runs inside a single database transaction: it locks the
//! subscription or purchase row it mutates, applies the state transition,
//! recomputes entitlements for the affected (tenant, user) pair under the
//! pair's advisory lock, and commits. Cache eviction belongs to the caller
//! and happens strictly after the commit.
//!
//! Tenant and user association comes only from the metadata the checkout
//! component stamps onto provider objects (tenant id on the session, user id
//! on the subscription / payment intent). Missing metadata is a permanent
//! failure; processors never guess.

use sqlx::PgPool;
use time::{Duration, OffsetDateTime};

use crate::error::{BillingError, BillingResult};
use crate::models::{metadata_value, Cadence, PurchaseStatus, SubscriptionStatus};
use crate::provider::types::{
    CheckoutMode, CheckoutSession, ProviderCharge, ProviderEvent, ProviderInvoice,
    ProviderSubscription,
};
use crate::provider::ProviderApi;
use crate::store::{self, PriceWithFeatures, PurchaseChange, SubscriptionChange};
use crate::{entitlements, store::find_price_by_provider_id};

/// Dependencies shared by all processors.
pub struct ProcessorContext<'a> {
    pub pool: &'a PgPool,
    pub provider: &'a dyn ProviderApi,
    pub past_due_grace: Duration,
}

/// Result of applying one event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Processed {
    /// State changed; the caller must evict the cache entry for this pair.
    Applied { tenant_id: String, user_id: String },
    /// Acknowledged with no local effect.
    Ignored(&'static str),
}

/// Dispatch an event to the processor for its type.
///
/// The registry is a static match: unknown types are acknowledged without
/// effect (the raw event row is already persisted by the ingestor).
pub async fn process_event(
    ctx: &ProcessorContext<'_>,
    event: &ProviderEvent,
) -> BillingResult<Processed> {
    match event.event_type.as_str() {
        "checkout.session.completed" => checkout_session_completed(ctx, event).await,
        "invoice.payment_succeeded" => invoice_payment_succeeded(ctx, event).await,
        "customer.subscription.updated" => subscription_updated(ctx, event).await,
        "customer.subscription.deleted" => subscription_deleted(ctx, event).await,
        "charge.refunded" => charge_refunded(ctx, event).await,
        other => {
            tracing::info!(
                event_id = %event.id,
                event_type = %other,
                "No processor for event type; acknowledging"
            );
            Ok(Processed::Ignored("unhandled event type"))
        }
    }
}

async fn checkout_session_completed(
    ctx: &ProcessorContext<'_>,
    event: &ProviderEvent,
) -> BillingResult<Processed> {
    let session: CheckoutSession = event.object()?;
    let tenant_id = metadata_value(&session.metadata, "tenant_id")
        .ok_or_else(|| BillingError::MetadataMissing("tenant_id on checkout session".into()))?
        .to_string();

    match session.mode {
        CheckoutMode::Subscription => {
            checkout_subscription(ctx, event, &session, &tenant_id).await
        }
        CheckoutMode::Payment => checkout_payment(ctx, event, &session, &tenant_id).await,
        CheckoutMode::Other => {
            tracing::warn!(
                event_id = %event.id,
                session_id = %session.id,
                "Checkout session with unsupported mode; acknowledging"
            );
            Ok(Processed::Ignored("unsupported checkout mode"))
        }
    }
}

async fn checkout_subscription(
    ctx: &ProcessorContext<'_>,
    event: &ProviderEvent,
    session: &CheckoutSession,
    tenant_id: &str,
) -> BillingResult<Processed> {
    let subscription_id = session.subscription.as_deref().ok_or_else(|| {
        BillingError::InvalidPayload("subscription checkout without subscription id".into())
    })?;

    let remote = ctx.provider.get_subscription(subscription_id).await?;
    let user_id = metadata_value(&remote.metadata, "user_id")
        .ok_or_else(|| BillingError::MetadataMissing("user_id on subscription".into()))?
        .to_string();
    let provider_price_id = remote
        .price_id()
        .ok_or_else(|| BillingError::InvalidPayload("subscription has no items".into()))?;
    let status = parse_subscription_status(&remote.status)?;

    let now = OffsetDateTime::now_utc();
    let mut tx = ctx.pool.begin().await?;

    let price = resolve_price(&mut tx, provider_price_id, tenant_id).await?;
    ensure_cadence(&price, CadenceClass::Recurring)?;

    let change = SubscriptionChange {
        tenant_id: tenant_id.to_string(),
        user_id: user_id.clone(),
        provider_subscription_id: remote.id.clone(),
        price_id: price.price.id,
        status: status.as_str().to_string(),
        current_period_start: remote.period_start()?,
        current_period_end: remote.period_end()?,
        cancel_at_period_end: remote.cancel_at_period_end,
        canceled_at: remote.canceled_at_time(),
    };
    store::upsert_subscription(&mut tx, &change, now).await?;

    entitlements::recompute_and_store(&mut tx, tenant_id, &user_id, now, ctx.past_due_grace)
        .await?;
    tx.commit().await?;

    tracing::info!(
        event_id = %event.id,
        tenant_id = %tenant_id,
        user_id = %user_id,
        provider_subscription_id = %remote.id,
        status = %status,
        "Mirrored subscription from checkout"
    );

    Ok(Processed::Applied {
        tenant_id: tenant_id.to_string(),
        user_id,
    })
}

async fn checkout_payment(
    ctx: &ProcessorContext<'_>,
    event: &ProviderEvent,
    session: &CheckoutSession,
    tenant_id: &str,
) -> BillingResult<Processed> {
    let payment_intent_id = session.payment_intent.as_deref().ok_or_else(|| {
        BillingError::InvalidPayload("payment checkout without payment intent".into())
    })?;

    let intent = ctx.provider.get_payment_intent(payment_intent_id).await?;
    let user_id = metadata_value(&intent.metadata, "user_id")
        .ok_or_else(|| BillingError::MetadataMissing("user_id on payment intent".into()))?
        .to_string();
    let charge_id = intent
        .latest_charge
        .as_deref()
        .ok_or_else(|| BillingError::InvalidPayload("payment intent has no charge".into()))?;

    let line_items = ctx.provider.get_checkout_line_items(&session.id).await?;
    let provider_price_id = line_items
        .first()
        .map(|item| item.price.id.as_str())
        .ok_or_else(|| BillingError::InvalidPayload("checkout session has no line items".into()))?;

    let status = if intent.status == "succeeded" {
        PurchaseStatus::Succeeded
    } else {
        PurchaseStatus::Pending
    };

    let now = OffsetDateTime::now_utc();
    let mut tx = ctx.pool.begin().await?;

    let price = resolve_price(&mut tx, provider_price_id, tenant_id).await?;
    ensure_cadence(&price, CadenceClass::OneTime)?;
    let valid_to = purchase_valid_to(now, price.price.access_duration_days);

    let change = PurchaseChange {
        tenant_id: tenant_id.to_string(),
        user_id: user_id.clone(),
        provider_charge_id: charge_id.to_string(),
        price_id: price.price.id,
        amount_cents: intent.amount,
        currency: intent.currency.clone(),
        status: status.as_str().to_string(),
        valid_from: now,
        valid_to,
    };

    if store::insert_purchase_if_absent(&mut tx, &change, now)
        .await?
        .is_none()
    {
        tracing::info!(
            event_id = %event.id,
            provider_charge_id = %charge_id,
            "Purchase already mirrored; recomputing only"
        );
    }

    entitlements::recompute_and_store(&mut tx, tenant_id, &user_id, now, ctx.past_due_grace)
        .await?;
    tx.commit().await?;

    tracing::info!(
        event_id = %event.id,
        tenant_id = %tenant_id,
        user_id = %user_id,
        provider_charge_id = %charge_id,
        status = %status,
        "Mirrored one-time purchase from checkout"
    );

    Ok(Processed::Applied {
        tenant_id: tenant_id.to_string(),
        user_id,
    })
}

async fn invoice_payment_succeeded(
    ctx: &ProcessorContext<'_>,
    event: &ProviderEvent,
) -> BillingResult<Processed> {
    let invoice: ProviderInvoice = event.object()?;
    let Some(subscription_id) = invoice.subscription.as_deref() else {
        tracing::info!(event_id = %event.id, "Invoice without subscription; acknowledging");
        return Ok(Processed::Ignored("invoice without subscription"));
    };

    let now = OffsetDateTime::now_utc();
    let mut tx = ctx.pool.begin().await?;

    let local = store::lock_subscription(&mut tx, subscription_id)
        .await?
        .ok_or_else(|| {
            BillingError::NotFound(format!("subscription {subscription_id} not mirrored"))
        })?;

    let status = renewal_status(local.status.parse().map_err(BillingError::InvalidPayload)?);
    store::update_subscription_state(
        &mut tx,
        subscription_id,
        status.as_str(),
        invoice.period_start()?,
        invoice.period_end()?,
        local.cancel_at_period_end,
        local.canceled_at,
        now,
    )
    .await?;

    entitlements::recompute_and_store(
        &mut tx,
        &local.tenant_id,
        &local.user_id,
        now,
        ctx.past_due_grace,
    )
    .await?;
    tx.commit().await?;

    tracing::info!(
        event_id = %event.id,
        tenant_id = %local.tenant_id,
        provider_subscription_id = %subscription_id,
        status = %status,
        "Advanced subscription period from paid invoice"
    );

    Ok(Processed::Applied {
        tenant_id: local.tenant_id,
        user_id: local.user_id,
    })
}

async fn subscription_updated(
    ctx: &ProcessorContext<'_>,
    event: &ProviderEvent,
) -> BillingResult<Processed> {
    let remote: ProviderSubscription = event.object()?;
    let status = parse_subscription_status(&remote.status)?;

    let now = OffsetDateTime::now_utc();
    let mut tx = ctx.pool.begin().await?;

    let local = store::lock_subscription(&mut tx, &remote.id)
        .await?
        .ok_or_else(|| BillingError::NotFound(format!("subscription {} not mirrored", remote.id)))?;

    store::update_subscription_state(
        &mut tx,
        &remote.id,
        status.as_str(),
        remote.period_start()?,
        remote.period_end()?,
        remote.cancel_at_period_end,
        remote.canceled_at_time(),
        now,
    )
    .await?;

    entitlements::recompute_and_store(
        &mut tx,
        &local.tenant_id,
        &local.user_id,
        now,
        ctx.past_due_grace,
    )
    .await?;
    tx.commit().await?;

    tracing::info!(
        event_id = %event.id,
        tenant_id = %local.tenant_id,
        provider_subscription_id = %remote.id,
        status = %status,
        cancel_at_period_end = remote.cancel_at_period_end,
        "Updated subscription from provider"
    );

    Ok(Processed::Applied {
        tenant_id: local.tenant_id,
        user_id: local.user_id,
    })
}

async fn subscription_deleted(
    ctx: &ProcessorContext<'_>,
    event: &ProviderEvent,
) -> BillingResult<Processed> {
    let remote: ProviderSubscription = event.object()?;
    let canceled_at = event.created_at()?;

    let now = OffsetDateTime::now_utc();
    let mut tx = ctx.pool.begin().await?;

    let local = store::lock_subscription(&mut tx, &remote.id)
        .await?
        .ok_or_else(|| BillingError::NotFound(format!("subscription {} not mirrored", remote.id)))?;

    store::update_subscription_state(
        &mut tx,
        &remote.id,
        SubscriptionStatus::Canceled.as_str(),
        local.current_period_start,
        local.current_period_end,
        false,
        Some(canceled_at),
        now,
    )
    .await?;

    entitlements::recompute_and_store(
        &mut tx,
        &local.tenant_id,
        &local.user_id,
        now,
        ctx.past_due_grace,
    )
    .await?;
    tx.commit().await?;

    tracing::info!(
        event_id = %event.id,
        tenant_id = %local.tenant_id,
        provider_subscription_id = %remote.id,
        "Marked subscription canceled"
    );

    Ok(Processed::Applied {
        tenant_id: local.tenant_id,
        user_id: local.user_id,
    })
}

async fn charge_refunded(
    ctx: &ProcessorContext<'_>,
    event: &ProviderEvent,
) -> BillingResult<Processed> {
    let charge: ProviderCharge = event.object()?;
    let refunded_at = event.created_at()?;

    let now = OffsetDateTime::now_utc();
    let mut tx = ctx.pool.begin().await?;

    let local = store::lock_purchase(&mut tx, &charge.id)
        .await?
        .ok_or_else(|| BillingError::NotFound(format!("purchase {} not mirrored", charge.id)))?;

    store::mark_purchase_refunded(&mut tx, &charge.id, refunded_at).await?;

    entitlements::recompute_and_store(
        &mut tx,
        &local.tenant_id,
        &local.user_id,
        now,
        ctx.past_due_grace,
    )
    .await?;
    tx.commit().await?;

    tracing::info!(
        event_id = %event.id,
        tenant_id = %local.tenant_id,
        provider_charge_id = %charge.id,
        "Marked purchase refunded"
    );

    Ok(Processed::Applied {
        tenant_id: local.tenant_id,
        user_id: local.user_id,
    })
}

/// Resolve a provider price to the local row and enforce tenant ownership.
async fn resolve_price(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    provider_price_id: &str,
    tenant_id: &str,
) -> BillingResult<PriceWithFeatures> {
    let price = find_price_by_provider_id(&mut **tx, provider_price_id)
        .await?
        .ok_or_else(|| {
            BillingError::Validation(format!("unknown provider price {provider_price_id}"))
        })?;

    if price.tenant_id != tenant_id {
        return Err(BillingError::Validation(format!(
            "price {provider_price_id} does not belong to tenant {tenant_id}"
        )));
    }

    Ok(price)
}

fn parse_subscription_status(raw: &str) -> BillingResult<SubscriptionStatus> {
    raw.parse().map_err(BillingError::InvalidPayload)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CadenceClass {
    Recurring,
    OneTime,
}

/// A subscription checkout must reference a recurring price and a payment
/// checkout a one-time price; a mismatch is a catalog error, not retryable.
fn ensure_cadence(price: &PriceWithFeatures, expected: CadenceClass) -> BillingResult<()> {
    let cadence: Cadence = price
        .price
        .cadence
        .parse()
        .map_err(BillingError::InvalidPayload)?;

    let class = match cadence {
        Cadence::Month | Cadence::Year => CadenceClass::Recurring,
        Cadence::OneTime => CadenceClass::OneTime,
    };

    if class != expected {
        return Err(BillingError::Validation(format!(
            "price {} has cadence {}, unusable for this checkout mode",
            price.price.provider_price_id,
            cadence.as_str()
        )));
    }

    Ok(())
}

/// A paid invoice reactivates a subscription that was trialing or past_due;
/// other states are left as the provider reported them.
fn renewal_status(current: SubscriptionStatus) -> SubscriptionStatus {
    match current {
        SubscriptionStatus::PastDue | SubscriptionStatus::Trialing => SubscriptionStatus::Active,
        other => other,
    }
}

/// Purchase validity window end, derived from the price's configured access
/// duration. NULL duration means lifetime access.
fn purchase_valid_to(
    now: OffsetDateTime,
    access_duration_days: Option<i32>,
) -> Option<OffsetDateTime> {
    access_duration_days.map(|days| now + Duration::days(i64::from(days)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renewal_reactivates_past_due_and_trialing_only() {
        assert_eq!(
            renewal_status(SubscriptionStatus::PastDue),
            SubscriptionStatus::Active
        );
        assert_eq!(
            renewal_status(SubscriptionStatus::Trialing),
            SubscriptionStatus::Active
        );
        assert_eq!(
            renewal_status(SubscriptionStatus::Canceled),
            SubscriptionStatus::Canceled
        );
        assert_eq!(
            renewal_status(SubscriptionStatus::Active),
            SubscriptionStatus::Active
        );
    }

    #[test]
    fn purchase_window_is_lifetime_without_duration() {
        let now = OffsetDateTime::from_unix_timestamp(1_700_000_000).unwrap();
        assert_eq!(purchase_valid_to(now, None), None);
        assert_eq!(
            purchase_valid_to(now, Some(30)),
            Some(now + Duration::days(30))
        );
    }

    #[test]
    fn cadence_must_match_checkout_mode() {
        use crate::models::Price;
        use uuid::Uuid;

        let price = |cadence: &str| PriceWithFeatures {
            price: Price {
                id: Uuid::new_v4(),
                product_id: Uuid::new_v4(),
                provider_price_id: "price_M".into(),
                amount_cents: 999,
                currency: "usd".into(),
                cadence: cadence.into(),
                access_duration_days: None,
            },
            feature_codes: vec!["pro".into()],
            tenant_id: "t_1".into(),
        };

        assert!(ensure_cadence(&price("month"), CadenceClass::Recurring).is_ok());
        assert!(ensure_cadence(&price("year"), CadenceClass::Recurring).is_ok());
        assert!(ensure_cadence(&price("one_time"), CadenceClass::OneTime).is_ok());

        assert!(matches!(
            ensure_cadence(&price("one_time"), CadenceClass::Recurring),
            Err(BillingError::Validation(_))
        ));
        assert!(matches!(
            ensure_cadence(&price("month"), CadenceClass::OneTime),
            Err(BillingError::Validation(_))
        ));
        assert!(matches!(
            ensure_cadence(&price("weekly"), CadenceClass::Recurring),
            Err(BillingError::InvalidPayload(_))
        ));
    }

    #[test]
    fn unknown_subscription_status_is_a_permanent_failure() {
        let err = parse_subscription_status("paused").unwrap_err();
        assert!(matches!(err, BillingError::InvalidPayload(_)));
        assert!(!err.is_transient());
    }
}
