//! Scheduled drift detection and repair against the provider.
//!
//! For each tenant the reconciler lists provider-side subscriptions and
//! charges modified inside the lookback window, inserts missing local
//! mirrors, overwrites drifted ones, and pushes every touched pair through
//! the same recompute + evict path the webhook processors use. One bad
//! record or tenant never aborts the run; errors are counted and surfaced in
//! the summary.

use std::sync::Arc;

use serde::Serialize;
use sqlx::PgPool;
use time::{Duration, OffsetDateTime};

use crate::cache::EntitlementCache;
use crate::entitlements;
use crate::error::BillingResult;
use crate::models::{metadata_value, PurchaseStatus, Tenant};
use crate::provider::types::{ProviderCharge, ProviderSubscription};
use crate::provider::ProviderApi;
use crate::store::{self, PurchaseChange, SubscriptionChange};

/// Name of the leader lease row shared by all replicas.
pub const LEASE_NAME: &str = "reconciliation";

/// Per-tenant counters for one run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TenantReconciliation {
    pub tenant_id: String,
    pub subscriptions_checked: usize,
    pub purchases_checked: usize,
    pub drift_detected: usize,
    pub corrected: usize,
    pub errors: Vec<String>,
}

/// Result of one reconciliation pass.
#[derive(Debug, Clone, Serialize)]
pub struct ReconciliationSummary {
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub finished_at: OffsetDateTime,
    pub lookback_days: i64,
    pub tenants: Vec<TenantReconciliation>,
}

impl ReconciliationSummary {
    pub fn total_drift(&self) -> usize {
        self.tenants.iter().map(|t| t.drift_detected).sum()
    }

    pub fn total_errors(&self) -> usize {
        self.tenants.iter().map(|t| t.errors.len()).sum()
    }
}

pub struct Reconciler {
    pool: PgPool,
    provider: Arc<dyn ProviderApi>,
    cache: EntitlementCache,
    past_due_grace: Duration,
    lookback_days: i64,
}

impl Reconciler {
    pub fn new(
        pool: PgPool,
        provider: Arc<dyn ProviderApi>,
        cache: EntitlementCache,
        past_due_grace: Duration,
        lookback_days: i64,
    ) -> Self {
        Self {
            pool,
            provider,
            cache,
            past_due_grace,
            lookback_days,
        }
    }

    /// Run one full pass over all active tenants.
    pub async fn run(&self) -> BillingResult<ReconciliationSummary> {
        let started_at = OffsetDateTime::now_utc();
        let since = started_at - Duration::days(self.lookback_days);
        let tenants = store::list_active_tenants(&self.pool).await?;

        let mut results = Vec::with_capacity(tenants.len());
        for tenant in tenants {
            let result = self.reconcile_tenant(&tenant, since).await;
            tracing::info!(
                tenant_id = %result.tenant_id,
                subscriptions_checked = result.subscriptions_checked,
                purchases_checked = result.purchases_checked,
                drift_detected = result.drift_detected,
                corrected = result.corrected,
                errors = result.errors.len(),
                "Tenant reconciliation complete"
            );
            results.push(result);
        }

        let summary = ReconciliationSummary {
            started_at,
            finished_at: OffsetDateTime::now_utc(),
            lookback_days: self.lookback_days,
            tenants: results,
        };

        tracing::info!(
            tenants = summary.tenants.len(),
            drift_detected = summary.total_drift(),
            errors = summary.total_errors(),
            "Reconciliation run complete"
        );

        Ok(summary)
    }

    async fn reconcile_tenant(
        &self,
        tenant: &Tenant,
        since: OffsetDateTime,
    ) -> TenantReconciliation {
        let mut result = TenantReconciliation {
            tenant_id: tenant.tenant_id.clone(),
            ..Default::default()
        };

        match self.provider.list_subscriptions(&tenant.tenant_id, since).await {
            Ok(remote_subscriptions) => {
                for remote in remote_subscriptions {
                    result.subscriptions_checked += 1;
                    if let Err(e) = self.reconcile_subscription(tenant, &remote, &mut result).await
                    {
                        result
                            .errors
                            .push(format!("subscription {}: {e}", remote.id));
                    }
                }
            }
            Err(e) => {
                result.errors.push(format!("list subscriptions: {e}"));
            }
        }

        match self.provider.list_charges(&tenant.tenant_id, since).await {
            Ok(remote_charges) => {
                for remote in remote_charges {
                    result.purchases_checked += 1;
                    if let Err(e) = self.reconcile_charge(tenant, &remote, &mut result).await {
                        result.errors.push(format!("charge {}: {e}", remote.id));
                    }
                }
            }
            Err(e) => {
                result.errors.push(format!("list charges: {e}"));
            }
        }

        result
    }

    async fn reconcile_subscription(
        &self,
        tenant: &Tenant,
        remote: &ProviderSubscription,
        result: &mut TenantReconciliation,
    ) -> BillingResult<()> {
        let remote_start = remote.period_start()?;
        let remote_end = remote.period_end()?;
        let remote_canceled_at = remote.canceled_at_time();

        let local = store::find_subscription(&self.pool, &remote.id).await?;

        let (tenant_id, user_id) = match &local {
            Some(local) => {
                if !subscription_drifted(local.status.as_str(), &local_window(local), remote) {
                    return Ok(());
                }
                (local.tenant_id.clone(), local.user_id.clone())
            }
            None => {
                // Not mirrored yet: bind through metadata, same rules as the
                // processors (never guess).
                let user_id = match metadata_value(&remote.metadata, "user_id") {
                    Some(user_id) => user_id.to_string(),
                    None => {
                        result
                            .errors
                            .push(format!("subscription {}: no user_id metadata", remote.id));
                        return Ok(());
                    }
                };
                (tenant.tenant_id.clone(), user_id)
            }
        };

        result.drift_detected += 1;
        let now = OffsetDateTime::now_utc();
        let mut tx = self.pool.begin().await?;

        if local.is_some() {
            store::update_subscription_state(
                &mut tx,
                &remote.id,
                &remote.status,
                remote_start,
                remote_end,
                remote.cancel_at_period_end,
                remote_canceled_at,
                now,
            )
            .await?;
        } else {
            let provider_price_id = remote.price_id().ok_or_else(|| {
                crate::error::BillingError::InvalidPayload(format!(
                    "subscription {} has no items",
                    remote.id
                ))
            })?;
            let price = store::find_price_by_provider_id(&mut *tx, provider_price_id)
                .await?
                .ok_or_else(|| {
                    crate::error::BillingError::Validation(format!(
                        "unknown provider price {provider_price_id}"
                    ))
                })?;

            store::upsert_subscription(
                &mut tx,
                &SubscriptionChange {
                    tenant_id: tenant_id.clone(),
                    user_id: user_id.clone(),
                    provider_subscription_id: remote.id.clone(),
                    price_id: price.price.id,
                    status: remote.status.clone(),
                    current_period_start: remote_start,
                    current_period_end: remote_end,
                    cancel_at_period_end: remote.cancel_at_period_end,
                    canceled_at: remote_canceled_at,
                },
                now,
            )
            .await?;
        }

        entitlements::recompute_and_store(&mut tx, &tenant_id, &user_id, now, self.past_due_grace)
            .await?;
        tx.commit().await?;

        self.cache.invalidate(&tenant_id, &user_id).await;
        result.corrected += 1;

        tracing::info!(
            tenant_id = %tenant_id,
            provider_subscription_id = %remote.id,
            status = %remote.status,
            "Repaired subscription drift"
        );

        Ok(())
    }

    async fn reconcile_charge(
        &self,
        tenant: &Tenant,
        remote: &ProviderCharge,
        result: &mut TenantReconciliation,
    ) -> BillingResult<()> {
        let remote_status = charge_status(remote);
        let local = store::find_purchase(&self.pool, &remote.id).await?;

        let (tenant_id, user_id) = match &local {
            Some(local) => {
                if local.status == remote_status.as_str() {
                    return Ok(());
                }
                (local.tenant_id.clone(), local.user_id.clone())
            }
            None => {
                let user_id = match metadata_value(&remote.metadata, "user_id") {
                    Some(user_id) => user_id.to_string(),
                    None => {
                        result
                            .errors
                            .push(format!("charge {}: no user_id metadata", remote.id));
                        return Ok(());
                    }
                };
                (tenant.tenant_id.clone(), user_id)
            }
        };

        result.drift_detected += 1;
        let now = OffsetDateTime::now_utc();
        let mut tx = self.pool.begin().await?;

        if local.is_some() {
            let refunded_at = match remote_status {
                PurchaseStatus::Refunded => Some(now),
                _ => None,
            };
            store::update_purchase_status(&mut tx, &remote.id, remote_status.as_str(), refunded_at)
                .await?;
        } else {
            let provider_price_id = match metadata_value(&remote.metadata, "provider_price_id") {
                Some(price_id) => price_id.to_string(),
                None => {
                    tx.rollback().await?;
                    result
                        .errors
                        .push(format!("charge {}: no provider_price_id metadata", remote.id));
                    return Ok(());
                }
            };
            let price = store::find_price_by_provider_id(&mut *tx, &provider_price_id)
                .await?
                .ok_or_else(|| {
                    crate::error::BillingError::Validation(format!(
                        "unknown provider price {provider_price_id}"
                    ))
                })?;

            let valid_to = price
                .price
                .access_duration_days
                .map(|days| now + Duration::days(i64::from(days)));
            store::insert_purchase_if_absent(
                &mut tx,
                &PurchaseChange {
                    tenant_id: tenant_id.clone(),
                    user_id: user_id.clone(),
                    provider_charge_id: remote.id.clone(),
                    price_id: price.price.id,
                    amount_cents: remote.amount,
                    currency: remote.currency.clone(),
                    status: remote_status.as_str().to_string(),
                    valid_from: now,
                    valid_to,
                },
                now,
            )
            .await?;
        }

        entitlements::recompute_and_store(&mut tx, &tenant_id, &user_id, now, self.past_due_grace)
            .await?;
        tx.commit().await?;

        self.cache.invalidate(&tenant_id, &user_id).await;
        result.corrected += 1;

        tracing::info!(
            tenant_id = %tenant_id,
            provider_charge_id = %remote.id,
            status = %remote_status,
            "Repaired purchase drift"
        );

        Ok(())
    }
}

/// Local subscription fields compared against the provider.
struct LocalWindow {
    period_start: OffsetDateTime,
    period_end: OffsetDateTime,
    cancel_at_period_end: bool,
}

fn local_window(local: &crate::models::Subscription) -> LocalWindow {
    LocalWindow {
        period_start: local.current_period_start,
        period_end: local.current_period_end,
        cancel_at_period_end: local.cancel_at_period_end,
    }
}

/// Drift check: status, period window (tolerating sub-second skew), and the
/// cancel flag.
fn subscription_drifted(
    local_status: &str,
    local: &LocalWindow,
    remote: &ProviderSubscription,
) -> bool {
    if local_status != remote.status {
        return true;
    }
    if local.cancel_at_period_end != remote.cancel_at_period_end {
        return true;
    }

    let Ok(remote_start) = remote.period_start() else {
        return false;
    };
    let Ok(remote_end) = remote.period_end() else {
        return false;
    };

    seconds_apart(local.period_start, remote_start) > 1
        || seconds_apart(local.period_end, remote_end) > 1
}

fn seconds_apart(a: OffsetDateTime, b: OffsetDateTime) -> i64 {
    (a - b).whole_seconds().abs()
}

fn charge_status(remote: &ProviderCharge) -> PurchaseStatus {
    if remote.refunded || remote.status == "refunded" {
        PurchaseStatus::Refunded
    } else {
        match remote.status.as_str() {
            "succeeded" => PurchaseStatus::Succeeded,
            "pending" => PurchaseStatus::Pending,
            _ => PurchaseStatus::Failed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn at(unix: i64) -> OffsetDateTime {
        OffsetDateTime::from_unix_timestamp(unix).unwrap()
    }

    fn remote(status: &str, start: i64, end: i64, cancel: bool) -> ProviderSubscription {
        serde_json::from_value(serde_json::json!({
            "id": "sub_1",
            "status": status,
            "current_period_start": start,
            "current_period_end": end,
            "cancel_at_period_end": cancel,
        }))
        .unwrap()
    }

    #[test]
    fn matching_records_show_no_drift() {
        let local = LocalWindow {
            period_start: at(1_000),
            period_end: at(2_000),
            cancel_at_period_end: false,
        };
        assert!(!subscription_drifted(
            "active",
            &local,
            &remote("active", 1_000, 2_000, false)
        ));
    }

    #[test]
    fn status_change_is_drift() {
        let local = LocalWindow {
            period_start: at(1_000),
            period_end: at(2_000),
            cancel_at_period_end: false,
        };
        assert!(subscription_drifted(
            "active",
            &local,
            &remote("canceled", 1_000, 2_000, false)
        ));
    }

    #[test]
    fn sub_second_period_skew_is_tolerated() {
        let local = LocalWindow {
            period_start: at(1_000),
            period_end: at(2_000),
            cancel_at_period_end: false,
        };
        assert!(!subscription_drifted(
            "active",
            &local,
            &remote("active", 1_000, 2_001, false)
        ));
        assert!(subscription_drifted(
            "active",
            &local,
            &remote("active", 1_000, 2_010, false)
        ));
    }

    #[test]
    fn cancel_flag_change_is_drift() {
        let local = LocalWindow {
            period_start: at(1_000),
            period_end: at(2_000),
            cancel_at_period_end: false,
        };
        assert!(subscription_drifted(
            "active",
            &local,
            &remote("active", 1_000, 2_000, true)
        ));
    }

    #[test]
    fn refund_flag_wins_over_raw_status() {
        let charge = ProviderCharge {
            id: "ch_1".into(),
            status: "succeeded".into(),
            amount: 999,
            currency: "usd".into(),
            refunded: true,
            metadata: HashMap::new(),
        };
        assert_eq!(charge_status(&charge), PurchaseStatus::Refunded);
    }
}
