//! Entitlement computation engine.
//!
//! `compute` is THE function that decides what a user can access: a pure
//! function of the loaded source rows and `now`, so the same inputs always
//! produce the same output. Webhook processors, the reconciler, and admin
//! overrides all converge on `recompute_and_store`, which replaces the
//! materialized rows for one (tenant, user) pair under an advisory lock.

use time::{Duration, OffsetDateTime};

use crate::error::BillingResult;
use crate::models::{
    AggregatedEntitlement, ComputedEntitlement, EntitlementRow, EntitlementSource, ManualGrant,
    Purchase, PurchaseStatus, Subscription, SubscriptionStatus,
};
use crate::store;

/// A subscription joined with the feature codes its price's product unlocks.
#[derive(Debug, Clone)]
pub struct SubscriptionGrant {
    pub subscription: Subscription,
    pub feature_codes: Vec<String>,
}

/// A purchase joined with the feature codes its price's product unlocks.
#[derive(Debug, Clone)]
pub struct PurchaseGrant {
    pub purchase: Purchase,
    pub feature_codes: Vec<String>,
}

/// Everything the engine reads for one (tenant, user) pair.
#[derive(Debug, Clone, Default)]
pub struct EntitlementSources {
    pub subscriptions: Vec<SubscriptionGrant>,
    pub purchases: Vec<PurchaseGrant>,
    pub grants: Vec<ManualGrant>,
}

/// Compute the entitlement set from all three sources.
///
/// Every contributing row is emitted (audits see all sources); the collapse
/// to one row per feature happens in [`aggregate`]. Output order is fixed so
/// repeated computation over unchanged inputs is byte-identical.
pub fn compute(
    sources: &EntitlementSources,
    now: OffsetDateTime,
    past_due_grace: Duration,
) -> Vec<ComputedEntitlement> {
    let mut computed = Vec::new();

    for entry in &sources.subscriptions {
        let sub = &entry.subscription;
        let Ok(status) = sub.status.parse::<SubscriptionStatus>() else {
            tracing::warn!(
                provider_subscription_id = %sub.provider_subscription_id,
                status = %sub.status,
                "Skipping subscription with unknown status"
            );
            continue;
        };

        // active/trialing grant until period end (strictly before); past_due
        // gets the configured grace window past the period end.
        let valid_to = match status {
            SubscriptionStatus::Active | SubscriptionStatus::Trialing => sub.current_period_end,
            SubscriptionStatus::PastDue => sub.current_period_end + past_due_grace,
            _ => continue,
        };
        if now >= valid_to {
            continue;
        }

        for feature_code in &entry.feature_codes {
            computed.push(ComputedEntitlement {
                feature_code: feature_code.clone(),
                source: EntitlementSource::Subscription,
                source_ref: sub.provider_subscription_id.clone(),
                valid_from: sub.current_period_start,
                valid_to: Some(valid_to),
            });
        }
    }

    for entry in &sources.purchases {
        let purchase = &entry.purchase;
        if purchase.status.parse::<PurchaseStatus>() != Ok(PurchaseStatus::Succeeded) {
            continue;
        }
        if !window_contains(purchase.valid_from, purchase.valid_to, now) {
            continue;
        }

        for feature_code in &entry.feature_codes {
            computed.push(ComputedEntitlement {
                feature_code: feature_code.clone(),
                source: EntitlementSource::Purchase,
                source_ref: purchase.provider_charge_id.clone(),
                valid_from: purchase.valid_from,
                valid_to: purchase.valid_to,
            });
        }
    }

    for grant in &sources.grants {
        if grant.revoked_at.is_some() {
            continue;
        }
        if !window_contains(grant.valid_from, grant.valid_to, now) {
            continue;
        }

        computed.push(ComputedEntitlement {
            feature_code: grant.feature_code.clone(),
            source: EntitlementSource::Manual,
            source_ref: grant.id.to_string(),
            valid_from: grant.valid_from,
            valid_to: grant.valid_to,
        });
    }

    computed.sort_by(|a, b| {
        (&a.feature_code, a.source.as_str(), &a.source_ref)
            .cmp(&(&b.feature_code, b.source.as_str(), &b.source_ref))
    });
    computed
}

/// Collapse materialized rows into the per-feature view served to callers.
///
/// Per feature code the winning row has the latest `valid_to` (NULL reads as
/// +infinity); ties break by source precedence manual > purchase >
/// subscription. `is_active` is true iff at least one contributing row
/// contains `now`.
pub fn aggregate(rows: &[EntitlementRow], now: OffsetDateTime) -> Vec<AggregatedEntitlement> {
    let mut by_feature: Vec<(&str, Vec<&EntitlementRow>)> = Vec::new();
    for row in rows {
        match by_feature.iter_mut().find(|(code, _)| *code == row.feature_code) {
            Some((_, group)) => group.push(row),
            None => by_feature.push((&row.feature_code, vec![row])),
        }
    }

    let mut view: Vec<AggregatedEntitlement> = Vec::with_capacity(by_feature.len());
    for (_, group) in by_feature {
        let best = group.iter().copied().max_by(|a, b| {
            window_rank(a.valid_to)
                .cmp(&window_rank(b.valid_to))
                .then_with(|| source_precedence(a).cmp(&source_precedence(b)))
        });
        let Some(best) = best else { continue };

        let is_active = group
            .iter()
            .any(|row| window_contains(row.valid_from, row.valid_to, now));

        view.push(AggregatedEntitlement {
            feature_code: best.feature_code.clone(),
            is_active,
            valid_from: best.valid_from,
            valid_to: best.valid_to,
            source: best
                .source
                .parse()
                .unwrap_or(EntitlementSource::Subscription),
        });
    }

    view.sort_by(|a, b| a.feature_code.cmp(&b.feature_code));
    view
}

/// Recompute and replace the materialized rows for one (tenant, user) pair.
///
/// Runs inside the caller's transaction. The advisory lock serializes
/// concurrent recomputations for the same pair so deletes and inserts cannot
/// interleave.
pub async fn recompute_and_store(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    tenant_id: &str,
    user_id: &str,
    now: OffsetDateTime,
    past_due_grace: Duration,
) -> BillingResult<Vec<ComputedEntitlement>> {
    store::acquire_pair_lock(&mut **tx, tenant_id, user_id).await?;

    let sources = store::load_entitlement_sources(&mut **tx, tenant_id, user_id).await?;
    let computed = compute(&sources, now, past_due_grace);

    store::replace_entitlements(&mut **tx, tenant_id, user_id, &computed, now).await?;

    tracing::debug!(
        tenant_id = %tenant_id,
        user_id = %user_id,
        rows = computed.len(),
        "Recomputed entitlements"
    );

    Ok(computed)
}

/// `[valid_from, valid_to)` with a NULL end reading as +infinity.
fn window_contains(
    valid_from: OffsetDateTime,
    valid_to: Option<OffsetDateTime>,
    now: OffsetDateTime,
) -> bool {
    now >= valid_from && valid_to.map_or(true, |end| now < end)
}

/// Order key treating a NULL `valid_to` as greater than any finite value.
fn window_rank(valid_to: Option<OffsetDateTime>) -> (bool, Option<OffsetDateTime>) {
    (valid_to.is_none(), valid_to)
}

fn source_precedence(row: &EntitlementRow) -> u8 {
    row.source
        .parse::<EntitlementSource>()
        .map(|s| s.precedence())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn at(unix: i64) -> OffsetDateTime {
        OffsetDateTime::from_unix_timestamp(unix).unwrap()
    }

    fn subscription(status: &str, start: OffsetDateTime, end: OffsetDateTime) -> Subscription {
        Subscription {
            id: Uuid::new_v4(),
            tenant_id: "t_1".into(),
            user_id: "u_1".into(),
            provider_subscription_id: "sub_1".into(),
            price_id: Uuid::new_v4(),
            status: status.into(),
            current_period_start: start,
            current_period_end: end,
            cancel_at_period_end: false,
            canceled_at: None,
            created_at: start,
            updated_at: start,
        }
    }

    fn purchase(status: &str, from: OffsetDateTime, to: Option<OffsetDateTime>) -> Purchase {
        Purchase {
            id: Uuid::new_v4(),
            tenant_id: "t_1".into(),
            user_id: "u_1".into(),
            provider_charge_id: "ch_1".into(),
            price_id: Uuid::new_v4(),
            amount_cents: 999,
            currency: "usd".into(),
            status: status.into(),
            refunded_at: None,
            valid_from: from,
            valid_to: to,
            created_at: from,
        }
    }

    fn manual_grant(
        feature: &str,
        from: OffsetDateTime,
        to: Option<OffsetDateTime>,
        revoked_at: Option<OffsetDateTime>,
    ) -> ManualGrant {
        ManualGrant {
            id: Uuid::new_v4(),
            tenant_id: "t_1".into(),
            user_id: "u_1".into(),
            feature_code: feature.into(),
            valid_from: from,
            valid_to: to,
            reason: "trial".into(),
            granted_by: "ops".into(),
            granted_at: from,
            revoked_at,
            revoked_by: revoked_at.map(|_| "ops".into()),
            revoke_reason: revoked_at.map(|_| "done".into()),
        }
    }

    fn row(
        feature: &str,
        source: &str,
        source_ref: &str,
        from: OffsetDateTime,
        to: Option<OffsetDateTime>,
    ) -> EntitlementRow {
        EntitlementRow {
            id: Uuid::new_v4(),
            tenant_id: "t_1".into(),
            user_id: "u_1".into(),
            feature_code: feature.into(),
            source: source.into(),
            source_ref: source_ref.into(),
            is_active: true,
            valid_from: from,
            valid_to: to,
            computed_at: from,
        }
    }

    #[test]
    fn active_subscription_grants_until_period_end() {
        let now = at(1_000_000);
        let sources = EntitlementSources {
            subscriptions: vec![SubscriptionGrant {
                subscription: subscription("active", at(900_000), at(1_100_000)),
                feature_codes: vec!["pro".into()],
            }],
            ..Default::default()
        };

        let computed = compute(&sources, now, Duration::ZERO);
        assert_eq!(computed.len(), 1);
        assert_eq!(computed[0].feature_code, "pro");
        assert_eq!(computed[0].valid_to, Some(at(1_100_000)));
        assert_eq!(computed[0].source, EntitlementSource::Subscription);
    }

    #[test]
    fn subscription_at_exact_period_end_is_not_active() {
        let now = at(1_100_000);
        let sources = EntitlementSources {
            subscriptions: vec![SubscriptionGrant {
                subscription: subscription("active", at(900_000), at(1_100_000)),
                feature_codes: vec!["pro".into()],
            }],
            ..Default::default()
        };

        assert!(compute(&sources, now, Duration::ZERO).is_empty());
    }

    #[test]
    fn past_due_grants_only_within_grace_window() {
        let sources = EntitlementSources {
            subscriptions: vec![SubscriptionGrant {
                subscription: subscription("past_due", at(900_000), at(1_000_000)),
                feature_codes: vec!["pro".into()],
            }],
            ..Default::default()
        };

        // Default grace of zero: nothing past the period end.
        assert!(compute(&sources, at(1_000_500), Duration::ZERO).is_empty());

        // With a grace window the same moment still qualifies.
        let computed = compute(&sources, at(1_000_500), Duration::seconds(1_000));
        assert_eq!(computed.len(), 1);
        assert_eq!(computed[0].valid_to, Some(at(1_001_000)));
    }

    #[test]
    fn canceled_and_unpaid_subscriptions_grant_nothing() {
        for status in ["canceled", "unpaid", "incomplete"] {
            let sources = EntitlementSources {
                subscriptions: vec![SubscriptionGrant {
                    subscription: subscription(status, at(900_000), at(2_000_000)),
                    feature_codes: vec!["pro".into()],
                }],
                ..Default::default()
            };
            assert!(
                compute(&sources, at(1_000_000), Duration::ZERO).is_empty(),
                "status {status} should not grant"
            );
        }
    }

    #[test]
    fn lifetime_purchase_has_no_end() {
        let sources = EntitlementSources {
            purchases: vec![PurchaseGrant {
                purchase: purchase("succeeded", at(500_000), None),
                feature_codes: vec!["lifetime_x".into()],
            }],
            ..Default::default()
        };

        let computed = compute(&sources, at(9_000_000), Duration::ZERO);
        assert_eq!(computed.len(), 1);
        assert_eq!(computed[0].valid_to, None);
    }

    #[test]
    fn finite_purchase_is_inactive_at_and_after_valid_to() {
        let sources = EntitlementSources {
            purchases: vec![PurchaseGrant {
                purchase: purchase("succeeded", at(500_000), Some(at(600_000))),
                feature_codes: vec!["boost".into()],
            }],
            ..Default::default()
        };

        assert_eq!(compute(&sources, at(599_999), Duration::ZERO).len(), 1);
        assert!(compute(&sources, at(600_000), Duration::ZERO).is_empty());
        assert!(compute(&sources, at(600_001), Duration::ZERO).is_empty());
    }

    #[test]
    fn refunded_purchase_grants_nothing() {
        let mut refunded = purchase("refunded", at(500_000), None);
        refunded.refunded_at = Some(at(550_000));
        let sources = EntitlementSources {
            purchases: vec![PurchaseGrant {
                purchase: refunded,
                feature_codes: vec!["lifetime_x".into()],
            }],
            ..Default::default()
        };

        assert!(compute(&sources, at(560_000), Duration::ZERO).is_empty());
    }

    #[test]
    fn revoked_grant_is_inactive_regardless_of_window() {
        let sources = EntitlementSources {
            grants: vec![manual_grant(
                "pro",
                at(100_000),
                Some(at(9_000_000)),
                Some(at(200_000)),
            )],
            ..Default::default()
        };

        assert!(compute(&sources, at(300_000), Duration::ZERO).is_empty());
    }

    #[test]
    fn compute_is_deterministic_over_repeated_calls() {
        let sources = EntitlementSources {
            subscriptions: vec![SubscriptionGrant {
                subscription: subscription("active", at(900_000), at(1_100_000)),
                feature_codes: vec!["pro".into(), "analytics".into()],
            }],
            purchases: vec![PurchaseGrant {
                purchase: purchase("succeeded", at(500_000), None),
                feature_codes: vec!["pro".into()],
            }],
            grants: vec![manual_grant("beta", at(100_000), None, None)],
        };

        let now = at(1_000_000);
        let first = compute(&sources, now, Duration::ZERO);
        let second = compute(&sources, now, Duration::ZERO);
        assert_eq!(first, second);

        // Sorted: analytics < beta < pro, and pro keeps both contributors.
        let codes: Vec<&str> = first.iter().map(|e| e.feature_code.as_str()).collect();
        assert_eq!(codes, vec!["analytics", "beta", "pro", "pro"]);
    }

    #[test]
    fn aggregate_prefers_latest_window_and_null_beats_finite() {
        let now = at(1_000_000);
        let rows = vec![
            row("pro", "subscription", "sub_1", at(900_000), Some(at(1_100_000))),
            row("pro", "purchase", "ch_1", at(500_000), None),
        ];

        let view = aggregate(&rows, now);
        assert_eq!(view.len(), 1);
        assert!(view[0].is_active);
        assert_eq!(view[0].source, EntitlementSource::Purchase);
        assert_eq!(view[0].valid_to, None);
    }

    #[test]
    fn aggregate_breaks_window_ties_by_source_precedence() {
        let now = at(1_000_000);
        let end = at(1_100_000);
        let rows = vec![
            row("pro", "subscription", "sub_1", at(900_000), Some(end)),
            row("pro", "manual", "g_1", at(950_000), Some(end)),
        ];

        let view = aggregate(&rows, now);
        assert_eq!(view[0].source, EntitlementSource::Manual);
    }

    #[test]
    fn aggregate_marks_expired_rows_inactive_but_keeps_best_window() {
        let now = at(1_000_000);
        let rows = vec![row(
            "pro",
            "subscription",
            "sub_1",
            at(800_000),
            Some(at(900_000)),
        )];

        let view = aggregate(&rows, now);
        assert_eq!(view.len(), 1);
        assert!(!view[0].is_active);
    }

    #[test]
    fn aggregate_active_manual_supersedes_expired_subscription() {
        let now = at(1_000_000);
        let rows = vec![
            row("pro", "subscription", "sub_1", at(800_000), Some(at(913_600))),
            row("pro", "manual", "g_1", at(990_000), Some(at(1_604_800))),
        ];

        let view = aggregate(&rows, now);
        assert_eq!(view.len(), 1);
        assert!(view[0].is_active);
        assert_eq!(view[0].source, EntitlementSource::Manual);
    }
}
