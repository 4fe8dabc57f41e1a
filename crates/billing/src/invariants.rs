//! Runnable consistency checks over billing state.
//!
//! Each check is read-only; violations carry enough context to debug.
//! Intended to run after webhook replays or reconciliation passes.

use serde::Serialize;
use sqlx::PgPool;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::entitlements;
use crate::error::BillingResult;
use crate::models::{ComputedEntitlement, EntitlementRow};
use crate::store;

/// A single invariant violation.
#[derive(Debug, Clone, Serialize)]
pub struct InvariantViolation {
    pub invariant: String,
    pub tenant_id: String,
    pub description: String,
    pub context: serde_json::Value,
}

/// Summary of one check run.
#[derive(Debug, Clone, Serialize)]
pub struct InvariantCheckSummary {
    #[serde(with = "time::serde::rfc3339")]
    pub checked_at: OffsetDateTime,
    pub checks_run: usize,
    pub checks_failed: usize,
    pub violations: Vec<InvariantViolation>,
    pub healthy: bool,
}

#[derive(Debug, sqlx::FromRow)]
struct BadPeriodRow {
    tenant_id: String,
    provider_subscription_id: String,
}

#[derive(Debug, sqlx::FromRow)]
struct RevokedBackedRow {
    tenant_id: String,
    user_id: String,
    feature_code: String,
    grant_id: Uuid,
}

#[derive(Debug, sqlx::FromRow)]
struct RefundedBackedRow {
    tenant_id: String,
    user_id: String,
    provider_charge_id: String,
}

pub struct InvariantChecker {
    pool: PgPool,
    past_due_grace: Duration,
}

impl InvariantChecker {
    pub fn new(pool: PgPool, past_due_grace: Duration) -> Self {
        Self {
            pool,
            past_due_grace,
        }
    }

    pub async fn run_all_checks(&self) -> BillingResult<InvariantCheckSummary> {
        let now = OffsetDateTime::now_utc();
        let mut violations = Vec::new();

        violations.extend(self.check_materialized_matches_fresh_computation(now).await?);
        violations.extend(self.check_period_windows_ordered().await?);
        violations.extend(self.check_no_entitlements_from_revoked_grants().await?);
        violations.extend(self.check_no_entitlements_from_refunded_purchases().await?);

        let checks_run = 4;
        let checks_failed = violations
            .iter()
            .map(|v| v.invariant.as_str())
            .collect::<std::collections::HashSet<_>>()
            .len();

        Ok(InvariantCheckSummary {
            checked_at: now,
            checks_run,
            checks_failed,
            healthy: violations.is_empty(),
            violations,
        })
    }

    /// The materialized rows for every pair must equal a fresh run of the
    /// engine over the pair's current source rows.
    ///
    /// The fresh computation is evaluated at the pair's `computed_at`, not at
    /// wall-clock now, so rows that merely expired since the last
    /// recomputation do not read as drift; a mismatch means a source row
    /// changed without the recomputation path running.
    async fn check_materialized_matches_fresh_computation(
        &self,
        now: OffsetDateTime,
    ) -> BillingResult<Vec<InvariantViolation>> {
        let pairs: Vec<(String, String)> = sqlx::query_as(
            r#"
            SELECT tenant_id, user_id FROM entitlements
            UNION
            SELECT tenant_id, user_id FROM subscriptions
            UNION
            SELECT tenant_id, user_id FROM purchases
            UNION
            SELECT tenant_id, user_id FROM manual_grants
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut violations = Vec::new();
        let mut conn = self.pool.acquire().await?;

        for (tenant_id, user_id) in pairs {
            let stored = store::load_entitlements(&mut *conn, &tenant_id, &user_id).await?;
            let as_of = stored
                .iter()
                .map(|row| row.computed_at)
                .max()
                .unwrap_or(now);

            let sources =
                store::load_entitlement_sources(&mut conn, &tenant_id, &user_id).await?;
            let fresh = entitlements::compute(&sources, as_of, self.past_due_grace);

            if !rows_match_computation(&stored, &fresh) {
                violations.push(InvariantViolation {
                    invariant: "materialized_matches_fresh_computation".to_string(),
                    tenant_id: tenant_id.clone(),
                    description: "Materialized entitlements differ from a fresh computation \
                                  over current source rows"
                        .to_string(),
                    context: serde_json::json!({
                        "user_id": user_id,
                        "stored_rows": stored.len(),
                        "fresh_rows": fresh.len(),
                        "as_of": as_of.unix_timestamp(),
                    }),
                });
            }
        }

        Ok(violations)
    }

    /// `current_period_start <= current_period_end` on every subscription.
    async fn check_period_windows_ordered(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<BadPeriodRow> = sqlx::query_as(
            r#"
            SELECT tenant_id, provider_subscription_id
            FROM subscriptions
            WHERE current_period_start > current_period_end
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "period_window_ordered".to_string(),
                tenant_id: row.tenant_id,
                description: "Subscription period starts after it ends".to_string(),
                context: serde_json::json!({
                    "provider_subscription_id": row.provider_subscription_id,
                }),
            })
            .collect())
    }

    /// Revoked grants must not back materialized entitlement rows.
    async fn check_no_entitlements_from_revoked_grants(
        &self,
    ) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<RevokedBackedRow> = sqlx::query_as(
            r#"
            SELECT e.tenant_id, e.user_id, e.feature_code, g.id as grant_id
            FROM entitlements e
            JOIN manual_grants g ON g.id::text = e.source_ref
            WHERE e.source = 'manual' AND g.revoked_at IS NOT NULL
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "no_revoked_grant_entitlements".to_string(),
                tenant_id: row.tenant_id,
                description: "Entitlement row backed by a revoked grant; recomputation missed"
                    .to_string(),
                context: serde_json::json!({
                    "user_id": row.user_id,
                    "feature_code": row.feature_code,
                    "grant_id": row.grant_id,
                }),
            })
            .collect())
    }

    /// Refunded purchases must not back materialized entitlement rows.
    async fn check_no_entitlements_from_refunded_purchases(
        &self,
    ) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<RefundedBackedRow> = sqlx::query_as(
            r#"
            SELECT e.tenant_id, e.user_id, p.provider_charge_id
            FROM entitlements e
            JOIN purchases p ON p.provider_charge_id = e.source_ref
            WHERE e.source = 'purchase' AND p.status = 'refunded'
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "no_refunded_purchase_entitlements".to_string(),
                tenant_id: row.tenant_id,
                description: "Entitlement row backed by a refunded purchase; recomputation missed"
                    .to_string(),
                context: serde_json::json!({
                    "user_id": row.user_id,
                    "provider_charge_id": row.provider_charge_id,
                }),
            })
            .collect())
    }
}

/// Stored rows equal the fresh computation when the two sets agree on
/// (feature_code, source, source_ref, valid_from, valid_to).
fn rows_match_computation(stored: &[EntitlementRow], fresh: &[ComputedEntitlement]) -> bool {
    if stored.len() != fresh.len() {
        return false;
    }

    let mut stored_keys: Vec<_> = stored
        .iter()
        .map(|row| {
            (
                row.feature_code.clone(),
                row.source.clone(),
                row.source_ref.clone(),
                row.valid_from,
                row.valid_to,
            )
        })
        .collect();
    stored_keys.sort();

    let mut fresh_keys: Vec<_> = fresh
        .iter()
        .map(|e| {
            (
                e.feature_code.clone(),
                e.source.as_str().to_string(),
                e.source_ref.clone(),
                e.valid_from,
                e.valid_to,
            )
        })
        .collect();
    fresh_keys.sort();

    stored_keys == fresh_keys
}
