//! Manual grant and revoke operations.
//!
//! Operator overrides ride the same recompute + evict path as the webhook
//! processors. Grants are append-only; revocation stamps the existing row
//! and is permanent. Both operations leave an audit line independent of the
//! grant row.

use serde::Deserialize;
use sqlx::PgPool;
use time::{Duration, OffsetDateTime};

use crate::audit::{AuditAction, AuditEntry, AuditLogger};
use crate::cache::EntitlementCache;
use crate::entitlements;
use crate::error::{BillingError, BillingResult};
use crate::models::AggregatedEntitlement;
use crate::store;

#[derive(Debug, Clone, Deserialize)]
pub struct GrantRequest {
    pub tenant_id: String,
    pub user_id: String,
    pub feature_code: String,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub valid_from: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub valid_to: Option<OffsetDateTime>,
    pub reason: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RevokeRequest {
    pub tenant_id: String,
    pub user_id: String,
    pub feature_code: String,
    pub reason: Option<String>,
}

/// Admin override operations.
pub struct GrantService {
    pool: PgPool,
    cache: EntitlementCache,
    audit: AuditLogger,
    past_due_grace: Duration,
}

impl GrantService {
    pub fn new(
        pool: PgPool,
        cache: EntitlementCache,
        audit: AuditLogger,
        past_due_grace: Duration,
    ) -> Self {
        Self {
            pool,
            cache,
            audit,
            past_due_grace,
        }
    }

    /// Insert a manual grant and return the resulting aggregated view.
    ///
    /// Granting a feature that already carries an active equivalent grant is
    /// a no-op success: the caller gets the current view back.
    pub async fn grant(
        &self,
        request: &GrantRequest,
        granted_by: &str,
    ) -> BillingResult<Vec<AggregatedEntitlement>> {
        if request.reason.trim().is_empty() {
            return Err(BillingError::Validation(
                "reason is required for manual grants".into(),
            ));
        }
        if request.feature_code.trim().is_empty() {
            return Err(BillingError::Validation("feature_code is required".into()));
        }

        let now = OffsetDateTime::now_utc();
        let valid_from = request.valid_from.unwrap_or(now);
        if let Some(valid_to) = request.valid_to {
            if valid_to <= valid_from {
                return Err(BillingError::Validation(
                    "valid_to must be after valid_from".into(),
                ));
            }
        }

        let mut tx = self.pool.begin().await?;

        let tenant = store::find_tenant(&mut *tx, &request.tenant_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("tenant {}", request.tenant_id)))?;

        let existing = store::find_covering_grant(
            &mut tx,
            &tenant.tenant_id,
            &request.user_id,
            &request.feature_code,
            now,
        )
        .await?;

        if let Some(existing) = existing {
            // Concurrent or repeated grants converge on the same state.
            tx.commit().await?;
            tracing::info!(
                tenant_id = %tenant.tenant_id,
                user_id = %request.user_id,
                feature_code = %request.feature_code,
                grant_id = %existing.id,
                "Grant already active; returning current view"
            );
            return self.current_view(&tenant.tenant_id, &request.user_id).await;
        }

        let grant = store::insert_manual_grant(
            &mut tx,
            &tenant.tenant_id,
            &request.user_id,
            &request.feature_code,
            valid_from,
            request.valid_to,
            request.reason.trim(),
            granted_by,
            now,
        )
        .await?;

        entitlements::recompute_and_store(
            &mut tx,
            &tenant.tenant_id,
            &request.user_id,
            now,
            self.past_due_grace,
        )
        .await?;
        tx.commit().await?;

        self.cache.invalidate(&tenant.tenant_id, &request.user_id).await;

        self.audit
            .record(
                AuditEntry {
                    tenant_id: tenant.tenant_id.clone(),
                    actor: granted_by.to_string(),
                    action: AuditAction::Grant,
                    user_id: Some(request.user_id.clone()),
                    feature_code: Some(request.feature_code.clone()),
                    detail: serde_json::json!({
                        "grant_id": grant.id,
                        "reason": grant.reason,
                        "valid_from": grant.valid_from.unix_timestamp(),
                        "valid_to": grant.valid_to.map(|t| t.unix_timestamp()),
                    }),
                },
                now,
            )
            .await;

        tracing::info!(
            tenant_id = %tenant.tenant_id,
            user_id = %request.user_id,
            feature_code = %request.feature_code,
            grant_id = %grant.id,
            granted_by = %granted_by,
            "Manual grant created"
        );

        self.current_view(&tenant.tenant_id, &request.user_id).await
    }

    /// Revoke the latest non-revoked grant matching the request and return
    /// the resulting aggregated view. 404 when no such grant exists.
    pub async fn revoke(
        &self,
        request: &RevokeRequest,
        revoked_by: &str,
    ) -> BillingResult<Vec<AggregatedEntitlement>> {
        let now = OffsetDateTime::now_utc();
        let mut tx = self.pool.begin().await?;

        let tenant = store::find_tenant(&mut *tx, &request.tenant_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("tenant {}", request.tenant_id)))?;

        let grant = store::lock_latest_active_grant(
            &mut tx,
            &tenant.tenant_id,
            &request.user_id,
            &request.feature_code,
        )
        .await?
        .ok_or_else(|| {
            BillingError::NotFound(format!(
                "no active grant for {}/{}",
                request.user_id, request.feature_code
            ))
        })?;

        let revoked =
            store::revoke_grant(&mut tx, grant.id, revoked_by, request.reason.as_deref(), now)
                .await?;

        entitlements::recompute_and_store(
            &mut tx,
            &tenant.tenant_id,
            &request.user_id,
            now,
            self.past_due_grace,
        )
        .await?;
        tx.commit().await?;

        self.cache.invalidate(&tenant.tenant_id, &request.user_id).await;

        self.audit
            .record(
                AuditEntry {
                    tenant_id: tenant.tenant_id.clone(),
                    actor: revoked_by.to_string(),
                    action: AuditAction::Revoke,
                    user_id: Some(request.user_id.clone()),
                    feature_code: Some(request.feature_code.clone()),
                    detail: serde_json::json!({
                        "grant_id": revoked.id,
                        "revoke_reason": revoked.revoke_reason,
                    }),
                },
                now,
            )
            .await;

        tracing::info!(
            tenant_id = %tenant.tenant_id,
            user_id = %request.user_id,
            feature_code = %request.feature_code,
            grant_id = %revoked.id,
            revoked_by = %revoked_by,
            "Manual grant revoked"
        );

        self.current_view(&tenant.tenant_id, &request.user_id).await
    }

    async fn current_view(
        &self,
        tenant_id: &str,
        user_id: &str,
    ) -> BillingResult<Vec<AggregatedEntitlement>> {
        let rows = store::load_entitlements(&self.pool, tenant_id, user_id).await?;
        Ok(entitlements::aggregate(&rows, OffsetDateTime::now_utc()))
    }
}
