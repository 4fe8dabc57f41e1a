//! Append-only audit trail for admin overrides.
//!
//! Every grant and revoke writes one immutable line (who, when, what, why)
//! independently of the grant row itself, so the trail survives even if a
//! later bug mangles grant state. Audit failures are logged, never
//! propagated; the override itself must not fail because the trail write did.

use serde::Serialize;
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

/// What the admin did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AuditAction {
    Grant,
    Revoke,
    Reconcile,
}

impl std::fmt::Display for AuditAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuditAction::Grant => write!(f, "grant"),
            AuditAction::Revoke => write!(f, "revoke"),
            AuditAction::Reconcile => write!(f, "reconcile"),
        }
    }
}

/// One audit line.
#[derive(Debug, Clone)]
pub struct AuditEntry {
    pub tenant_id: String,
    pub actor: String,
    pub action: AuditAction,
    pub user_id: Option<String>,
    pub feature_code: Option<String>,
    pub detail: serde_json::Value,
}

/// Writer for the immutable audit log.
#[derive(Clone)]
pub struct AuditLogger {
    pool: PgPool,
}

impl AuditLogger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Append one line. Best-effort: failures are logged with full context.
    pub async fn record(&self, entry: AuditEntry, now: OffsetDateTime) {
        let result = sqlx::query(
            r#"
            INSERT INTO audit_log
                (id, tenant_id, actor, action, user_id, feature_code, detail, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&entry.tenant_id)
        .bind(&entry.actor)
        .bind(entry.action.to_string())
        .bind(&entry.user_id)
        .bind(&entry.feature_code)
        .bind(&entry.detail)
        .bind(now)
        .execute(&self.pool)
        .await;

        if let Err(e) = result {
            tracing::error!(
                tenant_id = %entry.tenant_id,
                actor = %entry.actor,
                action = %entry.action,
                error = %e,
                "Failed to write audit line"
            );
        }
    }
}
