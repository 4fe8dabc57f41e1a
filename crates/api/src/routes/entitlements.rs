//! Tenant-facing entitlement reads.

use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::Json;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use paygate_billing::{entitlements, store, AggregatedEntitlement};

use crate::auth::{authenticate_tenant, ensure_tenant_scope};
use crate::error::ApiResult;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct EntitlementsQuery {
    pub user_id: String,
    /// Optional; when present it must match the credential's tenant.
    pub tenant_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct EntitlementsResponse {
    pub tenant_id: String,
    pub user_id: String,
    pub entitlements: Vec<AggregatedEntitlement>,
    #[serde(with = "time::serde::rfc3339")]
    pub checked_at: OffsetDateTime,
}

/// GET /v1/entitlements?user_id=...
///
/// Cache first; on miss (or any cache trouble) the view is aggregated from
/// the materialized rows and the cache repopulated best-effort. A genuine
/// database failure is a 503 — callers must treat it as "unknown", never as
/// an implicit grant.
pub async fn get_entitlements(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<EntitlementsQuery>,
) -> ApiResult<Json<EntitlementsResponse>> {
    let tenant = authenticate_tenant(&state, &headers).await?;
    ensure_tenant_scope(&tenant, query.tenant_id.as_deref())?;

    let now = OffsetDateTime::now_utc();

    if let Some(view) = state.cache.get(&tenant.tenant_id, &query.user_id).await {
        tracing::debug!(
            tenant_id = %tenant.tenant_id,
            user_id = %query.user_id,
            "Entitlement cache hit"
        );
        return Ok(Json(EntitlementsResponse {
            tenant_id: tenant.tenant_id,
            user_id: query.user_id,
            entitlements: view,
            checked_at: now,
        }));
    }

    let rows = store::load_entitlements(&state.pool, &tenant.tenant_id, &query.user_id).await?;
    let view = entitlements::aggregate(&rows, now);

    state
        .cache
        .put(&tenant.tenant_id, &query.user_id, &view)
        .await;

    Ok(Json(EntitlementsResponse {
        tenant_id: tenant.tenant_id,
        user_id: query.user_id,
        entitlements: view,
        checked_at: now,
    }))
}
