//! Admin operations: manual overrides, reconciliation, invariant checks.
//!
//! All endpoints require the admin credential, which is distinct from tenant
//! credentials.

use axum::extract::State;
use axum::http::HeaderMap;
use axum::Json;
use serde::Serialize;
use time::OffsetDateTime;

use paygate_billing::{
    store, AggregatedEntitlement, GrantRequest, InvariantCheckSummary, ReconciliationSummary,
    RevokeRequest, LEASE_NAME,
};

use crate::auth::require_admin;
use crate::error::ApiResult;
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct OverrideResponse {
    pub tenant_id: String,
    pub user_id: String,
    pub entitlements: Vec<AggregatedEntitlement>,
    #[serde(with = "time::serde::rfc3339")]
    pub checked_at: OffsetDateTime,
}

/// POST /v1/admin/grant
pub async fn grant(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<GrantRequest>,
) -> ApiResult<Json<OverrideResponse>> {
    let actor = require_admin(&state, &headers)?;

    let entitlements = state.grants.grant(&request, &actor).await?;

    Ok(Json(OverrideResponse {
        tenant_id: request.tenant_id,
        user_id: request.user_id,
        entitlements,
        checked_at: OffsetDateTime::now_utc(),
    }))
}

/// POST /v1/admin/revoke
pub async fn revoke(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<RevokeRequest>,
) -> ApiResult<Json<OverrideResponse>> {
    let actor = require_admin(&state, &headers)?;

    let entitlements = state.grants.revoke(&request, &actor).await?;

    Ok(Json(OverrideResponse {
        tenant_id: request.tenant_id,
        user_id: request.user_id,
        entitlements,
        checked_at: OffsetDateTime::now_utc(),
    }))
}

/// POST /v1/admin/reconcile
///
/// Runs a reconciliation pass immediately, taking the same lease the
/// scheduled job uses so a manual run and a scheduled tick cannot overlap.
pub async fn reconcile(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<Json<ReconciliationSummary>> {
    require_admin(&state, &headers)?;

    let now = OffsetDateTime::now_utc();
    let acquired = store::try_acquire_lease(
        &state.pool,
        LEASE_NAME,
        "admin-trigger",
        now + time::Duration::minutes(30),
        now,
    )
    .await
    .map_err(crate::error::ApiError::from)?;

    if !acquired {
        return Err(crate::error::ApiError::BadRequest(
            "a reconciliation run is already in progress".into(),
        ));
    }

    let summary = state.reconciler.run().await?;
    Ok(Json(summary))
}

/// GET /v1/admin/invariants
pub async fn invariants(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<Json<InvariantCheckSummary>> {
    require_admin(&state, &headers)?;

    let summary = state.invariants.run_all_checks().await?;
    Ok(Json(summary))
}
