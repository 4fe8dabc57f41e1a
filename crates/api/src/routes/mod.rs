//! Router wiring and health probes.

mod admin;
mod entitlements;
mod webhooks;

use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{extract::State, Json, Router};
use serde_json::json;

use crate::state::AppState;

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/v1/webhooks/provider", post(webhooks::handle_webhook))
        .route("/v1/entitlements", get(entitlements::get_entitlements))
        .route("/v1/admin/grant", post(admin::grant))
        .route("/v1/admin/revoke", post(admin::revoke))
        .route("/v1/admin/reconcile", post(admin::reconcile))
        .route("/v1/admin/invariants", get(admin::invariants))
        .route("/healthz", get(healthz))
        .route("/live", get(live))
        .route("/ready", get(ready))
        .with_state(state)
}

async fn healthz() -> Json<serde_json::Value> {
    Json(json!({"status": "healthy"}))
}

async fn live() -> Json<serde_json::Value> {
    Json(json!({"status": "alive"}))
}

/// Readiness requires database connectivity.
async fn ready(State(state): State<AppState>) -> impl IntoResponse {
    match sqlx::query("SELECT 1").execute(&state.pool).await {
        Ok(_) => (StatusCode::OK, Json(json!({"status": "ready"}))),
        Err(e) => {
            tracing::warn!(error = %e, "Readiness check failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({"status": "not ready"})),
            )
        }
    }
}
