//! Provider webhook endpoint.

use axum::body::Bytes;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::Json;
use serde_json::json;

use paygate_billing::WebhookDisposition;

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

/// POST /v1/webhooks/provider
///
/// 200 on processed / duplicate / permanently failed, 400 on malformed
/// bodies, 401 on signature problems, 503 on transient infrastructure
/// failures so the provider retries.
pub async fn handle_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Json<serde_json::Value>> {
    let signature = headers
        .get("signature")
        .and_then(|value| value.to_str().ok())
        .ok_or(ApiError::Unauthorized)?;

    let disposition = state.webhooks.handle(&body, signature).await?;

    let status = match disposition {
        WebhookDisposition::Processed => "processed",
        WebhookDisposition::Acknowledged => "acknowledged",
        WebhookDisposition::Duplicate => "duplicate",
        WebhookDisposition::FailedPermanent => "failed",
    };

    Ok(Json(json!({"received": true, "status": status})))
}
