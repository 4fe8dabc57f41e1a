//! HTTP boundary errors.
//!
//! Core errors are mapped to status codes here and nowhere else. Auth
//! failures carry no body detail; validation failures carry a short reason.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use paygate_billing::BillingError;
use serde_json::json;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("authentication required")]
    Unauthorized,
    #[error("forbidden")]
    Forbidden,
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    NotFound(String),
    #[error("service temporarily unavailable")]
    ServiceUnavailable,
    #[error("internal error")]
    Internal,
}

impl From<BillingError> for ApiError {
    fn from(e: BillingError) -> Self {
        if e.is_transient() {
            tracing::error!(error = %e, "Transient infrastructure failure");
            return ApiError::ServiceUnavailable;
        }

        match e {
            BillingError::SignatureInvalid | BillingError::StaleTimestamp => ApiError::Unauthorized,
            BillingError::Validation(msg) | BillingError::InvalidPayload(msg) => {
                ApiError::BadRequest(msg)
            }
            BillingError::MetadataMissing(what) => {
                ApiError::BadRequest(format!("missing metadata: {what}"))
            }
            BillingError::NotFound(what) | BillingError::ProviderNotFound(what) => {
                ApiError::NotFound(what)
            }
            BillingError::Internal(msg) => {
                tracing::error!(error = %msg, "Internal error");
                ApiError::Internal
            }
            // is_transient() handled these above.
            BillingError::Database(_) | BillingError::ProviderApi(_) => ApiError::ServiceUnavailable,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, "Authentication required".into()),
            ApiError::Forbidden => (StatusCode::FORBIDDEN, "Forbidden".into()),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            ApiError::ServiceUnavailable => (
                StatusCode::SERVICE_UNAVAILABLE,
                "Service temporarily unavailable, retry later".into(),
            ),
            ApiError::Internal => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal server error".into(),
            ),
        };

        let body = Json(json!({
            "error": message,
            "code": status.as_u16(),
        }));

        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_errors_map_to_503() {
        let api: ApiError = BillingError::ProviderApi("timeout".into()).into();
        assert!(matches!(api, ApiError::ServiceUnavailable));
    }

    #[test]
    fn signature_failures_map_to_401() {
        let api: ApiError = BillingError::SignatureInvalid.into();
        assert!(matches!(api, ApiError::Unauthorized));

        let api: ApiError = BillingError::StaleTimestamp.into();
        assert!(matches!(api, ApiError::Unauthorized));
    }

    #[test]
    fn validation_failures_map_to_400() {
        let api: ApiError = BillingError::Validation("reason is required".into()).into();
        assert!(matches!(api, ApiError::BadRequest(_)));

        let api: ApiError = BillingError::InvalidPayload("not json".into()).into();
        assert!(matches!(api, ApiError::BadRequest(_)));
    }

    #[test]
    fn not_found_maps_to_404() {
        let api: ApiError = BillingError::NotFound("grant".into()).into();
        assert!(matches!(api, ApiError::NotFound(_)));
    }
}
