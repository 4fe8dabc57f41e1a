//! Billing error types.
//!
//! Every fallible core operation returns [`BillingResult`]. Errors carry a
//! permanent/transient classification: transient failures invite a retry
//! (the provider re-delivers, a 503 goes out), permanent failures are
//! acknowledged and recorded so the provider stops retrying.

/// Errors produced by the billing core.
#[derive(Debug, thiserror::Error)]
pub enum BillingError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("provider api error: {0}")]
    ProviderApi(String),

    #[error("provider object not found: {0}")]
    ProviderNotFound(String),

    #[error("webhook signature invalid")]
    SignatureInvalid,

    #[error("webhook timestamp outside tolerance")]
    StaleTimestamp,

    #[error("malformed event payload: {0}")]
    InvalidPayload(String),

    #[error("missing required metadata: {0}")]
    MetadataMissing(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl BillingError {
    /// Transient failures should be retried by the caller (HTTP 503 at the
    /// boundary, `failed_transient` on the event record). Everything else is
    /// permanent: retrying the same input cannot succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Database(_) | Self::ProviderApi(_))
    }
}

pub type BillingResult<T> = Result<T, BillingError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_splits_retryable_from_permanent() {
        assert!(BillingError::ProviderApi("timeout".into()).is_transient());
        assert!(BillingError::Database(sqlx::Error::PoolTimedOut).is_transient());

        assert!(!BillingError::MetadataMissing("tenant_id".into()).is_transient());
        assert!(!BillingError::InvalidPayload("not json".into()).is_transient());
        assert!(!BillingError::SignatureInvalid.is_transient());
        assert!(!BillingError::NotFound("sub_1".into()).is_transient());
    }
}
