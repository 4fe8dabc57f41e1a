//! Credential verification and tenant-scope enforcement.
//!
//! Tenant credentials are bearer tokens stored only as SHA-256 hashes;
//! lookup goes through the hash index and the fetched hash is confirmed in
//! constant time. The admin credential is a separately configured secret,
//! also compared through hashes so the comparison is length-independent.

use axum::http::header::AUTHORIZATION;
use axum::http::HeaderMap;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use paygate_billing::{store, Tenant};

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

/// SHA-256 hex digest of a credential. Credentials are random >=128-bit
/// strings, so an unsalted one-way hash is sufficient.
pub fn hash_credential(credential: &str) -> String {
    hex::encode(Sha256::digest(credential.as_bytes()))
}

/// Constant-time equality of a stored hash against a presented credential.
pub fn verify_credential(stored_hash: &str, presented: &str) -> bool {
    let presented_hash = hash_credential(presented);
    stored_hash.as_bytes().ct_eq(presented_hash.as_bytes()).into()
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .filter(|token| !token.is_empty())
}

/// Resolve the tenant behind the request's bearer credential.
pub async fn authenticate_tenant(state: &AppState, headers: &HeaderMap) -> ApiResult<Tenant> {
    let token = bearer_token(headers).ok_or(ApiError::Unauthorized)?;
    let hash = hash_credential(token);

    let resolved = store::find_tenant_by_credential_hash(&state.pool, &hash)
        .await
        .map_err(ApiError::from)?
        .ok_or(ApiError::Unauthorized)?;

    if !verify_credential(&resolved.credential_hash, token) {
        return Err(ApiError::Unauthorized);
    }

    if !resolved.tenant.active {
        tracing::warn!(tenant_id = %resolved.tenant.tenant_id, "Inactive tenant rejected");
        return Err(ApiError::Forbidden);
    }

    Ok(resolved.tenant)
}

/// Verify the admin credential and return the actor identifier recorded in
/// audit lines.
pub fn require_admin(state: &AppState, headers: &HeaderMap) -> ApiResult<String> {
    let token = bearer_token(headers).ok_or(ApiError::Unauthorized)?;

    let expected = hash_credential(&state.config.admin_api_key);
    if !verify_credential(&expected, token) {
        return Err(ApiError::Unauthorized);
    }

    Ok("admin".to_string())
}

/// A request parameter naming a tenant must match the resolved tenant.
pub fn ensure_tenant_scope(tenant: &Tenant, requested: Option<&str>) -> ApiResult<()> {
    match requested {
        Some(requested) if requested != tenant.tenant_id => {
            tracing::warn!(
                tenant_id = %tenant.tenant_id,
                requested = %requested,
                "Tenant scope mismatch"
            );
            Err(ApiError::Forbidden)
        }
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hashing_is_stable_and_hex_encoded() {
        let hash = hash_credential("tok_abc");
        assert_eq!(hash, hash_credential("tok_abc"));
        assert_eq!(hash.len(), 64);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn verify_accepts_only_the_matching_credential() {
        let stored = hash_credential("tok_abc");
        assert!(verify_credential(&stored, "tok_abc"));
        assert!(!verify_credential(&stored, "tok_abd"));
        assert!(!verify_credential(&stored, ""));
        assert!(!verify_credential(&stored, "tok_abc "));
    }

    #[test]
    fn verify_handles_every_single_byte_flip() {
        let stored = hash_credential("tok_0123456789abcdef");
        let base = "tok_0123456789abcdef".as_bytes().to_vec();

        for i in 0..base.len() {
            let mut flipped = base.clone();
            flipped[i] ^= 0x01;
            let candidate = String::from_utf8(flipped).unwrap();
            assert!(
                !verify_credential(&stored, &candidate),
                "flip at {i} must fail"
            );
        }
    }

    #[test]
    fn tenant_scope_rejects_mismatched_tenant() {
        let tenant = Tenant {
            id: uuid::Uuid::new_v4(),
            tenant_id: "tenant_a".into(),
            name: "Tenant A".into(),
            active: true,
            created_at: time::OffsetDateTime::from_unix_timestamp(1_700_000_000).unwrap(),
        };

        assert!(ensure_tenant_scope(&tenant, None).is_ok());
        assert!(ensure_tenant_scope(&tenant, Some("tenant_a")).is_ok());
        assert!(matches!(
            ensure_tenant_scope(&tenant, Some("tenant_b")),
            Err(ApiError::Forbidden)
        ));
    }

    #[test]
    fn bearer_extraction_requires_the_scheme() {
        let mut headers = HeaderMap::new();
        assert_eq!(bearer_token(&headers), None);

        headers.insert(AUTHORIZATION, "tok_raw".parse().unwrap());
        assert_eq!(bearer_token(&headers), None);

        headers.insert(AUTHORIZATION, "Bearer ".parse().unwrap());
        assert_eq!(bearer_token(&headers), None);

        headers.insert(AUTHORIZATION, "Bearer tok_abc".parse().unwrap());
        assert_eq!(bearer_token(&headers), Some("tok_abc"));
    }
}
