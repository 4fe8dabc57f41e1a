//! Application state.

use std::sync::Arc;

use sqlx::PgPool;
use time::Duration;

use paygate_billing::{
    AuditLogger, EntitlementCache, GrantService, HttpProviderClient, InvariantChecker, ProviderApi,
    Reconciler, WebhookConfig, WebhookHandler,
};

use crate::config::Config;

/// Shared application state, cloned per request.
#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub config: Arc<Config>,
    pub cache: EntitlementCache,
    pub webhooks: Arc<WebhookHandler>,
    pub grants: Arc<GrantService>,
    pub reconciler: Arc<Reconciler>,
    pub invariants: Arc<InvariantChecker>,
}

impl AppState {
    pub fn new(pool: PgPool, config: Config) -> anyhow::Result<Self> {
        let provider: Arc<dyn ProviderApi> = Arc::new(HttpProviderClient::new(
            &config.provider_api_base,
            &config.provider_secret_key,
        )?);

        let cache = EntitlementCache::new(config.cache_ttl);
        let past_due_grace = Duration::days(config.past_due_grace_days);

        let webhooks = Arc::new(WebhookHandler::new(
            pool.clone(),
            cache.clone(),
            provider.clone(),
            WebhookConfig {
                signing_secret: config.webhook_signing_secret.clone(),
                skew_tolerance: config.webhook_skew_tolerance,
            },
            past_due_grace,
        ));

        let grants = Arc::new(GrantService::new(
            pool.clone(),
            cache.clone(),
            AuditLogger::new(pool.clone()),
            past_due_grace,
        ));

        let reconciler = Arc::new(Reconciler::new(
            pool.clone(),
            provider,
            cache.clone(),
            past_due_grace,
            config.reconciliation_lookback_days,
        ));

        let invariants = Arc::new(InvariantChecker::new(pool.clone(), past_due_grace));

        Ok(Self {
            pool,
            config: Arc::new(config),
            cache,
            webhooks,
            grants,
            reconciler,
            invariants,
        })
    }
}
