//! Application configuration.
//!
//! Loaded once from the environment at startup and passed explicitly into
//! constructors. Secrets are read here and never logged.

use std::time::Duration;

use anyhow::Context;

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub bind_address: String,
    pub db_max_connections: u32,

    pub webhook_signing_secret: String,
    pub webhook_skew_tolerance: Duration,

    pub provider_api_base: String,
    pub provider_secret_key: String,

    pub admin_api_key: String,

    pub cache_ttl: Duration,
    pub past_due_grace_days: i64,

    pub reconciliation_enabled: bool,
    pub reconciliation_hour_utc: u8,
    pub reconciliation_lookback_days: i64,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(&|key| std::env::var(key).ok())
    }

    /// Build from a key lookup function; the seam tests use.
    pub fn from_lookup(lookup: &dyn Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let required = |key: &str| {
            lookup(key).with_context(|| format!("missing required environment variable {key}"))
        };

        let reconciliation_hour_utc: u8 = parse_or(lookup, "RECONCILIATION_HOUR_UTC", 2)?;
        anyhow::ensure!(
            reconciliation_hour_utc < 24,
            "RECONCILIATION_HOUR_UTC must be 0-23"
        );

        Ok(Self {
            database_url: required("DATABASE_URL")?,
            bind_address: lookup("BIND_ADDRESS").unwrap_or_else(|| "0.0.0.0:8080".to_string()),
            db_max_connections: parse_or(lookup, "DB_MAX_CONNECTIONS", 10)?,

            webhook_signing_secret: required("WEBHOOK_SIGNING_SECRET")?,
            webhook_skew_tolerance: Duration::from_secs(parse_or(
                lookup,
                "WEBHOOK_SKEW_TOLERANCE_SECONDS",
                300,
            )?),

            provider_api_base: required("PROVIDER_API_BASE")?,
            provider_secret_key: required("PROVIDER_SECRET_KEY")?,

            admin_api_key: required("ADMIN_API_KEY")?,

            cache_ttl: Duration::from_secs(parse_or(lookup, "CACHE_TTL_SECONDS", 300)?),
            past_due_grace_days: parse_or(lookup, "PAST_DUE_GRACE_DAYS", 0)?,

            reconciliation_enabled: parse_or(lookup, "RECONCILIATION_ENABLED", true)?,
            reconciliation_hour_utc,
            reconciliation_lookback_days: parse_or(lookup, "RECONCILIATION_LOOKBACK_DAYS", 7)?,
        })
    }
}

fn parse_or<T>(
    lookup: &dyn Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> anyhow::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(raw) => raw
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid {key}={raw}: {e}")),
        None => Ok(default),
    }
}
