//! Entitlement read cache.
//!
//! Replica-local TTL cache keyed `ent:{tenant_id}:{user_id}` over the
//! serialized aggregated view. The cache is advisory: the database is the
//! source of truth, so every failure mode here degrades to a miss and a
//! direct database read. Writers evict strictly after their transaction
//! commits; nothing populates the cache inside a transaction.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;

use crate::models::AggregatedEntitlement;

/// Reference TTL; overridable via configuration.
pub const DEFAULT_TTL: Duration = Duration::from_secs(300);

/// Bounded entries so a scan of unique users cannot exhaust memory.
const MAX_ENTRIES: usize = 100_000;

#[derive(Debug, Clone)]
struct CacheEntry {
    payload: String,
    inserted_at: Instant,
    expires_at: Instant,
}

/// Shared entitlement cache handle.
#[derive(Clone)]
pub struct EntitlementCache {
    entries: Arc<RwLock<HashMap<String, CacheEntry>>>,
    ttl: Duration,
    max_entries: usize,
}

pub fn cache_key(tenant_id: &str, user_id: &str) -> String {
    format!("ent:{tenant_id}:{user_id}")
}

impl EntitlementCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
            ttl,
            max_entries: MAX_ENTRIES,
        }
    }

    #[cfg(test)]
    fn with_capacity(ttl: Duration, max_entries: usize) -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
            ttl,
            max_entries,
        }
    }

    /// Fetch the cached view for a pair. Expired or undecodable entries read
    /// as misses.
    pub async fn get(
        &self,
        tenant_id: &str,
        user_id: &str,
    ) -> Option<Vec<AggregatedEntitlement>> {
        let key = cache_key(tenant_id, user_id);
        let payload = {
            let entries = self.entries.read().await;
            let entry = entries.get(&key)?;
            if Instant::now() >= entry.expires_at {
                None
            } else {
                Some(entry.payload.clone())
            }
        };

        match payload {
            Some(payload) => match serde_json::from_str(&payload) {
                Ok(view) => Some(view),
                Err(e) => {
                    // Treat a corrupt entry as a miss; the read path will
                    // repopulate from the database.
                    tracing::warn!(key = %key, error = %e, "Dropping undecodable cache entry");
                    self.entries.write().await.remove(&key);
                    None
                }
            },
            None => None,
        }
    }

    /// Store the view for a pair, best-effort. Serialization failures are
    /// logged and ignored.
    pub async fn put(&self, tenant_id: &str, user_id: &str, view: &[AggregatedEntitlement]) {
        let key = cache_key(tenant_id, user_id);
        let payload = match serde_json::to_string(view) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Failed to serialize cache entry");
                return;
            }
        };

        let now = Instant::now();
        let mut entries = self.entries.write().await;

        // Drop expired entries first, then the oldest, to stay bounded.
        if entries.len() >= self.max_entries && !entries.contains_key(&key) {
            entries.retain(|_, entry| now < entry.expires_at);
            if entries.len() >= self.max_entries {
                if let Some(oldest) = entries
                    .iter()
                    .min_by_key(|(_, entry)| entry.inserted_at)
                    .map(|(k, _)| k.clone())
                {
                    entries.remove(&oldest);
                }
            }
        }

        entries.insert(
            key,
            CacheEntry {
                payload,
                inserted_at: now,
                expires_at: now + self.ttl,
            },
        );
    }

    /// Evict the entry for a pair. Called after every state-changing commit.
    pub async fn invalidate(&self, tenant_id: &str, user_id: &str) {
        let key = cache_key(tenant_id, user_id);
        self.entries.write().await.remove(&key);
        tracing::debug!(key = %key, "Evicted entitlement cache entry");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::EntitlementSource;
    use time::OffsetDateTime;

    fn view(feature: &str) -> Vec<AggregatedEntitlement> {
        vec![AggregatedEntitlement {
            feature_code: feature.to_string(),
            is_active: true,
            valid_from: OffsetDateTime::from_unix_timestamp(1_700_000_000).unwrap(),
            valid_to: None,
            source: EntitlementSource::Manual,
        }]
    }

    #[tokio::test]
    async fn round_trips_through_serialization() {
        let cache = EntitlementCache::new(DEFAULT_TTL);
        let stored = view("pro");
        cache.put("t_1", "u_1", &stored).await;

        assert_eq!(cache.get("t_1", "u_1").await, Some(stored));
        assert_eq!(cache.get("t_1", "u_2").await, None);
    }

    #[tokio::test]
    async fn entries_expire_after_ttl() {
        let cache = EntitlementCache::new(Duration::from_millis(10));
        cache.put("t_1", "u_1", &view("pro")).await;
        assert!(cache.get("t_1", "u_1").await.is_some());

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(cache.get("t_1", "u_1").await, None);
    }

    #[tokio::test]
    async fn invalidate_removes_the_pair_only() {
        let cache = EntitlementCache::new(DEFAULT_TTL);
        cache.put("t_1", "u_1", &view("pro")).await;
        cache.put("t_1", "u_2", &view("pro")).await;

        cache.invalidate("t_1", "u_1").await;

        assert_eq!(cache.get("t_1", "u_1").await, None);
        assert!(cache.get("t_1", "u_2").await.is_some());
    }

    #[tokio::test]
    async fn capacity_is_bounded_by_evicting_oldest() {
        let cache = EntitlementCache::with_capacity(DEFAULT_TTL, 2);
        cache.put("t_1", "u_1", &view("a")).await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        cache.put("t_1", "u_2", &view("b")).await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        cache.put("t_1", "u_3", &view("c")).await;

        let entries = cache.entries.read().await;
        assert_eq!(entries.len(), 2);
        assert!(!entries.contains_key(&cache_key("t_1", "u_1")));
    }

    #[test]
    fn key_protocol_is_stable() {
        assert_eq!(cache_key("t_1", "u_9"), "ent:t_1:u_9");
    }
}
