//! Short-lived read cache of resolved instances (moka)
//!
//! Keyed by `(name, plan id)`. Entries expire after the configured TTL; providers
//! invalidate explicitly after any write they perform against the backend. Staleness
//! within the TTL is acceptable since the broker never treats provider state as strongly
//! consistent with storage. A zero TTL disables caching.

use crate::error::{ProviderError, ProviderResult};
use crate::models::Instance;
use std::future::Future;
use std::time::Duration;
use tracing::debug;

const MAX_CAPACITY: u64 = 10_000;

#[derive(Clone)]
pub struct InstanceCache {
    cache: moka::future::Cache<(String, String), Instance>,
    ttl: Duration,
}

impl std::fmt::Debug for InstanceCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstanceCache")
            .field("entry_count", &self.cache.entry_count())
            .field("ttl", &self.ttl)
            .finish()
    }
}

impl InstanceCache {
    pub fn new(ttl: Duration) -> Self {
        let cache = moka::future::Cache::builder()
            .max_capacity(MAX_CAPACITY)
            .time_to_live(ttl)
            .support_invalidation_closures()
            .build();
        Self { cache, ttl }
    }

    fn key(name: &str, plan_id: &str) -> (String, String) {
        (name.to_string(), plan_id.to_string())
    }

    pub async fn get(&self, name: &str, plan_id: &str) -> Option<Instance> {
        self.cache.get(&Self::key(name, plan_id)).await
    }

    /// Return the cached instance, or run `load` and cache its result
    ///
    /// Errors are not cached, so a failed lookup is retried on the next call.
    pub async fn get_or_load<F, Fut>(&self, name: &str, plan_id: &str, load: F) -> ProviderResult<Instance>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = ProviderResult<Instance>>,
    {
        if self.ttl.is_zero() {
            return load().await;
        }
        let key = Self::key(name, plan_id);
        if let Some(hit) = self.cache.get(&key).await {
            debug!(name = name, plan_id = plan_id, "Instance cache HIT");
            return Ok(hit);
        }
        debug!(name = name, plan_id = plan_id, "Instance cache MISS");
        self.cache
            .try_get_with(key, load())
            .await
            .map_err(|shared: std::sync::Arc<ProviderError>| (*shared).clone())
    }

    pub async fn insert(&self, instance: Instance, plan_id: &str) {
        if self.ttl.is_zero() {
            return;
        }
        let key = Self::key(&instance.name, plan_id);
        self.cache.insert(key, instance).await;
    }

    /// Drop every cached plan variant of `name`
    pub async fn invalidate(&self, name: &str) {
        let name = name.to_string();
        if self
            .cache
            .invalidate_entries_if(move |key, _| key.0 == name)
            .is_err()
        {
            self.cache.invalidate_all();
        }
        self.cache.run_pending_tasks().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn instance(name: &str, status: &str) -> Instance {
        Instance {
            id: String::new(),
            name: name.into(),
            provider_id: name.into(),
            plan: None,
            username: String::new(),
            password: String::new(),
            endpoint: "localhost:6379".into(),
            status: status.into(),
            ready: status == "available",
            engine: "redis".into(),
            engine_version: "7.0".into(),
            scheme: "redis".into(),
        }
    }

    #[tokio::test]
    async fn test_read_through_loads_once() {
        let cache = InstanceCache::new(Duration::from_secs(60));
        let loads = AtomicUsize::new(0);

        for _ in 0..3 {
            let found = cache
                .get_or_load("cacheabc", "plan-1", || async {
                    loads.fetch_add(1, Ordering::SeqCst);
                    Ok(instance("cacheabc", "available"))
                })
                .await
                .unwrap();
            assert_eq!(found.status, "available");
        }
        assert_eq!(loads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_errors_are_not_cached() {
        let cache = InstanceCache::new(Duration::from_secs(60));
        let err = cache
            .get_or_load("missing", "plan-1", || async {
                Err(ProviderError::NotFound("missing".into()))
            })
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        assert!(cache.get("missing", "plan-1").await.is_none());
    }

    #[tokio::test]
    async fn test_invalidate_drops_all_plans_for_name() {
        let cache = InstanceCache::new(Duration::from_secs(60));
        cache.insert(instance("cacheabc", "available"), "plan-1").await;
        cache.insert(instance("cacheabc", "available"), "plan-2").await;
        cache.insert(instance("cachexyz", "available"), "plan-1").await;

        cache.invalidate("cacheabc").await;

        assert!(cache.get("cacheabc", "plan-1").await.is_none());
        assert!(cache.get("cacheabc", "plan-2").await.is_none());
        assert!(cache.get("cachexyz", "plan-1").await.is_some());
    }

    #[tokio::test]
    async fn test_zero_ttl_always_loads() {
        let cache = InstanceCache::new(Duration::ZERO);
        let loads = AtomicUsize::new(0);
        for _ in 0..2 {
            cache
                .get_or_load("cacheabc", "plan-1", || async {
                    loads.fetch_add(1, Ordering::SeqCst);
                    Ok(instance("cacheabc", "creating"))
                })
                .await
                .unwrap();
        }
        assert_eq!(loads.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_entries_expire_after_ttl() {
        let cache = InstanceCache::new(Duration::from_millis(50));
        cache.insert(instance("cacheabc", "creating"), "plan-1").await;
        assert!(cache.get("cacheabc", "plan-1").await.is_some());
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(cache.get("cacheabc", "plan-1").await.is_none());
    }
}
