//! # Providers
//!
//! Backend drivers behind one capability contract, [`Provider`]. Four implementations
//! exist, selected by the plan's [`ProviderKind`]:
//!
//! | Kind                            | Type                          | Backend             |
//! |---------------------------------|-------------------------------|---------------------|
//! | `aws-redis-instance`            | [`AwsRedisProvider`]          | ElastiCache (redis) |
//! | `aws-memcached-instance`        | [`AwsMemcachedProvider`]      | ElastiCache (memcached) |
//! | `kubernetes-redis-instance`     | [`KubernetesRedisProvider`]   | Deployment + Service |
//! | `kubernetes-memcached-instance` | [`KubernetesMemcachedProvider`] | Deployment + Service |
//!
//! Providers never populate `id`, `username` or `password` on instances they describe;
//! those come from storage. Each provider owns an [`InstanceCache`] of resolved
//! instances.
//!
//! Backend waits are async polling loops driven by [`PollSettings`].

pub mod cache;
pub mod elasticache;
pub mod kubernetes;
pub mod native;
pub mod workflow;

pub use cache::InstanceCache;
pub use elasticache::{
    AwsElastiCache, AwsMemcachedProvider, AwsRedisProvider, ElastiCacheApi, InMemoryElastiCache,
};
pub use kubernetes::{
    InMemoryKubernetes, KubeClusterClient, KubernetesApi, KubernetesMemcachedProvider,
    KubernetesRedisProvider,
};
pub use workflow::{WorkflowFailure, WorkflowKind, WorkflowStep};

use crate::config::BrokerConfig;
use crate::error::{ProviderError, ProviderResult};
use crate::models::{BackupSpec, Instance, ProviderKind, ProviderPlan, Stat};
use async_trait::async_trait;
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Connection details handed to a bound application
pub type Credentials = BTreeMap<String, String>;

/// Capability contract every backend driver implements
#[async_trait]
pub trait Provider: Send + Sync + fmt::Debug {
    fn kind(&self) -> ProviderKind;

    /// Describe the live resource named `name`
    async fn get_instance(&self, name: &str, plan: &ProviderPlan) -> ProviderResult<Instance>;

    /// Create a new resource; `owner` is recorded as billing/ownership metadata
    async fn provision(&self, id: &str, plan: &ProviderPlan, owner: &str) -> ProviderResult<Instance>;

    async fn deprovision(&self, instance: &Instance, take_snapshot: bool) -> ProviderResult<()>;

    /// Move the resource to `plan`, in place or by recreating it
    async fn modify(&self, instance: &Instance, plan: &ProviderPlan) -> ProviderResult<Instance>;

    async fn tag(&self, instance: &Instance, key: &str, value: &str) -> ProviderResult<()>;

    async fn untag(&self, instance: &Instance, key: &str) -> ProviderResult<()>;

    async fn restart(&self, instance: &Instance) -> ProviderResult<()>;

    async fn perform_post_provision(&self, instance: &Instance) -> ProviderResult<Instance>;

    fn get_url(&self, instance: &Instance) -> Credentials;

    async fn flush(&self, instance: &Instance) -> ProviderResult<()>;

    async fn stats(&self, instance: &Instance) -> ProviderResult<Vec<Stat>>;

    async fn get_backup(&self, instance: &Instance, backup_id: &str) -> ProviderResult<BackupSpec>;

    async fn list_backups(&self, instance: &Instance) -> ProviderResult<Vec<BackupSpec>>;

    async fn create_backup(&self, instance: &Instance) -> ProviderResult<BackupSpec>;

    async fn restore_backup(&self, instance: &Instance, backup_id: &str) -> ProviderResult<()>;
}

/// Interval and attempt budget for backend wait loops
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSettings {
    pub interval: Duration,
    pub max_attempts: u32,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(15),
            max_attempts: 40,
        }
    }
}

impl PollSettings {
    pub fn from_config(config: &BrokerConfig) -> Self {
        Self {
            interval: config.poll_interval(),
            max_attempts: config.poll_max_attempts,
        }
    }

    /// Re-run `check` until it yields `true`, sleeping between attempts
    pub async fn until<F, Fut>(&self, what: &str, mut check: F) -> ProviderResult<()>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ProviderResult<bool>>,
    {
        for attempt in 1..=self.max_attempts {
            if check().await? {
                debug!(what = what, attempt = attempt, "Wait condition met");
                return Ok(());
            }
            if attempt < self.max_attempts {
                tokio::time::sleep(self.interval).await;
            }
        }
        Err(ProviderError::Timeout(what.to_string()))
    }
}

/// Random lowercase alphanumeric suffix for generated resource names
pub(crate) fn random_suffix(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(|c| char::from(c).to_ascii_lowercase())
        .collect()
}

/// Backend clients available to the registry
///
/// [`BackendClients::connect`] builds the SDK-backed clients outside test mode; the
/// broker itself only depends on the traits.
#[derive(Debug, Clone, Default)]
pub struct BackendClients {
    pub elasticache: Option<Arc<dyn ElastiCacheApi>>,
    pub kubernetes: Option<Arc<dyn KubernetesApi>>,
}

impl BackendClients {
    /// In-memory clients for both backends
    pub fn in_memory() -> Self {
        Self {
            elasticache: Some(Arc::new(InMemoryElastiCache::new())),
            kubernetes: Some(Arc::new(InMemoryKubernetes::new())),
        }
    }

    /// Clients for the configured backends
    ///
    /// Test mode gets in-memory clients. Otherwise ElastiCache is reached in `AWS_REGION`
    /// and, with `use_kubernetes`, the cluster from [`kubernetes::resolve_kube_context`].
    pub async fn connect(config: &BrokerConfig) -> ProviderResult<Self> {
        if config.test {
            return Ok(Self::in_memory());
        }
        let region = config
            .require_aws_region()
            .map_err(|e| ProviderError::NoProvider(e.to_string()))?;
        let elasticache: Arc<dyn ElastiCacheApi> = Arc::new(AwsElastiCache::connect(region).await);

        let kubernetes = if config.use_kubernetes {
            let context = kubernetes::resolve_kube_context(config)?;
            Some(Arc::new(KubeClusterClient::connect(&context).await?) as Arc<dyn KubernetesApi>)
        } else {
            None
        };
        Ok(Self {
            elasticache: Some(elasticache),
            kubernetes,
        })
    }
}

/// Provider lookup by plan
#[derive(Debug, Clone)]
pub struct ProviderRegistry {
    providers: HashMap<ProviderKind, Arc<dyn Provider>>,
}

impl ProviderRegistry {
    /// Build providers for every backend whose client is present
    ///
    /// In test mode, missing clients are replaced with in-memory ones. Container backends
    /// are only registered when `use_kubernetes` is set; managed backends need a region
    /// outside test mode. Use [`BackendClients::connect`] to build real clients.
    pub fn from_config(config: &BrokerConfig, clients: BackendClients) -> ProviderResult<Self> {
        let poll = PollSettings::from_config(config);
        let ttl = config.instance_cache_ttl();
        let mut providers: HashMap<ProviderKind, Arc<dyn Provider>> = HashMap::new();

        let elasticache = match clients.elasticache {
            Some(client) => Some(client),
            None if config.test => Some(Arc::new(InMemoryElastiCache::new()) as Arc<dyn ElastiCacheApi>),
            None => None,
        };
        if let Some(client) = elasticache {
            if !config.test {
                config
                    .require_aws_region()
                    .map_err(|e| ProviderError::NoProvider(e.to_string()))?;
            }
            providers.insert(
                ProviderKind::AwsRedis,
                Arc::new(AwsRedisProvider::new(
                    client.clone(),
                    &config.name_prefix,
                    ttl,
                    poll,
                )),
            );
            providers.insert(
                ProviderKind::AwsMemcached,
                Arc::new(AwsMemcachedProvider::new(client, &config.name_prefix, ttl, poll)),
            );
        }

        if config.use_kubernetes {
            let kubernetes = match clients.kubernetes {
                Some(client) => Some(client),
                None if config.test => Some(Arc::new(InMemoryKubernetes::new()) as Arc<dyn KubernetesApi>),
                None => None,
            };
            if let Some(client) = kubernetes {
                providers.insert(
                    ProviderKind::KubernetesRedis,
                    Arc::new(KubernetesRedisProvider::new(
                        client.clone(),
                        &config.name_prefix,
                        ttl,
                        poll,
                    )),
                );
                providers.insert(
                    ProviderKind::KubernetesMemcached,
                    Arc::new(KubernetesMemcachedProvider::new(
                        client,
                        &config.name_prefix,
                        ttl,
                        poll,
                    )),
                );
            }
        }

        info!(
            providers = ?providers.keys().map(ProviderKind::as_str).collect::<Vec<_>>(),
            test_mode = config.test,
            "🔌 Provider registry initialized"
        );
        Ok(Self { providers })
    }

    /// Register or replace the provider for a kind
    pub fn with_provider(mut self, provider: Arc<dyn Provider>) -> Self {
        self.providers.insert(provider.kind(), provider);
        self
    }

    pub fn provider_for(&self, plan: &ProviderPlan) -> ProviderResult<Arc<dyn Provider>> {
        self.providers.get(&plan.provider).cloned().ok_or_else(|| {
            ProviderError::NoProvider(format!(
                "Unable to find provider for plan {} ({})",
                plan.id, plan.provider
            ))
        })
    }

    /// Provider of the plan attached to a resolved instance
    pub fn provider_for_instance(&self, instance: &Instance) -> ProviderResult<Arc<dyn Provider>> {
        let plan = instance.plan.as_ref().ok_or_else(|| {
            ProviderError::NoProvider(format!("Instance {} has no plan attached", instance.id))
        })?;
        self.provider_for(plan)
    }

    pub fn is_registered(&self, kind: ProviderKind) -> bool {
        self.providers.contains_key(&kind)
    }
}

/// Result of a backup operation on a backend without snapshots
pub(crate) fn backups_unsupported<T>(engine: &str) -> ProviderResult<T> {
    Err(ProviderError::Unsupported(format!(
        "Backups are unavailable on {engine}"
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::CatalogPlan;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn config(pairs: &[(&str, &str)]) -> BrokerConfig {
        BrokerConfig::from_map(
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
        .unwrap()
    }

    fn plan(kind: ProviderKind) -> ProviderPlan {
        ProviderPlan::new("plan-1", kind, "redis", "{}", CatalogPlan::default())
    }

    #[test]
    fn test_random_suffix_is_lowercase() {
        let suffix = random_suffix(12);
        assert_eq!(suffix.len(), 12);
        assert_eq!(suffix, suffix.to_ascii_lowercase());
    }

    #[tokio::test]
    async fn test_poll_until_times_out() {
        let poll = PollSettings {
            interval: Duration::from_millis(1),
            max_attempts: 3,
        };
        let calls = AtomicU32::new(0);
        let result = poll
            .until("never", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(false)
            })
            .await;
        assert!(matches!(result, Err(ProviderError::Timeout(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_poll_until_stops_when_met() {
        let poll = PollSettings {
            interval: Duration::from_millis(1),
            max_attempts: 10,
        };
        let calls = AtomicU32::new(0);
        poll.until("second try", || async {
            Ok(calls.fetch_add(1, Ordering::SeqCst) >= 1)
        })
        .await
        .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_kubernetes_providers_need_flag() {
        let registry =
            ProviderRegistry::from_config(&config(&[("TEST", "true")]), BackendClients::default())
                .unwrap();
        assert!(registry.provider_for(&plan(ProviderKind::AwsRedis)).is_ok());
        assert!(registry
            .provider_for(&plan(ProviderKind::KubernetesMemcached))
            .is_err());

        let registry = ProviderRegistry::from_config(
            &config(&[("TEST", "true"), ("USE_KUBERNETES", "true")]),
            BackendClients::default(),
        )
        .unwrap();
        assert!(registry
            .provider_for(&plan(ProviderKind::KubernetesMemcached))
            .is_ok());
        assert!(registry.provider_for(&plan(ProviderKind::Unknown)).is_err());
    }

    #[test]
    fn test_managed_backends_need_region_outside_test_mode() {
        let result = ProviderRegistry::from_config(&config(&[]), BackendClients::in_memory());
        assert!(matches!(result, Err(ProviderError::NoProvider(_))));

        let registry = ProviderRegistry::from_config(
            &config(&[("AWS_REGION", "us-east-1")]),
            BackendClients::in_memory(),
        )
        .unwrap();
        assert!(registry.is_registered(ProviderKind::AwsMemcached));
    }

    #[tokio::test]
    async fn test_connect_in_test_mode_uses_in_memory_clients() {
        let clients = BackendClients::connect(&config(&[("TEST", "true")]))
            .await
            .unwrap();
        assert!(clients.elasticache.is_some());
        assert!(clients.kubernetes.is_some());
    }

    #[tokio::test]
    async fn test_connect_builds_sdk_clients_for_region() {
        let clients = BackendClients::connect(&config(&[("AWS_REGION", "eu-west-1")]))
            .await
            .unwrap();
        assert!(format!("{:?}", clients.elasticache.unwrap()).contains("eu-west-1"));
        assert!(clients.kubernetes.is_none());

        let registry = ProviderRegistry::from_config(
            &config(&[("AWS_REGION", "eu-west-1")]),
            BackendClients::connect(&config(&[("AWS_REGION", "eu-west-1")]))
                .await
                .unwrap(),
        )
        .unwrap();
        assert!(registry.is_registered(ProviderKind::AwsRedis));
        assert!(registry.is_registered(ProviderKind::AwsMemcached));
    }

    #[tokio::test]
    async fn test_connect_without_region_fails() {
        let result = BackendClients::connect(&config(&[])).await;
        assert!(matches!(result, Err(ProviderError::NoProvider(_))));
    }
}
