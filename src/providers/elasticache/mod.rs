//! # Managed Cache Providers
//!
//! Redis and Memcached clusters on ElastiCache. Both engines share cluster bookkeeping
//! through [`ClusterDriver`]: describe, create, delete, tag and reboot, plus the waiters
//! used by the recreate-style workflows. Engine-specific behavior (modification strategy,
//! snapshots, native protocol access) lives in the `redis` and `memcached` modules.

pub mod client;
pub mod memcached;
pub mod redis;
pub mod sdk;

pub use client::{
    CacheCluster, CreateCacheClusterInput, DeleteCacheClusterInput, ElastiCacheApi,
    ElastiCacheOperation, InMemoryElastiCache, ModifyCacheClusterInput, Snapshot, Tag,
};
pub use memcached::AwsMemcachedProvider;
pub use redis::AwsRedisProvider;
pub use sdk::AwsElastiCache;

use crate::error::{ProviderError, ProviderResult};
use crate::models::{BackupSpec, Instance, ProviderPlan};
use crate::providers::{random_suffix, InstanceCache, PollSettings};
use crate::status;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Tag recording the owning organization on new clusters
pub const BILLING_TAG: &str = "BillingCode";

/// Length of the random part of generated cluster ids
const CLUSTER_ID_SUFFIX_LEN: usize = 8;

/// Cluster operations shared by both managed engines
#[derive(Debug)]
pub struct ClusterDriver {
    client: Arc<dyn ElastiCacheApi>,
    name_prefix: String,
    cache: InstanceCache,
    poll: PollSettings,
}

impl ClusterDriver {
    pub fn new(
        client: Arc<dyn ElastiCacheApi>,
        name_prefix: &str,
        cache_ttl: Duration,
        poll: PollSettings,
    ) -> Self {
        Self {
            client,
            name_prefix: name_prefix.to_string(),
            cache: InstanceCache::new(cache_ttl),
            poll,
        }
    }

    pub fn client(&self) -> &Arc<dyn ElastiCacheApi> {
        &self.client
    }

    pub fn cache(&self) -> &InstanceCache {
        &self.cache
    }

    pub fn poll(&self) -> PollSettings {
        self.poll
    }

    /// Decode the plan's private settings
    pub fn settings(plan: &ProviderPlan) -> ProviderResult<CreateCacheClusterInput> {
        Ok(plan.settings::<CreateCacheClusterInput>()?)
    }

    /// `lower(name_prefix + random)`
    pub fn generate_cluster_id(&self) -> String {
        format!("{}{}", self.name_prefix, random_suffix(CLUSTER_ID_SUFFIX_LEN)).to_lowercase()
    }

    pub fn instance_from_cluster(
        id: &str,
        name: &str,
        plan: &ProviderPlan,
        cluster: &CacheCluster,
    ) -> Instance {
        Instance {
            id: id.to_string(),
            name: name.to_string(),
            provider_id: cluster.cache_cluster_id.clone(),
            plan: Some(plan.clone()),
            username: String::new(),
            password: String::new(),
            endpoint: cluster.endpoint(),
            status: cluster.cache_cluster_status.clone(),
            ready: status::is_ready(&cluster.cache_cluster_status),
            engine: cluster.engine.clone(),
            engine_version: cluster.engine_version.clone(),
            scheme: plan.scheme.clone(),
        }
    }

    pub async fn get_instance(&self, name: &str, plan: &ProviderPlan) -> ProviderResult<Instance> {
        self.cache
            .get_or_load(name, &plan.id, || async {
                let cluster = self.client.describe_cache_cluster(name).await?;
                Ok(Self::instance_from_cluster("", name, plan, &cluster))
            })
            .await
    }

    /// Create a cluster with a generated id and the owner's billing tag
    pub async fn provision(&self, id: &str, plan: &ProviderPlan, owner: &str) -> ProviderResult<Instance> {
        let mut settings = Self::settings(plan)?;
        settings.cache_cluster_id = Some(self.generate_cluster_id());
        settings.tags = vec![Tag::new(BILLING_TAG, owner)];
        self.provision_with_settings(id, plan, settings).await
    }

    pub async fn provision_with_settings(
        &self,
        id: &str,
        plan: &ProviderPlan,
        settings: CreateCacheClusterInput,
    ) -> ProviderResult<Instance> {
        let cluster = self.client.create_cache_cluster(settings).await?;
        info!(
            instance_id = id,
            cache_cluster_id = %cluster.cache_cluster_id,
            plan_id = %plan.id,
            status = %cluster.cache_cluster_status,
            "🚀 Cache cluster created"
        );
        self.cache.invalidate(&cluster.cache_cluster_id).await;
        Ok(Self::instance_from_cluster(
            id,
            &cluster.cache_cluster_id,
            plan,
            &cluster,
        ))
    }

    pub async fn delete(&self, instance: &Instance, final_snapshot: Option<String>) -> ProviderResult<()> {
        self.client
            .delete_cache_cluster(DeleteCacheClusterInput {
                cache_cluster_id: instance.provider_id.clone(),
                final_snapshot_identifier: final_snapshot.clone(),
            })
            .await?;
        self.cache.invalidate(&instance.name).await;
        info!(
            instance_id = %instance.id,
            cache_cluster_id = %instance.provider_id,
            final_snapshot = ?final_snapshot,
            "🗑️ Cache cluster deletion started"
        );
        Ok(())
    }

    pub async fn tag(&self, instance: &Instance, key: &str, value: &str) -> ProviderResult<()> {
        self.client
            .add_tags(&instance.provider_id, vec![Tag::new(key, value)])
            .await
    }

    pub async fn untag(&self, instance: &Instance, key: &str) -> ProviderResult<()> {
        self.client
            .remove_tags(&instance.provider_id, vec![key.to_string()])
            .await
    }

    /// Reboot every node of a ready cluster
    pub async fn restart(&self, instance: &Instance) -> ProviderResult<()> {
        if !instance.ready {
            return Err(ProviderError::InvalidState(
                "Cannot restart a cache that is unavailable.".to_string(),
            ));
        }
        let cluster = self.client.describe_cache_cluster(&instance.provider_id).await?;
        let nodes = cluster.node_ids();
        if nodes.is_empty() {
            return Err(ProviderError::Backend(
                "No cluster or nodes were found to reboot.".to_string(),
            ));
        }
        self.client
            .reboot_cache_cluster(&instance.provider_id, nodes)
            .await?;
        self.cache.invalidate(&instance.name).await;
        Ok(())
    }

    /// Poll until the backend stops reporting the cluster
    pub async fn wait_until_deleted(&self, cache_cluster_id: &str) -> ProviderResult<()> {
        self.poll
            .until(&format!("deletion of {cache_cluster_id}"), || async {
                match self.client.describe_cache_cluster(cache_cluster_id).await {
                    Err(e) if e.is_not_found() => Ok(true),
                    Err(e) => Err(e),
                    Ok(cluster) => {
                        debug!(
                            cache_cluster_id = cache_cluster_id,
                            status = %cluster.cache_cluster_status,
                            "Waiting for cluster deletion"
                        );
                        Ok(false)
                    }
                }
            })
            .await
    }

    /// Poll until the cluster is available, returning its final description
    pub async fn wait_until_available(&self, cache_cluster_id: &str) -> ProviderResult<CacheCluster> {
        self.poll
            .until(&format!("availability of {cache_cluster_id}"), || async {
                let cluster = self.client.describe_cache_cluster(cache_cluster_id).await?;
                Ok(status::is_available(&cluster.cache_cluster_status))
            })
            .await?;
        self.client.describe_cache_cluster(cache_cluster_id).await
    }

    /// Poll until the first node reports an endpoint
    pub async fn wait_for_endpoint(&self, cache_cluster_id: &str) -> ProviderResult<CacheCluster> {
        self.poll
            .until(&format!("endpoint of {cache_cluster_id}"), || async {
                let cluster = self.client.describe_cache_cluster(cache_cluster_id).await?;
                Ok(!cluster.endpoint().is_empty())
            })
            .await?;
        self.client.describe_cache_cluster(cache_cluster_id).await
    }
}

/// Describe a snapshot as a backup of `resource_name`
///
/// Snapshots with no node data cannot be restored and are rejected.
pub fn backup_from_snapshot(resource_name: &str, snapshot: &Snapshot) -> ProviderResult<BackupSpec> {
    if snapshot.node_snapshots.is_empty() {
        return Err(ProviderError::Backend(format!(
            "No data for any nodes was found in backup {}",
            snapshot.snapshot_name
        )));
    }
    Ok(BackupSpec::new(
        resource_name,
        &snapshot.snapshot_name,
        &snapshot.snapshot_status,
        snapshot.created_at(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CatalogPlan, ProviderKind};

    fn driver(api: Arc<InMemoryElastiCache>) -> ClusterDriver {
        ClusterDriver::new(
            api,
            "Cache",
            Duration::from_secs(60),
            PollSettings {
                interval: Duration::from_millis(1),
                max_attempts: 5,
            },
        )
    }

    fn plan() -> ProviderPlan {
        ProviderPlan::new(
            "plan-1",
            ProviderKind::AwsRedis,
            "redis",
            r#"{"CacheNodeType":"cache.t2.micro","Engine":"redis","NumCacheNodes":1}"#,
            CatalogPlan::default(),
        )
    }

    #[test]
    fn test_generated_ids_are_lowercase_with_prefix() {
        let driver = driver(Arc::new(InMemoryElastiCache::new()));
        let id = driver.generate_cluster_id();
        assert!(id.starts_with("cache"));
        assert_eq!(id.len(), "cache".len() + 8);
        assert_eq!(id, id.to_lowercase());
    }

    #[tokio::test]
    async fn test_provision_tags_owner_and_never_sets_credentials() {
        let api = Arc::new(InMemoryElastiCache::new());
        let driver = driver(api.clone());
        let instance = driver.provision("instance-1", &plan(), "org-7").await.unwrap();

        assert_eq!(instance.id, "instance-1");
        assert!(instance.username.is_empty());
        assert!(instance.password.is_empty());
        assert_eq!(instance.status, "creating");
        assert!(!instance.ready);
        assert_eq!(
            api.tags(&instance.provider_id).get(BILLING_TAG).map(String::as_str),
            Some("org-7")
        );
    }

    #[tokio::test]
    async fn test_wait_until_deleted_times_out_when_stuck() {
        let api = Arc::new(InMemoryElastiCache::new().without_auto_advance());
        let driver = driver(api.clone());
        let instance = driver.provision("instance-1", &plan(), "org").await.unwrap();
        api.settle(&instance.provider_id);
        driver.delete(&instance, None).await.unwrap();

        let err = driver
            .wait_until_deleted(&instance.provider_id)
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Timeout(_)));

        api.settle(&instance.provider_id);
        driver.wait_until_deleted(&instance.provider_id).await.unwrap();
    }

    #[test]
    fn test_snapshot_without_nodes_is_rejected() {
        let snapshot = Snapshot {
            snapshot_name: "s".into(),
            cache_cluster_id: "c".into(),
            snapshot_status: "available".into(),
            engine: "redis".into(),
            node_snapshots: vec![],
        };
        assert!(backup_from_snapshot("c", &snapshot).is_err());
    }
}
