//! # Managed Memcached Provider
//!
//! Memcached clusters expose almost nothing that can change in place, so a plan change
//! destroys the cluster and creates it again under the same identifier. Data is lost on
//! modify and no snapshots exist.

use super::{ClusterDriver, ElastiCacheApi};
use crate::error::{ProviderError, ProviderResult};
use crate::models::{BackupSpec, Instance, ProviderKind, ProviderPlan, Stat};
use crate::providers::workflow::{WorkflowKind, WorkflowProgress, WorkflowStep};
use crate::providers::{backups_unsupported, native, Credentials, PollSettings, Provider};
use crate::status;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::instrument;

#[derive(Debug)]
pub struct AwsMemcachedProvider {
    driver: ClusterDriver,
}

impl AwsMemcachedProvider {
    pub fn new(
        client: Arc<dyn ElastiCacheApi>,
        name_prefix: &str,
        cache_ttl: Duration,
        poll: PollSettings,
    ) -> Self {
        Self {
            driver: ClusterDriver::new(client, name_prefix, cache_ttl, poll),
        }
    }
}

#[async_trait]
impl Provider for AwsMemcachedProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::AwsMemcached
    }

    async fn get_instance(&self, name: &str, plan: &ProviderPlan) -> ProviderResult<Instance> {
        self.driver.get_instance(name, plan).await
    }

    async fn provision(&self, id: &str, plan: &ProviderPlan, owner: &str) -> ProviderResult<Instance> {
        self.driver.provision(id, plan, owner).await
    }

    /// Memcached has no snapshots; `take_snapshot` is ignored
    async fn deprovision(&self, instance: &Instance, _take_snapshot: bool) -> ProviderResult<()> {
        self.driver.delete(instance, None).await
    }

    #[instrument(skip(self, instance, plan), fields(instance_id = %instance.id, plan_id = %plan.id))]
    async fn modify(&self, instance: &Instance, plan: &ProviderPlan) -> ProviderResult<Instance> {
        if !status::can_be_modified(&instance.status) {
            return Err(ProviderError::InvalidState(
                "Caches cannot be modified during backups, upgrades or while maintenance is being performed.".to_string(),
            ));
        }
        let mut settings = ClusterDriver::settings(plan)?;
        settings.cache_cluster_id = Some(instance.provider_id.clone());

        let mut progress = WorkflowProgress::new(WorkflowKind::RecreateModify, &instance.provider_id);
        progress
            .step(WorkflowStep::Deprovision, self.deprovision(instance, false))
            .await?;
        progress
            .step(
                WorkflowStep::AwaitDeletion,
                self.driver.wait_until_deleted(&instance.provider_id),
            )
            .await?;
        let recreated = progress
            .step(
                WorkflowStep::Provision,
                self.driver
                    .provision_with_settings(&instance.id, plan, settings),
            )
            .await?;
        progress.finish();
        Ok(recreated)
    }

    async fn tag(&self, instance: &Instance, key: &str, value: &str) -> ProviderResult<()> {
        self.driver.tag(instance, key, value).await
    }

    async fn untag(&self, instance: &Instance, key: &str) -> ProviderResult<()> {
        self.driver.untag(instance, key).await
    }

    async fn restart(&self, instance: &Instance) -> ProviderResult<()> {
        self.driver.restart(instance).await
    }

    async fn perform_post_provision(&self, instance: &Instance) -> ProviderResult<Instance> {
        Ok(instance.clone())
    }

    fn get_url(&self, instance: &Instance) -> Credentials {
        Credentials::from([("MEMCACHED_URL".to_string(), instance.endpoint.clone())])
    }

    async fn flush(&self, instance: &Instance) -> ProviderResult<()> {
        native::memcached_flush(&instance.endpoint).await
    }

    async fn stats(&self, instance: &Instance) -> ProviderResult<Vec<Stat>> {
        native::memcached_stats(&instance.endpoint).await
    }

    async fn get_backup(&self, _instance: &Instance, _backup_id: &str) -> ProviderResult<BackupSpec> {
        backups_unsupported("memcached")
    }

    async fn list_backups(&self, _instance: &Instance) -> ProviderResult<Vec<BackupSpec>> {
        backups_unsupported("memcached")
    }

    async fn create_backup(&self, _instance: &Instance) -> ProviderResult<BackupSpec> {
        backups_unsupported("memcached")
    }

    async fn restore_backup(&self, _instance: &Instance, _backup_id: &str) -> ProviderResult<()> {
        backups_unsupported("memcached")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::CatalogPlan;
    use crate::providers::elasticache::{ElastiCacheOperation, InMemoryElastiCache};

    fn plan(node_type: &str) -> ProviderPlan {
        ProviderPlan::new(
            format!("plan-{node_type}"),
            ProviderKind::AwsMemcached,
            "memcached",
            format!(r#"{{"CacheNodeType":"{node_type}","Engine":"memcached","NumCacheNodes":1}}"#),
            CatalogPlan::default(),
        )
    }

    fn provider(api: Arc<InMemoryElastiCache>) -> AwsMemcachedProvider {
        AwsMemcachedProvider::new(
            api,
            "cache",
            Duration::from_secs(60),
            PollSettings {
                interval: Duration::from_millis(1),
                max_attempts: 5,
            },
        )
    }

    async fn ready_instance(provider: &AwsMemcachedProvider) -> Instance {
        let plan = plan("cache.t2.micro");
        let created = provider.provision("instance-1", &plan, "org").await.unwrap();
        let mut instance = provider.get_instance(&created.name, &plan).await.unwrap();
        instance.id = "instance-1".into();
        instance
    }

    #[tokio::test]
    async fn test_credentials_are_bare_endpoint() {
        let provider = provider(Arc::new(InMemoryElastiCache::new()));
        let instance = ready_instance(&provider).await;
        let url = provider.get_url(&instance);
        assert_eq!(
            url.get("MEMCACHED_URL").unwrap(),
            &format!("{}.fake.cache.amazonaws.com:11211", instance.name)
        );
    }

    #[tokio::test]
    async fn test_deprovision_never_snapshots() {
        let api = Arc::new(InMemoryElastiCache::new());
        let provider = provider(api.clone());
        let instance = ready_instance(&provider).await;
        provider.deprovision(&instance, true).await.unwrap();
        assert!(api.snapshot(&format!("{}-final", instance.name)).is_none());
    }

    #[tokio::test]
    async fn test_modify_recreates_under_same_identifier() {
        let api = Arc::new(InMemoryElastiCache::new());
        let provider = provider(api.clone());
        let instance = ready_instance(&provider).await;
        let target = plan("cache.m5.large");

        let modified = provider.modify(&instance, &target).await.unwrap();
        assert_eq!(modified.id, "instance-1");
        assert_eq!(modified.provider_id, instance.provider_id);
        assert_eq!(
            api.cluster(&instance.provider_id).unwrap().cache_node_type.as_deref(),
            Some("cache.m5.large")
        );
    }

    #[tokio::test]
    async fn test_modify_failure_names_step() {
        let api = Arc::new(InMemoryElastiCache::new());
        let provider = provider(api.clone());
        let instance = ready_instance(&provider).await;
        api.fail_on(ElastiCacheOperation::Create, ProviderError::Backend("quota".into()));

        match provider.modify(&instance, &plan("cache.m5.large")).await {
            Err(ProviderError::Workflow(failure)) => {
                assert_eq!(failure.failed_step, WorkflowStep::Provision);
                assert_eq!(failure.last_completed, Some(WorkflowStep::AwaitDeletion));
            }
            other => panic!("expected workflow failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_backups_unsupported() {
        let provider = provider(Arc::new(InMemoryElastiCache::new()));
        let instance = ready_instance(&provider).await;
        assert!(matches!(
            provider.list_backups(&instance).await,
            Err(ProviderError::Unsupported(_))
        ));
        assert!(matches!(
            provider.create_backup(&instance).await,
            Err(ProviderError::Unsupported(_))
        ));
    }
}
