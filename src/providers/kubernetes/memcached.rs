//! # Container Memcached Provider

use super::{ContainerEngine, DeploymentDriver, KubernetesApi};
use crate::error::ProviderResult;
use crate::models::{BackupSpec, Instance, ProviderKind, ProviderPlan, Stat};
use crate::providers::{backups_unsupported, native, Credentials, PollSettings, Provider};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::instrument;

#[derive(Debug)]
pub struct KubernetesMemcachedProvider {
    driver: DeploymentDriver,
}

impl KubernetesMemcachedProvider {
    pub fn new(
        client: Arc<dyn KubernetesApi>,
        name_prefix: &str,
        cache_ttl: Duration,
        poll: PollSettings,
    ) -> Self {
        Self {
            driver: DeploymentDriver::new(
                client,
                ContainerEngine::Memcached,
                name_prefix,
                cache_ttl,
                poll,
            ),
        }
    }
}

#[async_trait]
impl Provider for KubernetesMemcachedProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::KubernetesMemcached
    }

    async fn get_instance(&self, name: &str, plan: &ProviderPlan) -> ProviderResult<Instance> {
        self.driver.get_instance(name, plan).await
    }

    async fn provision(&self, id: &str, plan: &ProviderPlan, owner: &str) -> ProviderResult<Instance> {
        self.driver.provision(id, plan, owner).await
    }

    async fn deprovision(&self, instance: &Instance, _take_snapshot: bool) -> ProviderResult<()> {
        self.driver.deprovision(instance).await
    }

    #[instrument(skip(self, instance, plan), fields(instance_id = %instance.id, plan_id = %plan.id))]
    async fn modify(&self, instance: &Instance, plan: &ProviderPlan) -> ProviderResult<Instance> {
        self.driver.recreate(instance, plan).await
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
