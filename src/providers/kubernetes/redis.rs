//! # Container Redis Provider
//!
//! Ephemeral redis without authentication or snapshots.

use super::{ContainerEngine, DeploymentDriver, KubernetesApi};
use crate::error::{ProviderError, ProviderResult};
use crate::models::{BackupSpec, Instance, ProviderKind, ProviderPlan, Stat};
use crate::providers::{backups_unsupported, native, Credentials, PollSettings, Provider};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::instrument;

#[derive(Debug)]
pub struct KubernetesRedisProvider {
    driver: DeploymentDriver,
}

impl KubernetesRedisProvider {
    pub fn new(
        client: Arc<dyn KubernetesApi>,
        name_prefix: &str,
        cache_ttl: Duration,
        poll: PollSettings,
    ) -> Self {
        Self {
            driver: DeploymentDriver::new(client, ContainerEngine::Redis, name_prefix, cache_ttl, poll),
        }
    }
}

#[async_trait]
impl Provider for KubernetesRedisProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::KubernetesRedis
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
        Credentials::from([(
            "REDIS_URL".to_string(),
            format!("{}://{}", instance.scheme, instance.endpoint),
        )])
    }

    async fn flush(&self, _instance: &Instance) -> ProviderResult<()> {
        Err(ProviderError::Unsupported(
            "Flush is not supported on redis".to_string(),
        ))
    }

    async fn stats(&self, instance: &Instance) -> ProviderResult<Vec<Stat>> {
        native::redis_info(&instance.endpoint, &instance.password).await
    }

    async fn get_backup(&self, _instance: &Instance, _backup_id: &str) -> ProviderResult<BackupSpec> {
        backups_unsupported("ephemeral redis")
    }

    async fn list_backups(&self, _instance: &Instance) -> ProviderResult<Vec<BackupSpec>> {
        backups_unsupported("ephemeral redis")
    }

    async fn create_backup(&self, _instance: &Instance) -> ProviderResult<BackupSpec> {
        backups_unsupported("ephemeral redis")
    }

    async fn restore_backup(&self, _instance: &Instance, _backup_id: &str) -> ProviderResult<()> {
        backups_unsupported("ephemeral redis")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::CatalogPlan;
    use crate::providers::kubernetes::{InMemoryKubernetes, KubernetesOperation, OWNER_ANNOTATION};
    use crate::providers::WorkflowStep;

    fn plan(size: u32) -> ProviderPlan {
        ProviderPlan::new(
            format!("redis-{size}"),
            ProviderKind::KubernetesRedis,
            "redis",
            format!(r#"{{"size_in_megabytes":"{size}","version":"7.2"}}"#),
            CatalogPlan::default(),
        )
    }

    fn provider(api: Arc<InMemoryKubernetes>) -> KubernetesRedisProvider {
        KubernetesRedisProvider::new(
            api,
            "cache",
            Duration::ZERO,
            PollSettings {
                interval: Duration::from_millis(1),
                max_attempts: 5,
            },
        )
    }

    #[tokio::test]
    async fn test_provision_creates_deployment_and_service() {
        let api = Arc::new(InMemoryKubernetes::new());
        let provider = provider(api.clone());
        let instance = provider.provision("instance-1", &plan(256), "org-a").await.unwrap();

        assert!(instance.name.starts_with("cache"));
        assert_eq!(instance.name.len(), "cache".len() + 9);
        assert_eq!(instance.status, "creating");
        assert_eq!(
            instance.endpoint,
            format!("{}.redis-system.svc.cluster.local:6379", instance.name)
        );

        let deployment = api.deployment("redis-system", &instance.name).unwrap();
        assert_eq!(deployment.container.image, "redis:7.2");
        assert_eq!(deployment.container.memory_limit, "256Mi");
        assert_eq!(deployment.annotations.get(OWNER_ANNOTATION).unwrap(), "org-a");
        let service = api.service("redis-system", &instance.name).unwrap();
        assert_eq!(service.service_type, "NodePort");
        assert_eq!(service.ports[0].port, 6379);
    }

    #[tokio::test]
    async fn test_instance_becomes_available_after_rollout() {
        let api = Arc::new(InMemoryKubernetes::new().with_manual_rollout());
        let provider = provider(api.clone());
        let created = provider.provision("instance-1", &plan(128), "org").await.unwrap();

        let pending = provider.get_instance(&created.name, &plan(128)).await.unwrap();
        assert_eq!(pending.status, "creating");
        assert!(!pending.ready);

        api.complete_rollout("redis-system", &created.name);
        let ready = provider.get_instance(&created.name, &plan(128)).await.unwrap();
        assert_eq!(ready.status, "available");
        assert!(ready.ready);
    }

    #[tokio::test]
    async fn test_modify_keeps_name_and_owner() {
        let api = Arc::new(InMemoryKubernetes::new());
        let provider = provider(api.clone());
        let instance = provider.provision("instance-1", &plan(128), "org-a").await.unwrap();

        let modified = provider.modify(&instance, &plan(512)).await.unwrap();
        assert_eq!(modified.name, instance.name);
        assert_eq!(modified.id, "instance-1");
        let deployment = api.deployment("redis-system", &instance.name).unwrap();
        assert_eq!(deployment.container.memory_limit, "512Mi");
        assert_eq!(deployment.annotations.get(OWNER_ANNOTATION).unwrap(), "org-a");
    }

    #[tokio::test]
    async fn test_modify_failure_reports_step() {
        let api = Arc::new(InMemoryKubernetes::new());
        let provider = provider(api.clone());
        let instance = provider.provision("instance-1", &plan(128), "org").await.unwrap();
        api.fail_on(
            KubernetesOperation::CreateDeployment,
            ProviderError::Backend("quota exceeded".into()),
        );

        match provider.modify(&instance, &plan(512)).await {
            Err(ProviderError::Workflow(failure)) => {
                assert_eq!(failure.failed_step, WorkflowStep::Provision);
                assert_eq!(failure.last_completed, Some(WorkflowStep::AwaitDeletion));
            }
            other => panic!("expected workflow failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_tags_are_annotations() {
        let api = Arc::new(InMemoryKubernetes::new());
        let provider = provider(api.clone());
        let instance = provider.provision("instance-1", &plan(128), "org").await.unwrap();

        provider.tag(&instance, "team", "cache").await.unwrap();
        assert_eq!(
            api.deployment("redis-system", &instance.name)
                .unwrap()
                .annotations
                .get("team")
                .map(String::as_str),
            Some("cache")
        );
        provider.untag(&instance, "team").await.unwrap();
        assert!(!api
            .deployment("redis-system", &instance.name)
            .unwrap()
            .annotations
            .contains_key("team"));
    }

    #[tokio::test]
    async fn test_restart_replaces_pods() {
        let api = Arc::new(InMemoryKubernetes::new());
        let provider = provider(api.clone());
        let instance = provider.provision("instance-1", &plan(128), "org").await.unwrap();
        let selector = format!("app={}", instance.name);
        let before = api.pod_names("redis-system", &selector);

        provider.restart(&instance).await.unwrap();
        let after = api.pod_names("redis-system", &selector);
        assert_eq!(before.len(), after.len());
        assert_ne!(before, after);
    }

    #[tokio::test]
    async fn test_flush_and_backups_unsupported() {
        let provider = provider(Arc::new(InMemoryKubernetes::new()));
        let instance = provider.provision("instance-1", &plan(128), "org").await.unwrap();
        assert!(matches!(
            provider.flush(&instance).await,
            Err(ProviderError::Unsupported(_))
        ));
        assert!(matches!(
            provider.restore_backup(&instance, "any").await,
            Err(ProviderError::Unsupported(_))
        ));
        assert_eq!(
            provider.get_url(&instance).get("REDIS_URL").unwrap(),
            &format!("redis://{}", instance.endpoint)
        );
    }
}
