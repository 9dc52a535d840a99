//! # Managed Redis Provider
//!
//! Single-node Redis clusters. Plan changes are applied in place; backups are cluster
//! snapshots.
//!
//! ## Restore
//!
//! A snapshot cannot be loaded into a running cluster, so restore replaces the cluster:
//!
//! 1. **verify-backup**: the snapshot exists and is available, the cluster is ready
//! 2. **delete-cluster**: delete with a safety snapshot `<name>-restore-<random>`
//! 3. **await-deletion**: poll until the backend stops reporting the cluster
//! 4. **recreate-from-snapshot**: create under the same id, seeded from the snapshot and
//!    carrying the old cluster's network, security and maintenance settings
//! 5. **await-available**: poll until the new cluster is available
//!
//! A failure after step 2 leaves the cluster missing or half-built; the safety snapshot
//! holds the pre-restore data.

use super::{backup_from_snapshot, ClusterDriver, CreateCacheClusterInput, ElastiCacheApi, ModifyCacheClusterInput};
use crate::error::{ProviderError, ProviderResult};
use crate::models::{BackupSpec, Instance, ProviderKind, ProviderPlan, Stat};
use crate::providers::workflow::{WorkflowKind, WorkflowProgress, WorkflowStep};
use crate::providers::{native, random_suffix, Credentials, PollSettings, Provider};
use crate::status;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument};

#[derive(Debug)]
pub struct AwsRedisProvider {
    driver: ClusterDriver,
}

impl AwsRedisProvider {
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

    /// Name of the snapshot taken when a cluster is deprovisioned
    pub fn final_snapshot_name(provider_id: &str) -> String {
        format!("{provider_id}-final")
    }

    /// Create settings that rebuild `old` from `snapshot_name`
    fn recreate_settings(
        instance: &Instance,
        old: &super::CacheCluster,
        snapshot_name: &str,
    ) -> CreateCacheClusterInput {
        CreateCacheClusterInput {
            cache_cluster_id: Some(instance.name.clone()),
            auth_token: old.auth_token_enabled.then(|| instance.password.clone()),
            auto_minor_version_upgrade: old.auto_minor_version_upgrade,
            cache_node_type: old.cache_node_type.clone(),
            cache_parameter_group_name: old.cache_parameter_group_name.clone(),
            cache_security_group_names: old.cache_security_group_names.clone(),
            cache_subnet_group_name: old.cache_subnet_group_name.clone(),
            engine: Some(old.engine.clone()),
            engine_version: Some(old.engine_version.clone()),
            notification_topic_arn: old.notification_topic_arn.clone(),
            num_cache_nodes: old.num_cache_nodes,
            port: old.configuration_endpoint.as_ref().map(|e| e.port),
            preferred_availability_zone: old.preferred_availability_zone.clone(),
            preferred_maintenance_window: old.preferred_maintenance_window.clone(),
            replication_group_id: old.replication_group_id.clone(),
            security_group_ids: old.security_group_ids.clone(),
            snapshot_name: Some(snapshot_name.to_string()),
            snapshot_retention_limit: old.snapshot_retention_limit,
            snapshot_window: old.snapshot_window.clone(),
            ..Default::default()
        }
    }
}

#[async_trait]
impl Provider for AwsRedisProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::AwsRedis
    }

    async fn get_instance(&self, name: &str, plan: &ProviderPlan) -> ProviderResult<Instance> {
        self.driver.get_instance(name, plan).await
    }

    async fn provision(&self, id: &str, plan: &ProviderPlan, owner: &str) -> ProviderResult<Instance> {
        self.driver.provision(id, plan, owner).await
    }

    async fn deprovision(&self, instance: &Instance, take_snapshot: bool) -> ProviderResult<()> {
        let snapshot = take_snapshot.then(|| Self::final_snapshot_name(&instance.provider_id));
        self.driver.delete(instance, snapshot).await
    }

    #[instrument(skip(self, instance, plan), fields(instance_id = %instance.id, plan_id = %plan.id))]
    async fn modify(&self, instance: &Instance, plan: &ProviderPlan) -> ProviderResult<Instance> {
        if !status::can_be_modified(&instance.status) {
            return Err(ProviderError::InvalidState(
                "Caches cannot be modified during backups, upgrades or while maintenance is being performed.".to_string(),
            ));
        }
        let settings = ClusterDriver::settings(plan)?;
        info!(cache_cluster_id = %instance.provider_id, "Modifying cache cluster settings");
        self.driver
            .client()
            .modify_cache_cluster(ModifyCacheClusterInput::from_settings(
                &instance.provider_id,
                &settings,
            ))
            .await?;
        self.driver.cache().invalidate(&instance.name).await;

        let cluster = self.driver.wait_for_endpoint(&instance.provider_id).await?;
        info!(cache_cluster_id = %instance.provider_id, "✅ Cache cluster modifications applied");
        Ok(ClusterDriver::instance_from_cluster(
            &instance.id,
            &instance.name,
            plan,
            &cluster,
        ))
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
            "Flush is not available on redis instances.".to_string(),
        ))
    }

    async fn stats(&self, instance: &Instance) -> ProviderResult<Vec<Stat>> {
        native::redis_info(&instance.endpoint, &instance.password).await
    }

    async fn get_backup(&self, instance: &Instance, backup_id: &str) -> ProviderResult<BackupSpec> {
        let snapshots = self
            .driver
            .client()
            .describe_snapshots(&instance.name, Some(backup_id))
            .await?;
        match snapshots.as_slice() {
            [snapshot] => backup_from_snapshot(&instance.name, snapshot),
            _ => Err(ProviderError::NotFound(format!("backup {backup_id}"))),
        }
    }

    async fn list_backups(&self, instance: &Instance) -> ProviderResult<Vec<BackupSpec>> {
        let snapshots = self
            .driver
            .client()
            .describe_snapshots(&instance.name, None)
            .await?;
        Ok(snapshots
            .iter()
            .filter(|snapshot| !snapshot.node_snapshots.is_empty())
            .filter_map(|snapshot| backup_from_snapshot(&instance.name, snapshot).ok())
            .collect())
    }

    async fn create_backup(&self, instance: &Instance) -> ProviderResult<BackupSpec> {
        if !instance.ready {
            return Err(ProviderError::InvalidState(
                "Cannot create a backup of a cache that is unavailable.".to_string(),
            ));
        }
        let snapshot_name = format!("{}-manual-{}", instance.name, random_suffix(10));
        let snapshot = self
            .driver
            .client()
            .create_snapshot(&instance.name, &snapshot_name)
            .await?;
        info!(instance_id = %instance.id, snapshot = %snapshot_name, "📸 Backup started");
        backup_from_snapshot(&instance.name, &snapshot)
    }

    #[instrument(skip(self, instance), fields(instance_id = %instance.id, cache_cluster_id = %instance.name))]
    async fn restore_backup(&self, instance: &Instance, backup_id: &str) -> ProviderResult<()> {
        let client = self.driver.client();
        let mut progress = WorkflowProgress::new(WorkflowKind::RestoreBackup, &instance.name);

        let old = progress
            .step(WorkflowStep::VerifyBackup, async {
                let backup = self.get_backup(instance, backup_id).await?;
                if !instance.ready {
                    return Err(ProviderError::InvalidState(
                        "Cannot restore a backup while the cache is unavailable.".to_string(),
                    ));
                }
                if !backup.is_available() {
                    return Err(ProviderError::InvalidState(format!(
                        "Backup {backup_id} is {} and cannot be restored yet.",
                        backup.status
                    )));
                }
                client.describe_cache_cluster(&instance.name).await
            })
            .await?;

        let safety_snapshot = format!("{}-restore-{}", instance.name, random_suffix(5));
        progress
            .step(WorkflowStep::DeleteCluster, async {
                self.driver
                    .delete(instance, Some(safety_snapshot.clone()))
                    .await
            })
            .await?;
        info!(safety_snapshot = %safety_snapshot, "Existing data preserved in safety snapshot");

        progress
            .step(
                WorkflowStep::AwaitDeletion,
                self.driver.wait_until_deleted(&instance.name),
            )
            .await?;

        progress
            .step(WorkflowStep::RecreateFromSnapshot, async {
                client
                    .create_cache_cluster(Self::recreate_settings(instance, &old, backup_id))
                    .await
            })
            .await?;

        progress
            .step(
                WorkflowStep::AwaitAvailable,
                self.driver.wait_until_available(&instance.name),
            )
            .await?;

        self.driver.cache().invalidate(&instance.name).await;
        progress.finish();
        Ok(())
    }
}
