//! # ElastiCache over the AWS SDK
//!
//! [`AwsElastiCache`] implements [`ElastiCacheApi`] with `aws-sdk-elasticache`. Requests
//! are built from the PascalCase input shapes and responses are flattened back into
//! [`CacheCluster`] and [`Snapshot`], so the providers never see SDK types.
//!
//! Tagging calls need the cluster ARN, which is looked up with a describe first.

use super::client::{
    CacheCluster, CacheNode, CreateCacheClusterInput, DeleteCacheClusterInput, ElastiCacheApi,
    Endpoint, ModifyCacheClusterInput, NodeSnapshot, Snapshot, Tag,
};
use crate::error::{ProviderError, ProviderResult};
use async_trait::async_trait;
use aws_sdk_elasticache::config::Region;
use aws_sdk_elasticache::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_elasticache::primitives::DateTime as SdkDateTime;
use aws_sdk_elasticache::types;
use aws_sdk_elasticache::Client;
use chrono::{DateTime, Utc};
use std::fmt;
use tracing::{debug, info};

/// Error codes the API uses for a missing resource
const NOT_FOUND_CODES: &[&str] = &["CacheClusterNotFound", "SnapshotNotFoundFault"];

/// Error codes for a resource whose status forbids the call
const INVALID_STATE_CODES: &[&str] = &["InvalidCacheClusterState", "InvalidSnapshotState"];

/// ElastiCache client bound to one region
#[derive(Clone)]
pub struct AwsElastiCache {
    client: Client,
    region: String,
}

impl fmt::Debug for AwsElastiCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AwsElastiCache")
            .field("region", &self.region)
            .finish()
    }
}

impl AwsElastiCache {
    /// Load credentials from the default provider chain for `region`
    pub async fn connect(region: &str) -> Self {
        let shared = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(Region::new(region.to_string()))
            .load()
            .await;
        info!(region = region, "☁️ ElastiCache client configured");
        Self {
            client: Client::new(&shared),
            region: region.to_string(),
        }
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    async fn describe_raw(&self, cache_cluster_id: &str) -> ProviderResult<types::CacheCluster> {
        let output = self
            .client
            .describe_cache_clusters()
            .cache_cluster_id(cache_cluster_id)
            .show_cache_node_info(true)
            .send()
            .await
            .map_err(|e| sdk_error("DescribeCacheClusters", e))?;
        output
            .cache_clusters()
            .first()
            .cloned()
            .ok_or_else(|| ProviderError::NotFound(format!("cache cluster {cache_cluster_id}")))
    }

    async fn resource_arn(&self, cache_cluster_id: &str) -> ProviderResult<String> {
        let cluster = self.describe_raw(cache_cluster_id).await?;
        cluster.arn().map(str::to_string).ok_or_else(|| {
            ProviderError::Backend(format!("cache cluster {cache_cluster_id} has no ARN"))
        })
    }
}

/// Map an SDK failure onto the provider vocabulary by its error code
fn sdk_error<E, R>(operation: &str, error: SdkError<E, R>) -> ProviderError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
    R: fmt::Debug + Send + Sync + 'static,
{
    let code = error
        .as_service_error()
        .and_then(|service| service.code())
        .unwrap_or_default()
        .to_string();
    let message = format!("{operation}: {}", DisplayErrorContext(&error));
    debug!(operation = operation, code = %code, "ElastiCache call failed");
    if NOT_FOUND_CODES.contains(&code.as_str()) {
        ProviderError::NotFound(message)
    } else if INVALID_STATE_CODES.contains(&code.as_str()) {
        ProviderError::InvalidState(message)
    } else {
        ProviderError::Backend(message)
    }
}

fn narrow(value: Option<i64>) -> Option<i32> {
    value.and_then(|v| i32::try_from(v).ok())
}

fn non_empty(values: Vec<String>) -> Option<Vec<String>> {
    (!values.is_empty()).then_some(values)
}

fn sdk_tag(tag: Tag) -> types::Tag {
    types::Tag::builder().key(tag.key).value(tag.value).build()
}

fn endpoint_from_sdk(endpoint: &types::Endpoint) -> Option<Endpoint> {
    Some(Endpoint {
        address: endpoint.address()?.to_string(),
        port: endpoint.port().map(i64::from).unwrap_or_default(),
    })
}

fn timestamp_from_sdk(time: &SdkDateTime) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(time.secs(), time.subsec_nanos())
}

fn owned(value: Option<&str>) -> Option<String> {
    value.map(str::to_string)
}

fn cluster_from_sdk(cluster: &types::CacheCluster) -> CacheCluster {
    CacheCluster {
        cache_cluster_id: cluster.cache_cluster_id().unwrap_or_default().to_string(),
        cache_cluster_status: cluster.cache_cluster_status().unwrap_or_default().to_string(),
        engine: cluster.engine().unwrap_or_default().to_string(),
        engine_version: cluster.engine_version().unwrap_or_default().to_string(),
        cache_node_type: owned(cluster.cache_node_type()),
        num_cache_nodes: cluster.num_cache_nodes().map(i64::from),
        cache_nodes: cluster
            .cache_nodes()
            .iter()
            .map(|node| CacheNode {
                cache_node_id: node.cache_node_id().unwrap_or_default().to_string(),
                endpoint: node.endpoint().and_then(endpoint_from_sdk),
            })
            .collect(),
        auth_token_enabled: cluster.auth_token_enabled().unwrap_or(false),
        auto_minor_version_upgrade: cluster.auto_minor_version_upgrade(),
        cache_parameter_group_name: owned(
            cluster
                .cache_parameter_group()
                .and_then(|group| group.cache_parameter_group_name()),
        ),
        cache_security_group_names: cluster
            .cache_security_groups()
            .iter()
            .filter_map(|group| owned(group.cache_security_group_name()))
            .collect(),
        cache_subnet_group_name: owned(cluster.cache_subnet_group_name()),
        configuration_endpoint: cluster.configuration_endpoint().and_then(endpoint_from_sdk),
        notification_topic_arn: owned(
            cluster
                .notification_configuration()
                .and_then(|notification| notification.topic_arn()),
        ),
        preferred_availability_zone: owned(cluster.preferred_availability_zone()),
        preferred_maintenance_window: owned(cluster.preferred_maintenance_window()),
        replication_group_id: owned(cluster.replication_group_id()),
        security_group_ids: cluster
            .security_groups()
            .iter()
            .filter_map(|group| owned(group.security_group_id()))
            .collect(),
        snapshot_retention_limit: cluster.snapshot_retention_limit().map(i64::from),
        snapshot_window: owned(cluster.snapshot_window()),
    }
}

fn snapshot_from_sdk(snapshot: &types::Snapshot) -> Snapshot {
    Snapshot {
        snapshot_name: snapshot.snapshot_name().unwrap_or_default().to_string(),
        cache_cluster_id: snapshot.cache_cluster_id().unwrap_or_default().to_string(),
        snapshot_status: snapshot.snapshot_status().unwrap_or_default().to_string(),
        engine: snapshot.engine().unwrap_or_default().to_string(),
        node_snapshots: snapshot
            .node_snapshots()
            .iter()
            .map(|node| NodeSnapshot {
                cache_node_id: node.cache_node_id().unwrap_or_default().to_string(),
                snapshot_create_time: node.snapshot_create_time().and_then(timestamp_from_sdk),
            })
            .collect(),
    }
}

#[async_trait]
impl ElastiCacheApi for AwsElastiCache {
    async fn create_cache_cluster(&self, input: CreateCacheClusterInput) -> ProviderResult<CacheCluster> {
        let tags: Vec<types::Tag> = input.tags.into_iter().map(sdk_tag).collect();
        let output = self
            .client
            .create_cache_cluster()
            .set_cache_cluster_id(input.cache_cluster_id)
            .set_az_mode(input.az_mode.as_deref().map(types::AzMode::from))
            .set_auth_token(input.auth_token)
            .set_auto_minor_version_upgrade(input.auto_minor_version_upgrade)
            .set_cache_node_type(input.cache_node_type)
            .set_cache_parameter_group_name(input.cache_parameter_group_name)
            .set_cache_security_group_names(non_empty(input.cache_security_group_names))
            .set_cache_subnet_group_name(input.cache_subnet_group_name)
            .set_engine(input.engine)
            .set_engine_version(input.engine_version)
            .set_notification_topic_arn(input.notification_topic_arn)
            .set_num_cache_nodes(narrow(input.num_cache_nodes))
            .set_port(narrow(input.port))
            .set_preferred_availability_zone(input.preferred_availability_zone)
            .set_preferred_maintenance_window(input.preferred_maintenance_window)
            .set_replication_group_id(input.replication_group_id)
            .set_security_group_ids(non_empty(input.security_group_ids))
            .set_snapshot_name(input.snapshot_name)
            .set_snapshot_retention_limit(narrow(input.snapshot_retention_limit))
            .set_snapshot_window(input.snapshot_window)
            .set_tags((!tags.is_empty()).then_some(tags))
            .send()
            .await
            .map_err(|e| sdk_error("CreateCacheCluster", e))?;
        output
            .cache_cluster()
            .map(cluster_from_sdk)
            .ok_or_else(|| ProviderError::Backend("CreateCacheCluster returned no cluster".to_string()))
    }

    async fn describe_cache_cluster(&self, cache_cluster_id: &str) -> ProviderResult<CacheCluster> {
        let cluster = self.describe_raw(cache_cluster_id).await?;
        Ok(cluster_from_sdk(&cluster))
    }

    async fn modify_cache_cluster(&self, input: ModifyCacheClusterInput) -> ProviderResult<CacheCluster> {
        let output = self
            .client
            .modify_cache_cluster()
            .cache_cluster_id(input.cache_cluster_id)
            .apply_immediately(input.apply_immediately)
            .set_az_mode(input.az_mode.as_deref().map(types::AzMode::from))
            .set_auto_minor_version_upgrade(input.auto_minor_version_upgrade)
            .set_cache_node_type(input.cache_node_type)
            .set_cache_parameter_group_name(input.cache_parameter_group_name)
            .set_cache_security_group_names(non_empty(input.cache_security_group_names))
            .set_engine_version(input.engine_version)
            .set_notification_topic_arn(input.notification_topic_arn)
            .set_num_cache_nodes(narrow(input.num_cache_nodes))
            .set_preferred_maintenance_window(input.preferred_maintenance_window)
            .set_security_group_ids(non_empty(input.security_group_ids))
            .set_snapshot_retention_limit(narrow(input.snapshot_retention_limit))
            .set_snapshot_window(input.snapshot_window)
            .send()
            .await
            .map_err(|e| sdk_error("ModifyCacheCluster", e))?;
        output
            .cache_cluster()
            .map(cluster_from_sdk)
            .ok_or_else(|| ProviderError::Backend("ModifyCacheCluster returned no cluster".to_string()))
    }

    async fn delete_cache_cluster(&self, input: DeleteCacheClusterInput) -> ProviderResult<()> {
        self.client
            .delete_cache_cluster()
            .cache_cluster_id(input.cache_cluster_id)
            .set_final_snapshot_identifier(input.final_snapshot_identifier)
            .send()
            .await
            .map_err(|e| sdk_error("DeleteCacheCluster", e))?;
        Ok(())
    }

    async fn reboot_cache_cluster(&self, cache_cluster_id: &str, node_ids: Vec<String>) -> ProviderResult<()> {
        self.client
            .reboot_cache_cluster()
            .cache_cluster_id(cache_cluster_id)
            .set_cache_node_ids_to_reboot(Some(node_ids))
            .send()
            .await
            .map_err(|e| sdk_error("RebootCacheCluster", e))?;
        Ok(())
    }

    async fn add_tags(&self, resource_name: &str, tags: Vec<Tag>) -> ProviderResult<()> {
        let arn = self.resource_arn(resource_name).await?;
        self.client
            .add_tags_to_resource()
            .resource_name(arn)
            .set_tags(Some(tags.into_iter().map(sdk_tag).collect()))
            .send()
            .await
            .map_err(|e| sdk_error("AddTagsToResource", e))?;
        Ok(())
    }

    async fn remove_tags(&self, resource_name: &str, keys: Vec<String>) -> ProviderResult<()> {
        let arn = self.resource_arn(resource_name).await?;
        self.client
            .remove_tags_from_resource()
            .resource_name(arn)
            .set_tag_keys(Some(keys))
            .send()
            .await
            .map_err(|e| sdk_error("RemoveTagsFromResource", e))?;
        Ok(())
    }

    async fn describe_snapshots(
        &self,
        cache_cluster_id: &str,
        snapshot_name: Option<&str>,
    ) -> ProviderResult<Vec<Snapshot>> {
        let output = self
            .client
            .describe_snapshots()
            .cache_cluster_id(cache_cluster_id)
            .set_snapshot_name(snapshot_name.map(str::to_string))
            .send()
            .await
            .map_err(|e| sdk_error("DescribeSnapshots", e))?;
        let mut snapshots: Vec<Snapshot> = output.snapshots().iter().map(snapshot_from_sdk).collect();
        snapshots.sort_by(|a, b| a.snapshot_name.cmp(&b.snapshot_name));
        Ok(snapshots)
    }

    async fn create_snapshot(&self, cache_cluster_id: &str, snapshot_name: &str) -> ProviderResult<Snapshot> {
        let output = self
            .client
            .create_snapshot()
            .cache_cluster_id(cache_cluster_id)
            .snapshot_name(snapshot_name)
            .send()
            .await
            .map_err(|e| sdk_error("CreateSnapshot", e))?;
        output
            .snapshot()
            .map(snapshot_from_sdk)
            .ok_or_else(|| ProviderError::Backend("CreateSnapshot returned no snapshot".to_string()))
    }
}
