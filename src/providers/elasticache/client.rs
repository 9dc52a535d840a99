//! # ElastiCache Client Seam
//!
//! The managed cache providers talk to the cloud API through [`ElastiCacheApi`]. Request
//! and response shapes mirror the ElastiCache API with PascalCase JSON keys, so a plan's
//! private settings deserialize straight into [`CreateCacheClusterInput`].
//!
//! [`InMemoryElastiCache`] implements the trait without network access for test mode and
//! for the test suite.
//!
//! ## In-Memory Lifecycle
//!
//! With auto-advance enabled (the default) transitional statuses settle on the next
//! describe call:
//!
//! ```text
//! creating | modifying | rebooting --describe--> available
//! deleting                         --describe--> (removed, NotFound)
//! snapshot creating                --describe--> available
//! ```

use crate::error::{ProviderError, ProviderResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::debug;

/// Key/value tag attached to a cache cluster
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Tag {
    pub key: String,
    pub value: String,
}

impl Tag {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Settings for creating a cache cluster
///
/// Plans carry this shape as their private details.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct CreateCacheClusterInput {
    pub cache_cluster_id: Option<String>,
    #[serde(rename = "AZMode")]
    pub az_mode: Option<String>,
    pub auth_token: Option<String>,
    pub auto_minor_version_upgrade: Option<bool>,
    pub cache_node_type: Option<String>,
    pub cache_parameter_group_name: Option<String>,
    pub cache_security_group_names: Vec<String>,
    pub cache_subnet_group_name: Option<String>,
    pub engine: Option<String>,
    pub engine_version: Option<String>,
    pub notification_topic_arn: Option<String>,
    pub num_cache_nodes: Option<i64>,
    pub port: Option<i64>,
    pub preferred_availability_zone: Option<String>,
    pub preferred_maintenance_window: Option<String>,
    pub replication_group_id: Option<String>,
    pub security_group_ids: Vec<String>,
    pub snapshot_name: Option<String>,
    pub snapshot_retention_limit: Option<i64>,
    pub snapshot_window: Option<String>,
    pub tags: Vec<Tag>,
}

/// In-place modification of a cache cluster
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ModifyCacheClusterInput {
    pub cache_cluster_id: String,
    pub apply_immediately: bool,
    #[serde(rename = "AZMode")]
    pub az_mode: Option<String>,
    pub auto_minor_version_upgrade: Option<bool>,
    pub cache_node_type: Option<String>,
    pub cache_parameter_group_name: Option<String>,
    pub cache_security_group_names: Vec<String>,
    pub engine_version: Option<String>,
    pub notification_topic_arn: Option<String>,
    pub num_cache_nodes: Option<i64>,
    pub preferred_maintenance_window: Option<String>,
    pub security_group_ids: Vec<String>,
    pub snapshot_retention_limit: Option<i64>,
    pub snapshot_window: Option<String>,
}

impl ModifyCacheClusterInput {
    /// Apply a plan's create settings to an existing cluster, immediately
    pub fn from_settings(cache_cluster_id: &str, settings: &CreateCacheClusterInput) -> Self {
        Self {
            cache_cluster_id: cache_cluster_id.to_string(),
            apply_immediately: true,
            az_mode: settings.az_mode.clone(),
            auto_minor_version_upgrade: settings.auto_minor_version_upgrade,
            cache_node_type: settings.cache_node_type.clone(),
            cache_parameter_group_name: settings.cache_parameter_group_name.clone(),
            cache_security_group_names: settings.cache_security_group_names.clone(),
            engine_version: settings.engine_version.clone(),
            notification_topic_arn: settings.notification_topic_arn.clone(),
            num_cache_nodes: settings.num_cache_nodes,
            preferred_maintenance_window: settings.preferred_maintenance_window.clone(),
            security_group_ids: settings.security_group_ids.clone(),
            snapshot_retention_limit: settings.snapshot_retention_limit,
            snapshot_window: settings.snapshot_window.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DeleteCacheClusterInput {
    pub cache_cluster_id: String,
    pub final_snapshot_identifier: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Endpoint {
    pub address: String,
    pub port: i64,
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.address, self.port)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CacheNode {
    pub cache_node_id: String,
    pub endpoint: Option<Endpoint>,
}

/// Described state of a cache cluster
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct CacheCluster {
    pub cache_cluster_id: String,
    pub cache_cluster_status: String,
    pub engine: String,
    pub engine_version: String,
    pub cache_node_type: Option<String>,
    pub num_cache_nodes: Option<i64>,
    pub cache_nodes: Vec<CacheNode>,
    pub auth_token_enabled: bool,
    pub auto_minor_version_upgrade: Option<bool>,
    pub cache_parameter_group_name: Option<String>,
    pub cache_security_group_names: Vec<String>,
    pub cache_subnet_group_name: Option<String>,
    pub configuration_endpoint: Option<Endpoint>,
    pub notification_topic_arn: Option<String>,
    pub preferred_availability_zone: Option<String>,
    pub preferred_maintenance_window: Option<String>,
    pub replication_group_id: Option<String>,
    pub security_group_ids: Vec<String>,
    pub snapshot_retention_limit: Option<i64>,
    pub snapshot_window: Option<String>,
}

impl CacheCluster {
    /// `address:port` of the first node, or empty while no node has an endpoint
    pub fn endpoint(&self) -> String {
        self.cache_nodes
            .first()
            .and_then(|node| node.endpoint.as_ref())
            .map(|endpoint| endpoint.to_string())
            .unwrap_or_default()
    }

    pub fn node_ids(&self) -> Vec<String> {
        self.cache_nodes
            .iter()
            .map(|node| node.cache_node_id.clone())
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct NodeSnapshot {
    pub cache_node_id: String,
    pub snapshot_create_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Snapshot {
    pub snapshot_name: String,
    pub cache_cluster_id: String,
    pub snapshot_status: String,
    pub engine: String,
    pub node_snapshots: Vec<NodeSnapshot>,
}

impl Snapshot {
    /// Creation time reported by the first node snapshot
    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        self.node_snapshots
            .first()
            .and_then(|node| node.snapshot_create_time)
    }
}

/// Managed cache cluster API
#[async_trait]
pub trait ElastiCacheApi: Send + Sync + fmt::Debug {
    async fn create_cache_cluster(&self, input: CreateCacheClusterInput) -> ProviderResult<CacheCluster>;

    /// Describe one cluster with node info; [`ProviderError::NotFound`] when absent
    async fn describe_cache_cluster(&self, cache_cluster_id: &str) -> ProviderResult<CacheCluster>;

    async fn modify_cache_cluster(&self, input: ModifyCacheClusterInput) -> ProviderResult<CacheCluster>;

    async fn delete_cache_cluster(&self, input: DeleteCacheClusterInput) -> ProviderResult<()>;

    async fn reboot_cache_cluster(&self, cache_cluster_id: &str, node_ids: Vec<String>) -> ProviderResult<()>;

    async fn add_tags(&self, resource_name: &str, tags: Vec<Tag>) -> ProviderResult<()>;

    async fn remove_tags(&self, resource_name: &str, keys: Vec<String>) -> ProviderResult<()>;

    /// Snapshots of a cluster, optionally filtered to one snapshot name
    async fn describe_snapshots(
        &self,
        cache_cluster_id: &str,
        snapshot_name: Option<&str>,
    ) -> ProviderResult<Vec<Snapshot>>;

    async fn create_snapshot(&self, cache_cluster_id: &str, snapshot_name: &str) -> ProviderResult<Snapshot>;
}

/// Operations of [`InMemoryElastiCache`] that can be made to fail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ElastiCacheOperation {
    Create,
    Describe,
    Modify,
    Delete,
    Reboot,
    Tag,
    Untag,
    DescribeSnapshots,
    CreateSnapshot,
}

#[derive(Debug, Clone)]
struct StoredCluster {
    cluster: CacheCluster,
    tags: BTreeMap<String, String>,
}

/// In-memory ElastiCache
#[derive(Debug)]
pub struct InMemoryElastiCache {
    clusters: DashMap<String, StoredCluster>,
    snapshots: DashMap<String, Snapshot>,
    failures: DashMap<ElastiCacheOperation, ProviderError>,
    auto_advance: AtomicBool,
}

impl Default for InMemoryElastiCache {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryElastiCache {
    pub fn new() -> Self {
        Self {
            clusters: DashMap::new(),
            snapshots: DashMap::new(),
            failures: DashMap::new(),
            auto_advance: AtomicBool::new(true),
        }
    }

    /// Keep transitional statuses until [`Self::settle`] is called
    pub fn without_auto_advance(self) -> Self {
        self.auto_advance.store(false, Ordering::SeqCst);
        self
    }

    pub fn set_auto_advance(&self, enabled: bool) {
        self.auto_advance.store(enabled, Ordering::SeqCst);
    }

    /// Make every call to `operation` fail with `error` until cleared
    pub fn fail_on(&self, operation: ElastiCacheOperation, error: ProviderError) {
        self.failures.insert(operation, error);
    }

    pub fn clear_failure(&self, operation: ElastiCacheOperation) {
        self.failures.remove(&operation);
    }

    /// Force a cluster's status, e.g. to simulate a backup or maintenance window
    pub fn set_status(&self, cache_cluster_id: &str, status: &str) {
        if let Some(mut stored) = self.clusters.get_mut(cache_cluster_id) {
            stored.cluster.cache_cluster_status = status.to_string();
        }
    }

    /// Run one lifecycle transition for a cluster and its snapshots
    pub fn settle(&self, cache_cluster_id: &str) {
        self.advance_cluster(cache_cluster_id);
        for mut snapshot in self.snapshots.iter_mut() {
            if snapshot.cache_cluster_id == cache_cluster_id && snapshot.snapshot_status == "creating" {
                snapshot.snapshot_status = "available".to_string();
            }
        }
    }

    pub fn cluster(&self, cache_cluster_id: &str) -> Option<CacheCluster> {
        self.clusters
            .get(cache_cluster_id)
            .map(|stored| stored.cluster.clone())
    }

    pub fn tags(&self, cache_cluster_id: &str) -> BTreeMap<String, String> {
        self.clusters
            .get(cache_cluster_id)
            .map(|stored| stored.tags.clone())
            .unwrap_or_default()
    }

    pub fn snapshot(&self, snapshot_name: &str) -> Option<Snapshot> {
        self.snapshots.get(snapshot_name).map(|s| s.clone())
    }

    pub fn cluster_count(&self) -> usize {
        self.clusters.len()
    }

    pub fn cluster_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.clusters.iter().map(|entry| entry.key().clone()).collect();
        ids.sort();
        ids
    }

    fn check_failure(&self, operation: ElastiCacheOperation) -> ProviderResult<()> {
        match self.failures.get(&operation) {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }

    fn advance_cluster(&self, cache_cluster_id: &str) {
        let deleting = match self.clusters.get_mut(cache_cluster_id) {
            Some(mut stored) => match stored.cluster.cache_cluster_status.as_str() {
                "creating" | "modifying" | "rebooting" => {
                    stored.cluster.cache_cluster_status = "available".to_string();
                    let address = format!("{cache_cluster_id}.fake.cache.amazonaws.com");
                    let port = default_port(&stored.cluster.engine);
                    for node in stored.cluster.cache_nodes.iter_mut() {
                        node.endpoint = Some(Endpoint {
                            address: address.clone(),
                            port,
                        });
                    }
                    false
                }
                "deleting" => true,
                _ => false,
            },
            None => false,
        };
        if deleting {
            self.clusters.remove(cache_cluster_id);
        }
    }

    fn node_snapshots(cluster: &CacheCluster) -> Vec<NodeSnapshot> {
        let now = Utc::now();
        cluster
            .cache_nodes
            .iter()
            .map(|node| NodeSnapshot {
                cache_node_id: node.cache_node_id.clone(),
                snapshot_create_time: Some(now),
            })
            .collect()
    }
}

fn default_engine_version(engine: &str) -> &'static str {
    if engine == "memcached" {
        "1.6.17"
    } else {
        "7.0.7"
    }
}

fn default_port(engine: &str) -> i64 {
    if engine == "memcached" {
        11211
    } else {
        6379
    }
}

#[async_trait]
impl ElastiCacheApi for InMemoryElastiCache {
    async fn create_cache_cluster(&self, input: CreateCacheClusterInput) -> ProviderResult<CacheCluster> {
        self.check_failure(ElastiCacheOperation::Create)?;
        let id = input
            .cache_cluster_id
            .clone()
            .ok_or_else(|| ProviderError::Backend("CacheClusterId is required".to_string()))?;
        if self.clusters.contains_key(&id) {
            return Err(ProviderError::Backend(format!(
                "CacheClusterAlreadyExists: {id}"
            )));
        }
        if let Some(snapshot_name) = &input.snapshot_name {
            match self.snapshots.get(snapshot_name) {
                Some(snapshot) if snapshot.snapshot_status == "available" => {}
                Some(_) => {
                    return Err(ProviderError::InvalidState(format!(
                        "snapshot {snapshot_name} is not available"
                    )))
                }
                None => return Err(ProviderError::NotFound(snapshot_name.clone())),
            }
        }

        let engine = input.engine.clone().unwrap_or_else(|| "redis".to_string());
        let node_count = input.num_cache_nodes.unwrap_or(1).max(1);
        let cache_nodes = (1..=node_count)
            .map(|n| CacheNode {
                cache_node_id: format!("{n:04}"),
                endpoint: None,
            })
            .collect();
        let cluster = CacheCluster {
            cache_cluster_id: id.clone(),
            cache_cluster_status: "creating".to_string(),
            engine_version: input
                .engine_version
                .clone()
                .unwrap_or_else(|| default_engine_version(&engine).to_string()),
            engine,
            cache_node_type: input.cache_node_type.clone(),
            num_cache_nodes: Some(node_count),
            cache_nodes,
            auth_token_enabled: input.auth_token.is_some(),
            auto_minor_version_upgrade: input.auto_minor_version_upgrade,
            cache_parameter_group_name: input.cache_parameter_group_name.clone(),
            cache_security_group_names: input.cache_security_group_names.clone(),
            cache_subnet_group_name: input.cache_subnet_group_name.clone(),
            configuration_endpoint: None,
            notification_topic_arn: input.notification_topic_arn.clone(),
            preferred_availability_zone: input.preferred_availability_zone.clone(),
            preferred_maintenance_window: input.preferred_maintenance_window.clone(),
            replication_group_id: input.replication_group_id.clone(),
            security_group_ids: input.security_group_ids.clone(),
            snapshot_retention_limit: input.snapshot_retention_limit,
            snapshot_window: input.snapshot_window.clone(),
        };
        let tags = input
            .tags
            .into_iter()
            .map(|tag| (tag.key, tag.value))
            .collect();
        debug!(cache_cluster_id = %id, "In-memory cache cluster created");
        self.clusters.insert(
            id,
            StoredCluster {
                cluster: cluster.clone(),
                tags,
            },
        );
        Ok(cluster)
    }

    async fn describe_cache_cluster(&self, cache_cluster_id: &str) -> ProviderResult<CacheCluster> {
        self.check_failure(ElastiCacheOperation::Describe)?;
        if self.auto_advance.load(Ordering::SeqCst) {
            self.settle(cache_cluster_id);
        }
        self.cluster(cache_cluster_id)
            .ok_or_else(|| ProviderError::NotFound(format!("cache cluster {cache_cluster_id}")))
    }

    async fn modify_cache_cluster(&self, input: ModifyCacheClusterInput) -> ProviderResult<CacheCluster> {
        self.check_failure(ElastiCacheOperation::Modify)?;
        let mut stored = self
            .clusters
            .get_mut(&input.cache_cluster_id)
            .ok_or_else(|| ProviderError::NotFound(format!("cache cluster {}", input.cache_cluster_id)))?;
        let cluster = &mut stored.cluster;
        if cluster.cache_cluster_status != "available" {
            return Err(ProviderError::InvalidState(format!(
                "InvalidCacheClusterState: {} is {}",
                cluster.cache_cluster_id, cluster.cache_cluster_status
            )));
        }
        if input.cache_node_type.is_some() {
            cluster.cache_node_type = input.cache_node_type.clone();
        }
        if let Some(version) = &input.engine_version {
            cluster.engine_version = version.clone();
        }
        if input.num_cache_nodes.is_some() {
            cluster.num_cache_nodes = input.num_cache_nodes;
        }
        if input.preferred_maintenance_window.is_some() {
            cluster.preferred_maintenance_window = input.preferred_maintenance_window.clone();
        }
        if !input.security_group_ids.is_empty() {
            cluster.security_group_ids = input.security_group_ids.clone();
        }
        cluster.cache_cluster_status = "modifying".to_string();
        Ok(cluster.clone())
    }

    async fn delete_cache_cluster(&self, input: DeleteCacheClusterInput) -> ProviderResult<()> {
        self.check_failure(ElastiCacheOperation::Delete)?;
        let snapshot = {
            let mut stored = self
                .clusters
                .get_mut(&input.cache_cluster_id)
                .ok_or_else(|| ProviderError::NotFound(format!("cache cluster {}", input.cache_cluster_id)))?;
            if stored.cluster.cache_cluster_status == "deleting" {
                return Err(ProviderError::InvalidState(format!(
                    "InvalidCacheClusterState: {} is already deleting",
                    input.cache_cluster_id
                )));
            }
            stored.cluster.cache_cluster_status = "deleting".to_string();
            input.final_snapshot_identifier.as_ref().map(|name| Snapshot {
                snapshot_name: name.clone(),
                cache_cluster_id: stored.cluster.cache_cluster_id.clone(),
                snapshot_status: "available".to_string(),
                engine: stored.cluster.engine.clone(),
                node_snapshots: Self::node_snapshots(&stored.cluster),
            })
        };
        if let Some(snapshot) = snapshot {
            self.snapshots.insert(snapshot.snapshot_name.clone(), snapshot);
        }
        Ok(())
    }

    async fn reboot_cache_cluster(&self, cache_cluster_id: &str, node_ids: Vec<String>) -> ProviderResult<()> {
        self.check_failure(ElastiCacheOperation::Reboot)?;
        let mut stored = self
            .clusters
            .get_mut(cache_cluster_id)
            .ok_or_else(|| ProviderError::NotFound(format!("cache cluster {cache_cluster_id}")))?;
        debug!(cache_cluster_id = cache_cluster_id, nodes = node_ids.len(), "In-memory reboot");
        stored.cluster.cache_cluster_status = "rebooting".to_string();
        Ok(())
    }

    async fn add_tags(&self, resource_name: &str, tags: Vec<Tag>) -> ProviderResult<()> {
        self.check_failure(ElastiCacheOperation::Tag)?;
        let mut stored = self
            .clusters
            .get_mut(resource_name)
            .ok_or_else(|| ProviderError::NotFound(format!("cache cluster {resource_name}")))?;
        for tag in tags {
            stored.tags.insert(tag.key, tag.value);
        }
        Ok(())
    }

    async fn remove_tags(&self, resource_name: &str, keys: Vec<String>) -> ProviderResult<()> {
        self.check_failure(ElastiCacheOperation::Untag)?;
        let mut stored = self
            .clusters
            .get_mut(resource_name)
            .ok_or_else(|| ProviderError::NotFound(format!("cache cluster {resource_name}")))?;
        for key in keys {
            stored.tags.remove(&key);
        }
        Ok(())
    }

    async fn describe_snapshots(
        &self,
        cache_cluster_id: &str,
        snapshot_name: Option<&str>,
    ) -> ProviderResult<Vec<Snapshot>> {
        self.check_failure(ElastiCacheOperation::DescribeSnapshots)?;
        let auto_advance = self.auto_advance.load(Ordering::SeqCst);
        let mut found: Vec<Snapshot> = self
            .snapshots
            .iter_mut()
            .filter(|s| s.cache_cluster_id == cache_cluster_id)
            .filter(|s| snapshot_name.map_or(true, |name| s.snapshot_name == name))
            .map(|mut s| {
                if auto_advance && s.snapshot_status == "creating" {
                    s.snapshot_status = "available".to_string();
                }
                s.clone()
            })
            .collect();
        found.sort_by(|a, b| a.snapshot_name.cmp(&b.snapshot_name));
        Ok(found)
    }

    async fn create_snapshot(&self, cache_cluster_id: &str, snapshot_name: &str) -> ProviderResult<Snapshot> {
        self.check_failure(ElastiCacheOperation::CreateSnapshot)?;
        let snapshot = {
            let stored = self
                .clusters
                .get(cache_cluster_id)
                .ok_or_else(|| ProviderError::NotFound(format!("cache cluster {cache_cluster_id}")))?;
            if stored.cluster.cache_cluster_status != "available" {
                return Err(ProviderError::InvalidState(format!(
                    "InvalidCacheClusterState: {cache_cluster_id} is {}",
                    stored.cluster.cache_cluster_status
                )));
            }
            Snapshot {
                snapshot_name: snapshot_name.to_string(),
                cache_cluster_id: cache_cluster_id.to_string(),
                snapshot_status: "creating".to_string(),
                engine: stored.cluster.engine.clone(),
                node_snapshots: Self::node_snapshots(&stored.cluster),
            }
        };
        if self.snapshots.contains_key(snapshot_name) {
            return Err(ProviderError::Backend(format!(
                "SnapshotAlreadyExistsFault: {snapshot_name}"
            )));
        }
        self.snapshots
            .insert(snapshot_name.to_string(), snapshot.clone());
        Ok(snapshot)
    }
}
