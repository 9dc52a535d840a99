//! Shared fixtures for the integration tests.
//!
//! Every fixture runs against the in-memory backends with the instance cache disabled and
//! millisecond polling, so backend state changes are visible on the next call.

#![allow(dead_code)]

use cache_broker::config::BrokerConfig;
use cache_broker::models::{CatalogPlan, ProviderKind, ProviderPlan, Service};
use cache_broker::orchestration::{Broker, ProvisionRequest};
use cache_broker::providers::elasticache::{ElastiCacheApi, InMemoryElastiCache};
use cache_broker::providers::kubernetes::{InMemoryKubernetes, KubernetesApi};
use cache_broker::providers::BackendClients;
use cache_broker::storage::{InMemoryStorage, Storage};
use cache_broker::tasks::TaskExecutor;
use std::sync::Arc;
use uuid::Uuid;

pub const REDIS_SMALL: &str = "redis-small";
pub const REDIS_LARGE: &str = "redis-large";
pub const MEMCACHED_SMALL: &str = "memcached-small";
pub const K8S_REDIS: &str = "k8s-redis";
pub const K8S_MEMCACHED: &str = "k8s-memcached";

pub fn test_config() -> BrokerConfig {
    BrokerConfig {
        test: true,
        use_kubernetes: true,
        instance_cache_ttl_seconds: 0,
        poll_interval_ms: 1,
        poll_max_attempts: 5,
        ..BrokerConfig::default()
    }
}

fn catalog_plan(id: &str) -> CatalogPlan {
    CatalogPlan {
        id: id.to_string(),
        name: id.to_string(),
        description: format!("{id} plan"),
        free: false,
    }
}

fn aws_plan(id: &str, kind: ProviderKind, scheme: &str, engine: &str, node_type: &str) -> ProviderPlan {
    ProviderPlan::new(
        id,
        kind,
        scheme,
        format!(
            r#"{{"CacheNodeType":"{node_type}","Engine":"{engine}","NumCacheNodes":1,"SecurityGroupIds":["sg-1"]}}"#
        ),
        catalog_plan(id),
    )
}

pub fn plans() -> Vec<ProviderPlan> {
    vec![
        aws_plan(REDIS_SMALL, ProviderKind::AwsRedis, "redis", "redis", "cache.t2.micro"),
        aws_plan(REDIS_LARGE, ProviderKind::AwsRedis, "redis", "redis", "cache.m5.large"),
        aws_plan(
            MEMCACHED_SMALL,
            ProviderKind::AwsMemcached,
            "memcached",
            "memcached",
            "cache.t2.micro",
        ),
        ProviderPlan::new(
            K8S_REDIS,
            ProviderKind::KubernetesRedis,
            "redis",
            r#"{"size_in_megabytes":"256","version":"7.0"}"#,
            catalog_plan(K8S_REDIS),
        ),
        ProviderPlan::new(
            K8S_MEMCACHED,
            ProviderKind::KubernetesMemcached,
            "memcached",
            r#"{"size_in_megabytes":128,"version":"1.6"}"#,
            catalog_plan(K8S_MEMCACHED),
        ),
    ]
}

/// Broker wired to inspectable in-memory collaborators
pub struct TestBroker {
    pub broker: Broker,
    pub executor: TaskExecutor,
    pub storage: Arc<InMemoryStorage>,
    pub elasticache: Arc<InMemoryElastiCache>,
    pub kubernetes: Arc<InMemoryKubernetes>,
}

impl TestBroker {
    pub async fn new() -> Self {
        Self::with_backends(InMemoryElastiCache::new(), InMemoryKubernetes::new()).await
    }

    pub async fn with_backends(elasticache: InMemoryElastiCache, kubernetes: InMemoryKubernetes) -> Self {
        let storage = Arc::new(InMemoryStorage::new());
        for plan in plans() {
            storage.add_plan(plan).await;
        }
        storage
            .add_service(Service {
                id: "cache-service".to_string(),
                name: "cache".to_string(),
                description: "Redis and Memcached instances".to_string(),
                bindable: true,
                plan_updateable: true,
                plans: plans().into_iter().map(|plan| plan.base_plan).collect(),
            })
            .await;

        let elasticache = Arc::new(elasticache);
        let kubernetes = Arc::new(kubernetes);
        let clients = BackendClients {
            elasticache: Some(elasticache.clone() as Arc<dyn ElastiCacheApi>),
            kubernetes: Some(kubernetes.clone() as Arc<dyn KubernetesApi>),
        };
        let broker = Broker::from_config(&test_config(), storage.clone() as Arc<dyn Storage>, clients)
            .expect("broker should build from test config");
        let executor = TaskExecutor::new(storage.clone() as Arc<dyn Storage>, broker.providers().clone());

        Self {
            broker,
            executor,
            storage,
            elasticache,
            kubernetes,
        }
    }

    /// Provision a fresh instance and return its id
    pub async fn provision(&self, plan_id: &str) -> String {
        let instance_id = new_instance_id();
        self.broker
            .provision(provision_request(&instance_id, plan_id))
            .await
            .expect("provision should succeed");
        instance_id
    }

    /// Run queued tasks until the queue is empty or `limit` runs happened
    pub async fn drain_tasks(&self, limit: usize) -> usize {
        let mut runs = 0;
        while runs < limit {
            match self.executor.run_next().await.expect("task queue should be readable") {
                Some(_) => runs += 1,
                None => break,
            }
        }
        runs
    }
}

pub fn new_instance_id() -> String {
    Uuid::new_v4().to_string()
}

pub fn provision_request(instance_id: &str, plan_id: &str) -> ProvisionRequest {
    ProvisionRequest {
        instance_id: instance_id.to_string(),
        plan_id: plan_id.to_string(),
        accepts_incomplete: true,
        organization_guid: "org-1".to_string(),
        webhook: None,
    }
}
