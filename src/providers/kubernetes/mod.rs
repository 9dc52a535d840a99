//! # Container Providers
//!
//! Redis and Memcached run as a single-replica Deployment fronted by a NodePort Service,
//! both named after the instance and labeled `app=<name>`. The owning organization is
//! kept in an `owner` annotation, which also carries over when a plan change recreates
//! the pair.
//!
//! | Engine    | Namespace          | Port                 | Image                 |
//! |-----------|--------------------|----------------------|-----------------------|
//! | redis     | `redis-system`     | 6379                 | `redis:<version>`     |
//! | memcached | `memcached-system` | plan port or 11211   | plan image or `memcached` |
//!
//! Deployments report a rollout state rather than a status string. The driver declares
//! `complete` and `progressing` as synonyms of `available` and `creating`, and instances
//! carry the canonical spelling.

pub mod client;
pub mod cluster;
pub mod memcached;
pub mod redis;

pub use client::{
    resolve_kube_context, Container, Deployment, InMemoryKubernetes, KubeContext, KubernetesApi,
    KubernetesOperation, Labels, Pod, Service, ServicePort, ROLLOUT_COMPLETE, ROLLOUT_PROGRESSING,
};
pub use cluster::KubeClusterClient;
pub use memcached::KubernetesMemcachedProvider;
pub use redis::KubernetesRedisProvider;

use crate::error::{ProviderError, ProviderResult};
use crate::models::{Instance, ProviderPlan};
use crate::providers::workflow::{WorkflowKind, WorkflowProgress, WorkflowStep};
use crate::providers::{random_suffix, InstanceCache, PollSettings};
use crate::status::{StatusClassifier, StatusFamily};
use serde::{Deserialize, Deserializer};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

pub const OWNER_ANNOTATION: &str = "owner";
const APP_LABEL: &str = "app";
const NAME_SUFFIX_LEN: usize = 9;

/// Private settings of a container plan
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ContainerPlanSettings {
    #[serde(deserialize_with = "string_or_number")]
    pub size_in_megabytes: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub docker_image: Option<String>,
    #[serde(default)]
    pub port: Option<i32>,
}

fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Number(i64),
    }
    Ok(match Raw::deserialize(deserializer)? {
        Raw::Text(text) => text,
        Raw::Number(number) => number.to_string(),
    })
}

/// Engine-specific container layout
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerEngine {
    Redis,
    Memcached,
}

impl ContainerEngine {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Redis => "redis",
            Self::Memcached => "memcached",
        }
    }

    pub fn namespace(&self) -> &'static str {
        match self {
            Self::Redis => "redis-system",
            Self::Memcached => "memcached-system",
        }
    }

    pub fn port(&self, settings: &ContainerPlanSettings) -> i32 {
        match self {
            Self::Redis => 6379,
            Self::Memcached => settings.port.filter(|port| *port != 0).unwrap_or(11211),
        }
    }

    pub fn image(&self, settings: &ContainerPlanSettings) -> String {
        let base = match self {
            Self::Redis => "redis".to_string(),
            Self::Memcached => settings
                .docker_image
                .clone()
                .filter(|image| !image.is_empty())
                .unwrap_or_else(|| "memcached".to_string()),
        };
        format!("{base}:{}", settings.version)
    }

    pub fn args(&self, settings: &ContainerPlanSettings) -> Vec<String> {
        match self {
            Self::Redis => Vec::new(),
            Self::Memcached => vec![
                format!("-m {}", settings.size_in_megabytes),
                "-I 50M".to_string(),
            ],
        }
    }
}

/// Deployment and service bookkeeping shared by both container engines
#[derive(Debug)]
pub struct DeploymentDriver {
    client: Arc<dyn KubernetesApi>,
    engine: ContainerEngine,
    name_prefix: String,
    cache: InstanceCache,
    poll: PollSettings,
    statuses: StatusClassifier,
}

/// Rollout states in terms of the cache cluster vocabulary
pub fn rollout_classifier() -> StatusClassifier {
    StatusClassifier::new().with_synonyms(
        StatusFamily::CacheCluster,
        [(ROLLOUT_COMPLETE, "available"), (ROLLOUT_PROGRESSING, "creating")],
    )
}

impl DeploymentDriver {
    pub fn new(
        client: Arc<dyn KubernetesApi>,
        engine: ContainerEngine,
        name_prefix: &str,
        cache_ttl: Duration,
        poll: PollSettings,
    ) -> Self {
        Self {
            client,
            engine,
            name_prefix: name_prefix.to_string(),
            cache: InstanceCache::new(cache_ttl),
            poll,
            statuses: rollout_classifier(),
        }
    }

    pub fn engine(&self) -> ContainerEngine {
        self.engine
    }

    pub fn namespace(&self) -> &'static str {
        self.engine.namespace()
    }

    pub fn settings(plan: &ProviderPlan) -> ProviderResult<ContainerPlanSettings> {
        Ok(plan.settings::<ContainerPlanSettings>()?)
    }

    /// `name_prefix + lower(random)`
    pub fn generate_name(&self) -> String {
        format!(
            "{}{}",
            self.name_prefix,
            random_suffix(NAME_SUFFIX_LEN).to_lowercase()
        )
    }

    pub fn endpoint(&self, name: &str, settings: &ContainerPlanSettings) -> String {
        format!(
            "{name}.{}.svc.cluster.local:{}",
            self.namespace(),
            self.engine.port(settings)
        )
    }

    fn instance(
        &self,
        id: &str,
        name: &str,
        plan: &ProviderPlan,
        settings: &ContainerPlanSettings,
        rollout_state: &str,
    ) -> Instance {
        Instance {
            id: id.to_string(),
            name: name.to_string(),
            provider_id: name.to_string(),
            plan: Some(plan.clone()),
            username: String::new(),
            password: String::new(),
            endpoint: self.endpoint(name, settings),
            status: self.statuses.canonical(rollout_state).to_string(),
            ready: self.statuses.is_ready(rollout_state),
            engine: self.engine.name().to_string(),
            engine_version: settings.version.clone(),
            scheme: plan.scheme.clone(),
        }
    }

    pub async fn get_instance(&self, name: &str, plan: &ProviderPlan) -> ProviderResult<Instance> {
        self.cache
            .get_or_load(name, &plan.id, || async {
                let deployment = self.client.get_deployment(self.namespace(), name).await?;
                let settings = Self::settings(plan)?;
                Ok(self.instance("", name, plan, &settings, deployment.rollout_state()))
            })
            .await
    }

    pub async fn provision(&self, id: &str, plan: &ProviderPlan, owner: &str) -> ProviderResult<Instance> {
        let name = self.generate_name();
        self.provision_named(id, &name, plan, owner).await
    }

    /// Create the deployment and service for `name`
    pub async fn provision_named(
        &self,
        id: &str,
        name: &str,
        plan: &ProviderPlan,
        owner: &str,
    ) -> ProviderResult<Instance> {
        let settings = Self::settings(plan)?;
        let port = self.engine.port(&settings);
        let labels = Labels::from([(APP_LABEL.to_string(), name.to_string())]);
        let annotations = Labels::from([(OWNER_ANNOTATION.to_string(), owner.to_string())]);

        let deployment = self
            .client
            .create_deployment(Deployment {
                name: name.to_string(),
                namespace: self.namespace().to_string(),
                labels: labels.clone(),
                annotations: annotations.clone(),
                selector: labels.clone(),
                replicas: 1,
                ready_replicas: 0,
                container: Container {
                    name: self.engine.name().to_string(),
                    image: self.engine.image(&settings),
                    args: self.engine.args(&settings),
                    container_port: port,
                    memory_limit: format!("{}Mi", settings.size_in_megabytes),
                },
            })
            .await?;

        let service = Service {
            name: name.to_string(),
            namespace: self.namespace().to_string(),
            service_type: "NodePort".to_string(),
            labels: labels.clone(),
            annotations,
            selector: labels,
            ports: vec![ServicePort {
                port,
                target_port: port,
            }],
        };
        if let Err(e) = self.client.create_service(service).await {
            warn!(name = name, error = %e, "Service creation failed, removing deployment");
            if let Err(cleanup) = self.client.delete_deployment(self.namespace(), name).await {
                warn!(name = name, error = %cleanup, "Deployment cleanup failed");
            }
            return Err(e);
        }

        info!(
            instance_id = id,
            name = name,
            namespace = self.namespace(),
            engine = self.engine.name(),
            "🚀 Deployment and service created"
        );
        self.cache.invalidate(name).await;
        Ok(self.instance(id, name, plan, &settings, deployment.rollout_state()))
    }

    /// Remove the service, then the deployment
    pub async fn deprovision(&self, instance: &Instance) -> ProviderResult<()> {
        self.client
            .delete_service(self.namespace(), &instance.name)
            .await?;
        self.client
            .delete_deployment(self.namespace(), &instance.name)
            .await?;
        self.cache.invalidate(&instance.name).await;
        info!(instance_id = %instance.id, name = %instance.name, "🗑️ Deployment and service removed");
        Ok(())
    }

    /// Recreate the pair under the same name with the new plan, keeping the owner
    pub async fn recreate(&self, instance: &Instance, plan: &ProviderPlan) -> ProviderResult<Instance> {
        let mut progress = WorkflowProgress::new(WorkflowKind::RecreateModify, &instance.provider_id);

        let owner = progress
            .step(WorkflowStep::ReadOwner, async {
                let deployment = self
                    .client
                    .get_deployment(self.namespace(), &instance.provider_id)
                    .await?;
                Ok(deployment
                    .annotations
                    .get(OWNER_ANNOTATION)
                    .cloned()
                    .unwrap_or_default())
            })
            .await?;

        progress
            .step(WorkflowStep::Deprovision, self.deprovision(instance))
            .await?;

        progress
            .step(WorkflowStep::AwaitDeletion, async {
                self.poll
                    .until(&format!("deletion of {}", instance.provider_id), || async {
                        match self
                            .client
                            .get_deployment(self.namespace(), &instance.provider_id)
                            .await
                        {
                            Err(e) if e.is_not_found() => Ok(true),
                            Err(e) => Err(e),
                            Ok(_) => Ok(false),
                        }
                    })
                    .await
            })
            .await?;

        let recreated = progress
            .step(
                WorkflowStep::Provision,
                self.provision_named(&instance.id, &instance.provider_id, plan, &owner),
            )
            .await?;
        progress.finish();
        Ok(recreated)
    }

    async fn update_annotations<F>(&self, instance: &Instance, change: F) -> ProviderResult<()>
    where
        F: FnOnce(&mut Labels) + Send,
    {
        let mut deployment = self
            .client
            .get_deployment(self.namespace(), &instance.provider_id)
            .await?;
        change(&mut deployment.annotations);
        self.client.update_deployment(deployment).await?;
        Ok(())
    }

    pub async fn tag(&self, instance: &Instance, key: &str, value: &str) -> ProviderResult<()> {
        self.update_annotations(instance, |annotations| {
            annotations.insert(key.to_string(), value.to_string());
        })
        .await
    }

    pub async fn untag(&self, instance: &Instance, key: &str) -> ProviderResult<()> {
        self.update_annotations(instance, |annotations| {
            annotations.remove(key);
        })
        .await
    }

    /// Delete the instance's pods; the deployment schedules replacements
    pub async fn restart(&self, instance: &Instance) -> ProviderResult<()> {
        let selector = format!("{APP_LABEL}={}", instance.provider_id);
        let deleted = self.client.delete_pods(self.namespace(), &selector).await?;
        if deleted == 0 {
            return Err(ProviderError::NotFound(format!(
                "no pods matching {selector}"
            )));
        }
        self.cache.invalidate(&instance.name).await;
        info!(instance_id = %instance.id, pods = deleted, "🔄 Pods deleted for restart");
        Ok(())
    }
}
