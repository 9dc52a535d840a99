//! # Kubernetes Client Seam
//!
//! The container providers manage one Deployment and one Service per instance through
//! [`KubernetesApi`]. Only the fields the providers read or write are modeled.
//!
//! [`InMemoryKubernetes`] stands in for a cluster in test mode. New deployments start with
//! zero ready replicas; with auto-rollout enabled (the default) the rollout completes on
//! the next read, otherwise [`InMemoryKubernetes::complete_rollout`] finishes it.

use crate::config::BrokerConfig;
use crate::error::{ProviderError, ProviderResult};
use crate::providers::random_suffix;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::debug;

pub type Labels = BTreeMap<String, String>;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Container {
    pub name: String,
    pub image: String,
    pub args: Vec<String>,
    pub container_port: i32,
    /// Memory limit quantity, e.g. `256Mi`
    pub memory_limit: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deployment {
    pub name: String,
    pub namespace: String,
    pub labels: Labels,
    pub annotations: Labels,
    pub selector: Labels,
    pub replicas: i32,
    pub ready_replicas: i32,
    pub container: Container,
}

impl Deployment {
    /// Every desired replica reports ready
    pub fn is_ready(&self) -> bool {
        self.ready_replicas == self.replicas
    }

    /// Rollout state as `kubectl rollout status` would phrase it
    pub fn rollout_state(&self) -> &'static str {
        if self.is_ready() {
            ROLLOUT_COMPLETE
        } else {
            ROLLOUT_PROGRESSING
        }
    }
}

pub const ROLLOUT_COMPLETE: &str = "complete";
pub const ROLLOUT_PROGRESSING: &str = "progressing";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServicePort {
    pub port: i32,
    pub target_port: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    pub name: String,
    pub namespace: String,
    pub service_type: String,
    pub labels: Labels,
    pub annotations: Labels,
    pub selector: Labels,
    pub ports: Vec<ServicePort>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pod {
    pub name: String,
    pub namespace: String,
    pub labels: Labels,
}

/// Parse an equality-based label selector such as `app=cacheabc,tier=cache`
pub fn parse_selector(selector: &str) -> Labels {
    selector
        .split(',')
        .filter_map(|term| term.split_once('='))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .collect()
}

pub fn selector_matches(selector: &Labels, labels: &Labels) -> bool {
    selector
        .iter()
        .all(|(key, value)| labels.get(key) == Some(value))
}

/// Container orchestrator API
#[async_trait]
pub trait KubernetesApi: Send + Sync + fmt::Debug {
    async fn create_deployment(&self, deployment: Deployment) -> ProviderResult<Deployment>;

    /// Fetch a deployment; [`ProviderError::NotFound`] when absent
    async fn get_deployment(&self, namespace: &str, name: &str) -> ProviderResult<Deployment>;

    async fn update_deployment(&self, deployment: Deployment) -> ProviderResult<Deployment>;

    async fn delete_deployment(&self, namespace: &str, name: &str) -> ProviderResult<()>;

    async fn create_service(&self, service: Service) -> ProviderResult<Service>;

    async fn get_service(&self, namespace: &str, name: &str) -> ProviderResult<Service>;

    async fn delete_service(&self, namespace: &str, name: &str) -> ProviderResult<()>;

    async fn list_pods(&self, namespace: &str, label_selector: &str) -> ProviderResult<Vec<Pod>>;

    /// Delete every pod matching the selector, returning how many were removed
    async fn delete_pods(&self, namespace: &str, label_selector: &str) -> ProviderResult<usize>;
}

/// How the broker reaches a real cluster
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KubeContext {
    /// Service account credentials mounted into the pod
    InCluster,
    /// A kubeconfig file on the local machine
    Local(PathBuf),
}

/// Decide which cluster credentials to use
///
/// In-cluster configuration wins. Falling back to `~/.kube/config` requires
/// `USE_LOCAL_KUBE_CONTEXT`.
pub fn resolve_kube_context(config: &BrokerConfig) -> ProviderResult<KubeContext> {
    if std::env::var("KUBERNETES_SERVICE_HOST").is_ok_and(|host| !host.is_empty()) {
        return Ok(KubeContext::InCluster);
    }
    if !config.use_local_kube_context {
        return Err(ProviderError::NoProvider(
            "Not running inside a cluster and USE_LOCAL_KUBE_CONTEXT is not enabled".to_string(),
        ));
    }
    let home = std::env::var("HOME")
        .or_else(|_| std::env::var("USERPROFILE"))
        .map_err(|_| ProviderError::NoProvider("Unable to locate a home directory".to_string()))?;
    let path = PathBuf::from(home).join(".kube").join("config");
    if !path.exists() {
        return Err(ProviderError::NoProvider(format!(
            "Kubernetes config not found at {}",
            path.display()
        )));
    }
    Ok(KubeContext::Local(path))
}

/// Operations of [`InMemoryKubernetes`] that can be made to fail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KubernetesOperation {
    CreateDeployment,
    GetDeployment,
    UpdateDeployment,
    DeleteDeployment,
    CreateService,
    DeleteService,
    DeletePods,
}

type Key = (String, String);

fn key(namespace: &str, name: &str) -> Key {
    (namespace.to_string(), name.to_string())
}

#[derive(Debug, Default)]
struct ClusterState {
    deployments: HashMap<Key, Deployment>,
    services: HashMap<Key, Service>,
    pods: HashMap<Key, Pod>,
}

impl ClusterState {
    fn spawn_pods(&mut self, deployment: &Deployment, count: i32) {
        for _ in 0..count {
            let pod = Pod {
                name: format!("{}-{}", deployment.name, random_suffix(5)),
                namespace: deployment.namespace.clone(),
                labels: deployment.selector.clone(),
            };
            self.pods.insert(key(&pod.namespace, &pod.name), pod);
        }
    }

    fn matching_pods(&self, namespace: &str, selector: &Labels) -> Vec<Key> {
        self.pods
            .iter()
            .filter(|((ns, _), pod)| ns == namespace && selector_matches(selector, &pod.labels))
            .map(|(k, _)| k.clone())
            .collect()
    }
}

/// In-memory cluster
#[derive(Debug)]
pub struct InMemoryKubernetes {
    state: RwLock<ClusterState>,
    failures: RwLock<HashMap<KubernetesOperation, ProviderError>>,
    auto_rollout: AtomicBool,
}

impl Default for InMemoryKubernetes {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryKubernetes {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(ClusterState::default()),
            failures: RwLock::new(HashMap::new()),
            auto_rollout: AtomicBool::new(true),
        }
    }

    /// Leave new deployments unready until [`Self::complete_rollout`]
    pub fn with_manual_rollout(self) -> Self {
        self.auto_rollout.store(false, Ordering::SeqCst);
        self
    }

    pub fn complete_rollout(&self, namespace: &str, name: &str) {
        if let Some(deployment) = self.state.write().deployments.get_mut(&key(namespace, name)) {
            deployment.ready_replicas = deployment.replicas;
        }
    }

    pub fn fail_on(&self, operation: KubernetesOperation, error: ProviderError) {
        self.failures.write().insert(operation, error);
    }

    pub fn clear_failure(&self, operation: KubernetesOperation) {
        self.failures.write().remove(&operation);
    }

    pub fn deployment(&self, namespace: &str, name: &str) -> Option<Deployment> {
        self.state
            .read()
            .deployments
            .get(&key(namespace, name))
            .cloned()
    }

    pub fn service(&self, namespace: &str, name: &str) -> Option<Service> {
        self.state.read().services.get(&key(namespace, name)).cloned()
    }

    pub fn pod_names(&self, namespace: &str, label_selector: &str) -> Vec<String> {
        let selector = parse_selector(label_selector);
        let state = self.state.read();
        let mut names: Vec<String> = state
            .matching_pods(namespace, &selector)
            .into_iter()
            .map(|(_, name)| name)
            .collect();
        names.sort();
        names
    }

    fn check_failure(&self, operation: KubernetesOperation) -> ProviderResult<()> {
        match self.failures.read().get(&operation) {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }

    fn not_found(kind: &str, namespace: &str, name: &str) -> ProviderError {
        ProviderError::NotFound(format!("{kind} {namespace}/{name}"))
    }
}

#[async_trait]
impl KubernetesApi for InMemoryKubernetes {
    async fn create_deployment(&self, mut deployment: Deployment) -> ProviderResult<Deployment> {
        self.check_failure(KubernetesOperation::CreateDeployment)?;
        let mut state = self.state.write();
        let k = key(&deployment.namespace, &deployment.name);
        if state.deployments.contains_key(&k) {
            return Err(ProviderError::Backend(format!(
                "deployments \"{}\" already exists",
                deployment.name
            )));
        }
        deployment.ready_replicas = 0;
        state.spawn_pods(&deployment, deployment.replicas);
        state.deployments.insert(k, deployment.clone());
        debug!(namespace = %deployment.namespace, name = %deployment.name, "In-memory deployment created");
        Ok(deployment)
    }

    async fn get_deployment(&self, namespace: &str, name: &str) -> ProviderResult<Deployment> {
        self.check_failure(KubernetesOperation::GetDeployment)?;
        let mut state = self.state.write();
        let deployment = state
            .deployments
            .get_mut(&key(namespace, name))
            .ok_or_else(|| Self::not_found("deployment", namespace, name))?;
        let snapshot = deployment.clone();
        if self.auto_rollout.load(Ordering::SeqCst) {
            deployment.ready_replicas = deployment.replicas;
        }
        Ok(snapshot)
    }

    async fn update_deployment(&self, deployment: Deployment) -> ProviderResult<Deployment> {
        self.check_failure(KubernetesOperation::UpdateDeployment)?;
        let mut state = self.state.write();
        let existing = state
            .deployments
            .get_mut(&key(&deployment.namespace, &deployment.name))
            .ok_or_else(|| Self::not_found("deployment", &deployment.namespace, &deployment.name))?;
        existing.labels = deployment.labels;
        existing.annotations = deployment.annotations;
        existing.container = deployment.container;
        existing.replicas = deployment.replicas;
        Ok(existing.clone())
    }

    async fn delete_deployment(&self, namespace: &str, name: &str) -> ProviderResult<()> {
        self.check_failure(KubernetesOperation::DeleteDeployment)?;
        let mut state = self.state.write();
        let removed = state
            .deployments
            .remove(&key(namespace, name))
            .ok_or_else(|| Self::not_found("deployment", namespace, name))?;
        for pod in state.matching_pods(namespace, &removed.selector) {
            state.pods.remove(&pod);
        }
        Ok(())
    }

    async fn create_service(&self, service: Service) -> ProviderResult<Service> {
        self.check_failure(KubernetesOperation::CreateService)?;
        let mut state = self.state.write();
        let k = key(&service.namespace, &service.name);
        if state.services.contains_key(&k) {
            return Err(ProviderError::Backend(format!(
                "services \"{}\" already exists",
                service.name
            )));
        }
        state.services.insert(k, service.clone());
        Ok(service)
    }

    async fn get_service(&self, namespace: &str, name: &str) -> ProviderResult<Service> {
        self.state
            .read()
            .services
            .get(&key(namespace, name))
            .cloned()
            .ok_or_else(|| Self::not_found("service", namespace, name))
    }

    async fn delete_service(&self, namespace: &str, name: &str) -> ProviderResult<()> {
        self.check_failure(KubernetesOperation::DeleteService)?;
        self.state
            .write()
            .services
            .remove(&key(namespace, name))
            .map(|_| ())
            .ok_or_else(|| Self::not_found("service", namespace, name))
    }

    async fn list_pods(&self, namespace: &str, label_selector: &str) -> ProviderResult<Vec<Pod>> {
        let selector = parse_selector(label_selector);
        let state = self.state.read();
        Ok(state
            .matching_pods(namespace, &selector)
            .iter()
            .filter_map(|k| state.pods.get(k).cloned())
            .collect())
    }

    async fn delete_pods(&self, namespace: &str, label_selector: &str) -> ProviderResult<usize> {
        self.check_failure(KubernetesOperation::DeletePods)?;
        let selector = parse_selector(label_selector);
        let mut state = self.state.write();
        let doomed = state.matching_pods(namespace, &selector);
        for pod in &doomed {
            state.pods.remove(pod);
        }

        // owning deployments replace what was deleted
        let owners: Vec<Deployment> = state
            .deployments
            .values()
            .filter(|d| d.namespace == namespace && selector_matches(&selector, &d.selector))
            .cloned()
            .collect();
        for deployment in owners {
            state.spawn_pods(&deployment, deployment.replicas);
        }
        Ok(doomed.len())
    }
}
