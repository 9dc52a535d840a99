//! # Kubernetes over kube-rs
//!
//! [`KubeClusterClient`] implements [`KubernetesApi`] against a real API server with
//! `kube` and the `k8s-openapi` resource types. Only the fields modeled by
//! [`Deployment`], [`Service`] and [`Pod`] are written; updates replace the live object
//! while keeping its resource version.

use super::client::{
    Container, Deployment, KubeContext, KubernetesApi, Labels, Pod, Service, ServicePort,
};
use crate::error::{ProviderError, ProviderResult};
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{Deployment as KubeDeployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    Container as KubeContainer, ContainerPort, Pod as KubePod, PodSpec, PodTemplateSpec,
    ResourceRequirements, Service as KubeService, ServicePort as KubeServicePort, ServiceSpec,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::Client;
use std::collections::BTreeMap;
use std::fmt;
use tracing::{debug, info};

/// Client for the cluster selected by a [`KubeContext`]
#[derive(Clone)]
pub struct KubeClusterClient {
    client: Client,
    context: KubeContext,
}

impl fmt::Debug for KubeClusterClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KubeClusterClient")
            .field("context", &self.context)
            .finish()
    }
}

impl KubeClusterClient {
    /// Build a client from in-cluster credentials or the local kubeconfig
    pub async fn connect(context: &KubeContext) -> ProviderResult<Self> {
        let config = match context {
            KubeContext::InCluster => kube::Config::incluster().map_err(|e| {
                ProviderError::NoProvider(format!("In-cluster configuration failed: {e}"))
            })?,
            KubeContext::Local(path) => {
                let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
                    ProviderError::NoProvider(format!("Unable to read {}: {e}", path.display()))
                })?;
                kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                    .await
                    .map_err(|e| {
                        ProviderError::NoProvider(format!("Invalid kubeconfig {}: {e}", path.display()))
                    })?
            }
        };
        let client = Client::try_from(config)
            .map_err(|e| ProviderError::NoProvider(format!("Kubernetes client setup failed: {e}")))?;
        info!(context = ?context, "☸️ Kubernetes client configured");
        Ok(Self {
            client,
            context: context.clone(),
        })
    }

    pub fn context(&self) -> &KubeContext {
        &self.context
    }

    fn deployments(&self, namespace: &str) -> Api<KubeDeployment> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn services(&self, namespace: &str) -> Api<KubeService> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn pods(&self, namespace: &str) -> Api<KubePod> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

fn kube_error(operation: &str, error: kube::Error) -> ProviderError {
    match error {
        kube::Error::Api(response) if response.code == 404 => {
            ProviderError::NotFound(format!("{operation}: {}", response.message))
        }
        kube::Error::Api(response) if response.code == 409 => {
            ProviderError::InvalidState(format!("{operation}: {}", response.message))
        }
        other => ProviderError::Backend(format!("{operation}: {other}")),
    }
}

fn metadata(name: &str, namespace: &str, labels: &Labels, annotations: &Labels) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(namespace.to_string()),
        labels: Some(labels.clone()),
        annotations: Some(annotations.clone()),
        ..Default::default()
    }
}

fn container_to_kube(container: &Container) -> KubeContainer {
    KubeContainer {
        name: container.name.clone(),
        image: Some(container.image.clone()),
        args: (!container.args.is_empty()).then(|| container.args.clone()),
        ports: Some(vec![ContainerPort {
            container_port: container.container_port,
            ..Default::default()
        }]),
        resources: Some(ResourceRequirements {
            limits: Some(BTreeMap::from([(
                "memory".to_string(),
                Quantity(container.memory_limit.clone()),
            )])),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn container_from_kube(container: KubeContainer) -> Container {
    Container {
        container_port: container
            .ports
            .as_ref()
            .and_then(|ports| ports.first())
            .map(|port| port.container_port)
            .unwrap_or_default(),
        memory_limit: container
            .resources
            .and_then(|resources| resources.limits)
            .and_then(|mut limits| limits.remove("memory"))
            .map(|quantity| quantity.0)
            .unwrap_or_default(),
        image: container.image.unwrap_or_default(),
        args: container.args.unwrap_or_default(),
        name: container.name,
    }
}

fn deployment_to_kube(deployment: &Deployment) -> KubeDeployment {
    KubeDeployment {
        metadata: metadata(
            &deployment.name,
            &deployment.namespace,
            &deployment.labels,
            &deployment.annotations,
        ),
        spec: Some(DeploymentSpec {
            replicas: Some(deployment.replicas),
            selector: LabelSelector {
                match_labels: Some(deployment.selector.clone()),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(deployment.selector.clone()),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![container_to_kube(&deployment.container)],
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn deployment_from_kube(deployment: KubeDeployment) -> Deployment {
    let ready_replicas = deployment
        .status
        .as_ref()
        .and_then(|status| status.ready_replicas)
        .unwrap_or(0);
    let spec = deployment.spec.unwrap_or_default();
    let container = spec
        .template
        .spec
        .and_then(|pod| pod.containers.into_iter().next())
        .map(container_from_kube)
        .unwrap_or_default();
    let meta = deployment.metadata;
    Deployment {
        name: meta.name.unwrap_or_default(),
        namespace: meta.namespace.unwrap_or_default(),
        labels: meta.labels.unwrap_or_default(),
        annotations: meta.annotations.unwrap_or_default(),
        selector: spec.selector.match_labels.unwrap_or_default(),
        replicas: spec.replicas.unwrap_or(1),
        ready_replicas,
        container,
    }
}

fn service_to_kube(service: &Service) -> KubeService {
    KubeService {
        metadata: metadata(&service.name, &service.namespace, &service.labels, &service.annotations),
        spec: Some(ServiceSpec {
            type_: Some(service.service_type.clone()),
            selector: Some(service.selector.clone()),
            ports: Some(
                service
                    .ports
                    .iter()
                    .map(|port| KubeServicePort {
                        port: port.port,
                        target_port: Some(IntOrString::Int(port.target_port)),
                        ..Default::default()
                    })
                    .collect(),
            ),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn service_from_kube(service: KubeService) -> Service {
    let spec = service.spec.unwrap_or_default();
    let meta = service.metadata;
    Service {
        name: meta.name.unwrap_or_default(),
        namespace: meta.namespace.unwrap_or_default(),
        service_type: spec.type_.unwrap_or_default(),
        labels: meta.labels.unwrap_or_default(),
        annotations: meta.annotations.unwrap_or_default(),
        selector: spec.selector.unwrap_or_default(),
        ports: spec
            .ports
            .unwrap_or_default()
            .into_iter()
            .map(|port| ServicePort {
                target_port: match port.target_port {
                    Some(IntOrString::Int(target)) => target,
                    _ => port.port,
                },
                port: port.port,
            })
            .collect(),
    }
}

fn pod_from_kube(pod: KubePod) -> Pod {
    Pod {
        name: pod.metadata.name.unwrap_or_default(),
        namespace: pod.metadata.namespace.unwrap_or_default(),
        labels: pod.metadata.labels.unwrap_or_default(),
    }
}

#[async_trait]
impl KubernetesApi for KubeClusterClient {
    async fn create_deployment(&self, deployment: Deployment) -> ProviderResult<Deployment> {
        let created = self
            .deployments(&deployment.namespace)
            .create(&PostParams::default(), &deployment_to_kube(&deployment))
            .await
            .map_err(|e| kube_error("create deployment", e))?;
        Ok(deployment_from_kube(created))
    }

    async fn get_deployment(&self, namespace: &str, name: &str) -> ProviderResult<Deployment> {
        let deployment = self
            .deployments(namespace)
            .get(name)
            .await
            .map_err(|e| kube_error("get deployment", e))?;
        Ok(deployment_from_kube(deployment))
    }

    async fn update_deployment(&self, deployment: Deployment) -> ProviderResult<Deployment> {
        let api = self.deployments(&deployment.namespace);
        let live = api
            .get(&deployment.name)
            .await
            .map_err(|e| kube_error("get deployment", e))?;
        let mut desired = deployment_to_kube(&deployment);
        desired.metadata.resource_version = live.metadata.resource_version;
        let replaced = api
            .replace(&deployment.name, &PostParams::default(), &desired)
            .await
            .map_err(|e| kube_error("replace deployment", e))?;
        Ok(deployment_from_kube(replaced))
    }

    async fn delete_deployment(&self, namespace: &str, name: &str) -> ProviderResult<()> {
        self.deployments(namespace)
            .delete(name, &DeleteParams::background())
            .await
            .map_err(|e| kube_error("delete deployment", e))?;
        Ok(())
    }

    async fn create_service(&self, service: Service) -> ProviderResult<Service> {
        let created = self
            .services(&service.namespace)
            .create(&PostParams::default(), &service_to_kube(&service))
            .await
            .map_err(|e| kube_error("create service", e))?;
        Ok(service_from_kube(created))
    }

    async fn get_service(&self, namespace: &str, name: &str) -> ProviderResult<Service> {
        let service = self
            .services(namespace)
            .get(name)
            .await
            .map_err(|e| kube_error("get service", e))?;
        Ok(service_from_kube(service))
    }

    async fn delete_service(&self, namespace: &str, name: &str) -> ProviderResult<()> {
        self.services(namespace)
            .delete(name, &DeleteParams::default())
            .await
            .map_err(|e| kube_error("delete service", e))?;
        Ok(())
    }

    async fn list_pods(&self, namespace: &str, label_selector: &str) -> ProviderResult<Vec<Pod>> {
        let pods = self
            .pods(namespace)
            .list(&ListParams::default().labels(label_selector))
            .await
            .map_err(|e| kube_error("list pods", e))?;
        Ok(pods.items.into_iter().map(pod_from_kube).collect())
    }

    async fn delete_pods(&self, namespace: &str, label_selector: &str) -> ProviderResult<usize> {
        let api = self.pods(namespace);
        let pods = self.list_pods(namespace, label_selector).await?;
        for pod in &pods {
            api.delete(&pod.name, &DeleteParams::default())
                .await
                .map_err(|e| kube_error("delete pod", e))?;
            debug!(namespace = namespace, pod = %pod.name, "Pod deleted");
        }
        Ok(pods.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn deployment() -> Deployment {
        let labels = Labels::from([("app".to_string(), "cacheabc".to_string())]);
        Deployment {
            name: "cacheabc".into(),
            namespace: "redis-system".into(),
            labels: labels.clone(),
            annotations: Labels::from([("owner".to_string(), "org-1".to_string())]),
            selector: labels,
            replicas: 1,
            ready_replicas: 0,
            container: Container {
                name: "redis".into(),
                image: "redis:7.2".into(),
                args: Vec::new(),
                container_port: 6379,
                memory_limit: "256Mi".into(),
            },
        }
    }

    #[test]
    fn test_deployment_survives_resource_conversion() {
        let original = deployment();
        let kube = deployment_to_kube(&original);
        let spec = kube.spec.as_ref().unwrap();
        let container = &spec.template.spec.as_ref().unwrap().containers[0];
        assert_eq!(container.args, None);
        assert_eq!(
            container.resources.as_ref().unwrap().limits.as_ref().unwrap()["memory"],
            Quantity("256Mi".into())
        );
        assert_eq!(deployment_from_kube(kube), original);
    }

    #[test]
    fn test_service_ports_keep_target() {
        let service = Service {
            name: "cacheabc".into(),
            namespace: "memcached-system".into(),
            service_type: "NodePort".into(),
            labels: Labels::new(),
            annotations: Labels::new(),
            selector: Labels::from([("app".to_string(), "cacheabc".to_string())]),
            ports: vec![ServicePort {
                port: 11211,
                target_port: 11211,
            }],
        };
        assert_eq!(service_from_kube(service_to_kube(&service)), service);
    }
}
