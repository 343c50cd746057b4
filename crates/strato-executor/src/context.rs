//! Execution context shared by every task: the orchestrator adapter, the
//! agent registry and the knowledge handle.

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Namespace, Secret, Service};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, DeleteParams, Patch, PatchParams, PostParams};
use kube::Client;
use thiserror::Error;
use tracing::debug;

use strato_model::{AgentError, AgentRegistry, ControllerConfig, SharedKnowledge};

/// Orchestrator failures as tasks see them. `NotFound` and `AlreadyExists`
/// are mapped from HTTP 404/409 so idempotent operations can treat them as
/// success; everything else is transient for this cycle.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("object not found")]
    NotFound,

    #[error("object already exists")]
    AlreadyExists,

    #[error("kubernetes api error: {0}")]
    Api(String),

    #[error("malformed manifest: {0}")]
    Manifest(String),

    #[error(transparent)]
    Agent(#[from] AgentError),

    #[error(transparent)]
    Model(#[from] strato_model::ModelError),
}

/// The narrow orchestrator surface the tasks run against. The production
/// implementation wraps the Kubernetes client; tests plug in fakes.
#[async_trait]
pub trait KubeApi: Send + Sync {
    async fn create_namespace(&self, name: &str) -> Result<(), OrchestratorError>;
    async fn delete_namespace(&self, name: &str) -> Result<(), OrchestratorError>;
    async fn create_secret(&self, namespace: &str, name: &str, docker_config: &str) -> Result<(), OrchestratorError>;
    async fn delete_secret(&self, namespace: &str, name: &str) -> Result<(), OrchestratorError>;
    async fn create_deployment(&self, namespace: &str, manifest: &str) -> Result<(), OrchestratorError>;
    async fn update_deployment(&self, namespace: &str, name: &str, manifest: &str) -> Result<(), OrchestratorError>;
    async fn delete_deployment(&self, namespace: &str, name: &str) -> Result<(), OrchestratorError>;
    /// Returns the cluster ip assigned to the created service.
    async fn create_service(&self, namespace: &str, manifest: &str) -> Result<String, OrchestratorError>;
    async fn delete_service(&self, namespace: &str, name: &str) -> Result<(), OrchestratorError>;
}

/// Everything a task needs at execution time.
pub struct ExecutionContext {
    pub knowledge: SharedKnowledge,
    pub kube: Arc<dyn KubeApi>,
    pub agents: Arc<dyn AgentRegistry>,
    pub config: ControllerConfig,
}

impl ExecutionContext {
    pub fn new(
        knowledge: SharedKnowledge,
        kube: Arc<dyn KubeApi>,
        agents: Arc<dyn AgentRegistry>,
        config: ControllerConfig,
    ) -> Self {
        Self { knowledge, kube, agents, config }
    }
}

/// Production adapter over the Kubernetes client.
pub struct KubernetesClient {
    client: Client,
}

impl KubernetesClient {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn namespaces(&self) -> Api<Namespace> {
        Api::all(self.client.clone())
    }

    fn secrets(&self, namespace: &str) -> Api<Secret> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn deployments(&self, namespace: &str) -> Api<Deployment> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn services(&self, namespace: &str) -> Api<Service> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

/// Maps HTTP status codes onto the typed error shape every task relies on.
fn map_kube_error(error: kube::Error) -> OrchestratorError {
    match &error {
        kube::Error::Api(response) if response.code == 404 => OrchestratorError::NotFound,
        kube::Error::Api(response) if response.code == 409 => OrchestratorError::AlreadyExists,
        _ => OrchestratorError::Api(error.to_string()),
    }
}

fn parse_manifest<T: serde::de::DeserializeOwned>(manifest: &str) -> Result<T, OrchestratorError> {
    serde_yaml::from_str(manifest).map_err(|e| OrchestratorError::Manifest(e.to_string()))
}

#[async_trait]
impl KubeApi for KubernetesClient {
    async fn create_namespace(&self, name: &str) -> Result<(), OrchestratorError> {
        let namespace = Namespace {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        self.namespaces()
            .create(&PostParams::default(), &namespace)
            .await
            .map_err(map_kube_error)?;
        debug!(namespace = name, "namespace created");
        Ok(())
    }

    async fn delete_namespace(&self, name: &str) -> Result<(), OrchestratorError> {
        self.namespaces()
            .delete(name, &DeleteParams::background())
            .await
            .map_err(map_kube_error)?;
        Ok(())
    }

    async fn create_secret(&self, namespace: &str, name: &str, docker_config: &str) -> Result<(), OrchestratorError> {
        let mut string_data = std::collections::BTreeMap::new();
        string_data.insert(".dockerconfigjson".to_string(), docker_config.to_string());
        let secret = Secret {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            string_data: Some(string_data),
            type_: Some("kubernetes.io/dockerconfigjson".to_string()),
            ..Default::default()
        };
        self.secrets(namespace)
            .create(&PostParams::default(), &secret)
            .await
            .map_err(map_kube_error)?;
        Ok(())
    }

    async fn delete_secret(&self, namespace: &str, name: &str) -> Result<(), OrchestratorError> {
        self.secrets(namespace)
            .delete(name, &DeleteParams::default())
            .await
            .map_err(map_kube_error)?;
        Ok(())
    }

    async fn create_deployment(&self, namespace: &str, manifest: &str) -> Result<(), OrchestratorError> {
        let deployment: Deployment = parse_manifest(manifest)?;
        self.deployments(namespace)
            .create(&PostParams::default(), &deployment)
            .await
            .map_err(map_kube_error)?;
        Ok(())
    }

    async fn update_deployment(&self, namespace: &str, name: &str, manifest: &str) -> Result<(), OrchestratorError> {
        let deployment: Deployment = parse_manifest(manifest)?;
        self.deployments(namespace)
            .patch(name, &PatchParams::default(), &Patch::Merge(&deployment))
            .await
            .map_err(map_kube_error)?;
        Ok(())
    }

    async fn delete_deployment(&self, namespace: &str, name: &str) -> Result<(), OrchestratorError> {
        self.deployments(namespace)
            .delete(name, &DeleteParams::background().grace_period(0))
            .await
            .map_err(map_kube_error)?;
        Ok(())
    }

    async fn create_service(&self, namespace: &str, manifest: &str) -> Result<String, OrchestratorError> {
        let service: Service = parse_manifest(manifest)?;
        let created = self
            .services(namespace)
            .create(&PostParams::default(), &service)
            .await
            .map_err(map_kube_error)?;
        Ok(created
            .spec
            .and_then(|spec| spec.cluster_ip)
            .unwrap_or_default())
    }

    async fn delete_service(&self, namespace: &str, name: &str) -> Result<(), OrchestratorError> {
        self.services(namespace)
            .delete(name, &DeleteParams::background().grace_period(0))
            .await
            .map_err(map_kube_error)?;
        Ok(())
    }
}
