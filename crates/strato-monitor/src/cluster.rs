//! Read-only view of the orchestrator used by the Kubernetes monitor.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Node as K8sNode, Pod};
use kube::api::{Api, ListParams};
use kube::Client;
use thiserror::Error;

use strato_model::{ResourceRequest, COMPONENT_LABEL, INSTANCE_LABEL};

/// Node label naming its hardware class; nodes without it fall back to the
/// configured default class.
pub const HW_CLASS_LABEL: &str = "strato.dev/hw-class";

#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("orchestrator unavailable: {0}")]
    Api(String),

    #[error(transparent)]
    Feed(#[from] strato_model::FeedError),

    #[error(transparent)]
    Agent(#[from] strato_model::AgentError),
}

/// Coarse pod condition the monitor reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PodCondition {
    Pending,
    Running,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone)]
pub struct PodObservation {
    /// Namespace, which is the application name.
    pub application: String,
    pub component: String,
    pub instance_id: String,
    pub condition: PodCondition,
    pub ip: Option<String>,
    pub node: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NodeObservation {
    pub name: String,
    pub hw_id: Option<String>,
    pub capacity: ResourceRequest,
    pub pods: Vec<String>,
}

/// What the Kubernetes monitor needs from the cluster.
#[async_trait]
pub trait ClusterApi: Send + Sync {
    async fn list_nodes(&self) -> Result<Vec<NodeObservation>, MonitorError>;
    async fn list_pods(&self) -> Result<Vec<PodObservation>, MonitorError>;
}

/// Production implementation over the Kubernetes client.
pub struct KubernetesClusterApi {
    client: Client,
}

impl KubernetesClusterApi {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ClusterApi for KubernetesClusterApi {
    async fn list_nodes(&self) -> Result<Vec<NodeObservation>, MonitorError> {
        let nodes: Api<K8sNode> = Api::all(self.client.clone());
        let list = nodes
            .list(&ListParams::default())
            .await
            .map_err(|e| MonitorError::Api(e.to_string()))?;
        Ok(list
            .items
            .into_iter()
            .filter_map(|node| {
                let name = node.metadata.name.clone()?;
                let hw_id = node
                    .metadata
                    .labels
                    .as_ref()
                    .and_then(|l| l.get(HW_CLASS_LABEL))
                    .cloned();
                let capacity = node
                    .status
                    .as_ref()
                    .and_then(|s| s.capacity.as_ref())
                    .map(|capacity| ResourceRequest {
                        cpu_millis: capacity
                            .get("cpu")
                            .map(|q| parse_cpu_millis(&q.0))
                            .unwrap_or(0),
                        memory_mb: capacity
                            .get("memory")
                            .map(|q| parse_memory_mb(&q.0))
                            .unwrap_or(0),
                    })
                    .unwrap_or_default();
                Some(NodeObservation { name, hw_id, capacity, pods: Vec::new() })
            })
            .collect())
    }

    async fn list_pods(&self) -> Result<Vec<PodObservation>, MonitorError> {
        let pods: Api<Pod> = Api::all(self.client.clone());
        let list = pods
            .list(&ListParams::default().labels(INSTANCE_LABEL))
            .await
            .map_err(|e| MonitorError::Api(e.to_string()))?;
        Ok(list
            .items
            .into_iter()
            .filter_map(|pod| {
                let labels = pod.metadata.labels.as_ref()?;
                let instance_id = labels.get(INSTANCE_LABEL)?.clone();
                let component = labels.get(COMPONENT_LABEL)?.clone();
                let application = pod.metadata.namespace.clone()?;
                let status = pod.status.as_ref();
                let condition = match status.and_then(|s| s.phase.as_deref()) {
                    Some("Running") => PodCondition::Running,
                    Some("Succeeded") => PodCondition::Succeeded,
                    Some("Failed") => PodCondition::Failed,
                    _ => PodCondition::Pending,
                };
                Some(PodObservation {
                    application,
                    component,
                    instance_id,
                    condition,
                    ip: status.and_then(|s| s.pod_ip.clone()),
                    node: pod.spec.as_ref().and_then(|s| s.node_name.clone()),
                })
            })
            .collect())
    }
}

/// Parses Kubernetes cpu quantities ("2", "1500m") into millicores.
fn parse_cpu_millis(quantity: &str) -> u64 {
    if let Some(millis) = quantity.strip_suffix('m') {
        millis.parse().unwrap_or(0)
    } else {
        quantity.parse::<u64>().map(|cores| cores * 1000).unwrap_or(0)
    }
}

/// Parses Kubernetes memory quantities ("8Gi", "512Mi", bytes) into MiB.
fn parse_memory_mb(quantity: &str) -> u64 {
    if let Some(gib) = quantity.strip_suffix("Gi") {
        gib.parse::<u64>().map(|g| g * 1024).unwrap_or(0)
    } else if let Some(mib) = quantity.strip_suffix("Mi") {
        mib.parse().unwrap_or(0)
    } else if let Some(kib) = quantity.strip_suffix("Ki") {
        kib.parse::<u64>().map(|k| k / 1024).unwrap_or(0)
    } else {
        quantity.parse::<u64>().map(|bytes| bytes / (1024 * 1024)).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cpu_quantity_parsing() {
        assert_eq!(parse_cpu_millis("2"), 2000);
        assert_eq!(parse_cpu_millis("1500m"), 1500);
        assert_eq!(parse_cpu_millis("bogus"), 0);
    }

    #[test]
    fn test_memory_quantity_parsing() {
        assert_eq!(parse_memory_mb("8Gi"), 8192);
        assert_eq!(parse_memory_mb("512Mi"), 512);
        assert_eq!(parse_memory_mb("2048Ki"), 2);
    }
}
