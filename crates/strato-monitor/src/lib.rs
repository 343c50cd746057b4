//! Monitoring phase of the adaptation loop.
//!
//! A composite monitor owns ordered sub-monitors; each one pulls facts from
//! one source (orchestrator, workload agents, client feed, user-equipment
//! feed) into the knowledge base. No sub-monitor may block the loop: every
//! call is bounded by the configured timeout.

pub mod cluster;
pub mod monitors;

pub use cluster::*;
pub use monitors::*;

use std::time::Duration;

use async_trait::async_trait;
use tracing::{info, warn};

use strato_model::SharedKnowledge;

/// One ordered step of the monitoring phase.
#[async_trait]
pub trait SubMonitor: Send + Sync {
    fn name(&self) -> &str;
    async fn monitor(&self, knowledge: &SharedKnowledge) -> Result<(), MonitorError>;
}

/// Invokes its sub-monitors in registration order, isolating the loop from
/// their failures and latencies.
pub struct TopLevelMonitor {
    knowledge: SharedKnowledge,
    monitors: Vec<Box<dyn SubMonitor>>,
    timeout: Duration,
}

impl TopLevelMonitor {
    pub fn new(knowledge: SharedKnowledge, timeout: Duration) -> Self {
        Self { knowledge, monitors: Vec::new(), timeout }
    }

    pub fn add_monitor(&mut self, monitor: Box<dyn SubMonitor>) {
        self.monitors.push(monitor);
    }

    /// Runs every sub-monitor once. Failures and timeouts are logged and
    /// skipped; the next cycle gets another chance.
    pub async fn monitor(&self) {
        for monitor in &self.monitors {
            match tokio::time::timeout(self.timeout, monitor.monitor(&self.knowledge)).await {
                Ok(Ok(())) => info!(monitor = monitor.name(), "monitor pass complete"),
                Ok(Err(error)) => warn!(monitor = monitor.name(), %error, "monitor pass failed"),
                Err(_) => warn!(monitor = monitor.name(), "monitor pass timed out"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::{Arc, Mutex};
    use strato_model::{
        shared_knowledge, Application, Cardinality, ClientEvent, ClientEventKind, Component,
        ComponentType, ControllerConfig, InstancePhase, QueueFeed, ResourceRequest, UePosition,
    };

    use crate::cluster::{NodeObservation, PodCondition, PodObservation};

    #[derive(Default)]
    struct FakeCluster {
        nodes: Mutex<Vec<NodeObservation>>,
        pods: Mutex<Vec<PodObservation>>,
    }

    #[async_trait]
    impl ClusterApi for FakeCluster {
        async fn list_nodes(&self) -> Result<Vec<NodeObservation>, MonitorError> {
            Ok(self.nodes.lock().unwrap().clone())
        }
        async fn list_pods(&self) -> Result<Vec<PodObservation>, MonitorError> {
            Ok(self.pods.lock().unwrap().clone())
        }
    }

    fn demo_application() -> Application {
        let mut app = Application::new("demo");
        app.add_component(Component {
            application: "demo".into(),
            name: "frontend".into(),
            kind: ComponentType::Managed,
            cardinality: Cardinality::Single,
            deployment_template: None,
            dependencies: vec![],
            probes: vec![],
            sharded: false,
            resources: ResourceRequest::default(),
            supported_hw_ids: vec![],
        });
        app.add_component(Component {
            application: "demo".into(),
            name: "viewer".into(),
            kind: ComponentType::Unmanaged,
            cardinality: Cardinality::Multiple,
            deployment_template: None,
            dependencies: vec!["frontend".into()],
            probes: vec![],
            sharded: false,
            resources: ResourceRequest::default(),
            supported_hw_ids: vec![],
        });
        app
    }

    #[tokio::test]
    async fn test_kubernetes_monitor_advances_phase_monotonically() {
        let knowledge = shared_knowledge(ControllerConfig::default());
        knowledge.write().await.add_application(demo_application());

        let cluster = Arc::new(FakeCluster::default());
        *cluster.pods.lock().unwrap() = vec![PodObservation {
            application: "demo".into(),
            component: "frontend".into(),
            instance_id: "frontend-0".into(),
            condition: PodCondition::Running,
            ip: Some("10.0.0.9".into()),
            node: Some("node-a".into()),
        }];
        let monitor = KubernetesMonitor::new(cluster.clone());

        monitor.monitor(&knowledge).await.unwrap();
        {
            let k = knowledge.read().await;
            let instance = k.actual_state.get_managed("demo", "frontend", "frontend-0").unwrap();
            assert_eq!(instance.phase, InstancePhase::Init);
            assert_eq!(instance.ip.as_deref(), Some("10.0.0.9"));
        }

        // A later, stale observation cannot lower the phase.
        knowledge
            .write()
            .await
            .actual_state
            .get_managed_mut("demo", "frontend", "frontend-0")
            .unwrap()
            .advance_phase(InstancePhase::Ready);
        *cluster.pods.lock().unwrap() = vec![PodObservation {
            application: "demo".into(),
            component: "frontend".into(),
            instance_id: "frontend-0".into(),
            condition: PodCondition::Pending,
            ip: Some("10.0.0.9".into()),
            node: Some("node-a".into()),
        }];
        monitor.monitor(&knowledge).await.unwrap();
        let k = knowledge.read().await;
        let instance = k.actual_state.get_managed("demo", "frontend", "frontend-0").unwrap();
        assert_eq!(instance.phase, InstancePhase::Ready);
    }

    #[tokio::test]
    async fn test_client_monitor_adds_and_removes_clients() {
        let knowledge = shared_knowledge(ControllerConfig::default());
        knowledge.write().await.add_application(demo_application());

        let feed = Arc::new(QueueFeed::new());
        feed.push_event(ClientEvent {
            kind: ClientEventKind::Connected,
            application: "demo".into(),
            component: "viewer".into(),
            id: "client-1".into(),
            location: "edge-1".into(),
        });
        let monitor = ClientMonitor::new(feed.clone());
        monitor.monitor(&knowledge).await.unwrap();

        {
            let k = knowledge.read().await;
            let clients = k.fresh_clients();
            assert_eq!(clients.len(), 1);
            assert_eq!(clients[0].location, "edge-1");
        }

        feed.push_event(ClientEvent {
            kind: ClientEventKind::Disconnected,
            application: "demo".into(),
            component: "viewer".into(),
            id: "client-1".into(),
            location: String::new(),
        });
        monitor.monitor(&knowledge).await.unwrap();
        assert!(knowledge.read().await.fresh_clients().is_empty());
    }

    #[tokio::test]
    async fn test_ue_monitor_updates_topology() {
        let knowledge = shared_knowledge(ControllerConfig::default());
        let feed = Arc::new(QueueFeed::new());
        let mut distances = BTreeMap::new();
        distances.insert("node-a".to_string(), 4.5);
        feed.push_position(UePosition { client_id: "client-1".into(), distances });

        UeMonitor::new(feed).monitor(&knowledge).await.unwrap();
        let k = knowledge.read().await;
        assert_eq!(k.network_topology.distance("client-1", "node-a"), 4.5);
    }

    #[tokio::test]
    async fn test_unknown_component_clients_are_rejected() {
        let knowledge = shared_knowledge(ControllerConfig::default());
        knowledge.write().await.add_application(demo_application());

        let feed = Arc::new(QueueFeed::new());
        feed.push_event(ClientEvent {
            kind: ClientEventKind::Connected,
            application: "demo".into(),
            // A managed component cannot have external clients.
            component: "frontend".into(),
            id: "client-2".into(),
            location: "edge-1".into(),
        });
        ClientMonitor::new(feed).monitor(&knowledge).await.unwrap();
        assert!(knowledge.read().await.fresh_clients().is_empty());
        assert!(knowledge.read().await.check_invariants().is_ok());
    }
}
