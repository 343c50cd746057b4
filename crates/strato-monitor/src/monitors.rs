//! The sub-monitors driven by the composite monitor each cycle.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use strato_model::{
    AgentRegistry, ArchitectureSource, ClientEventKind, ClientFeed, ClientInstance, ComponentType,
    Instance, InstancePhase, ManagedInstance, Node, SharedKnowledge, UeFeed,
};

use crate::cluster::{ClusterApi, MonitorError, PodCondition};
use crate::SubMonitor;

/// Pulls node and pod facts from the orchestrator into the actual state.
/// Phase transitions derived here only ever move forward.
pub struct KubernetesMonitor {
    cluster: Arc<dyn ClusterApi>,
}

impl KubernetesMonitor {
    pub fn new(cluster: Arc<dyn ClusterApi>) -> Self {
        Self { cluster }
    }
}

#[async_trait]
impl SubMonitor for KubernetesMonitor {
    fn name(&self) -> &str {
        "kubernetes"
    }

    async fn monitor(&self, knowledge: &SharedKnowledge) -> Result<(), MonitorError> {
        let nodes = self.cluster.list_nodes().await?;
        let pods = self.cluster.list_pods().await?;

        let mut knowledge = knowledge.write().await;
        let default_hw = knowledge.config.default_hardware_id.clone();

        knowledge.nodes = nodes
            .into_iter()
            .map(|observation| {
                let mut node = Node::new(
                    observation.name.clone(),
                    observation.hw_id.unwrap_or_else(|| default_hw.clone()),
                    observation.capacity,
                );
                node.pods = observation.pods;
                (observation.name, node)
            })
            .collect();

        for pod in pods {
            if !knowledge.applications.contains_key(&pod.application) {
                debug!(namespace = %pod.application, "ignoring pod of unknown application");
                continue;
            }
            if knowledge
                .actual_state
                .get_managed(&pod.application, &pod.component, &pod.instance_id)
                .is_none()
            {
                knowledge.actual_state.add_instance(Instance::Managed(ManagedInstance::new(
                    pod.application.clone(),
                    pod.component.clone(),
                    pod.instance_id.clone(),
                )));
            }
            let Some(instance) = knowledge
                .actual_state
                .get_managed_mut(&pod.application, &pod.component, &pod.instance_id)
            else {
                continue;
            };
            if let Some(ip) = &pod.ip {
                if instance.ip.is_none() {
                    instance.ip = Some(ip.clone());
                }
            }
            if pod.node.is_some() {
                instance.node = pod.node.clone();
            }
            match pod.condition {
                PodCondition::Running if instance.ip.is_some() => {
                    instance.advance_phase(InstancePhase::Init)
                }
                PodCondition::Succeeded => instance.advance_phase(InstancePhase::Finished),
                PodCondition::Failed => instance.advance_phase(InstancePhase::Failed),
                _ => {}
            }
        }
        Ok(())
    }
}

/// Ingests newly published architectures and removals, and polls workload
/// agents to move instances through the Init→Ready and Finalizing→Finished
/// transitions.
pub struct ApplicationMonitor {
    source: Arc<dyn ArchitectureSource>,
    agents: Arc<dyn AgentRegistry>,
}

impl ApplicationMonitor {
    pub fn new(source: Arc<dyn ArchitectureSource>, agents: Arc<dyn AgentRegistry>) -> Self {
        Self { source, agents }
    }
}

#[async_trait]
impl SubMonitor for ApplicationMonitor {
    fn name(&self) -> &str {
        "applications"
    }

    async fn monitor(&self, knowledge: &SharedKnowledge) -> Result<(), MonitorError> {
        {
            let mut knowledge = knowledge.write().await;
            for architecture in self.source.publish_new_architectures() {
                info!(application = %architecture.name, "ingesting published architecture");
                knowledge.add_application(architecture);
            }
            for removal in self.source.publish_new_removals() {
                knowledge.remove_application(&removal);
            }
        }

        // Snapshot the instances worth polling, then talk to agents without
        // holding the lock.
        let to_poll: Vec<(String, String, String, String, InstancePhase)> = {
            let knowledge = knowledge.read().await;
            knowledge
                .actual_state
                .all_managed()
                .filter(|m| {
                    (m.phase == InstancePhase::Init && m.init_completed)
                        || m.phase == InstancePhase::Finalizing
                })
                .filter_map(|m| {
                    m.ip.as_ref().map(|ip| {
                        (m.application.clone(), m.component.clone(), m.id.clone(), ip.clone(), m.phase)
                    })
                })
                .collect()
        };

        for (application, component, id, ip, phase) in to_poll {
            let state = match self.agents.agent_for(&ip).await {
                Ok(agent) => agent.state().await,
                Err(error) => Err(error),
            };
            let state = match state {
                Ok(state) => state,
                Err(error) => {
                    debug!(instance = %id, %error, "agent not reachable yet");
                    continue;
                }
            };
            let mut knowledge = knowledge.write().await;
            if let Some(instance) = knowledge.actual_state.get_managed_mut(&application, &component, &id) {
                if phase == InstancePhase::Init && state.ready {
                    instance.advance_phase(InstancePhase::Ready);
                    info!(instance = %id, "instance is ready");
                }
                if phase == InstancePhase::Finalizing && state.finished {
                    instance.advance_phase(InstancePhase::Finished);
                    info!(instance = %id, "instance finished");
                }
            }
        }
        Ok(())
    }
}

/// Tracks clients connecting to and disconnecting from the platform.
pub struct ClientMonitor {
    feed: Arc<dyn ClientFeed>,
}

impl ClientMonitor {
    pub fn new(feed: Arc<dyn ClientFeed>) -> Self {
        Self { feed }
    }
}

#[async_trait]
impl SubMonitor for ClientMonitor {
    fn name(&self) -> &str {
        "clients"
    }

    async fn monitor(&self, knowledge: &SharedKnowledge) -> Result<(), MonitorError> {
        let events = self.feed.poll_events().await?;
        if events.is_empty() {
            return Ok(());
        }
        let mut knowledge = knowledge.write().await;
        for event in events {
            match event.kind {
                ClientEventKind::Connected => {
                    let declared = knowledge
                        .applications
                        .get(&event.application)
                        .and_then(|a| a.get_component(&event.component))
                        .map(|c| c.kind == ComponentType::Unmanaged)
                        .unwrap_or(false);
                    if !declared {
                        warn!(
                            application = %event.application,
                            component = %event.component,
                            "client for unknown or managed component rejected"
                        );
                        continue;
                    }
                    info!(client = %event.id, application = %event.application, "client connected");
                    knowledge.actual_state.add_instance(Instance::Client(
                        ClientInstance::new(event.application, event.component, event.id)
                            .with_location(event.location),
                    ));
                }
                ClientEventKind::Disconnected => {
                    info!(client = %event.id, "client disconnected");
                    knowledge
                        .actual_state
                        .remove_instance(&event.application, &event.component, &event.id);
                    knowledge.network_topology.forget_client(&event.id);
                }
            }
        }
        Ok(())
    }
}

/// Applies user-equipment position reports to the network topology.
pub struct UeMonitor {
    feed: Arc<dyn UeFeed>,
}

impl UeMonitor {
    pub fn new(feed: Arc<dyn UeFeed>) -> Self {
        Self { feed }
    }
}

#[async_trait]
impl SubMonitor for UeMonitor {
    fn name(&self) -> &str {
        "user-equipment"
    }

    async fn monitor(&self, knowledge: &SharedKnowledge) -> Result<(), MonitorError> {
        let positions = self.feed.poll_positions().await?;
        if positions.is_empty() {
            return Ok(());
        }
        let mut knowledge = knowledge.write().await;
        for position in positions {
            for (node, distance) in position.distances {
                knowledge
                    .network_topology
                    .set_distance(&position.client_id, &node, distance);
            }
        }
        Ok(())
    }
}
