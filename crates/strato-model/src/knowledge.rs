//! The knowledge base at the center of the adaptation loop.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::info;

use crate::config::ControllerConfig;
use crate::errors::ModelError;
use crate::instance::ClientInstance;
use crate::model::{Application, Component, Node};
use crate::network::NetworkTopology;
use crate::state::ClusterState;

/// Everything the platform knows, under one coarse lock. The monitor writes
/// during the monitoring phase, the executor writes through task model
/// updates during execution; everyone else reads.
#[derive(Debug)]
pub struct Knowledge {
    pub config: ControllerConfig,
    pub applications: BTreeMap<String, Application>,
    pub actual_state: ClusterState,
    pub nodes: BTreeMap<String, Node>,
    pub network_topology: NetworkTopology,
    pub client_support: bool,
    pub api_access_token: Option<String>,
    /// Single-instance applications the last placement search could not fit
    /// anywhere.
    pub components_without_resources: BTreeSet<String>,
    /// Namespaces of removed applications still awaiting cluster cleanup.
    pub orphaned_namespaces: BTreeSet<String>,
}

impl Knowledge {
    pub fn new(config: ControllerConfig) -> Self {
        let client_support = config.client_support;
        Self {
            config,
            applications: BTreeMap::new(),
            actual_state: ClusterState::new(),
            nodes: BTreeMap::new(),
            network_topology: NetworkTopology::new(),
            client_support,
            api_access_token: None,
            components_without_resources: BTreeSet::new(),
            orphaned_namespaces: BTreeSet::new(),
        }
    }

    /// Installs a newly accepted application. Readers holding the lock see
    /// either no trace of the application or all of it.
    pub fn add_application(&mut self, application: Application) {
        info!(application = %application.name, "application added to knowledge");
        self.applications.insert(application.name.clone(), application);
    }

    /// Removes an application and cascades to all of its instances. Its
    /// namespace, if one was created, is left for the planner to clean up.
    pub fn remove_application(&mut self, name: &str) {
        info!(application = name, "application removed from knowledge");
        if let Some(application) = self.applications.remove(name) {
            if application.namespace_created && !application.namespace_deleted {
                self.orphaned_namespaces.insert(name.to_string());
            }
        }
        self.actual_state.remove_application(name);
        self.components_without_resources.remove(name);
    }

    pub fn there_are_applications(&self) -> bool {
        !self.applications.is_empty()
    }

    pub fn application(&self, name: &str) -> Result<&Application, ModelError> {
        self.applications
            .get(name)
            .ok_or_else(|| ModelError::UnknownApplication(name.to_string()))
    }

    pub fn component(&self, application: &str, component: &str) -> Result<&Component, ModelError> {
        self.application(application)?
            .get_component(component)
            .ok_or_else(|| ModelError::UnknownComponent(format!("{application}.{component}")))
    }

    pub fn update_access_token(&mut self, token: impl Into<String>) {
        self.api_access_token = Some(token.into());
    }

    /// Clients that connected since their dependencies were last handed out.
    pub fn fresh_clients(&self) -> Vec<&ClientInstance> {
        self.actual_state.all_clients().filter(|c| c.fresh).collect()
    }

    /// Checks the structural invariants the rest of the loop relies on.
    /// Intended for tests and debug assertions.
    pub fn check_invariants(&self) -> Result<(), String> {
        for instance in self.actual_state.all_instances() {
            let app = self
                .applications
                .get(instance.application())
                .ok_or_else(|| format!("instance {} refers to unknown application", instance.id()))?;
            let component = app
                .get_component(instance.component())
                .ok_or_else(|| format!("instance {} refers to unknown component", instance.id()))?;
            for dependency in instance.dependencies().keys() {
                if !component.dependencies.iter().any(|d| d == dependency) {
                    return Err(format!(
                        "instance {} binds undeclared dependency {}",
                        instance.id(),
                        dependency
                    ));
                }
            }
        }
        Ok(())
    }
}

/// Handle shared by every phase of the loop and by the external interfaces.
pub type SharedKnowledge = Arc<RwLock<Knowledge>>;

pub fn shared_knowledge(config: ControllerConfig) -> SharedKnowledge {
    Arc::new(RwLock::new(Knowledge::new(config)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::{Instance, ManagedInstance};
    use crate::model::{Cardinality, Component, ComponentType, ResourceRequest};

    fn demo_application() -> Application {
        let mut app = Application::new("demo");
        app.add_component(Component {
            application: "demo".into(),
            name: "frontend".into(),
            kind: ComponentType::Managed,
            cardinality: Cardinality::Single,
            deployment_template: None,
            dependencies: vec!["backend".into()],
            probes: vec![],
            sharded: false,
            resources: ResourceRequest::default(),
            supported_hw_ids: vec![],
        });
        app
    }

    #[test]
    fn test_remove_application_cascades() {
        let mut knowledge = Knowledge::new(ControllerConfig::default());
        knowledge.add_application(demo_application());
        knowledge
            .actual_state
            .add_instance(Instance::Managed(ManagedInstance::new("demo", "frontend", "frontend-0")));

        knowledge.remove_application("demo");
        assert!(knowledge.actual_state.is_empty());
        assert!(!knowledge.there_are_applications());
    }

    #[test]
    fn test_invariants_catch_orphan_instances() {
        let mut knowledge = Knowledge::new(ControllerConfig::default());
        knowledge
            .actual_state
            .add_instance(Instance::Managed(ManagedInstance::new("ghost", "frontend", "frontend-0")));
        assert!(knowledge.check_invariants().is_err());
    }

    #[test]
    fn test_invariants_catch_undeclared_dependency_bindings() {
        let mut knowledge = Knowledge::new(ControllerConfig::default());
        knowledge.add_application(demo_application());
        let mut instance = ManagedInstance::new("demo", "frontend", "frontend-0");
        instance.dependencies.insert("cache".into(), "cache-0".into());
        knowledge.actual_state.add_instance(Instance::Managed(instance));
        assert!(knowledge.check_invariants().is_err());
    }
}
