//! Indexed view of every instance the platform runs or serves.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::instance::{ClientInstance, Instance, ManagedInstance};

/// The application → component → instance index. Two distinguished values
/// live in the knowledge base: the actual state written by monitoring, and
/// the desired state produced by the analyzer. Cloning yields a snapshot.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClusterState {
    apps: BTreeMap<String, BTreeMap<String, BTreeMap<String, Instance>>>,
}

impl ClusterState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_instance(&mut self, instance: Instance) {
        self.apps
            .entry(instance.application().to_string())
            .or_default()
            .entry(instance.component().to_string())
            .or_default()
            .insert(instance.id().to_string(), instance);
    }

    pub fn get_instance(&self, app: &str, component: &str, id: &str) -> Option<&Instance> {
        self.apps.get(app)?.get(component)?.get(id)
    }

    pub fn get_instance_mut(&mut self, app: &str, component: &str, id: &str) -> Option<&mut Instance> {
        self.apps.get_mut(app)?.get_mut(component)?.get_mut(id)
    }

    pub fn get_managed(&self, app: &str, component: &str, id: &str) -> Option<&ManagedInstance> {
        self.get_instance(app, component, id)?.as_managed()
    }

    pub fn get_managed_mut(&mut self, app: &str, component: &str, id: &str) -> Option<&mut ManagedInstance> {
        match self.get_instance_mut(app, component, id)? {
            Instance::Managed(m) => Some(m),
            Instance::Client(_) => None,
        }
    }

    pub fn remove_instance(&mut self, app: &str, component: &str, id: &str) -> Option<Instance> {
        let components = self.apps.get_mut(app)?;
        let instances = components.get_mut(component)?;
        let removed = instances.remove(id);
        if instances.is_empty() {
            components.remove(component);
        }
        if components.is_empty() {
            self.apps.remove(app);
        }
        removed
    }

    /// Drops every instance of the application.
    pub fn remove_application(&mut self, app: &str) {
        self.apps.remove(app);
    }

    pub fn contains_application(&self, app: &str) -> bool {
        self.apps.contains_key(app)
    }

    pub fn applications(&self) -> impl Iterator<Item = &str> {
        self.apps.keys().map(String::as_str)
    }

    pub fn components(&self, app: &str) -> impl Iterator<Item = &str> {
        self.apps.get(app).into_iter().flat_map(|c| c.keys().map(String::as_str))
    }

    pub fn instances(&self, app: &str, component: &str) -> impl Iterator<Item = &Instance> {
        self.apps
            .get(app)
            .and_then(|c| c.get(component))
            .into_iter()
            .flat_map(|i| i.values())
    }

    pub fn all_instances(&self) -> impl Iterator<Item = &Instance> {
        self.apps.values().flat_map(|c| c.values()).flat_map(|i| i.values())
    }

    pub fn all_managed(&self) -> impl Iterator<Item = &ManagedInstance> {
        self.all_instances().filter_map(Instance::as_managed)
    }

    pub fn all_managed_mut(&mut self) -> impl Iterator<Item = &mut ManagedInstance> {
        self.apps
            .values_mut()
            .flat_map(|c| c.values_mut())
            .flat_map(|i| i.values_mut())
            .filter_map(|i| match i {
                Instance::Managed(m) => Some(m),
                Instance::Client(_) => None,
            })
    }

    pub fn all_clients(&self) -> impl Iterator<Item = &ClientInstance> {
        self.all_instances().filter_map(Instance::as_client)
    }

    /// The single managed instance of a single-component application, if it
    /// exists. Used by the job interface where application = component = job.
    pub fn unique_instance(&self, app: &str) -> Option<&ManagedInstance> {
        let components = self.apps.get(app)?;
        if components.len() != 1 {
            return None;
        }
        let instances = components.values().next()?;
        if instances.len() != 1 {
            return None;
        }
        instances.values().next()?.as_managed()
    }

    /// Records that `dependent` is now served by `provider_id` for the
    /// `provider_component` dependency.
    pub fn set_dependency(
        &mut self,
        app: &str,
        component: &str,
        id: &str,
        provider_component: &str,
        provider_id: &str,
    ) {
        if let Some(instance) = self.get_instance_mut(app, component, id) {
            let dependencies = match instance {
                Instance::Managed(m) => &mut m.dependencies,
                Instance::Client(c) => {
                    c.fresh = false;
                    &mut c.dependencies
                }
            };
            dependencies.insert(provider_component.to_string(), provider_id.to_string());
        }
    }

    pub fn instance_count(&self) -> usize {
        self.apps.values().flat_map(|c| c.values()).map(|i| i.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.apps.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn managed(app: &str, component: &str, id: &str) -> Instance {
        Instance::Managed(ManagedInstance::new(app, component, id))
    }

    #[test]
    fn test_add_get_remove_roundtrip() {
        let mut state = ClusterState::new();
        state.add_instance(managed("demo", "frontend", "frontend-0"));
        state.add_instance(managed("demo", "backend", "backend-0"));

        assert!(state.get_managed("demo", "frontend", "frontend-0").is_some());
        assert_eq!(state.components("demo").count(), 2);

        state.remove_instance("demo", "frontend", "frontend-0");
        assert!(state.get_instance("demo", "frontend", "frontend-0").is_none());
        // Empty component buckets disappear with their last instance.
        assert_eq!(state.components("demo").count(), 1);
    }

    #[test]
    fn test_remove_application_cascades_to_instances() {
        let mut state = ClusterState::new();
        state.add_instance(managed("demo", "frontend", "frontend-0"));
        state.add_instance(managed("demo", "frontend", "frontend-1"));
        state.remove_application("demo");
        assert!(state.is_empty());
    }

    #[test]
    fn test_unique_instance_requires_single_component_and_instance() {
        let mut state = ClusterState::new();
        state.add_instance(managed("job", "job", "job-0"));
        assert_eq!(state.unique_instance("job").unwrap().id, "job-0");

        state.add_instance(managed("job", "job", "job-1"));
        assert!(state.unique_instance("job").is_none());
    }

    #[test]
    fn test_set_dependency_clears_fresh_flag_on_clients() {
        let mut state = ClusterState::new();
        state.add_instance(Instance::Client(ClientInstance::new("demo", "viewer", "c1")));
        state.set_dependency("demo", "viewer", "c1", "frontend", "frontend-0");

        let client = state
            .get_instance("demo", "viewer", "c1")
            .and_then(Instance::as_client)
            .unwrap();
        assert!(!client.fresh);
        assert_eq!(client.dependencies.get("frontend").unwrap(), "frontend-0");
    }
}
