//! The admission registry: submitted architectures, their statuses, and the
//! global probe alias set.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;

use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use strato_model::{Application, ArchitectureSource, Requirement};

/// Admission lifecycle of a submitted application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AppStatus {
    /// Submitted; isolation measurements are being gathered.
    Received,
    /// Measured but not yet complete (no contracts attached).
    Measured,
    Rejected,
    Accepted,
    /// Accepted and handed to the adaptation loop.
    Published,
}

#[derive(Debug, Error)]
pub enum AdmissionError {
    #[error("unknown application: {0}")]
    UnknownApplication(String),

    #[error("probe {0} was submitted with an alias already set")]
    AliasAlreadySet(String),
}

#[derive(Debug)]
struct AppEntry {
    architecture: Application,
    status: AppStatus,
}

#[derive(Debug, Default)]
struct RegistryState {
    apps: BTreeMap<String, AppEntry>,
    aliases: BTreeSet<String>,
    published: Vec<Application>,
    removals: Vec<String>,
}

/// Thread-safe store of everything the admission flow knows.
#[derive(Debug, Default)]
pub struct AppRegistry {
    inner: Mutex<RegistryState>,
}

impl AppRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs a submitted architecture, assigning a globally unique alias
    /// to every probe. Probes must arrive without aliases.
    pub fn add_app(&self, mut architecture: Application) -> Result<Application, AdmissionError> {
        let mut state = self.inner.lock().unwrap();
        for component in architecture.components.values_mut() {
            for probe in &mut component.probes {
                if !probe.alias.is_empty() {
                    return Err(AdmissionError::AliasAlreadySet(probe.name.clone()));
                }
                probe.alias = generate_alias(&mut state.aliases);
            }
        }
        info!(application = %architecture.name, "application admitted for measurement");
        state.apps.insert(
            architecture.name.clone(),
            AppEntry { architecture: architecture.clone(), status: AppStatus::Received },
        );
        Ok(architecture)
    }

    /// Merges freshly submitted QoS requirements into the stored (aliased)
    /// architecture and marks it complete. Returns the merged architecture.
    pub fn attach_requirements(&self, submitted: &Application) -> Result<Application, AdmissionError> {
        let mut state = self.inner.lock().unwrap();
        let entry = state
            .apps
            .get_mut(&submitted.name)
            .ok_or_else(|| AdmissionError::UnknownApplication(submitted.name.clone()))?;
        for (component_name, component) in &submitted.components {
            let Some(stored) = entry.architecture.components.get_mut(component_name) else {
                continue;
            };
            for probe in &component.probes {
                if let Some(stored_probe) = stored.probes.iter_mut().find(|p| p.name == probe.name) {
                    let additions: Vec<Requirement> = probe
                        .requirements
                        .iter()
                        .filter(|r| !stored_probe.requirements.contains(r))
                        .cloned()
                        .collect();
                    stored_probe.requirements.extend(additions);
                }
            }
        }
        entry.architecture.complete = true;
        Ok(entry.architecture.clone())
    }

    /// Removes an application; published ones are queued for removal from
    /// the knowledge base.
    pub fn remove_app(&self, name: &str) {
        let mut state = self.inner.lock().unwrap();
        if let Some(entry) = state.apps.remove(name) {
            if entry.status == AppStatus::Published {
                state.removals.push(name.to_string());
            }
        }
    }

    pub fn status(&self, name: &str) -> Option<AppStatus> {
        self.inner.lock().unwrap().apps.get(name).map(|e| e.status)
    }

    pub fn set_status(&self, name: &str, status: AppStatus) {
        if let Some(entry) = self.inner.lock().unwrap().apps.get_mut(name) {
            entry.status = status;
        }
    }

    pub fn architecture(&self, name: &str) -> Option<Application> {
        self.inner.lock().unwrap().apps.get(name).map(|e| e.architecture.clone())
    }

    /// Applications currently in measurement-bearing states.
    pub fn pending(&self) -> Vec<Application> {
        self.inner
            .lock()
            .unwrap()
            .apps
            .values()
            .filter(|e| matches!(e.status, AppStatus::Received | AppStatus::Measured))
            .map(|e| e.architecture.clone())
            .collect()
    }

    pub fn any_measuring(&self) -> bool {
        self.inner
            .lock()
            .unwrap()
            .apps
            .values()
            .any(|e| matches!(e.status, AppStatus::Received | AppStatus::Measured))
    }

    /// Marks an accepted application published and queues its architecture
    /// for the adaptation loop.
    pub fn publish(&self, name: &str) {
        let mut state = self.inner.lock().unwrap();
        if let Some(entry) = state.apps.get_mut(name) {
            entry.status = AppStatus::Published;
            let architecture = entry.architecture.clone();
            state.published.push(architecture);
            info!(application = name, "architecture published");
        }
    }

    /// One-line human-readable status summary.
    pub fn stats(&self, name: &str) -> String {
        match self.status(name) {
            Some(status) => format!("application: {name}\nstatus: {status:?}"),
            None => format!("application: {name}\nstatus: unknown"),
        }
    }

    pub fn alias_count(&self) -> usize {
        self.inner.lock().unwrap().aliases.len()
    }
}

impl ArchitectureSource for AppRegistry {
    fn publish_new_architectures(&self) -> Vec<Application> {
        std::mem::take(&mut self.inner.lock().unwrap().published)
    }

    fn publish_new_removals(&self) -> Vec<String> {
        std::mem::take(&mut self.inner.lock().unwrap().removals)
    }
}

/// Four random uppercase letters, re-drawn until globally unique.
fn generate_alias(aliases: &mut BTreeSet<String>) -> String {
    let mut rng = rand::thread_rng();
    loop {
        let alias: String = (0..4).map(|_| rng.gen_range(b'A'..=b'Z') as char).collect();
        if aliases.insert(alias.clone()) {
            return alias;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strato_model::{Cardinality, Component, ComponentType, Probe, ResourceRequest, TimeContract};

    fn architecture(name: &str) -> Application {
        let mut app = Application::new(name);
        app.add_component(Component {
            application: name.into(),
            name: name.into(),
            kind: ComponentType::Managed,
            cardinality: Cardinality::Single,
            deployment_template: None,
            dependencies: vec![],
            probes: vec![Probe {
                name: "main".into(),
                alias: String::new(),
                application: name.into(),
                component: name.into(),
                requirements: vec![],
                code: String::new(),
                config: String::new(),
                signal_set: String::new(),
                execution_time_signal: String::new(),
                run_count_signal: String::new(),
            }],
            sharded: false,
            resources: ResourceRequest::default(),
            supported_hw_ids: vec![],
        });
        app
    }

    #[test]
    fn test_aliases_are_four_uppercase_letters_and_unique() {
        let registry = AppRegistry::new();
        let mut seen = BTreeSet::new();
        for i in 0..500 {
            let admitted = registry.add_app(architecture(&format!("app-{i}"))).unwrap();
            for probe in admitted.probes() {
                assert_eq!(probe.alias.len(), 4);
                assert!(probe.alias.chars().all(|c| c.is_ascii_uppercase()));
                assert!(seen.insert(probe.alias.clone()), "duplicate alias {}", probe.alias);
            }
        }
        assert_eq!(registry.alias_count(), 500);
    }

    #[test]
    fn test_alias_generation_survives_collisions() {
        // Saturate a large share of the alias space and keep generating.
        let mut aliases = BTreeSet::new();
        for _ in 0..10_000 {
            let alias = generate_alias(&mut aliases);
            assert_eq!(alias.len(), 4);
        }
        assert_eq!(aliases.len(), 10_000);
    }

    #[test]
    fn test_attach_requirements_merges_into_aliased_probes() {
        let registry = AppRegistry::new();
        registry.add_app(architecture("job")).unwrap();

        let mut update = architecture("job");
        update.components.get_mut("job").unwrap().probes[0]
            .requirements
            .push(Requirement::Time(TimeContract { time_ms: 200.0, percentile: 95.0 }));
        let merged = registry.attach_requirements(&update).unwrap();

        assert!(merged.complete);
        let probe = merged.probes().next().unwrap();
        assert_eq!(probe.alias.len(), 4);
        assert_eq!(probe.requirements.len(), 1);
    }

    #[test]
    fn test_published_removals_are_queued() {
        let registry = AppRegistry::new();
        registry.add_app(architecture("job")).unwrap();
        registry.publish("job");
        assert_eq!(registry.publish_new_architectures().len(), 1);

        registry.remove_app("job");
        assert_eq!(registry.publish_new_removals(), vec!["job".to_string()]);
    }
}
