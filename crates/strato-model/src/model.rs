//! Application architectures: components, probes and their QoS contracts.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Whether an instance of a component is driven by the controller or lives
/// outside the cluster (an external client).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ComponentType {
    Managed,
    Unmanaged,
}

/// How many instances of a component may run at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Cardinality {
    Single,
    Multiple,
}

/// A QoS contract attached to a probe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Requirement {
    Time(TimeContract),
    Throughput(ThroughputContract),
}

/// Response time at a percentile must stay under the limit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeContract {
    pub time_ms: f64,
    pub percentile: f64,
}

/// Mean request time must stay under the limit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThroughputContract {
    pub mean_request_time_ms: f64,
}

/// A measurable workload unit inside a component, identified cluster-wide by
/// a short alias assigned at admission time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Probe {
    pub name: String,
    /// Four uppercase letters, unique across every probe the platform knows.
    pub alias: String,
    pub application: String,
    pub component: String,
    pub requirements: Vec<Requirement>,
    /// Non-empty for probes shipped as code executed by the workload agent.
    pub code: String,
    pub config: String,
    pub signal_set: String,
    pub execution_time_signal: String,
    pub run_count_signal: String,
}

impl Probe {
    /// Probes with attached code are run by the agent; the rest are
    /// procedures baked into the container image.
    pub fn is_code(&self) -> bool {
        !self.code.is_empty()
    }

    pub fn component_id(&self) -> String {
        format!("{}.{}", self.application, self.component)
    }

    /// The strictest time limit among the probe's contracts, if any.
    pub fn time_limit(&self) -> Option<f64> {
        self.requirements
            .iter()
            .filter_map(|r| match r {
                Requirement::Time(c) => Some(c.time_ms),
                Requirement::Throughput(_) => None,
            })
            .min_by(|a, b| a.total_cmp(b))
    }
}

/// Resources an instance of a component asks from its node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRequest {
    pub cpu_millis: u64,
    pub memory_mb: u64,
}

/// One deployable (or external) part of an application.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Component {
    pub application: String,
    pub name: String,
    pub kind: ComponentType,
    pub cardinality: Cardinality,
    /// Kubernetes deployment manifest for managed components, YAML.
    pub deployment_template: Option<String>,
    /// Names of components this one needs a live instance of.
    pub dependencies: Vec<String>,
    pub probes: Vec<Probe>,
    /// Component keeps per-shard state in the platform database.
    pub sharded: bool,
    pub resources: ResourceRequest,
    /// Hardware classes this component may be placed on; empty means any.
    pub supported_hw_ids: Vec<String>,
}

impl Component {
    /// Cluster-wide component identifier.
    pub fn global_id(&self) -> String {
        format!("{}.{}", self.application, self.name)
    }

    pub fn is_managed(&self) -> bool {
        self.kind == ComponentType::Managed
    }
}

/// A named collection of components submitted by one tenant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Application {
    pub name: String,
    pub components: BTreeMap<String, Component>,
    /// Set once the QoS contracts are attached; incomplete applications can
    /// be measured but not deployed.
    pub complete: bool,
    /// Registry credentials for pulling the application's images.
    pub docker_secret: Option<String>,
    pub namespace_created: bool,
    pub secret_added: bool,
    pub namespace_deleted: bool,
}

impl Application {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            components: BTreeMap::new(),
            complete: false,
            docker_secret: None,
            namespace_created: false,
            secret_added: false,
            namespace_deleted: false,
        }
    }

    pub fn add_component(&mut self, component: Component) {
        self.components.insert(component.name.clone(), component);
    }

    pub fn get_component(&self, name: &str) -> Option<&Component> {
        self.components.get(name)
    }

    /// All probes of all components, in component order.
    pub fn probes(&self) -> impl Iterator<Item = &Probe> {
        self.components.values().flat_map(|c| c.probes.iter())
    }

    pub fn managed_components(&self) -> impl Iterator<Item = &Component> {
        self.components.values().filter(|c| c.is_managed())
    }
}

/// A cluster node with its hardware class and capacity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub name: String,
    /// Equivalence label for nodes with indistinguishable performance.
    pub hw_id: String,
    pub capacity: ResourceRequest,
    /// Names of pods currently scheduled here, as last observed.
    pub pods: Vec<String>,
}

impl Node {
    pub fn new(name: impl Into<String>, hw_id: impl Into<String>, capacity: ResourceRequest) -> Self {
        Self {
            name: name.into(),
            hw_id: hw_id.into(),
            capacity,
            pods: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn probe(alias: &str, requirements: Vec<Requirement>) -> Probe {
        Probe {
            name: "render".into(),
            alias: alias.into(),
            application: "demo".into(),
            component: "frontend".into(),
            requirements,
            code: String::new(),
            config: String::new(),
            signal_set: String::new(),
            execution_time_signal: String::new(),
            run_count_signal: String::new(),
        }
    }

    #[test]
    fn test_probe_time_limit_picks_strictest_contract() {
        let p = probe(
            "ABCD",
            vec![
                Requirement::Time(TimeContract { time_ms: 250.0, percentile: 95.0 }),
                Requirement::Time(TimeContract { time_ms: 120.0, percentile: 50.0 }),
                Requirement::Throughput(ThroughputContract { mean_request_time_ms: 80.0 }),
            ],
        );
        assert_eq!(p.time_limit(), Some(120.0));
        assert!(!p.is_code());
    }

    #[test]
    fn test_component_global_id() {
        let component = Component {
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
        };
        assert_eq!(component.global_id(), "demo.frontend");
    }
}
