//! Running component instances, managed and external.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle phase of a managed instance. Phases only ever move forward;
/// `Failed` is the terminal phase for pods that died before finishing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum InstancePhase {
    Creating,
    Init,
    Ready,
    Finalizing,
    Finished,
    Failed,
}

/// An instance of a managed component running inside the cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagedInstance {
    pub application: String,
    pub component: String,
    pub id: String,
    pub node: Option<String>,
    pub ip: Option<String>,
    pub phase: InstancePhase,
    pub init_completed: bool,
    pub mongo_init_completed: bool,
    /// While set, the planner must not tear this instance down; used to keep
    /// dependencies of freshly connected clients alive until they bind.
    pub pinned: bool,
    /// Dependency component name to the id of the instance serving it.
    pub dependencies: BTreeMap<String, String>,
    /// Rendered deployment manifest this instance was (or will be) created from.
    pub deployment: Option<String>,
}

impl ManagedInstance {
    pub fn new(application: impl Into<String>, component: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            application: application.into(),
            component: component.into(),
            id: id.into(),
            node: None,
            ip: None,
            phase: InstancePhase::Creating,
            init_completed: false,
            mongo_init_completed: false,
            pinned: false,
            dependencies: BTreeMap::new(),
            deployment: None,
        }
    }

    /// Raise the phase to `phase` if it is ahead of the current one. Never
    /// moves backwards.
    pub fn advance_phase(&mut self, phase: InstancePhase) {
        if phase > self.phase {
            self.phase = phase;
        }
    }
}

/// An external client consuming managed components; the controller does not
/// run it, only tracks it and keeps its dependencies served.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientInstance {
    pub application: String,
    pub component: String,
    pub id: String,
    /// Network location the client connects from; used for proximity costs
    /// and for reaching the client's agent.
    pub location: String,
    pub dependencies: BTreeMap<String, String>,
    /// Set while the client has connected but its dependencies have not been
    /// handed to it yet.
    pub fresh: bool,
    pub connected_at: DateTime<Utc>,
}

impl ClientInstance {
    pub fn new(application: impl Into<String>, component: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            application: application.into(),
            component: component.into(),
            id: id.into(),
            location: String::new(),
            dependencies: BTreeMap::new(),
            fresh: true,
            connected_at: Utc::now(),
        }
    }

    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.location = location.into();
        self
    }
}

/// Any instance the cluster state tracks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Instance {
    Managed(ManagedInstance),
    Client(ClientInstance),
}

impl Instance {
    pub fn application(&self) -> &str {
        match self {
            Instance::Managed(m) => &m.application,
            Instance::Client(c) => &c.application,
        }
    }

    pub fn component(&self) -> &str {
        match self {
            Instance::Managed(m) => &m.component,
            Instance::Client(c) => &c.component,
        }
    }

    pub fn id(&self) -> &str {
        match self {
            Instance::Managed(m) => &m.id,
            Instance::Client(c) => &c.id,
        }
    }

    pub fn dependencies(&self) -> &BTreeMap<String, String> {
        match self {
            Instance::Managed(m) => &m.dependencies,
            Instance::Client(c) => &c.dependencies,
        }
    }

    pub fn as_managed(&self) -> Option<&ManagedInstance> {
        match self {
            Instance::Managed(m) => Some(m),
            Instance::Client(_) => None,
        }
    }

    pub fn as_client(&self) -> Option<&ClientInstance> {
        match self {
            Instance::Client(c) => Some(c),
            Instance::Managed(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_never_moves_backwards() {
        let mut instance = ManagedInstance::new("demo", "frontend", "frontend-1");
        instance.advance_phase(InstancePhase::Ready);
        assert_eq!(instance.phase, InstancePhase::Ready);
        instance.advance_phase(InstancePhase::Init);
        assert_eq!(instance.phase, InstancePhase::Ready);
        instance.advance_phase(InstancePhase::Finished);
        assert_eq!(instance.phase, InstancePhase::Finished);
    }

    #[test]
    fn test_phase_ordering_matches_lifecycle() {
        assert!(InstancePhase::Creating < InstancePhase::Init);
        assert!(InstancePhase::Init < InstancePhase::Ready);
        assert!(InstancePhase::Ready < InstancePhase::Finalizing);
        assert!(InstancePhase::Finalizing < InstancePhase::Finished);
    }
}
