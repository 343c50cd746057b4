//! Tasks and their preconditions.
//!
//! A task is a tagged operation with a stable id, a set of precondition
//! predicates over the knowledge base, and a model update applied under the
//! knowledge write lock once the operation succeeded. Ordering between tasks
//! is expressed exclusively through preconditions.

use serde::{Deserialize, Serialize};

use strato_model::{InstancePhase, Knowledge};

use crate::context::{ExecutionContext, OrchestratorError};
use crate::tasks;

/// Predicate over the knowledge base; a task runs only when all of its
/// preconditions hold.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Precondition {
    NamespaceExists(String),
    NamespaceAbsent(String),
    NamespaceActive(String),
    ApplicationDeployed(String),
    SecretAdded(String),
    /// No managed instance of the application remains in the actual state.
    NamespaceEmpty(String),
    InstanceExists {
        application: String,
        component: String,
        instance_id: String,
    },
    PhaseAtLeast {
        application: String,
        component: String,
        instance_id: String,
        phase: InstancePhase,
    },
}

impl Precondition {
    pub fn holds(&self, knowledge: &Knowledge) -> bool {
        match self {
            Precondition::NamespaceExists(app) => knowledge
                .applications
                .get(app)
                .map(|a| a.namespace_created)
                .unwrap_or(false),
            Precondition::NamespaceAbsent(app) => !knowledge
                .applications
                .get(app)
                .map(|a| a.namespace_created)
                .unwrap_or(false),
            Precondition::NamespaceActive(app) => knowledge
                .applications
                .get(app)
                .map(|a| a.namespace_created && !a.namespace_deleted)
                .unwrap_or(false),
            Precondition::ApplicationDeployed(app) => knowledge.applications.contains_key(app),
            Precondition::SecretAdded(app) => knowledge
                .applications
                .get(app)
                .map(|a| a.secret_added)
                .unwrap_or(false),
            Precondition::NamespaceEmpty(app) => {
                !knowledge.actual_state.all_managed().any(|m| &m.application == app)
            }
            Precondition::InstanceExists { application, component, instance_id } => knowledge
                .actual_state
                .get_managed(application, component, instance_id)
                .is_some(),
            Precondition::PhaseAtLeast { application, component, instance_id, phase } => knowledge
                .actual_state
                .get_managed(application, component, instance_id)
                .map(|m| m.phase >= *phase)
                .unwrap_or(false),
        }
    }
}

/// What a task observed while executing; consumed by its model update.
#[derive(Debug, Clone, Default)]
pub struct TaskReport {
    pub success: bool,
    pub service_ip: Option<String>,
}

impl TaskReport {
    pub fn success() -> Self {
        Self { success: true, service_ip: None }
    }

    pub fn with_service_ip(ip: String) -> Self {
        Self { success: true, service_ip: Some(ip) }
    }
}

/// The tagged operation types the planner may emit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskKind {
    CreateNamespace {
        application: String,
    },
    DeleteNamespace {
        application: String,
    },
    CreateDockerSecret {
        application: String,
        docker_config: String,
    },
    DeleteDockerSecret {
        application: String,
    },
    CreateService {
        application: String,
        component: String,
        instance_id: String,
        manifest: String,
        node: Option<String>,
    },
    DeleteService {
        application: String,
        component: String,
        instance_id: String,
        /// Wait for the instance to finish before removing its service;
        /// instances that never started are deleted without the gate.
        gate_on_finished: bool,
    },
    CreateDeployment {
        application: String,
        component: String,
        instance_id: String,
        manifest: String,
    },
    UpdateDeployment {
        application: String,
        component: String,
        instance_id: String,
        manifest: String,
    },
    DeleteDeployment {
        application: String,
        component: String,
        instance_id: String,
        gate_on_finished: bool,
    },
    InitializeInstance {
        application: String,
        component: String,
        instance_id: String,
    },
    SetMongoParameters {
        application: String,
        component: String,
        instance_id: String,
        shard_key: u32,
    },
    SetDependencyAddress {
        application: String,
        dependent_component: String,
        dependent_id: String,
        dependent_managed: bool,
        provider_component: String,
        provider_id: String,
    },
    FinalizeInstance {
        application: String,
        component: String,
        instance_id: String,
    },
}

/// One schedulable unit of work.
#[derive(Debug, Clone)]
pub struct Task {
    id: String,
    kind: TaskKind,
    preconditions: Vec<Precondition>,
}

impl Task {
    pub fn new(kind: TaskKind) -> Self {
        let id = task_id(&kind);
        let preconditions = default_preconditions(&kind);
        Self { id, kind, preconditions }
    }

    /// Stable identifier derived from the kind and its targets; equal tasks
    /// emitted in consecutive cycles share it.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> &TaskKind {
        &self.kind
    }

    pub fn preconditions(&self) -> &[Precondition] {
        &self.preconditions
    }

    /// Runs the operation. Idempotent "already done" orchestrator answers
    /// are reported as success; other failures bubble up for retry.
    pub async fn execute(&self, context: &ExecutionContext) -> Result<TaskReport, OrchestratorError> {
        match &self.kind {
            TaskKind::CreateNamespace { .. }
            | TaskKind::DeleteNamespace { .. }
            | TaskKind::CreateDockerSecret { .. }
            | TaskKind::DeleteDockerSecret { .. }
            | TaskKind::CreateService { .. }
            | TaskKind::DeleteService { .. }
            | TaskKind::CreateDeployment { .. }
            | TaskKind::UpdateDeployment { .. }
            | TaskKind::DeleteDeployment { .. } => tasks::kubernetes::execute(&self.kind, context).await,
            TaskKind::InitializeInstance { .. }
            | TaskKind::SetMongoParameters { .. }
            | TaskKind::SetDependencyAddress { .. }
            | TaskKind::FinalizeInstance { .. } => tasks::middleware::execute(&self.kind, context).await,
        }
    }

    /// Applies the task's effect on the knowledge model. Only invoked after
    /// a successful execution, under the knowledge write lock.
    pub fn update_model(&self, knowledge: &mut Knowledge, report: &TaskReport) {
        match &self.kind {
            TaskKind::CreateNamespace { .. }
            | TaskKind::DeleteNamespace { .. }
            | TaskKind::CreateDockerSecret { .. }
            | TaskKind::DeleteDockerSecret { .. }
            | TaskKind::CreateService { .. }
            | TaskKind::DeleteService { .. }
            | TaskKind::CreateDeployment { .. }
            | TaskKind::UpdateDeployment { .. }
            | TaskKind::DeleteDeployment { .. } => {
                tasks::kubernetes::update_model(&self.kind, knowledge, report)
            }
            TaskKind::InitializeInstance { .. }
            | TaskKind::SetMongoParameters { .. }
            | TaskKind::SetDependencyAddress { .. }
            | TaskKind::FinalizeInstance { .. } => {
                tasks::middleware::update_model(&self.kind, knowledge, report)
            }
        }
    }
}

fn task_id(kind: &TaskKind) -> String {
    match kind {
        TaskKind::CreateNamespace { application } => format!("create-namespace:{application}"),
        TaskKind::DeleteNamespace { application } => format!("delete-namespace:{application}"),
        TaskKind::CreateDockerSecret { application, .. } => format!("create-docker-secret:{application}"),
        TaskKind::DeleteDockerSecret { application } => format!("delete-docker-secret:{application}"),
        TaskKind::CreateService { application, component, instance_id, .. } => {
            format!("create-service:{application}:{component}:{instance_id}")
        }
        TaskKind::DeleteService { application, component, instance_id, .. } => {
            format!("delete-service:{application}:{component}:{instance_id}")
        }
        TaskKind::CreateDeployment { application, component, instance_id, .. } => {
            format!("create-deployment:{application}:{component}:{instance_id}")
        }
        TaskKind::UpdateDeployment { application, component, instance_id, .. } => {
            format!("update-deployment:{application}:{component}:{instance_id}")
        }
        TaskKind::DeleteDeployment { application, component, instance_id, .. } => {
            format!("delete-deployment:{application}:{component}:{instance_id}")
        }
        TaskKind::InitializeInstance { application, component, instance_id } => {
            format!("initialize-instance:{application}:{component}:{instance_id}")
        }
        TaskKind::SetMongoParameters { application, component, instance_id, .. } => {
            format!("set-mongo-parameters:{application}:{component}:{instance_id}")
        }
        TaskKind::SetDependencyAddress {
            application,
            dependent_component,
            dependent_id,
            provider_component,
            ..
        } => format!("set-dependency-address:{application}:{dependent_component}:{dependent_id}:{provider_component}"),
        TaskKind::FinalizeInstance { application, component, instance_id } => {
            format!("finalize-instance:{application}:{component}:{instance_id}")
        }
    }
}

fn default_preconditions(kind: &TaskKind) -> Vec<Precondition> {
    match kind {
        TaskKind::CreateNamespace { application } => vec![
            Precondition::NamespaceAbsent(application.clone()),
            Precondition::ApplicationDeployed(application.clone()),
        ],
        TaskKind::DeleteNamespace { application } => {
            vec![Precondition::NamespaceEmpty(application.clone())]
        }
        TaskKind::CreateDockerSecret { application, .. } => {
            vec![Precondition::NamespaceActive(application.clone())]
        }
        TaskKind::DeleteDockerSecret { application } => {
            vec![Precondition::NamespaceEmpty(application.clone())]
        }
        TaskKind::CreateService { application, .. } => vec![
            Precondition::NamespaceActive(application.clone()),
            Precondition::SecretAdded(application.clone()),
        ],
        TaskKind::DeleteService { application, component, instance_id, gate_on_finished } => {
            let mut preconditions = vec![Precondition::NamespaceActive(application.clone())];
            if *gate_on_finished {
                preconditions.push(Precondition::PhaseAtLeast {
                    application: application.clone(),
                    component: component.clone(),
                    instance_id: instance_id.clone(),
                    phase: InstancePhase::Finished,
                });
            }
            preconditions
        }
        TaskKind::CreateDeployment { application, component, instance_id, .. } => vec![
            Precondition::NamespaceActive(application.clone()),
            Precondition::InstanceExists {
                application: application.clone(),
                component: component.clone(),
                instance_id: instance_id.clone(),
            },
        ],
        TaskKind::UpdateDeployment { application, component, instance_id, .. } => vec![
            Precondition::NamespaceActive(application.clone()),
            Precondition::InstanceExists {
                application: application.clone(),
                component: component.clone(),
                instance_id: instance_id.clone(),
            },
        ],
        TaskKind::DeleteDeployment { application, component, instance_id, gate_on_finished } => {
            let mut preconditions = vec![Precondition::NamespaceActive(application.clone())];
            if *gate_on_finished {
                preconditions.push(Precondition::PhaseAtLeast {
                    application: application.clone(),
                    component: component.clone(),
                    instance_id: instance_id.clone(),
                    phase: InstancePhase::Finished,
                });
            }
            preconditions
        }
        TaskKind::InitializeInstance { application, component, instance_id } => vec![
            Precondition::InstanceExists {
                application: application.clone(),
                component: component.clone(),
                instance_id: instance_id.clone(),
            },
            Precondition::PhaseAtLeast {
                application: application.clone(),
                component: component.clone(),
                instance_id: instance_id.clone(),
                phase: InstancePhase::Init,
            },
        ],
        TaskKind::SetMongoParameters { application, component, instance_id, .. } => {
            vec![Precondition::PhaseAtLeast {
                application: application.clone(),
                component: component.clone(),
                instance_id: instance_id.clone(),
                phase: InstancePhase::Init,
            }]
        }
        TaskKind::SetDependencyAddress {
            application,
            dependent_component,
            dependent_id,
            dependent_managed,
            provider_component,
            provider_id,
        } => {
            let mut preconditions = vec![Precondition::PhaseAtLeast {
                application: application.clone(),
                component: provider_component.clone(),
                instance_id: provider_id.clone(),
                phase: InstancePhase::Ready,
            }];
            if *dependent_managed {
                preconditions.push(Precondition::PhaseAtLeast {
                    application: application.clone(),
                    component: dependent_component.clone(),
                    instance_id: dependent_id.clone(),
                    phase: InstancePhase::Init,
                });
            }
            preconditions
        }
        TaskKind::FinalizeInstance { application, component, instance_id } => {
            vec![Precondition::PhaseAtLeast {
                application: application.clone(),
                component: component.clone(),
                instance_id: instance_id.clone(),
                phase: InstancePhase::Init,
            }]
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strato_model::{Application, ControllerConfig};

    #[test]
    fn test_task_ids_are_stable_across_cycles() {
        let a = Task::new(TaskKind::CreateNamespace { application: "demo".into() });
        let b = Task::new(TaskKind::CreateNamespace { application: "demo".into() });
        assert_eq!(a.id(), b.id());
    }

    #[test]
    fn test_create_namespace_preconditions() {
        let mut knowledge = Knowledge::new(ControllerConfig::default());
        let task = Task::new(TaskKind::CreateNamespace { application: "demo".into() });

        // Unknown application: namespace absent, application not deployed.
        assert!(task.preconditions()[0].holds(&knowledge));
        assert!(!task.preconditions()[1].holds(&knowledge));

        knowledge.add_application(Application::new("demo"));
        assert!(task.preconditions().iter().all(|p| p.holds(&knowledge)));

        knowledge.applications.get_mut("demo").unwrap().namespace_created = true;
        assert!(!task.preconditions()[0].holds(&knowledge));
    }

    #[test]
    fn test_delete_deployment_gate_is_optional() {
        let gated = Task::new(TaskKind::DeleteDeployment {
            application: "demo".into(),
            component: "frontend".into(),
            instance_id: "frontend-0".into(),
            gate_on_finished: true,
        });
        let ungated = Task::new(TaskKind::DeleteDeployment {
            application: "demo".into(),
            component: "frontend".into(),
            instance_id: "frontend-0".into(),
            gate_on_finished: false,
        });
        assert_eq!(gated.preconditions().len(), 2);
        assert_eq!(ungated.preconditions().len(), 1);
        // The gate does not change the task identity.
        assert_eq!(gated.id(), ungated.id());
    }
}
