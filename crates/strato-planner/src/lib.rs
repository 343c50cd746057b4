//! Planning phase of the adaptation loop.
//!
//! Diffs the desired cluster state against the actual one and emits one
//! execution plan per application. Plans are sets, not sequences: ordering
//! is carried entirely by the preconditions on the emitted tasks, and the
//! executor discovers a legal order at runtime. Re-planning a converged
//! state emits nothing.

pub mod manifests;

pub use manifests::*;

use tracing::{debug, info};

use strato_executor::{ExecutionPlan, Task, TaskKind};
use strato_model::{
    Application, ClusterState, Component, Instance, InstancePhase, Knowledge, ManagedInstance,
    SharedKnowledge,
};

/// Produces the execution plans that converge the actual state toward the
/// desired one.
pub struct ExecutionPlanner {
    knowledge: SharedKnowledge,
}

impl ExecutionPlanner {
    pub fn new(knowledge: SharedKnowledge) -> Self {
        Self { knowledge }
    }

    pub async fn plan_changes(&self, desired: &ClusterState) -> Vec<ExecutionPlan> {
        let knowledge = self.knowledge.read().await;
        plan_changes(&knowledge, desired)
    }
}

/// Pure planning over a knowledge snapshot; exposed for tests and tools.
pub fn plan_changes(knowledge: &Knowledge, desired: &ClusterState) -> Vec<ExecutionPlan> {
    let mut plans = Vec::new();

    let mut applications: Vec<&str> = knowledge.applications.keys().map(String::as_str).collect();
    for app in desired.applications() {
        if !applications.contains(&app) {
            applications.push(app);
        }
    }

    for app_name in applications {
        let Some(application) = knowledge.applications.get(app_name) else {
            continue;
        };
        let mut plan = ExecutionPlan::new(app_name);
        plan_application(knowledge, application, desired, &mut plan);
        if !plan.is_empty() {
            info!(application = app_name, tasks = plan.tasks.len(), "plan emitted");
            plans.push(plan);
        }
    }

    // Namespaces of applications that were removed from the model entirely.
    for namespace in &knowledge.orphaned_namespaces {
        let mut plan = ExecutionPlan::new(namespace.clone());
        plan.push(Task::new(TaskKind::DeleteNamespace { application: namespace.clone() }));
        plans.push(plan);
    }

    plans
}

fn plan_application(
    knowledge: &Knowledge,
    application: &Application,
    desired: &ClusterState,
    plan: &mut ExecutionPlan,
) {
    let app = &application.name;
    let mut namespace_tasks_emitted = false;

    // Creation: desired managed instances the cluster does not run yet.
    for component in application.managed_components() {
        let mut shard_key: u32 = 0;
        for instance in desired
            .instances(app, &component.name)
            .filter_map(Instance::as_managed)
        {
            let exists = knowledge
                .actual_state
                .get_managed(app, &component.name, &instance.id)
                .is_some();
            if exists {
                plan_template_change(knowledge, component, instance, plan);
            } else {
                if !application.namespace_created && !namespace_tasks_emitted {
                    plan.push(Task::new(TaskKind::CreateNamespace { application: app.clone() }));
                }
                if !application.secret_added && !namespace_tasks_emitted {
                    plan.push(Task::new(TaskKind::CreateDockerSecret {
                        application: app.clone(),
                        docker_config: application.docker_secret.clone().unwrap_or_default(),
                    }));
                }
                namespace_tasks_emitted = true;
                plan_instance_creation(component, instance, shard_key, plan);
            }
            shard_key += 1;
        }
    }

    // Teardown: actual managed instances the desired state dropped.
    let mut removed_everything = true;
    let mut removed_any = false;
    for instance in knowledge
        .actual_state
        .all_instances()
        .filter(|i| i.application() == app)
        .filter_map(Instance::as_managed)
    {
        let keep = desired.get_managed(app, &instance.component, &instance.id).is_some();
        if keep || instance.pinned {
            if !keep {
                debug!(instance = %instance.id, "pinned instance kept despite removal proposal");
            }
            removed_everything = false;
            continue;
        }
        removed_any = true;
        plan_instance_teardown(app, instance, plan);
    }

    // Dependency rebinding for clients and surviving managed instances.
    for instance in desired.all_instances().filter(|i| i.application() == app) {
        let actual = knowledge
            .actual_state
            .get_instance(app, instance.component(), instance.id());
        let Some(actual) = actual else {
            // New managed instances get their addresses with the creation
            // chain; new clients are bound once monitoring records them.
            continue;
        };
        for (provider_component, provider_id) in instance.dependencies() {
            let bound = actual.dependencies().get(provider_component) == Some(provider_id);
            if bound {
                continue;
            }
            plan.push(Task::new(TaskKind::SetDependencyAddress {
                application: app.clone(),
                dependent_component: instance.component().to_string(),
                dependent_id: instance.id().to_string(),
                dependent_managed: instance.as_managed().is_some(),
                provider_component: provider_component.clone(),
                provider_id: provider_id.clone(),
            }));
        }
    }

    // The application's last instances leaving take the namespace with them.
    let desired_has_instances = desired
        .instances_of_app(app)
        .any(|i| i.as_managed().is_some());
    if removed_any && removed_everything && !desired_has_instances {
        plan.push(Task::new(TaskKind::DeleteDockerSecret { application: app.clone() }));
        plan.push(Task::new(TaskKind::DeleteNamespace { application: app.clone() }));
    }
}

fn plan_instance_creation(
    component: &Component,
    instance: &ManagedInstance,
    shard_key: u32,
    plan: &mut ExecutionPlan,
) {
    let app = &component.application;
    plan.push(Task::new(TaskKind::CreateService {
        application: app.clone(),
        component: component.name.clone(),
        instance_id: instance.id.clone(),
        manifest: render_service(component, &instance.id),
        node: instance.node.clone(),
    }));
    if let Some(manifest) = render_deployment(component, instance) {
        plan.push(Task::new(TaskKind::CreateDeployment {
            application: app.clone(),
            component: component.name.clone(),
            instance_id: instance.id.clone(),
            manifest,
        }));
    }
    plan.push(Task::new(TaskKind::InitializeInstance {
        application: app.clone(),
        component: component.name.clone(),
        instance_id: instance.id.clone(),
    }));
    if component.sharded {
        plan.push(Task::new(TaskKind::SetMongoParameters {
            application: app.clone(),
            component: component.name.clone(),
            instance_id: instance.id.clone(),
            shard_key,
        }));
    }
    for (provider_component, provider_id) in &instance.dependencies {
        plan.push(Task::new(TaskKind::SetDependencyAddress {
            application: app.clone(),
            dependent_component: component.name.clone(),
            dependent_id: instance.id.clone(),
            dependent_managed: true,
            provider_component: provider_component.clone(),
            provider_id: provider_id.clone(),
        }));
    }
}

fn plan_instance_teardown(app: &str, instance: &ManagedInstance, plan: &mut ExecutionPlan) {
    // Instances that never initialized cannot be finalized and will not
    // reach the finished phase; their resources are removed directly.
    let started = instance.phase >= InstancePhase::Init && instance.phase < InstancePhase::Failed;
    if instance.phase >= InstancePhase::Init && instance.phase < InstancePhase::Finalizing {
        plan.push(Task::new(TaskKind::FinalizeInstance {
            application: app.to_string(),
            component: instance.component.clone(),
            instance_id: instance.id.clone(),
        }));
    }
    plan.push(Task::new(TaskKind::DeleteDeployment {
        application: app.to_string(),
        component: instance.component.clone(),
        instance_id: instance.id.clone(),
        gate_on_finished: started,
    }));
    plan.push(Task::new(TaskKind::DeleteService {
        application: app.to_string(),
        component: instance.component.clone(),
        instance_id: instance.id.clone(),
        gate_on_finished: started,
    }));
}

fn plan_template_change(
    knowledge: &Knowledge,
    component: &Component,
    instance: &ManagedInstance,
    plan: &mut ExecutionPlan,
) {
    let Some(actual) = knowledge
        .actual_state
        .get_managed(&component.application, &component.name, &instance.id)
    else {
        return;
    };
    let Some(rendered) = render_deployment(component, instance) else {
        return;
    };
    // Unknown running manifests (instances first seen by monitoring) are
    // left alone; only a tracked, differing manifest triggers redeployment.
    if matches!(&actual.deployment, Some(current) if current != &rendered) {
        plan.push(Task::new(TaskKind::UpdateDeployment {
            application: component.application.clone(),
            component: component.name.clone(),
            instance_id: instance.id.clone(),
            manifest: rendered,
        }));
    }
}

trait InstancesOfApp {
    fn instances_of_app<'a>(&'a self, app: &'a str) -> Box<dyn Iterator<Item = &'a Instance> + 'a>;
}

impl InstancesOfApp for ClusterState {
    fn instances_of_app<'a>(&'a self, app: &'a str) -> Box<dyn Iterator<Item = &'a Instance> + 'a> {
        Box::new(self.all_instances().filter(move |i| i.application() == app))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strato_model::{Cardinality, ComponentType, ControllerConfig, ResourceRequest};

    fn component(app: &str, name: &str) -> Component {
        Component {
            application: app.into(),
            name: name.into(),
            kind: ComponentType::Managed,
            cardinality: Cardinality::Single,
            deployment_template: Some(
                "apiVersion: apps/v1\nkind: Deployment\nmetadata:\n  name: placeholder\n".into(),
            ),
            dependencies: vec![],
            probes: vec![],
            sharded: false,
            resources: ResourceRequest::default(),
            supported_hw_ids: vec![],
        }
    }

    fn knowledge_with_app() -> Knowledge {
        let mut knowledge = Knowledge::new(ControllerConfig::default());
        let mut app = Application::new("demo");
        app.add_component(component("demo", "frontend"));
        knowledge.add_application(app);
        knowledge
    }

    fn kinds(plan: &ExecutionPlan) -> Vec<&'static str> {
        plan.tasks
            .iter()
            .map(|t| match t.kind() {
                TaskKind::CreateNamespace { .. } => "create-namespace",
                TaskKind::DeleteNamespace { .. } => "delete-namespace",
                TaskKind::CreateDockerSecret { .. } => "create-docker-secret",
                TaskKind::DeleteDockerSecret { .. } => "delete-docker-secret",
                TaskKind::CreateService { .. } => "create-service",
                TaskKind::DeleteService { .. } => "delete-service",
                TaskKind::CreateDeployment { .. } => "create-deployment",
                TaskKind::UpdateDeployment { .. } => "update-deployment",
                TaskKind::DeleteDeployment { .. } => "delete-deployment",
                TaskKind::InitializeInstance { .. } => "initialize-instance",
                TaskKind::SetMongoParameters { .. } => "set-mongo-parameters",
                TaskKind::SetDependencyAddress { .. } => "set-dependency-address",
                TaskKind::FinalizeInstance { .. } => "finalize-instance",
            })
            .collect()
    }

    #[test]
    fn test_new_instance_emits_full_creation_chain() {
        let knowledge = knowledge_with_app();
        let mut desired = ClusterState::new();
        let mut instance = ManagedInstance::new("demo", "frontend", "frontend-0");
        instance.node = Some("node-a".into());
        desired.add_instance(Instance::Managed(instance));

        let plans = plan_changes(&knowledge, &desired);
        assert_eq!(plans.len(), 1);
        assert_eq!(
            kinds(&plans[0]),
            vec![
                "create-namespace",
                "create-docker-secret",
                "create-service",
                "create-deployment",
                "initialize-instance",
            ]
        );
    }

    #[test]
    fn test_converged_state_plans_nothing() {
        let mut knowledge = knowledge_with_app();
        let mut instance = ManagedInstance::new("demo", "frontend", "frontend-0");
        instance.node = Some("node-a".into());
        knowledge.applications.get_mut("demo").unwrap().namespace_created = true;
        knowledge.applications.get_mut("demo").unwrap().secret_added = true;
        knowledge.actual_state.add_instance(Instance::Managed(instance.clone()));

        let mut desired = ClusterState::new();
        desired.add_instance(Instance::Managed(instance));

        let plans = plan_changes(&knowledge, &desired);
        assert!(plans.is_empty());
    }

    #[test]
    fn test_removed_instance_emits_gated_teardown_chain() {
        let mut knowledge = knowledge_with_app();
        knowledge.applications.get_mut("demo").unwrap().namespace_created = true;
        knowledge.applications.get_mut("demo").unwrap().secret_added = true;
        let mut instance = ManagedInstance::new("demo", "frontend", "frontend-0");
        instance.advance_phase(InstancePhase::Ready);
        knowledge.actual_state.add_instance(Instance::Managed(instance));

        let plans = plan_changes(&knowledge, &ClusterState::new());
        assert_eq!(plans.len(), 1);
        assert_eq!(
            kinds(&plans[0]),
            vec![
                "finalize-instance",
                "delete-deployment",
                "delete-service",
                "delete-docker-secret",
                "delete-namespace",
            ]
        );
    }

    #[test]
    fn test_pinned_instance_survives_removal_proposal() {
        let mut knowledge = knowledge_with_app();
        let mut instance = ManagedInstance::new("demo", "frontend", "frontend-0");
        instance.pinned = true;
        instance.advance_phase(InstancePhase::Ready);
        knowledge.actual_state.add_instance(Instance::Managed(instance));

        let plans = plan_changes(&knowledge, &ClusterState::new());
        assert!(plans.is_empty());
    }

    #[test]
    fn test_client_rebinding_emits_dependency_address_task() {
        let mut knowledge = knowledge_with_app();
        let app = knowledge.applications.get_mut("demo").unwrap();
        app.add_component(Component {
            kind: ComponentType::Unmanaged,
            cardinality: Cardinality::Multiple,
            deployment_template: None,
            dependencies: vec!["frontend".into()],
            ..component("demo", "viewer")
        });
        let mut frontend = ManagedInstance::new("demo", "frontend", "frontend-0");
        frontend.advance_phase(InstancePhase::Ready);
        knowledge.actual_state.add_instance(Instance::Managed(frontend.clone()));
        knowledge
            .actual_state
            .add_instance(Instance::Client(strato_model::ClientInstance::new("demo", "viewer", "c1")));

        let mut desired = ClusterState::new();
        desired.add_instance(Instance::Managed(frontend));
        desired.add_instance(Instance::Client(strato_model::ClientInstance::new("demo", "viewer", "c1")));
        desired.set_dependency("demo", "viewer", "c1", "frontend", "frontend-0");

        let plans = plan_changes(&knowledge, &desired);
        assert_eq!(plans.len(), 1);
        assert_eq!(kinds(&plans[0]), vec!["set-dependency-address"]);
    }
}
