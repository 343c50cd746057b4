//! Execution and model updates of the Kubernetes-facing tasks.
//!
//! The namespace of an application is the application name. Idempotent
//! answers from the orchestrator (404 on delete, 409 on create) count as
//! success so replayed plans converge instead of failing.

use tracing::{debug, info};

use strato_model::{Instance, InstancePhase, Knowledge, ManagedInstance};

use crate::context::{ExecutionContext, OrchestratorError};
use crate::task::{TaskKind, TaskReport};

pub(crate) async fn execute(
    kind: &TaskKind,
    context: &ExecutionContext,
) -> Result<TaskReport, OrchestratorError> {
    match kind {
        TaskKind::CreateNamespace { application } => {
            match context.kube.create_namespace(application).await {
                Ok(()) | Err(OrchestratorError::AlreadyExists) => {
                    info!(namespace = %application, "namespace created");
                    Ok(TaskReport::success())
                }
                Err(error) => Err(error),
            }
        }
        TaskKind::DeleteNamespace { application } => {
            match context.kube.delete_namespace(application).await {
                Ok(()) | Err(OrchestratorError::NotFound) => {
                    info!(namespace = %application, "namespace deleted");
                    Ok(TaskReport::success())
                }
                Err(error) => Err(error),
            }
        }
        TaskKind::CreateDockerSecret { application, docker_config } => {
            let name = context.config.docker_secret_name.clone();
            match context.kube.create_secret(application, &name, docker_config).await {
                Ok(()) | Err(OrchestratorError::AlreadyExists) => {
                    info!(namespace = %application, "docker secret created");
                    Ok(TaskReport::success())
                }
                Err(error) => Err(error),
            }
        }
        TaskKind::DeleteDockerSecret { application } => {
            let name = context.config.docker_secret_name.clone();
            match context.kube.delete_secret(application, &name).await {
                Ok(()) | Err(OrchestratorError::NotFound) => {
                    info!(namespace = %application, "docker secret deleted");
                    Ok(TaskReport::success())
                }
                Err(error) => Err(error),
            }
        }
        TaskKind::CreateService { application, component, instance_id, manifest, .. } => {
            match context.kube.create_service(application, manifest).await {
                Ok(ip) => {
                    info!(namespace = %application, component = %component, instance = %instance_id, %ip, "service created");
                    Ok(TaskReport::with_service_ip(ip))
                }
                Err(OrchestratorError::AlreadyExists) => Ok(TaskReport::success()),
                Err(error) => Err(error),
            }
        }
        TaskKind::DeleteService { application, instance_id, .. } => {
            let name = instance_id.clone();
            match context.kube.delete_service(application, &name).await {
                Ok(()) | Err(OrchestratorError::NotFound) => {
                    info!(namespace = %application, service = %name, "service deleted");
                    Ok(TaskReport::success())
                }
                Err(error) => Err(error),
            }
        }
        TaskKind::CreateDeployment { application, component, instance_id, manifest } => {
            match context.kube.create_deployment(application, manifest).await {
                Ok(()) | Err(OrchestratorError::AlreadyExists) => {
                    info!(namespace = %application, component = %component, instance = %instance_id, "deployment created");
                    Ok(TaskReport::success())
                }
                Err(error) => Err(error),
            }
        }
        TaskKind::UpdateDeployment { application, instance_id, manifest, .. } => {
            let name = instance_id.clone();
            context.kube.update_deployment(application, &name, manifest).await?;
            info!(namespace = %application, deployment = %name, "deployment updated");
            Ok(TaskReport::success())
        }
        TaskKind::DeleteDeployment { application, instance_id, .. } => {
            let name = instance_id.clone();
            match context.kube.delete_deployment(application, &name).await {
                Ok(()) | Err(OrchestratorError::NotFound) => {
                    info!(namespace = %application, deployment = %name, "deployment deleted");
                    Ok(TaskReport::success())
                }
                Err(error) => Err(error),
            }
        }
        other => unreachable!("not a kubernetes task: {other:?}"),
    }
}

pub(crate) fn update_model(kind: &TaskKind, knowledge: &mut Knowledge, report: &TaskReport) {
    match kind {
        TaskKind::CreateNamespace { application } => {
            if let Some(app) = knowledge.applications.get_mut(application) {
                app.namespace_created = true;
                app.namespace_deleted = false;
            }
        }
        TaskKind::DeleteNamespace { application } => {
            if let Some(app) = knowledge.applications.get_mut(application) {
                app.namespace_created = false;
                app.namespace_deleted = true;
            }
            knowledge.orphaned_namespaces.remove(application);
        }
        TaskKind::CreateDockerSecret { application, .. } => {
            if let Some(app) = knowledge.applications.get_mut(application) {
                app.secret_added = true;
            }
        }
        TaskKind::DeleteDockerSecret { application } => {
            if let Some(app) = knowledge.applications.get_mut(application) {
                app.secret_added = false;
            }
        }
        TaskKind::CreateService { application, component, instance_id, node, .. } => {
            if knowledge.actual_state.get_managed(application, component, instance_id).is_none() {
                let mut instance = ManagedInstance::new(application, component, instance_id);
                instance.node = node.clone();
                knowledge.actual_state.add_instance(Instance::Managed(instance));
            }
            if let Some(instance) = knowledge.actual_state.get_managed_mut(application, component, instance_id) {
                if let Some(ip) = &report.service_ip {
                    if !ip.is_empty() {
                        instance.ip = Some(ip.clone());
                    }
                }
            }
        }
        TaskKind::DeleteService { application, component, instance_id, .. } => {
            knowledge.actual_state.remove_instance(application, component, instance_id);
            debug!(namespace = %application, instance = %instance_id, "instance removed from actual state");
        }
        TaskKind::CreateDeployment { application, component, instance_id, manifest } => {
            if let Some(instance) = knowledge.actual_state.get_managed_mut(application, component, instance_id) {
                instance.deployment = Some(manifest.clone());
                // The pod is scheduled and the service ip is known; the
                // monitor will confirm, never lower.
                if instance.ip.is_some() {
                    instance.advance_phase(InstancePhase::Init);
                }
            }
        }
        TaskKind::UpdateDeployment { application, component, instance_id, manifest } => {
            if let Some(instance) = knowledge.actual_state.get_managed_mut(application, component, instance_id) {
                instance.deployment = Some(manifest.clone());
            }
        }
        TaskKind::DeleteDeployment { application, component, instance_id, .. } => {
            if let Some(instance) = knowledge.actual_state.get_managed_mut(application, component, instance_id) {
                instance.deployment = None;
            }
        }
        other => unreachable!("not a kubernetes task: {other:?}"),
    }
}
