//! Execution and model updates of the agent-facing tasks.

use tracing::info;

use strato_model::{
    AgentError, DependencyAddress, InstanceConfig, InstancePhase, Knowledge, MongoParameters,
    ProbeConfig, ProbeType,
};

use crate::context::{ExecutionContext, OrchestratorError};
use crate::task::{TaskKind, TaskReport};

pub(crate) async fn execute(
    kind: &TaskKind,
    context: &ExecutionContext,
) -> Result<TaskReport, OrchestratorError> {
    match kind {
        TaskKind::InitializeInstance { application, component, instance_id } => {
            let (ip, config) = {
                let knowledge = context.knowledge.read().await;
                let instance = knowledge
                    .actual_state
                    .get_managed(application, component, instance_id)
                    .ok_or(OrchestratorError::NotFound)?;
                let ip = instance
                    .ip
                    .clone()
                    .ok_or_else(|| AgentError::Unreachable(format!("instance {instance_id} has no ip")))?;
                let declaration = knowledge.component(application, component)?;
                let probes = declaration
                    .probes
                    .iter()
                    .map(|probe| ProbeConfig {
                        name: probe.name.clone(),
                        probe_type: if probe.is_code() { ProbeType::Code } else { ProbeType::Procedure },
                        code: probe.code.clone(),
                        config: probe.config.clone(),
                        signal_set: probe.signal_set.clone(),
                        execution_time_signal: probe.execution_time_signal.clone(),
                        run_count_signal: probe.run_count_signal.clone(),
                        run_count: 0,
                    })
                    .collect();
                let config = InstanceConfig {
                    instance_id: instance_id.clone(),
                    api_endpoint_ip: context.config.api_endpoint_ip.clone(),
                    api_endpoint_port: context.config.api_endpoint_port,
                    access_token: knowledge.api_access_token.clone().unwrap_or_default(),
                    production: true,
                    probes,
                };
                (ip, config)
            };
            let agent = context.agents.agent_for(&ip).await?;
            agent.initialize_instance(config).await?;
            info!(instance = %instance_id, "instance initialized");
            Ok(TaskReport::success())
        }
        TaskKind::SetMongoParameters { application, component, instance_id, shard_key } => {
            let ip = instance_ip(context, application, component, instance_id).await?;
            let parameters = MongoParameters {
                db: application.clone(),
                collection: component.clone(),
                shard_key: *shard_key,
                mongos_ip: context.config.mongos_ip.clone(),
            };
            let agent = context.agents.agent_for(&ip).await?;
            agent.set_mongo_parameters(parameters).await?;
            info!(instance = %instance_id, "mongo parameters set");
            Ok(TaskReport::success())
        }
        TaskKind::SetDependencyAddress {
            application,
            dependent_component,
            dependent_id,
            dependent_managed,
            provider_component,
            provider_id,
        } => {
            let (dependent_address, provider_ip) = {
                let knowledge = context.knowledge.read().await;
                let provider = knowledge
                    .actual_state
                    .get_managed(application, provider_component, provider_id)
                    .ok_or(OrchestratorError::NotFound)?;
                let provider_ip = provider
                    .ip
                    .clone()
                    .ok_or_else(|| AgentError::Unreachable(format!("provider {provider_id} has no ip")))?;
                let dependent_address = if *dependent_managed {
                    knowledge
                        .actual_state
                        .get_managed(application, dependent_component, dependent_id)
                        .and_then(|m| m.ip.clone())
                } else {
                    knowledge
                        .actual_state
                        .get_instance(application, dependent_component, dependent_id)
                        .and_then(|i| i.as_client())
                        .map(|c| c.location.clone())
                };
                let dependent_address = dependent_address
                    .ok_or_else(|| AgentError::Unreachable(format!("dependent {dependent_id} has no address")))?;
                (dependent_address, provider_ip)
            };
            let address = DependencyAddress {
                name: provider_component.clone(),
                ip: provider_ip,
            };
            let agent = context.agents.agent_for(&dependent_address).await?;
            agent.set_dependency_address(address).await?;
            info!(
                dependent = %dependent_id,
                provider = %provider_id,
                "dependency address set"
            );
            Ok(TaskReport::success())
        }
        TaskKind::FinalizeInstance { application, component, instance_id } => {
            let ip = instance_ip(context, application, component, instance_id).await?;
            let agent = context.agents.agent_for(&ip).await?;
            agent.finalize_execution().await?;
            info!(instance = %instance_id, "finalize call sent");
            Ok(TaskReport::success())
        }
        other => unreachable!("not a middleware task: {other:?}"),
    }
}

pub(crate) fn update_model(kind: &TaskKind, knowledge: &mut Knowledge, _report: &TaskReport) {
    match kind {
        TaskKind::InitializeInstance { application, component, instance_id } => {
            if let Some(instance) = knowledge.actual_state.get_managed_mut(application, component, instance_id) {
                instance.init_completed = true;
            }
        }
        TaskKind::SetMongoParameters { application, component, instance_id, .. } => {
            if let Some(instance) = knowledge.actual_state.get_managed_mut(application, component, instance_id) {
                instance.mongo_init_completed = true;
            }
        }
        TaskKind::SetDependencyAddress {
            application,
            dependent_component,
            dependent_id,
            provider_component,
            provider_id,
            ..
        } => {
            knowledge.actual_state.set_dependency(
                application,
                dependent_component,
                dependent_id,
                provider_component,
                provider_id,
            );
        }
        TaskKind::FinalizeInstance { application, component, instance_id } => {
            if let Some(instance) = knowledge.actual_state.get_managed_mut(application, component, instance_id) {
                instance.advance_phase(InstancePhase::Finalizing);
            }
        }
        other => unreachable!("not a middleware task: {other:?}"),
    }
}

async fn instance_ip(
    context: &ExecutionContext,
    application: &str,
    component: &str,
    instance_id: &str,
) -> Result<String, OrchestratorError> {
    let knowledge = context.knowledge.read().await;
    let instance = knowledge
        .actual_state
        .get_managed(application, component, instance_id)
        .ok_or(OrchestratorError::NotFound)?;
    instance
        .ip
        .clone()
        .ok_or_else(|| AgentError::Unreachable(format!("instance {instance_id} has no ip")).into())
}
