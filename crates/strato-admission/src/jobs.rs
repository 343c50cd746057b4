//! External job submission surface.
//!
//! Wraps a user-supplied container plus code and config into a
//! single-component application with one probe and drives it through the
//! admission flow; once deployed, runs are proxied to the workload agent of
//! the job's unique instance.

use std::collections::BTreeMap;
use std::sync::Arc;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{Container, PodSpec, PodTemplateSpec, ResourceRequirements};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{error, info};

use strato_model::{
    AgentRegistry, Application, Cardinality, Component, ComponentType, InstancePhase, Probe,
    Requirement, ResourceRequest, RunParameters, SharedKnowledge, TimeContract,
};

use crate::deploy::{AdmissionStatus, DeployController};

/// Admission and deployment status of a submitted job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    NotPresent,
    Measuring,
    Measured,
    Rejected,
    Accepted,
    NoResources,
    Deployed,
}

/// Everything an external submitter provides for one job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobDescription {
    pub job_id: String,
    pub docker_container: String,
    pub code: String,
    pub config: String,
    pub signal_set: String,
    pub execution_time_signal: String,
    pub run_count_signal: String,
    pub min_memory_mb: u64,
    pub max_memory_mb: u64,
    pub min_cpu_millis: u64,
    pub max_cpu_millis: u64,
    pub k8s_labels: BTreeMap<String, String>,
}

/// A time contract attached when the job is promoted to deployment.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct JobContract {
    pub time_ms: f64,
    pub percentile: f64,
}

pub struct JobInterface {
    deploy: Arc<DeployController>,
    knowledge: SharedKnowledge,
    agents: Arc<dyn AgentRegistry>,
    jobs: Mutex<BTreeMap<String, Application>>,
}

impl JobInterface {
    pub fn new(
        deploy: Arc<DeployController>,
        knowledge: SharedKnowledge,
        agents: Arc<dyn AgentRegistry>,
    ) -> Self {
        Self { deploy, knowledge, agents, jobs: Mutex::new(BTreeMap::new()) }
    }

    /// Accepts a job for measurement. Refused while no access token is
    /// configured, since the job could never reach the platform API.
    pub async fn submit_job(&self, description: JobDescription) -> bool {
        if self.knowledge.read().await.api_access_token.is_none() {
            error!("cannot submit a job without a configured access token");
            return false;
        }
        let architecture = job_architecture(&description);
        self.jobs
            .lock()
            .await
            .insert(description.job_id.clone(), architecture.clone());
        if let Err(error) = self.deploy.submit_architecture(architecture) {
            error!(job = %description.job_id, %error, "job submission failed");
            return false;
        }
        info!(job = %description.job_id, "job accepted for measurements");
        true
    }

    /// Attaches the QoS contract and requests deployment.
    pub async fn deploy_job(&self, job_id: &str, contract: JobContract) -> bool {
        let mut jobs = self.jobs.lock().await;
        let Some(architecture) = jobs.get_mut(job_id) else {
            error!(job = job_id, "cannot deploy an unknown job");
            return false;
        };
        if let Some(component) = architecture.components.get_mut(job_id) {
            if let Some(probe) = component.probes.first_mut() {
                probe.requirements.push(Requirement::Time(TimeContract {
                    time_ms: contract.time_ms,
                    percentile: contract.percentile,
                }));
            }
        }
        architecture.complete = true;
        self.deploy.submit_requirements(architecture).is_ok()
    }

    pub async fn get_job_status(&self, job_id: &str) -> JobStatus {
        let knowledge = self.knowledge.read().await;
        if knowledge.applications.contains_key(job_id) {
            if knowledge.components_without_resources.contains(job_id) {
                return JobStatus::NoResources;
            }
            match knowledge.actual_state.unique_instance(job_id) {
                Some(instance) if instance.phase == InstancePhase::Ready => JobStatus::Deployed,
                _ => JobStatus::Accepted,
            }
        } else {
            match self.deploy.get_application_status(job_id) {
                AdmissionStatus::Unknown => JobStatus::NotPresent,
                AdmissionStatus::Received => JobStatus::Measuring,
                AdmissionStatus::Measured => JobStatus::Measured,
                AdmissionStatus::Rejected => JobStatus::Rejected,
                AdmissionStatus::Accepted | AdmissionStatus::Published => JobStatus::Accepted,
            }
        }
    }

    /// Proxies one run to the job's agent; a no-op unless the job's unique
    /// instance is ready.
    pub async fn run_job(&self, parameters: RunParameters) -> bool {
        let ip = {
            let knowledge = self.knowledge.read().await;
            match knowledge.actual_state.unique_instance(&parameters.job_id) {
                Some(instance) if instance.phase == InstancePhase::Ready => instance.ip.clone(),
                _ => None,
            }
        };
        let Some(ip) = ip else {
            return false;
        };
        info!(job = %parameters.job_id, run = %parameters.run_id, "running job");
        match self.agents.agent_for(&ip).await {
            Ok(agent) => agent.run_job(parameters).await.is_ok(),
            Err(error) => {
                error!(%error, "job agent unreachable");
                false
            }
        }
    }

    pub async fn unschedule_job(&self, job_id: &str) {
        self.jobs.lock().await.remove(job_id);
        self.deploy.delete_application(job_id);
    }

    /// Rotates the platform access token. Refused while jobs are measuring
    /// or deployed.
    pub async fn update_access_token(&self, token: &str) -> bool {
        if !self.deploy.update_access_token() {
            error!("cannot update the access token: jobs are being measured");
            return false;
        }
        let mut knowledge = self.knowledge.write().await;
        if knowledge.there_are_applications() {
            error!("cannot update the access token: jobs are deployed");
            return false;
        }
        knowledge.update_access_token(token);
        info!("access token updated");
        true
    }
}

/// Builds the single-component architecture wrapping a job.
fn job_architecture(description: &JobDescription) -> Application {
    let job_id = &description.job_id;
    let mut application = Application::new(job_id.clone());
    application.complete = false;
    application.add_component(Component {
        application: job_id.clone(),
        name: job_id.clone(),
        kind: ComponentType::Managed,
        cardinality: Cardinality::Single,
        deployment_template: Some(render_job_deployment(description)),
        dependencies: vec![],
        probes: vec![Probe {
            name: job_id.clone(),
            alias: String::new(),
            application: job_id.clone(),
            component: job_id.clone(),
            requirements: vec![],
            code: description.code.clone(),
            config: description.config.clone(),
            signal_set: description.signal_set.clone(),
            execution_time_signal: description.execution_time_signal.clone(),
            run_count_signal: description.run_count_signal.clone(),
        }],
        sharded: false,
        resources: ResourceRequest {
            cpu_millis: description.min_cpu_millis,
            memory_mb: description.min_memory_mb,
        },
        supported_hw_ids: vec![],
    });
    application
}

/// Renders the job's deployment template with resource requests, limits and
/// the submitter's labels.
fn render_job_deployment(description: &JobDescription) -> String {
    let mut labels = description.k8s_labels.clone();
    labels.insert("strato.dev/job".to_string(), description.job_id.clone());

    let mut requests = BTreeMap::new();
    requests.insert("cpu".to_string(), Quantity(format!("{}m", description.min_cpu_millis)));
    requests.insert("memory".to_string(), Quantity(format!("{}Mi", description.min_memory_mb)));
    let mut limits = BTreeMap::new();
    limits.insert("cpu".to_string(), Quantity(format!("{}m", description.max_cpu_millis)));
    limits.insert("memory".to_string(), Quantity(format!("{}Mi", description.max_memory_mb)));

    let deployment = Deployment {
        metadata: ObjectMeta {
            name: Some(description.job_id.clone()),
            labels: Some(labels.clone()),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(1),
            selector: LabelSelector {
                match_labels: Some(labels.clone()),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![Container {
                        name: description.job_id.clone(),
                        image: Some(description.docker_container.clone()),
                        resources: Some(ResourceRequirements {
                            requests: Some(requests),
                            limits: Some(limits),
                            ..Default::default()
                        }),
                        ..Default::default()
                    }],
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    };
    serde_yaml::to_string(&deployment).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn description() -> JobDescription {
        JobDescription {
            job_id: "ivisjob".into(),
            docker_container: "registry.example/jobs/base:latest".into(),
            code: "print('hello')".into(),
            config: "{}".into(),
            signal_set: "jobs".into(),
            execution_time_signal: "elapsed".into(),
            run_count_signal: "runs".into(),
            min_memory_mb: 256,
            max_memory_mb: 512,
            min_cpu_millis: 250,
            max_cpu_millis: 1000,
            k8s_labels: BTreeMap::from([("team".to_string(), "analytics".to_string())]),
        }
    }

    #[test]
    fn test_job_architecture_is_single_managed_component_with_one_probe() {
        let architecture = job_architecture(&description());
        assert_eq!(architecture.components.len(), 1);
        let component = architecture.get_component("ivisjob").unwrap();
        assert_eq!(component.kind, ComponentType::Managed);
        assert_eq!(component.cardinality, Cardinality::Single);
        assert_eq!(component.probes.len(), 1);
        assert!(component.probes[0].is_code());
        assert!(!architecture.complete);
    }

    #[test]
    fn test_job_deployment_carries_resources_and_labels() {
        let manifest = render_job_deployment(&description());
        let deployment: Deployment = serde_yaml::from_str(&manifest).unwrap();

        let labels = deployment.metadata.labels.unwrap();
        assert_eq!(labels.get("team").map(String::as_str), Some("analytics"));

        let container = &deployment.spec.unwrap().template.spec.unwrap().containers[0];
        let resources = container.resources.as_ref().unwrap();
        assert_eq!(resources.requests.as_ref().unwrap()["cpu"].0, "250m");
        assert_eq!(resources.limits.as_ref().unwrap()["memory"].0, "512Mi");
    }
}
