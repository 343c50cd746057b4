//! Rendering of per-instance Kubernetes manifests.
//!
//! Deployment templates are authored per component; the planner stamps the
//! instance identity into them. Services are generated, exposing the
//! middleware agent port under the instance's name.

use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use tracing::warn;

use strato_model::{Component, ManagedInstance, AGENT_PORT, COMPONENT_LABEL, INSTANCE_LABEL};

/// Builds the service manifest for one instance.
pub fn render_service(component: &Component, instance_id: &str) -> String {
    let labels = instance_labels(component, instance_id);
    let service = Service {
        metadata: ObjectMeta {
            name: Some(instance_id.to_string()),
            namespace: Some(component.application.clone()),
            labels: Some(labels.clone()),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            selector: Some(labels),
            ports: Some(vec![ServicePort {
                name: Some("agent".to_string()),
                port: AGENT_PORT as i32,
                target_port: Some(IntOrString::Int(AGENT_PORT as i32)),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    };
    serde_yaml::to_string(&service).unwrap_or_default()
}

/// Stamps the instance identity into the component's deployment template.
/// Returns `None` for components without a template (nothing to deploy).
pub fn render_deployment(component: &Component, instance: &ManagedInstance) -> Option<String> {
    let template = component.deployment_template.as_deref()?;
    let mut deployment: k8s_openapi::api::apps::v1::Deployment = match serde_yaml::from_str(template) {
        Ok(deployment) => deployment,
        Err(error) => {
            warn!(
                component = %component.global_id(),
                %error,
                "deployment template is not a valid manifest, using it verbatim"
            );
            return Some(template.to_string());
        }
    };

    let labels = instance_labels(component, &instance.id);
    deployment.metadata.name = Some(instance.id.clone());
    deployment.metadata.namespace = Some(component.application.clone());
    deployment
        .metadata
        .labels
        .get_or_insert_with(Default::default)
        .extend(labels.clone());

    if let Some(spec) = deployment.spec.as_mut() {
        spec.selector
            .match_labels
            .get_or_insert_with(Default::default)
            .extend(labels.clone());
        spec.template
            .metadata
            .get_or_insert_with(Default::default)
            .labels
            .get_or_insert_with(Default::default)
            .extend(labels);
    }

    serde_yaml::to_string(&deployment).ok()
}

fn instance_labels(component: &Component, instance_id: &str) -> std::collections::BTreeMap<String, String> {
    let mut labels = std::collections::BTreeMap::new();
    labels.insert(INSTANCE_LABEL.to_string(), instance_id.to_string());
    labels.insert(COMPONENT_LABEL.to_string(), component.name.clone());
    labels
}
