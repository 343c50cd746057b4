//! The placement problem handed to the solver.
//!
//! Variables are built from a knowledge snapshot: one node variable per
//! candidate managed instance (with an explicit unplaced value for optional
//! candidates) and one provider variable per client dependency. The problem
//! is rebuilt from scratch every cycle; nothing is solved incrementally.

use std::collections::{BTreeMap, BTreeSet};

use strato_model::{
    Cardinality, ClusterState, Instance, Knowledge, ManagedInstance, NetworkDistances, Node,
    ResourceRequest,
};

/// Node-variable value meaning "this candidate is not deployed".
pub const UNPLACED: i64 = -1;

/// A managed instance the solver may place: either one that already runs or
/// a fresh one the placement is allowed to create.
#[derive(Debug, Clone)]
pub struct CandidateInstance {
    pub application: String,
    pub component: String,
    /// Global component id used in feasibility queries.
    pub component_id: String,
    pub id: String,
    /// Index into `PlacementProblem::nodes` where the instance currently
    /// runs, if it does.
    pub existing_node: Option<usize>,
    /// Required candidates must be placed; they have no unplaced value.
    pub required: bool,
    pub resources: ResourceRequest,
    pub declared_dependencies: Vec<String>,
}

/// One client dependency that must bind to a live provider instance.
#[derive(Debug, Clone)]
pub struct DependencyVariable {
    pub application: String,
    pub client_component: String,
    pub client_id: String,
    pub provider_component: String,
    /// Candidate indices this dependency may bind to.
    pub domain: Vec<usize>,
}

/// A complete variable assignment found by the solver.
#[derive(Debug, Clone)]
pub struct Solution {
    pub nodes: Vec<i64>,
    pub dependencies: Vec<usize>,
    pub cost: f64,
}

#[derive(Debug, Clone)]
pub struct PlacementProblem {
    pub nodes: Vec<Node>,
    pub candidates: Vec<CandidateInstance>,
    /// Per-candidate value order: `UNPLACED` first for optional candidates,
    /// then hardware-compatible node indices ascending.
    pub node_domains: Vec<Vec<i64>>,
    pub dependencies: Vec<DependencyVariable>,
    pub distances: NetworkDistances,
    actual: ClusterState,
}

impl PlacementProblem {
    /// Builds the problem from the current knowledge. `last_desired` supplies
    /// pin markers that must survive until their clients bind.
    pub fn build(knowledge: &Knowledge, last_desired: &ClusterState) -> Self {
        let nodes: Vec<Node> = knowledge.nodes.values().cloned().collect();
        let node_index: BTreeMap<&str, usize> =
            nodes.iter().enumerate().map(|(i, n)| (n.name.as_str(), i)).collect();

        let client_ids: Vec<String> = knowledge
            .actual_state
            .all_clients()
            .map(|c| c.id.clone())
            .collect();
        let distances = knowledge.network_topology.snapshot(
            client_ids.iter().map(String::as_str),
            nodes.iter().map(|n| n.name.as_str()),
        );

        let mut candidates = Vec::new();
        let mut node_domains = Vec::new();
        let mut candidate_index: BTreeMap<(String, String), Vec<usize>> = BTreeMap::new();

        for application in knowledge.applications.values() {
            for component in application.managed_components() {
                let existing: Vec<&ManagedInstance> = knowledge
                    .actual_state
                    .instances(&application.name, &component.name)
                    .filter_map(Instance::as_managed)
                    .collect();
                let mut used_ids: BTreeSet<String> =
                    existing.iter().map(|m| m.id.clone()).collect();

                let mut push = |candidate: CandidateInstance, domain: Vec<i64>| {
                    candidate_index
                        .entry((candidate.application.clone(), candidate.component.clone()))
                        .or_default()
                        .push(candidates.len());
                    node_domains.push(domain);
                    candidates.push(candidate);
                };

                let compatible: Vec<i64> = nodes
                    .iter()
                    .enumerate()
                    .filter(|(_, node)| {
                        component.supported_hw_ids.is_empty()
                            || component.supported_hw_ids.iter().any(|h| h == &node.hw_id)
                    })
                    .map(|(i, _)| i as i64)
                    .collect();

                let make_candidate = |id: String, existing_node: Option<usize>, required: bool| CandidateInstance {
                    application: application.name.clone(),
                    component: component.name.clone(),
                    component_id: component.global_id(),
                    id,
                    existing_node,
                    required,
                    resources: component.resources,
                    declared_dependencies: component.dependencies.clone(),
                };

                let pinned = |id: &str| {
                    last_desired
                        .get_managed(&application.name, &component.name, id)
                        .map(|m| m.pinned)
                        .unwrap_or(false)
                };

                match component.cardinality {
                    Cardinality::Single => {
                        if existing.is_empty() {
                            let id = fresh_id(&component.name, &mut used_ids);
                            push(make_candidate(id, None, true), compatible.clone());
                        } else {
                            for (i, instance) in existing.iter().enumerate() {
                                let required = i == 0;
                                let node = instance.node.as_deref().and_then(|n| node_index.get(n)).copied();
                                let domain = domain_for(required, &compatible);
                                push(make_candidate(instance.id.clone(), node, required), domain);
                            }
                        }
                    }
                    Cardinality::Multiple => {
                        for instance in &existing {
                            let required = pinned(&instance.id);
                            let node = instance.node.as_deref().and_then(|n| node_index.get(n)).copied();
                            let domain = domain_for(required, &compatible);
                            push(make_candidate(instance.id.clone(), node, required), domain);
                        }
                        // One growth candidate per client dependency on this
                        // component that has no binding yet.
                        let unbound = knowledge
                            .actual_state
                            .all_clients()
                            .filter(|client| client.application == application.name)
                            .filter(|client| {
                                application
                                    .get_component(&client.component)
                                    .map(|decl| decl.dependencies.iter().any(|d| d == &component.name))
                                    .unwrap_or(false)
                            })
                            .filter(|client| !client.dependencies.contains_key(&component.name))
                            .count();
                        for _ in 0..unbound {
                            let id = fresh_id(&component.name, &mut used_ids);
                            push(make_candidate(id, None, false), domain_for(false, &compatible));
                        }
                    }
                }
            }
        }

        let mut dependencies = Vec::new();
        for application in knowledge.applications.values() {
            for client in knowledge
                .actual_state
                .all_clients()
                .filter(|c| c.application == application.name)
            {
                let Some(declaration) = application.get_component(&client.component) else {
                    continue;
                };
                let mut declared: Vec<&String> = declaration.dependencies.iter().collect();
                declared.sort();
                for provider in declared {
                    let domain = candidate_index
                        .get(&(application.name.clone(), provider.clone()))
                        .cloned()
                        .unwrap_or_default();
                    dependencies.push(DependencyVariable {
                        application: application.name.clone(),
                        client_component: client.component.clone(),
                        client_id: client.id.clone(),
                        provider_component: provider.clone(),
                        domain,
                    });
                }
            }
        }

        Self {
            nodes,
            candidates,
            node_domains,
            dependencies,
            distances,
            actual: knowledge.actual_state.clone(),
        }
    }

    pub fn variable_count(&self) -> usize {
        self.candidates.len() + self.dependencies.len()
    }

    /// Turns a solved assignment into the desired cluster state.
    pub fn materialize(&self, solution: &Solution) -> ClusterState {
        let mut desired = ClusterState::new();
        let mut placed_by_component: BTreeMap<(String, String), Vec<usize>> = BTreeMap::new();

        for (index, candidate) in self.candidates.iter().enumerate() {
            let value = solution.nodes[index];
            if value == UNPLACED {
                continue;
            }
            let node_name = self.nodes[value as usize].name.clone();
            let mut instance = self
                .actual
                .get_managed(&candidate.application, &candidate.component, &candidate.id)
                .cloned()
                .unwrap_or_else(|| {
                    ManagedInstance::new(&candidate.application, &candidate.component, &candidate.id)
                });
            instance.node = Some(node_name);
            placed_by_component
                .entry((candidate.application.clone(), candidate.component.clone()))
                .or_default()
                .push(index);
            desired.add_instance(Instance::Managed(instance));
        }

        // Managed instances bind every declared dependency to the first
        // placed provider instance.
        for (index, candidate) in self.candidates.iter().enumerate() {
            if solution.nodes[index] == UNPLACED {
                continue;
            }
            for provider in &candidate.declared_dependencies {
                let Some(provider_indices) =
                    placed_by_component.get(&(candidate.application.clone(), provider.clone()))
                else {
                    continue;
                };
                if let Some(&first) = provider_indices.first() {
                    desired.set_dependency(
                        &candidate.application,
                        &candidate.component,
                        &candidate.id,
                        provider,
                        &self.candidates[first].id,
                    );
                }
            }
        }

        // Clients are carried over and rebound per the dependency variables.
        for client in self.actual.all_clients() {
            desired.add_instance(Instance::Client(client.clone()));
        }
        for (index, variable) in self.dependencies.iter().enumerate() {
            let chosen = &self.candidates[solution.dependencies[index]];
            desired.set_dependency(
                &variable.application,
                &variable.client_component,
                &variable.client_id,
                &variable.provider_component,
                &chosen.id,
            );
        }
        desired
    }
}

fn domain_for(required: bool, compatible: &[i64]) -> Vec<i64> {
    if required {
        compatible.to_vec()
    } else {
        let mut domain = Vec::with_capacity(compatible.len() + 1);
        domain.push(UNPLACED);
        domain.extend_from_slice(compatible);
        domain
    }
}

/// Smallest `<component>-<k>` id not yet taken.
fn fresh_id(component: &str, used: &mut BTreeSet<String>) -> String {
    let mut k = 0usize;
    loop {
        let id = format!("{component}-{k}");
        if used.insert(id.clone()) {
            return id;
        }
        k += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strato_model::{Application, ClientInstance, Component, ComponentType, ControllerConfig};

    fn knowledge_with_single_app() -> Knowledge {
        let mut knowledge = Knowledge::new(ControllerConfig::default());
        let mut app = Application::new("demo");
        app.add_component(Component {
            application: "demo".into(),
            name: "frontend".into(),
            kind: ComponentType::Managed,
            cardinality: Cardinality::Single,
            deployment_template: Some("kind: Deployment".into()),
            dependencies: vec![],
            probes: vec![],
            sharded: false,
            resources: ResourceRequest { cpu_millis: 100, memory_mb: 128 },
            supported_hw_ids: vec![],
        });
        knowledge.add_application(app);
        knowledge.nodes.insert(
            "node-a".into(),
            Node::new("node-a", "default", ResourceRequest { cpu_millis: 4000, memory_mb: 8192 }),
        );
        knowledge
    }

    #[test]
    fn test_single_component_yields_required_candidate() {
        let knowledge = knowledge_with_single_app();
        let problem = PlacementProblem::build(&knowledge, &ClusterState::new());

        assert_eq!(problem.candidates.len(), 1);
        let candidate = &problem.candidates[0];
        assert!(candidate.required);
        assert_eq!(candidate.id, "frontend-0");
        // Required candidates cannot stay unplaced.
        assert!(!problem.node_domains[0].contains(&UNPLACED));
    }

    #[test]
    fn test_client_dependency_gets_growth_candidate_and_variable() {
        let mut knowledge = knowledge_with_single_app();
        let app = knowledge.applications.get_mut("demo").unwrap();
        app.add_component(Component {
            application: "demo".into(),
            name: "viewer".into(),
            kind: ComponentType::Unmanaged,
            cardinality: Cardinality::Multiple,
            deployment_template: None,
            dependencies: vec!["backend".into()],
            probes: vec![],
            sharded: false,
            resources: ResourceRequest::default(),
            supported_hw_ids: vec![],
        });
        app.add_component(Component {
            application: "demo".into(),
            name: "backend".into(),
            kind: ComponentType::Managed,
            cardinality: Cardinality::Multiple,
            deployment_template: Some("kind: Deployment".into()),
            dependencies: vec![],
            probes: vec![],
            sharded: false,
            resources: ResourceRequest { cpu_millis: 100, memory_mb: 128 },
            supported_hw_ids: vec![],
        });
        knowledge
            .actual_state
            .add_instance(Instance::Client(ClientInstance::new("demo", "viewer", "client-1")));

        let problem = PlacementProblem::build(&knowledge, &ClusterState::new());

        // frontend (required) + one backend growth candidate for the client.
        assert_eq!(problem.candidates.len(), 2);
        assert_eq!(problem.dependencies.len(), 1);
        let dependency = &problem.dependencies[0];
        assert_eq!(dependency.provider_component, "backend");
        assert_eq!(dependency.domain.len(), 1);
    }
}
