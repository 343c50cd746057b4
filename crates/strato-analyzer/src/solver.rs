//! Backtracking search over the placement problem.
//!
//! Decision strategy: pick the first unbound variable, try its values in
//! ascending order. The bounded search keeps the best solution found before
//! the wall-clock limit expires (branch-and-bound on the objective); the
//! unbounded long-term search stops at the first feasible solution.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info};

use strato_aggregator::{ComponentCount, NodeAssignment};
use strato_model::{ClusterState, ResourceRequest};

use crate::predictor::Predict;
use crate::problem::{PlacementProblem, Solution, UNPLACED};

/// Relative weight of moving one instance versus one unit of network
/// distance.
pub const MIGRATION_COST: f64 = 100.0;

const UNBOUND: i64 = i64::MIN;

pub struct PlacementSolver {
    problem: PlacementProblem,
    predictor: Arc<dyn Predict>,
}

impl PlacementSolver {
    pub fn new(problem: PlacementProblem, predictor: Arc<dyn Predict>) -> Self {
        Self { problem, predictor }
    }

    /// Best placement found within `time_limit`, or `None` when the search
    /// saw no feasible solution in time.
    pub fn find_assignment(&self, time_limit: Duration) -> Option<ClusterState> {
        let started = Instant::now();
        let solution = self.solve(Some(started + time_limit), false)?;
        info!(
            cost = solution.cost,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "placement found"
        );
        Some(self.problem.materialize(&solution))
    }

    /// First feasible placement, searched without any time limit. Runs on a
    /// blocking worker; may take arbitrarily long.
    pub fn find_assignment_longterm(&self) -> Option<ClusterState> {
        let solution = self.solve(None, true)?;
        info!(cost = solution.cost, "long-term placement search finished");
        Some(self.problem.materialize(&solution))
    }

    fn solve(&self, deadline: Option<Instant>, first_only: bool) -> Option<Solution> {
        let mut search = Search {
            problem: &self.problem,
            predictor: self.predictor.as_ref(),
            deadline,
            first_only,
            node_values: vec![UNBOUND; self.problem.candidates.len()],
            dep_values: vec![usize::MAX; self.problem.dependencies.len()],
            node_usage: vec![ResourceRequest::default(); self.problem.nodes.len()],
            cost: 0.0,
            best: None,
        };
        search.branch(0);
        if search.best.is_none() {
            debug!("placement search exhausted without a solution");
        }
        search.best
    }
}

struct Search<'a> {
    problem: &'a PlacementProblem,
    predictor: &'a dyn Predict,
    deadline: Option<Instant>,
    first_only: bool,
    node_values: Vec<i64>,
    dep_values: Vec<usize>,
    node_usage: Vec<ResourceRequest>,
    cost: f64,
    best: Option<Solution>,
}

impl Search<'_> {
    /// Returns `true` when the search should stop unwinding entirely.
    fn branch(&mut self, variable: usize) -> bool {
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                return true;
            }
        }
        if !self.first_only {
            if let Some(best) = &self.best {
                if self.cost >= best.cost {
                    return false;
                }
            }
        }
        if variable == self.problem.variable_count() {
            self.record_solution();
            return self.first_only;
        }
        if variable < self.problem.candidates.len() {
            self.branch_node_variable(variable)
        } else {
            self.branch_dependency_variable(variable, variable - self.problem.candidates.len())
        }
    }

    fn branch_node_variable(&mut self, variable: usize) -> bool {
        let domain = self.problem.node_domains[variable].clone();
        for value in domain {
            if value == UNPLACED {
                self.node_values[variable] = UNPLACED;
                if self.branch(variable + 1) {
                    return true;
                }
                self.node_values[variable] = UNBOUND;
                continue;
            }
            let node = value as usize;
            if !self.fits(variable, node) {
                continue;
            }
            let migration = self.migration_cost(variable, node);
            self.place(variable, node, migration);
            if self.colocation_feasible(node) && self.branch(variable + 1) {
                return true;
            }
            self.unplace(variable, node, migration);
        }
        false
    }

    fn branch_dependency_variable(&mut self, variable: usize, dependency: usize) -> bool {
        let domain = self.problem.dependencies[dependency].domain.clone();
        for candidate in domain {
            let provider_node = self.node_values[candidate];
            if provider_node == UNPLACED || provider_node == UNBOUND {
                // Dependencies only bind to instances the solution deploys.
                continue;
            }
            let client = &self.problem.dependencies[dependency].client_id;
            let node_name = &self.problem.nodes[provider_node as usize].name;
            let distance = self.problem.distances.distance(client, node_name);
            self.dep_values[dependency] = candidate;
            self.cost += distance;
            if self.branch(variable + 1) {
                return true;
            }
            self.cost -= distance;
            self.dep_values[dependency] = usize::MAX;
        }
        false
    }

    fn fits(&self, variable: usize, node: usize) -> bool {
        let request = self.problem.candidates[variable].resources;
        let usage = self.node_usage[node];
        let capacity = self.problem.nodes[node].capacity;
        usage.cpu_millis + request.cpu_millis <= capacity.cpu_millis
            && usage.memory_mb + request.memory_mb <= capacity.memory_mb
    }

    fn migration_cost(&self, variable: usize, node: usize) -> f64 {
        match self.problem.candidates[variable].existing_node {
            Some(existing) if existing != node => MIGRATION_COST,
            _ => 0.0,
        }
    }

    fn place(&mut self, variable: usize, node: usize, migration: f64) {
        let request = self.problem.candidates[variable].resources;
        self.node_values[variable] = node as i64;
        self.node_usage[node].cpu_millis += request.cpu_millis;
        self.node_usage[node].memory_mb += request.memory_mb;
        self.cost += migration;
    }

    fn unplace(&mut self, variable: usize, node: usize, migration: f64) {
        let request = self.problem.candidates[variable].resources;
        self.node_values[variable] = UNBOUND;
        self.node_usage[node].cpu_millis -= request.cpu_millis;
        self.node_usage[node].memory_mb -= request.memory_mb;
        self.cost -= migration;
    }

    /// Co-located workloads on a node must pass the QoS predictor. The check
    /// runs on every placement: extra load never improves interference, so a
    /// failing multiset prunes the whole subtree.
    fn colocation_feasible(&self, node: usize) -> bool {
        let mut counts: std::collections::BTreeMap<&str, u32> = std::collections::BTreeMap::new();
        for (index, value) in self.node_values.iter().enumerate() {
            if *value == node as i64 {
                *counts.entry(self.problem.candidates[index].component_id.as_str()).or_insert(0) += 1;
            }
        }
        if counts.is_empty() {
            return true;
        }
        let assignment = NodeAssignment {
            hw_id: self.problem.nodes[node].hw_id.clone(),
            components: counts
                .into_iter()
                .map(|(component_id, count)| ComponentCount {
                    component_id: component_id.to_string(),
                    count,
                })
                .collect(),
        };
        self.predictor.predict(&assignment)
    }

    fn record_solution(&mut self) {
        let better = match &self.best {
            Some(best) => self.cost < best.cost,
            None => true,
        };
        if better {
            debug!(cost = self.cost, "solution recorded");
            self.best = Some(Solution {
                nodes: self.node_values.clone(),
                dependencies: self.dep_values.clone(),
                cost: self.cost,
            });
        }
    }
}
