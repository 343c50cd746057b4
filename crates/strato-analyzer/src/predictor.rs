//! Feasibility predictors consulted by the placement search.

use std::sync::Arc;

use tracing::warn;

use strato_aggregator::{NodeAssignment, PerformanceAggregator};

/// Answers whether a set of co-located instances will meet its QoS
/// contracts. Implementations must be callable from the blocking solver.
pub trait Predict: Send + Sync {
    fn predict(&self, assignment: &NodeAssignment) -> bool;
}

/// Accepts any co-location. Used when client support is disabled and
/// placements are constrained by resources only.
#[derive(Debug, Default)]
pub struct PermissivePredictor;

impl Predict for PermissivePredictor {
    fn predict(&self, _assignment: &NodeAssignment) -> bool {
        true
    }
}

/// Consults the in-process performance aggregator. Contract violations
/// (components the aggregator never saw) are answered conservatively with
/// `false`; admission is responsible for registering everything first.
pub struct AggregatorPredictor {
    aggregator: Arc<PerformanceAggregator>,
}

impl AggregatorPredictor {
    pub fn new(aggregator: Arc<PerformanceAggregator>) -> Self {
        Self { aggregator }
    }
}

impl Predict for AggregatorPredictor {
    fn predict(&self, assignment: &NodeAssignment) -> bool {
        match self.aggregator.predict(assignment) {
            Ok(result) => result,
            Err(error) => {
                warn!(%error, "feasibility query rejected, treating co-location as infeasible");
                false
            }
        }
    }
}
