//! Pluggable statistical prediction for unmeasured probe combinations.

use std::collections::BTreeMap;

use statrs::statistics::{Data, Distribution, OrderStatistics};
use tracing::debug;

/// A model that extrapolates QoS outcomes for combinations without recorded
/// measurements. Treated as a black box by the prediction service; the only
/// contract is the three query methods below.
pub trait StatisticalModel: Send + Sync {
    /// Makes the model aware of a hardware class.
    fn add_hw_id(&mut self, hw_id: &str);

    /// Feeds isolation samples for a probe on a hardware class.
    fn observe_isolation(&mut self, hw_id: &str, alias: &str, samples: &[f64]);

    /// Predicted: response time of the combination's controlled probe at
    /// `percentile` stays within `time_limit_ms`.
    fn predict_time(&mut self, hw_id: &str, combination: &[String], time_limit_ms: f64, percentile: f64) -> bool;

    /// Predicted: mean request time of the combination's controlled probe
    /// stays within `mean_request_time_ms`.
    fn predict_throughput(&mut self, hw_id: &str, combination: &[String], mean_request_time_ms: f64) -> bool;
}

/// Default model: scales a probe's isolation behavior linearly with the
/// number of co-located workloads. Pessimistic but cheap, and conservative
/// enough to be safe as an admission gate.
#[derive(Debug, Default)]
pub struct ScaledIsolationModel {
    baselines: BTreeMap<(String, String), Vec<f64>>,
    hw_ids: Vec<String>,
}

impl ScaledIsolationModel {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StatisticalModel for ScaledIsolationModel {
    fn add_hw_id(&mut self, hw_id: &str) {
        if !self.hw_ids.iter().any(|h| h == hw_id) {
            self.hw_ids.push(hw_id.to_string());
        }
    }

    fn observe_isolation(&mut self, hw_id: &str, alias: &str, samples: &[f64]) {
        debug!(hw_id, alias, samples = samples.len(), "isolation baseline observed");
        self.baselines
            .insert((hw_id.to_string(), alias.to_string()), samples.to_vec());
    }

    fn predict_time(&mut self, hw_id: &str, combination: &[String], time_limit_ms: f64, percentile: f64) -> bool {
        let Some(controlled) = combination.first() else {
            return false;
        };
        let key = (hw_id.to_string(), controlled.clone());
        let Some(baseline) = self.baselines.get(&key) else {
            return false;
        };
        let mut data = Data::new(baseline.clone());
        let isolated = data.percentile(percentile.round() as usize);
        isolated * combination.len() as f64 <= time_limit_ms
    }

    fn predict_throughput(&mut self, hw_id: &str, combination: &[String], mean_request_time_ms: f64) -> bool {
        let Some(controlled) = combination.first() else {
            return false;
        };
        let key = (hw_id.to_string(), controlled.clone());
        let Some(baseline) = self.baselines.get(&key) else {
            return false;
        };
        let Some(mean) = Data::new(baseline.clone()).mean() else {
            return false;
        };
        // Same comparison as the measurement-backed path: the (scaled) mean
        // must stay within the contract's mean request time.
        mean * combination.len() as f64 <= mean_request_time_ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_probe_predicts_false() {
        let mut model = ScaledIsolationModel::new();
        assert!(!model.predict_time("default", &["ABCD".into()], 100.0, 95.0));
        assert!(!model.predict_throughput("default", &["ABCD".into()], 100.0));
    }

    #[test]
    fn test_scaling_with_combination_size() {
        let mut model = ScaledIsolationModel::new();
        let samples: Vec<f64> = vec![10.0; 100];
        model.observe_isolation("default", "ABCD", &samples);

        // Isolated: 10ms. Under a 25ms limit, two co-located workloads fit,
        // three do not.
        let pair = vec!["ABCD".to_string(), "EFGH".to_string()];
        let triple = vec!["ABCD".to_string(), "EFGH".to_string(), "IJKL".to_string()];
        assert!(model.predict_time("default", &pair, 25.0, 95.0));
        assert!(!model.predict_time("default", &triple, 25.0, 95.0));
        assert!(model.predict_throughput("default", &pair, 25.0));
        assert!(!model.predict_throughput("default", &triple, 25.0));
    }
}
