//! Measurement scenarios and their generation.
//!
//! A scenario asks the measurement infrastructure to run one controlled probe
//! against a set of background probes on a given hardware class. The
//! generator tracks which (hardware, combination) points lack data: every
//! registered probe gets an isolation scenario, and the prediction service
//! requests co-location points whenever feasibility checks run out of data.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use strato_model::Probe;

use crate::measurements::{MeasurementStore, RESULT_FILE_PREFIX};

pub const DEFAULT_WARM_UP_CYCLES: u32 = 100;
pub const DEFAULT_MEASURED_CYCLES: u32 = 400;

/// One measurement request handed to the infrastructure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scenario {
    pub id: String,
    pub controlled_probe: Probe,
    pub background_probes: Vec<Probe>,
    pub hw_id: String,
    pub warm_up_cycles: u32,
    pub measured_cycles: u32,
    pub cpu_events: Vec<String>,
    pub filename_header: PathBuf,
    pub filename_data: PathBuf,
}

impl Scenario {
    pub fn new(
        controlled_probe: Probe,
        background_probes: Vec<Probe>,
        hw_id: impl Into<String>,
        results_path: &std::path::Path,
    ) -> Self {
        let hw_id = hw_id.into();
        let folder = results_path.join(&controlled_probe.application).join(&hw_id);
        let mut file = String::from(RESULT_FILE_PREFIX);
        file.push_str(&controlled_probe.alias);
        for probe in &background_probes {
            file.push('-');
            file.push_str(&probe.alias);
        }
        Self {
            id: Uuid::new_v4().to_string(),
            controlled_probe,
            background_probes,
            hw_id,
            warm_up_cycles: DEFAULT_WARM_UP_CYCLES,
            measured_cycles: DEFAULT_MEASURED_CYCLES,
            cpu_events: Vec::new(),
            filename_header: folder.join(format!("{file}.header")),
            filename_data: folder.join(format!("{file}.out")),
        }
    }

    /// Alias list, controlled probe first.
    pub fn combination(&self) -> Vec<String> {
        let mut aliases = vec![self.controlled_probe.alias.clone()];
        aliases.extend(self.background_probes.iter().map(|p| p.alias.clone()));
        aliases
    }

    /// Canonical measurement name this scenario will produce data for.
    pub fn measurement_name(&self) -> String {
        MeasurementStore::compose_name(&self.hw_id, &self.combination())
    }
}

/// A missing measurement point: controlled probe plus co-location size on a
/// hardware class. Ordered so scenario emission is deterministic.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct MeasurementPoint {
    hw_id: String,
    controlled_alias: String,
    size: usize,
}

/// Produces the next scenario worth measuring.
#[derive(Debug)]
pub struct ScenarioGenerator {
    results_path: PathBuf,
    default_hw_id: String,
    probes: BTreeMap<String, Probe>,
    peers_by_component: BTreeMap<String, BTreeSet<String>>,
    requested: BTreeMap<MeasurementPoint, u64>,
    in_flight: BTreeSet<MeasurementPoint>,
    completed: BTreeSet<MeasurementPoint>,
}

impl ScenarioGenerator {
    pub fn new(results_path: impl Into<PathBuf>, default_hw_id: impl Into<String>) -> Self {
        Self {
            results_path: results_path.into(),
            default_hw_id: default_hw_id.into(),
            probes: BTreeMap::new(),
            peers_by_component: BTreeMap::new(),
            requested: BTreeMap::new(),
            in_flight: BTreeSet::new(),
            completed: BTreeSet::new(),
        }
    }

    /// Tracks the probe and queues its isolation measurement on the default
    /// hardware class unless data already exists.
    pub fn register_probe(&mut self, probe: &Probe) {
        self.peers_by_component
            .entry(probe.component_id())
            .or_default()
            .insert(probe.alias.clone());
        self.probes.insert(probe.alias.clone(), probe.clone());
        let isolation = MeasurementPoint {
            hw_id: self.default_hw_id.clone(),
            controlled_alias: probe.alias.clone(),
            size: 1,
        };
        if !self.completed.contains(&isolation) {
            *self.requested.entry(isolation).or_insert(0) += 1;
        }
    }

    /// Records demand for a co-location measurement of the given size.
    pub fn request_scenario(&mut self, hw_id: &str, controlled_alias: &str, size: usize) {
        let point = MeasurementPoint {
            hw_id: hw_id.to_string(),
            controlled_alias: controlled_alias.to_string(),
            size,
        };
        if self.completed.contains(&point) {
            return;
        }
        *self.requested.entry(point).or_insert(0) += 1;
    }

    /// The next pending scenario, or `None` when every requested point is
    /// measured or already dispatched. Deterministic given the registration
    /// history.
    pub fn next_scenario(&mut self) -> Option<Scenario> {
        let point = self
            .requested
            .keys()
            .find(|point| !self.in_flight.contains(point) && !self.completed.contains(point))?
            .clone();
        let controlled = self.probes.get(&point.controlled_alias)?.clone();
        let background = self.background_probes_for(&controlled, point.size - 1);
        self.in_flight.insert(point.clone());
        let scenario = Scenario::new(controlled, background, point.hw_id.clone(), &self.results_path);
        info!(scenario = %scenario.id, measurement = %scenario.measurement_name(), "scenario generated");
        Some(scenario)
    }

    /// Marks the scenario's point as measured and clears its demand.
    pub fn scenario_completed(&mut self, scenario: &Scenario) {
        let point = MeasurementPoint {
            hw_id: scenario.hw_id.clone(),
            controlled_alias: scenario.controlled_probe.alias.clone(),
            size: scenario.combination().len(),
        };
        debug!(scenario = %scenario.id, "scenario completed");
        self.in_flight.remove(&point);
        self.requested.remove(&point);
        self.completed.insert(point);
    }

    /// Marks a point covered by a data file found on disk.
    pub fn load_datafile(&mut self, hw_id: &str, controlled_alias: &str, background: &[String]) {
        let point = MeasurementPoint {
            hw_id: hw_id.to_string(),
            controlled_alias: controlled_alias.to_string(),
            size: background.len() + 1,
        };
        self.requested.remove(&point);
        self.completed.insert(point);
    }

    pub fn pending_count(&self) -> usize {
        self.requested
            .keys()
            .filter(|p| !self.in_flight.contains(p) && !self.completed.contains(p))
            .count()
    }

    /// Background load for a co-location point: the controlled probe's
    /// component peers (itself included), cycled deterministically.
    fn background_probes_for(&self, controlled: &Probe, count: usize) -> Vec<Probe> {
        if count == 0 {
            return Vec::new();
        }
        let peers: Vec<&Probe> = self
            .peers_by_component
            .get(&controlled.component_id())
            .into_iter()
            .flatten()
            .filter_map(|alias| self.probes.get(alias))
            .collect();
        if peers.is_empty() {
            return std::iter::repeat(controlled.clone()).take(count).collect();
        }
        peers.iter().cycle().take(count).map(|p| (*p).clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strato_model::Requirement;
    use strato_model::TimeContract;

    fn probe(alias: &str) -> Probe {
        Probe {
            name: format!("probe-{alias}"),
            alias: alias.into(),
            application: "demo".into(),
            component: "frontend".into(),
            requirements: vec![Requirement::Time(TimeContract { time_ms: 100.0, percentile: 95.0 })],
            code: String::new(),
            config: String::new(),
            signal_set: String::new(),
            execution_time_signal: String::new(),
            run_count_signal: String::new(),
        }
    }

    #[test]
    fn test_registration_queues_isolation_scenario() {
        let mut generator = ScenarioGenerator::new("/tmp/results", "default");
        generator.register_probe(&probe("ABCD"));

        let scenario = generator.next_scenario().expect("isolation scenario");
        assert_eq!(scenario.controlled_probe.alias, "ABCD");
        assert!(scenario.background_probes.is_empty());
        assert_eq!(scenario.hw_id, "default");
        assert_eq!(scenario.warm_up_cycles, DEFAULT_WARM_UP_CYCLES);
        assert_eq!(scenario.measured_cycles, DEFAULT_MEASURED_CYCLES);

        // The point is in flight; nothing else to hand out.
        assert!(generator.next_scenario().is_none());

        generator.scenario_completed(&scenario);
        assert!(generator.next_scenario().is_none());
        assert_eq!(generator.pending_count(), 0);
    }

    #[test]
    fn test_requested_colocation_point_produces_background_load() {
        let mut generator = ScenarioGenerator::new("/tmp/results", "default");
        generator.register_probe(&probe("ABCD"));
        generator.register_probe(&probe("EFGH"));
        // Drain the isolation scenarios first.
        let first = generator.next_scenario().unwrap();
        generator.scenario_completed(&first);
        let second = generator.next_scenario().unwrap();
        generator.scenario_completed(&second);

        generator.request_scenario("default", "ABCD", 3);
        let scenario = generator.next_scenario().expect("co-location scenario");
        assert_eq!(scenario.combination().len(), 3);
        assert_eq!(scenario.controlled_probe.alias, "ABCD");
    }

    #[test]
    fn test_loaded_datafiles_suppress_scenarios() {
        let mut generator = ScenarioGenerator::new("/tmp/results", "default");
        generator.load_datafile("default", "ABCD", &[]);
        generator.register_probe(&probe("ABCD"));
        assert!(generator.next_scenario().is_none());
    }

    #[test]
    fn test_scenario_file_paths_follow_results_layout() {
        let scenario = Scenario::new(probe("ABCD"), vec![probe("EFGH")], "hw-a", std::path::Path::new("/results"));
        assert_eq!(
            scenario.filename_data,
            PathBuf::from("/results/demo/hw-a/merged_iterative_result--batch--ABCD-EFGH.out")
        );
        assert_eq!(
            scenario.filename_header,
            PathBuf::from("/results/demo/hw-a/merged_iterative_result--batch--ABCD-EFGH.header")
        );
        assert_eq!(scenario.measurement_name(), "hw-a;ABCD-EFGH");
    }
}
