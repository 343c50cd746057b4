//! The performance aggregator service.
//!
//! One service owns the measurement store, the scenario generator and the
//! statistical model, all behind a single coarse lock, and answers the
//! feasibility, registration, judgement and scenario calls.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use strato_model::{Application, ControllerConfig, Probe, Requirement};

use crate::measurements::{MeasurementError, MeasurementStore, SignalMetadata};
use crate::scenarios::{Scenario, ScenarioGenerator};
use crate::statistical::StatisticalModel;

/// A candidate co-location the placement search wants validated: component
/// instance counts on one hardware class.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeAssignment {
    pub hw_id: String,
    pub components: Vec<ComponentCount>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentCount {
    /// Global component id (`application.component`).
    pub component_id: String,
    pub count: u32,
}

/// Verdict on an application's QoS requirements given the measurement data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JudgeResult {
    /// Some probe still lacks isolation measurements.
    NeedsData,
    /// A contract cannot be met even in isolation.
    Rejected,
    /// Measurements are in but the architecture has no contracts yet.
    Measured,
    Accepted,
}

/// Per-percentile timing report for one probe; `mean` is −1.0 when no
/// isolation data exists.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimingReport {
    pub name: String,
    pub mean: f64,
    pub contracts: Vec<PercentileTiming>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PercentileTiming {
    pub percentile: f64,
    pub time_ms: f64,
}

/// Contract violations are hard errors: the caller referenced an entity the
/// aggregator never registered.
#[derive(Debug, Error)]
pub enum AggregatorError {
    #[error("component {0} is not registered")]
    UnknownComponent(String),

    #[error("probe {0} is not registered")]
    UnknownProbe(String),

    #[error("application {0} is not registered")]
    UnknownApplication(String),

    #[error(transparent)]
    Measurement(#[from] MeasurementError),
}

struct AggregatorState {
    applications: BTreeMap<String, Application>,
    probes_by_component: BTreeMap<String, BTreeSet<String>>,
    probes_by_alias: BTreeMap<String, Probe>,
    store: MeasurementStore,
    generator: ScenarioGenerator,
    model: Box<dyn StatisticalModel>,
}

/// The aggregation service itself. All mutating calls serialize on the inner
/// lock.
pub struct PerformanceAggregator {
    default_hw_id: String,
    statistical_prediction_enabled: bool,
    inner: Mutex<AggregatorState>,
}

impl PerformanceAggregator {
    pub fn new(config: &ControllerConfig, model: Box<dyn StatisticalModel>) -> Self {
        let mut store = MeasurementStore::new(&config.results_path);
        let mut generator = ScenarioGenerator::new(&config.results_path, &config.default_hardware_id);
        for (hw_id, controlled, background, _path) in store.load_existing_measurements() {
            generator.load_datafile(&hw_id, &controlled, &background);
        }
        Self {
            default_hw_id: config.default_hardware_id.clone(),
            statistical_prediction_enabled: config.statistical_prediction_enabled,
            inner: Mutex::new(AggregatorState {
                applications: BTreeMap::new(),
                probes_by_component: BTreeMap::new(),
                probes_by_alias: BTreeMap::new(),
                store,
                generator,
                model,
            }),
        }
    }

    /// Will every QoS requirement hold if these instances share a node of
    /// this hardware class? Missing data requests a scenario and answers
    /// `false`.
    pub fn predict(&self, assignment: &NodeAssignment) -> Result<bool, AggregatorError> {
        let mut state = self.inner.lock().unwrap();

        for component in &assignment.components {
            if !state.probes_by_component.contains_key(&component.component_id) {
                return Err(AggregatorError::UnknownComponent(component.component_id.clone()));
            }
        }
        if assignment.components.len() == 1
            && assignment.components[0].count == 1
            && assignment.hw_id == self.default_hw_id
        {
            return Ok(true);
        }

        let counts: BTreeMap<String, u32> = assignment
            .components
            .iter()
            .map(|c| (c.component_id.clone(), c.count))
            .collect();

        for combination in generate_combinations(&counts, &state.probes_by_component) {
            let name = MeasurementStore::compose_name(&assignment.hw_id, &combination);
            let measured = state.store.has_measurement(&name);
            if !self.statistical_prediction_enabled && !measured {
                debug!(measurement = %name, "no data for combination, requesting scenario");
                state
                    .generator
                    .request_scenario(&assignment.hw_id, &combination[0], combination.len());
                return Ok(false);
            }
            let probe = state
                .probes_by_alias
                .get(&combination[0])
                .cloned()
                .ok_or_else(|| AggregatorError::UnknownProbe(combination[0].clone()))?;
            for requirement in &probe.requirements {
                let holds = match requirement {
                    Requirement::Time(contract) => {
                        if measured {
                            state.store.predict_time(&name, contract.time_ms, contract.percentile)
                        } else {
                            state.model.predict_time(
                                &assignment.hw_id,
                                &combination,
                                contract.time_ms,
                                contract.percentile,
                            )
                        }
                    }
                    Requirement::Throughput(contract) => {
                        if measured {
                            state.store.predict_throughput(&name, contract.mean_request_time_ms)
                        } else {
                            state.model.predict_throughput(
                                &assignment.hw_id,
                                &combination,
                                contract.mean_request_time_ms,
                            )
                        }
                    }
                };
                if !holds {
                    state
                        .generator
                        .request_scenario(&assignment.hw_id, &combination[0], combination.len());
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }

    /// Installs an application and indexes its probes. Probes with signal
    /// metadata and existing isolation data get their signals forwarded to
    /// the measurement store.
    pub fn register_app(&self, application: &Application) {
        let mut state = self.inner.lock().unwrap();
        info!(application = %application.name, "application registered with aggregator");
        state
            .applications
            .insert(application.name.clone(), application.clone());
        for component in application.components.values() {
            let component_id = component.global_id();
            state.probes_by_component.entry(component_id.clone()).or_default();
            for probe in &component.probes {
                register_probe(&mut state, &component_id, probe);
                state.generator.register_probe(probe);
                if !probe.signal_set.is_empty() {
                    let isolation = MeasurementStore::compose_name(&self.default_hw_id, &[probe.alias.clone()]);
                    if state.store.has_measurement(&isolation) {
                        state.store.register_signals(
                            &probe.alias,
                            SignalMetadata {
                                signal_set: probe.signal_set.clone(),
                                execution_time_signal: probe.execution_time_signal.clone(),
                                run_count_signal: probe.run_count_signal.clone(),
                            },
                        );
                    }
                }
            }
        }
    }

    pub fn unregister_app(&self, name: &str) {
        let mut state = self.inner.lock().unwrap();
        state.applications.remove(name);
    }

    pub fn register_hw_config(&self, hw_id: &str) {
        let mut state = self.inner.lock().unwrap();
        state.model.add_hw_id(hw_id);
    }

    /// The next scenario to measure, if any point still lacks data.
    pub fn fetch_scenario(&self) -> Option<Scenario> {
        let mut state = self.inner.lock().unwrap();
        state.generator.next_scenario()
    }

    /// Stores the data file of a completed scenario and retires the
    /// scenario. Isolation runs also feed the statistical model's baseline.
    pub fn on_scenario_done(&self, scenario: &Scenario, data_file: &Path) -> Result<(), AggregatorError> {
        let mut state = self.inner.lock().unwrap();
        info!(
            scenario = %scenario.id,
            application = %scenario.controlled_probe.application,
            "scenario completed"
        );
        state.generator.scenario_completed(scenario);
        let name = scenario.measurement_name();
        state.store.process_measurement_file(&name, data_file)?;
        if scenario.background_probes.is_empty() {
            if let Some(samples) = state.store.samples(&name) {
                let alias = scenario.controlled_probe.alias.clone();
                state.model.observe_isolation(&scenario.hw_id, &alias, &samples);
            }
        }
        Ok(())
    }

    /// Response times of a probe at the requested percentiles from its
    /// isolation measurements; mean −1.0 when no data exists.
    pub fn report_percentiles(&self, alias: &str, percentiles: &[f64]) -> TimingReport {
        let mut state = self.inner.lock().unwrap();
        let name = MeasurementStore::compose_name(&self.default_hw_id, &[alias.to_string()]);
        if !state.store.has_measurement(&name) {
            return TimingReport {
                name: alias.to_string(),
                mean: -1.0,
                contracts: Vec::new(),
            };
        }
        let contracts = percentiles
            .iter()
            .map(|&percentile| PercentileTiming {
                percentile,
                time_ms: state.store.time_at_percentile(&name, percentile).unwrap_or(-1.0),
            })
            .collect();
        TimingReport {
            name: alias.to_string(),
            mean: state.store.mean_time(&name).unwrap_or(-1.0),
            contracts,
        }
    }

    /// Judges whether the application's requirements are realistic given the
    /// isolation data. Accepting re-registers the probes so contracts added
    /// since registration are absorbed.
    pub fn judge_app(&self, application: &Application) -> Result<JudgeResult, AggregatorError> {
        let mut state = self.inner.lock().unwrap();
        if !state.applications.contains_key(&application.name) {
            // Not registered yet; nothing to judge against.
            return Ok(JudgeResult::NeedsData);
        }
        for component in application.components.values() {
            for probe in &component.probes {
                let name = MeasurementStore::compose_name(&self.default_hw_id, &[probe.alias.clone()]);
                if !state.store.has_measurement(&name) {
                    return Ok(JudgeResult::NeedsData);
                }
                for requirement in &probe.requirements {
                    let holds = match requirement {
                        Requirement::Time(contract) => {
                            state.store.predict_time(&name, contract.time_ms, contract.percentile)
                        }
                        Requirement::Throughput(contract) => {
                            state.store.predict_throughput(&name, contract.mean_request_time_ms)
                        }
                    };
                    if !holds {
                        warn!(
                            application = %application.name,
                            probe = %probe.alias,
                            "isolation measurement misses its contract"
                        );
                        return Ok(JudgeResult::Rejected);
                    }
                }
            }
        }
        if !application.complete {
            return Ok(JudgeResult::Measured);
        }
        // Contracts may have been added between registration and judgement;
        // re-register every probe to absorb them. The per-component index is
        // reset before the component's own probes are reinserted.
        state
            .applications
            .insert(application.name.clone(), application.clone());
        for component in application.components.values() {
            let component_id = component.global_id();
            state.probes_by_component.insert(component_id.clone(), BTreeSet::new());
            for probe in &component.probes {
                if !state.probes_by_alias.contains_key(&probe.alias) {
                    return Err(AggregatorError::UnknownProbe(probe.alias.clone()));
                }
                register_probe(&mut state, &component_id, probe);
            }
        }
        Ok(JudgeResult::Accepted)
    }

    /// Number of measurement points still waiting for a scenario run.
    pub fn pending_scenarios(&self) -> usize {
        self.inner.lock().unwrap().generator.pending_count()
    }
}

fn register_probe(state: &mut AggregatorState, component_id: &str, probe: &Probe) {
    state.probes_by_alias.insert(probe.alias.clone(), probe.clone());
    state
        .probes_by_component
        .entry(component_id.to_string())
        .or_default()
        .insert(probe.alias.clone());
}

/// Enumerates every probe combination the assignment could exhibit: each
/// registered probe of each component takes a turn as the controlled probe
/// (its component's count reduced by one), and the remaining slots are
/// filled with every multiset of the components' probes, in a stable order.
fn generate_combinations(
    counts: &BTreeMap<String, u32>,
    probes_by_component: &BTreeMap<String, BTreeSet<String>>,
) -> Vec<Vec<String>> {
    let components: Vec<(String, u32)> = counts.iter().map(|(id, count)| (id.clone(), *count)).collect();
    let mut combinations = Vec::new();
    for main_component in counts.keys() {
        let mut tails = Vec::new();
        component_combinations(&components, main_component, probes_by_component, Vec::new(), &mut tails);
        let main_probes = probes_by_component.get(main_component).cloned().unwrap_or_default();
        for tail in &tails {
            for controlled in &main_probes {
                let mut combination = Vec::with_capacity(tail.len() + 1);
                combination.push(controlled.clone());
                combination.extend(tail.iter().cloned());
                combinations.push(combination);
            }
        }
    }
    combinations
}

fn component_combinations(
    rest: &[(String, u32)],
    main_component: &str,
    probes_by_component: &BTreeMap<String, BTreeSet<String>>,
    acc: Vec<String>,
    out: &mut Vec<Vec<String>>,
) {
    let Some(((component, count), tail)) = rest.split_first() else {
        out.push(acc);
        return;
    };
    let mut count = *count as usize;
    if component == main_component {
        count -= 1;
    }
    let probes: Vec<String> = probes_by_component
        .get(component)
        .into_iter()
        .flatten()
        .cloned()
        .collect();
    let mut slot_fills = Vec::new();
    probe_multisets(&probes, count, Vec::new(), &mut slot_fills);
    for fill in slot_fills {
        let mut next = acc.clone();
        next.extend(fill);
        component_combinations(tail, main_component, probes_by_component, next, out);
    }
}

/// All ways to fill `size` slots with the given probes, with replacement,
/// ordered by the probes' enumeration order.
fn probe_multisets(probes: &[String], size: usize, acc: Vec<String>, out: &mut Vec<Vec<String>>) {
    if acc.len() == size {
        out.push(acc);
        return;
    }
    let Some((head, tail)) = probes.split_first() else {
        return;
    };
    for copies in 0..=size {
        if acc.len() + copies <= size {
            let mut next = acc.clone();
            next.extend(std::iter::repeat(head.clone()).take(copies));
            probe_multisets(tail, size, next, out);
        }
    }
}
