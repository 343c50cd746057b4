//! Storage and querying of workload measurement files.
//!
//! The on-disk format is shared with the workload agents: a `.header` file
//! with a `;`-separated column list and a `.out` file with one `;`-separated
//! row per measured iteration. Files live under
//! `<results>/<application>/<hw_id>/`.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use statrs::statistics::{Data, Distribution, OrderStatistics};
use thiserror::Error;
use tracing::{debug, warn};

/// File name prefix shared with the measurement tooling.
pub const RESULT_FILE_PREFIX: &str = "merged_iterative_result--batch--";
/// Column carrying the per-iteration elapsed time in milliseconds.
pub const ELAPSED_COLUMN: &str = "elapsed";
/// Field separator of both header and data files.
pub const SEPARATOR: char = ';';

#[derive(Debug, Error)]
pub enum MeasurementError {
    #[error("failed to read measurement file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("measurement file {0} has no elapsed-time column")]
    MissingElapsedColumn(PathBuf),

    #[error("measurement file {0} contains no samples")]
    Empty(PathBuf),
}

/// Signal-set metadata attached to a measured probe, forwarded from the
/// submitting framework so results can be exported back into it.
#[derive(Debug, Clone)]
pub struct SignalMetadata {
    pub signal_set: String,
    pub execution_time_signal: String,
    pub run_count_signal: String,
}

#[derive(Debug)]
struct MeasurementData {
    samples: Vec<f64>,
}

/// In-memory index of every processed measurement, keyed by the canonical
/// measurement name.
#[derive(Debug)]
pub struct MeasurementStore {
    results_path: PathBuf,
    measurements: BTreeMap<String, MeasurementData>,
    signals: BTreeMap<String, SignalMetadata>,
}

impl MeasurementStore {
    pub fn new(results_path: impl Into<PathBuf>) -> Self {
        Self {
            results_path: results_path.into(),
            measurements: BTreeMap::new(),
            signals: BTreeMap::new(),
        }
    }

    /// Canonical measurement name for a probe combination on a hardware
    /// class: the hardware id joined with the alias list.
    pub fn compose_name(hw_id: &str, combination: &[String]) -> String {
        format!("{};{}", hw_id, combination.join("-"))
    }

    pub fn has_measurement(&self, name: &str) -> bool {
        self.measurements.contains_key(name)
    }

    /// Parses a finished scenario's data file and indexes it under `name`.
    pub fn process_measurement_file(&mut self, name: &str, data_path: &Path) -> Result<(), MeasurementError> {
        let samples = read_elapsed_samples(data_path)?;
        debug!(measurement = name, samples = samples.len(), "measurement processed");
        self.measurements.insert(name.to_string(), MeasurementData { samples });
        Ok(())
    }

    /// Returns the raw elapsed samples of a measurement, oldest first.
    pub fn samples(&self, name: &str) -> Option<Vec<f64>> {
        self.measurements.get(name).map(|m| m.samples.clone())
    }

    /// Scans the results directory and indexes every data file already on
    /// disk. Returns `(hw_id, controlled_alias, background_aliases, path)`
    /// for each file so the scenario generator can mark those points done.
    pub fn load_existing_measurements(&mut self) -> Vec<(String, String, Vec<String>, PathBuf)> {
        let mut loaded = Vec::new();
        let Ok(apps) = fs::read_dir(&self.results_path) else {
            return loaded;
        };
        for app in apps.flatten() {
            let Ok(hw_dirs) = fs::read_dir(app.path()) else {
                continue;
            };
            for hw_dir in hw_dirs.flatten() {
                let hw_id = hw_dir.file_name().to_string_lossy().to_string();
                let Ok(files) = fs::read_dir(hw_dir.path()) else {
                    continue;
                };
                for file in files.flatten() {
                    let path = file.path();
                    let Some(aliases) = parse_result_file_name(&path) else {
                        continue;
                    };
                    let name = Self::compose_name(&hw_id, &aliases);
                    match self.process_measurement_file(&name, &path) {
                        Ok(()) => {
                            loaded.push((hw_id.clone(), aliases[0].clone(), aliases[1..].to_vec(), path));
                        }
                        Err(error) => warn!(%error, ?path, "skipping unreadable measurement file"),
                    }
                }
            }
        }
        loaded
    }

    /// Does the measured response time at `percentile` stay within
    /// `time_limit_ms`?
    pub fn predict_time(&self, name: &str, time_limit_ms: f64, percentile: f64) -> bool {
        match self.time_at_percentile(name, percentile) {
            Some(time) => time <= time_limit_ms,
            None => false,
        }
    }

    /// Does the measured mean request time stay within
    /// `mean_request_time_ms`?
    pub fn predict_throughput(&self, name: &str, mean_request_time_ms: f64) -> bool {
        match self.mean_time(name) {
            Some(mean) => mean <= mean_request_time_ms,
            None => false,
        }
    }

    pub fn time_at_percentile(&self, name: &str, percentile: f64) -> Option<f64> {
        let samples = &self.measurements.get(name)?.samples;
        let mut data = Data::new(samples.clone());
        Some(data.percentile(percentile.round() as usize))
    }

    pub fn mean_time(&self, name: &str) -> Option<f64> {
        let samples = &self.measurements.get(name)?.samples;
        Data::new(samples.clone()).mean()
    }

    pub fn register_signals(&mut self, alias: &str, metadata: SignalMetadata) {
        self.signals.insert(alias.to_string(), metadata);
    }

    pub fn signals_for(&self, alias: &str) -> Option<&SignalMetadata> {
        self.signals.get(alias)
    }

    pub fn results_path(&self) -> &Path {
        &self.results_path
    }
}

/// Extracts the alias list from a `merged_iterative_result--batch--A-B.out`
/// file name; `None` for anything else (headers included).
fn parse_result_file_name(path: &Path) -> Option<Vec<String>> {
    if path.extension()? != "out" {
        return None;
    }
    let stem = path.file_stem()?.to_str()?;
    let aliases = stem.strip_prefix(RESULT_FILE_PREFIX)?;
    let aliases: Vec<String> = aliases.split('-').map(str::to_string).collect();
    if aliases.iter().any(|a| a.is_empty()) {
        return None;
    }
    Some(aliases)
}

fn read_elapsed_samples(data_path: &Path) -> Result<Vec<f64>, MeasurementError> {
    let header_path = data_path.with_extension("header");
    let io = |source| MeasurementError::Io { path: data_path.to_path_buf(), source };

    let elapsed_index = match fs::read_to_string(&header_path) {
        Ok(header) => header
            .trim()
            .split(SEPARATOR)
            .position(|column| column == ELAPSED_COLUMN)
            .ok_or_else(|| MeasurementError::MissingElapsedColumn(header_path.clone()))?,
        // Data written by older agents ships without a header; the elapsed
        // column has always been the third one.
        Err(_) => 2,
    };

    let data = fs::read_to_string(data_path).map_err(io)?;
    let mut samples = Vec::new();
    for line in data.lines() {
        if line.trim().is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.split(SEPARATOR).collect();
        if let Some(value) = fields.get(elapsed_index).and_then(|f| f.trim().parse::<f64>().ok()) {
            samples.push(value);
        }
    }
    if samples.is_empty() {
        return Err(MeasurementError::Empty(data_path.to_path_buf()));
    }
    Ok(samples)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_measurement(dir: &Path, stem: &str, rows: &[(u64, u64)]) -> PathBuf {
        let header_path = dir.join(format!("{stem}.header"));
        fs::write(&header_path, "start_time;end_time;elapsed").unwrap();
        let data_path = dir.join(format!("{stem}.out"));
        let mut file = fs::File::create(&data_path).unwrap();
        for (start, end) in rows {
            writeln!(file, "{};{};{}", start, end, end - start).unwrap();
        }
        data_path
    }

    #[test]
    fn test_process_and_query_measurement() {
        let dir = tempfile::tempdir().unwrap();
        let rows: Vec<(u64, u64)> = (0..100).map(|i| (i, i + 50 + i % 10)).collect();
        let data = write_measurement(dir.path(), "merged_iterative_result--batch--ABCD", &rows);

        let mut store = MeasurementStore::new(dir.path());
        let name = MeasurementStore::compose_name("default", &["ABCD".to_string()]);
        store.process_measurement_file(&name, &data).unwrap();

        assert!(store.has_measurement(&name));
        // All elapsed values are in [50, 59].
        assert!(store.predict_time(&name, 60.0, 95.0));
        assert!(!store.predict_time(&name, 10.0, 95.0));
        assert!(store.predict_throughput(&name, 60.0));
        assert!(!store.predict_throughput(&name, 50.0));
    }

    #[test]
    fn test_load_existing_measurements_scans_layout() {
        let dir = tempfile::tempdir().unwrap();
        let hw_dir = dir.path().join("demo").join("default");
        fs::create_dir_all(&hw_dir).unwrap();
        write_measurement(&hw_dir, "merged_iterative_result--batch--ABCD-EFGH", &[(0, 10), (1, 12)]);

        let mut store = MeasurementStore::new(dir.path());
        let loaded = store.load_existing_measurements();

        assert_eq!(loaded.len(), 1);
        let (hw, controlled, background, _) = &loaded[0];
        assert_eq!(hw, "default");
        assert_eq!(controlled, "ABCD");
        assert_eq!(background, &vec!["EFGH".to_string()]);
        let name = MeasurementStore::compose_name("default", &["ABCD".into(), "EFGH".into()]);
        assert!(store.has_measurement(&name));
    }

    #[test]
    fn test_empty_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let data = dir.path().join("merged_iterative_result--batch--ABCD.out");
        fs::write(&data, "").unwrap();

        let mut store = MeasurementStore::new(dir.path());
        let result = store.process_measurement_file("default;ABCD", &data);
        assert!(matches!(result, Err(MeasurementError::Empty(_))));
    }
}
