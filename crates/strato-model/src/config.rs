//! Controller configuration with environment overrides.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Port the middleware agent listens on inside every workload container.
pub const AGENT_PORT: u16 = 50055;

/// Label carrying the instance id on every workload object.
pub const INSTANCE_LABEL: &str = "strato.dev/instance";

/// Label carrying the component name on every workload object.
pub const COMPONENT_LABEL: &str = "strato.dev/component";

/// Process-wide configuration for the adaptation platform.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// Path to the kubeconfig used against the production cluster.
    pub kubeconfig: String,
    /// Worker pool size for parallel plan execution.
    pub thread_count: usize,
    /// Address of the mongos router used for shard commands.
    pub mongos_ip: String,
    /// Wall-clock budget for the short placement search.
    pub solver_time_limit: Duration,
    /// Hardware class assumed for nodes that report none.
    pub default_hardware_id: String,
    pub predictor_host: String,
    pub predictor_port: u16,
    /// When off, missing measurements always fail feasibility and request a
    /// scenario instead of consulting the statistical model.
    pub statistical_prediction_enabled: bool,
    /// Execute plans concurrently instead of one at a time.
    pub parallel_execution: bool,
    pub api_endpoint_ip: String,
    pub api_endpoint_port: u16,
    /// Name of the docker registry secret created per namespace.
    pub docker_secret_name: String,
    /// Root directory for scenario measurement results.
    pub results_path: PathBuf,
    /// Directory the workload agents write probe data files into.
    pub probes_path: PathBuf,
    /// How many times a failed task is retried within one cycle.
    pub max_task_retries: u32,
    /// Upper bound on a single sub-monitor call.
    pub monitor_timeout: Duration,
    /// Whether external clients are supported (enables the QoS-aware
    /// placement search instead of the permissive one).
    pub client_support: bool,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            kubeconfig: "/etc/strato/kubeconfig".to_string(),
            thread_count: 16,
            mongos_ip: "127.0.0.1".to_string(),
            solver_time_limit: Duration::from_secs(5),
            default_hardware_id: "default".to_string(),
            predictor_host: "0.0.0.0".to_string(),
            predictor_port: 52545,
            statistical_prediction_enabled: false,
            parallel_execution: true,
            api_endpoint_ip: "0.0.0.0".to_string(),
            api_endpoint_port: 8081,
            docker_secret_name: "strato-registry-secret".to_string(),
            results_path: PathBuf::from("./results"),
            probes_path: PathBuf::from("./probes"),
            max_task_retries: 3,
            monitor_timeout: Duration::from_secs(10),
            client_support: false,
        }
    }
}

impl ControllerConfig {
    /// Load the defaults and apply `STRATO_*` environment overrides.
    pub fn load() -> Self {
        let mut config = Self::default();
        config.load_from_env();
        config
    }

    fn load_from_env(&mut self) {
        if let Ok(path) = std::env::var("STRATO_KUBECONFIG") {
            self.kubeconfig = path;
        }
        if let Ok(count) = std::env::var("STRATO_THREAD_COUNT") {
            if let Ok(count) = count.parse() {
                self.thread_count = count;
            }
        }
        if let Ok(ip) = std::env::var("STRATO_MONGOS_IP") {
            self.mongos_ip = ip;
        }
        if let Ok(secs) = std::env::var("STRATO_SOLVER_TIME_LIMIT") {
            if let Ok(secs) = secs.parse() {
                self.solver_time_limit = Duration::from_secs(secs);
            }
        }
        if let Ok(hw) = std::env::var("STRATO_DEFAULT_HARDWARE_ID") {
            self.default_hardware_id = hw;
        }
        if let Ok(host) = std::env::var("STRATO_PREDICTOR_HOST") {
            self.predictor_host = host;
        }
        if let Ok(port) = std::env::var("STRATO_PREDICTOR_PORT") {
            if let Ok(port) = port.parse() {
                self.predictor_port = port;
            }
        }
        if let Ok(flag) = std::env::var("STRATO_STATISTICAL_PREDICTION") {
            self.statistical_prediction_enabled = flag == "1" || flag.eq_ignore_ascii_case("true");
        }
        if let Ok(flag) = std::env::var("STRATO_PARALLEL_EXECUTION") {
            self.parallel_execution = flag == "1" || flag.eq_ignore_ascii_case("true");
        }
        if let Ok(ip) = std::env::var("STRATO_API_ENDPOINT_IP") {
            self.api_endpoint_ip = ip;
        }
        if let Ok(port) = std::env::var("STRATO_API_ENDPOINT_PORT") {
            if let Ok(port) = port.parse() {
                self.api_endpoint_port = port;
            }
        }
        if let Ok(path) = std::env::var("STRATO_RESULTS_PATH") {
            self.results_path = PathBuf::from(path);
        }
        if let Ok(flag) = std::env::var("STRATO_CLIENT_SUPPORT") {
            self.client_support = flag == "1" || flag.eq_ignore_ascii_case("true");
        }
    }
}
