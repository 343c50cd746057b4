//! Interface to the middleware agent running inside every workload container.
//!
//! The transport is out of scope here; tests and local runs plug in
//! in-process implementations of these traits.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// How a probe is shipped to the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProbeType {
    /// Code plus JSON config executed by the agent itself.
    Code,
    /// Pre-baked procedure inside the container image.
    Procedure,
}

/// Per-probe payload of the instance initialization call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeConfig {
    pub name: String,
    pub probe_type: ProbeType,
    pub code: String,
    pub config: String,
    pub signal_set: String,
    pub execution_time_signal: String,
    pub run_count_signal: String,
    pub run_count: u32,
}

/// Everything an instance needs to start serving.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceConfig {
    pub instance_id: String,
    pub api_endpoint_ip: String,
    pub api_endpoint_port: u16,
    pub access_token: String,
    pub production: bool,
    pub probes: Vec<ProbeConfig>,
}

/// Tells a dependent instance where one of its dependencies lives.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DependencyAddress {
    pub name: String,
    pub ip: String,
}

/// Shard routing parameters for components with sharded state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MongoParameters {
    pub db: String,
    pub collection: String,
    pub shard_key: u32,
    pub mongos_ip: String,
}

/// One run of a deployed job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunParameters {
    pub job_id: String,
    pub run_id: String,
    pub state: String,
}

/// Agent-reported instance condition, polled by the application monitor.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct AgentState {
    pub ready: bool,
    pub finished: bool,
}

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("agent unreachable: {0}")]
    Unreachable(String),

    #[error("agent protocol error: {0}")]
    Protocol(String),
}

/// The per-container control surface.
#[async_trait]
pub trait MiddlewareAgent: Send + Sync {
    async fn initialize_instance(&self, config: InstanceConfig) -> Result<(), AgentError>;
    async fn set_dependency_address(&self, address: DependencyAddress) -> Result<(), AgentError>;
    async fn set_mongo_parameters(&self, parameters: MongoParameters) -> Result<(), AgentError>;
    async fn finalize_execution(&self) -> Result<(), AgentError>;
    async fn run_job(&self, parameters: RunParameters) -> Result<(), AgentError>;
    async fn state(&self) -> Result<AgentState, AgentError>;
}

/// Resolves an instance ip to its agent handle.
#[async_trait]
pub trait AgentRegistry: Send + Sync {
    async fn agent_for(&self, ip: &str) -> Result<Arc<dyn MiddlewareAgent>, AgentError>;
}
