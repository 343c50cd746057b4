//! The deploy controller: drives submitted applications through judgement
//! and publishes the accepted ones.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use strato_aggregator::{JudgeResult, PerformanceAggregator};
use strato_model::Application;

use crate::registry::{AdmissionError, AppRegistry, AppStatus};

/// Externally visible admission status of an application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AdmissionStatus {
    Unknown,
    Received,
    Measured,
    Rejected,
    Accepted,
    Published,
}

pub struct DeployController {
    registry: Arc<AppRegistry>,
    aggregator: Arc<PerformanceAggregator>,
}

impl DeployController {
    pub fn new(registry: Arc<AppRegistry>, aggregator: Arc<PerformanceAggregator>) -> Self {
        Self { registry, aggregator }
    }

    /// Admits an architecture: aliases its probes and registers it with the
    /// performance aggregator so measurement scenarios start flowing.
    pub fn submit_architecture(&self, architecture: Application) -> Result<(), AdmissionError> {
        let admitted = self.registry.add_app(architecture)?;
        self.aggregator.register_app(&admitted);
        Ok(())
    }

    /// Attaches QoS requirements to a previously submitted architecture,
    /// completing it; the next admission refresh judges it.
    pub fn submit_requirements(&self, architecture: &Application) -> Result<(), AdmissionError> {
        self.registry.attach_requirements(architecture)?;
        Ok(())
    }

    pub fn delete_application(&self, name: &str) {
        self.registry.remove_app(name);
        self.aggregator.unregister_app(name);
    }

    pub fn get_application_status(&self, name: &str) -> AdmissionStatus {
        match self.registry.status(name) {
            None => AdmissionStatus::Unknown,
            Some(AppStatus::Received) => AdmissionStatus::Received,
            Some(AppStatus::Measured) => AdmissionStatus::Measured,
            Some(AppStatus::Rejected) => AdmissionStatus::Rejected,
            Some(AppStatus::Accepted) => AdmissionStatus::Accepted,
            Some(AppStatus::Published) => AdmissionStatus::Published,
        }
    }

    /// Token rotation is refused while any application is still measuring.
    pub fn update_access_token(&self) -> bool {
        !self.registry.any_measuring()
    }

    /// Judges every pending application against the aggregated measurement
    /// data; accepted ones are published to the adaptation loop.
    pub fn refresh_admissions(&self) {
        for architecture in self.registry.pending() {
            match self.aggregator.judge_app(&architecture) {
                Ok(JudgeResult::NeedsData) => {}
                Ok(JudgeResult::Measured) => {
                    self.registry.set_status(&architecture.name, AppStatus::Measured);
                }
                Ok(JudgeResult::Rejected) => {
                    info!(application = %architecture.name, "application rejected");
                    self.registry.set_status(&architecture.name, AppStatus::Rejected);
                }
                Ok(JudgeResult::Accepted) => {
                    info!(application = %architecture.name, "application accepted");
                    self.registry.set_status(&architecture.name, AppStatus::Accepted);
                    self.registry.publish(&architecture.name);
                }
                Err(error) => {
                    warn!(application = %architecture.name, %error, "judgement failed");
                }
            }
        }
    }

    pub fn stats(&self, name: &str) -> String {
        self.registry.stats(name)
    }
}
