//! The adaptation controller: runs the monitor → analyze → plan → execute
//! loop over the shared knowledge base, one cycle at a time, in a single
//! control task.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::info;

use strato_analyzer::Analyzer;
use strato_executor::{ExecutionPlan, Executor};
use strato_model::{
    AgentError, AgentRegistry, ClusterState, MiddlewareAgent, SharedKnowledge,
};
use strato_monitor::TopLevelMonitor;
use strato_planner::ExecutionPlanner;

/// Stand-in agent registry for deployments without an agent transport
/// linked in. Every call reports the agent as unreachable, which the rest
/// of the loop already tolerates (retries now, re-derives next cycle).
#[derive(Debug, Default)]
pub struct OfflineAgents;

#[async_trait]
impl AgentRegistry for OfflineAgents {
    async fn agent_for(&self, ip: &str) -> Result<Arc<dyn MiddlewareAgent>, AgentError> {
        Err(AgentError::Unreachable(format!("no agent transport configured for {ip}")))
    }
}

/// Runs all four phases of the adaptation loop sequentially.
pub struct AdaptationController {
    knowledge: SharedKnowledge,
    monitor: TopLevelMonitor,
    analyzer: Analyzer,
    planner: ExecutionPlanner,
    executor: Executor,
    parallel_execution: bool,
    desired_state: ClusterState,
    plans: Vec<ExecutionPlan>,
}

impl AdaptationController {
    pub fn new(
        knowledge: SharedKnowledge,
        monitor: TopLevelMonitor,
        analyzer: Analyzer,
        planner: ExecutionPlanner,
        executor: Executor,
        parallel_execution: bool,
    ) -> Self {
        Self {
            knowledge,
            monitor,
            analyzer,
            planner,
            executor,
            parallel_execution,
            desired_state: ClusterState::new(),
            plans: Vec::new(),
        }
    }

    pub fn knowledge(&self) -> &SharedKnowledge {
        &self.knowledge
    }

    pub async fn monitoring(&mut self) {
        info!("--------------- MONITORING PHASE ---------------");
        self.monitor.monitor().await;
    }

    pub async fn analysis(&mut self) {
        info!("--------------- ANALYSIS PHASE   ---------------");
        self.desired_state = self.analyzer.find_new_assignment().await;
    }

    pub async fn planning(&mut self) {
        info!("--------------- PLANNING PHASE   ---------------");
        self.plans = self.planner.plan_changes(&self.desired_state).await;
    }

    /// Executes the produced plans; returns how many were executed.
    pub async fn execution(&mut self) -> usize {
        info!("--------------- EXECUTION PHASE  ---------------");
        self.executor.start_cycle().await;
        let plans = std::mem::take(&mut self.plans);
        let count = if self.parallel_execution {
            self.executor.execute_plans_in_parallel(plans).await
        } else {
            self.executor.execute_plans(plans).await
        };
        info!(plans = count, "execution phase finished");
        count
    }

    /// Runs one full MAPE-K cycle, logging each phase's duration.
    pub async fn run_cycle(&mut self) {
        let mut mark = Instant::now();
        self.monitoring().await;
        mark = log_phase_duration(mark);
        self.analysis().await;
        mark = log_phase_duration(mark);
        self.planning().await;
        mark = log_phase_duration(mark);
        self.execution().await;
        log_phase_duration(mark);
    }

    /// Runs cycles until the actual state matches the desired state, i.e.
    /// until a cycle has nothing left to execute.
    pub async fn deploy(&mut self) {
        loop {
            self.monitoring().await;
            self.analysis().await;
            self.planning().await;
            if self.execution().await == 0 {
                break;
            }
        }
    }

    /// Runs the adaptation loop until the shutdown flag flips. The signal is
    /// only honored between cycles; in-flight tasks finish first.
    pub async fn run(&mut self, shutdown: watch::Receiver<bool>) {
        info!("MAPE-K loop started");
        while !*shutdown.borrow() {
            self.run_cycle().await;
        }
        info!("shutdown signal received, ending");
    }
}

fn log_phase_duration(since: Instant) -> Instant {
    info!(duration_ms = since.elapsed().as_millis() as u64, "phase duration");
    Instant::now()
}
