//! Execution phase of the adaptation loop.
//!
//! The executor takes the planner's task sets and runs every task whose
//! preconditions hold, retrying failures a bounded number of times within
//! the cycle and applying model updates under the knowledge write lock.
//! Plans can run one at a time or concurrently on a bounded worker pool.

pub mod context;
pub mod task;
pub mod tasks;

pub use context::*;
pub use task::*;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// The tasks needed to converge one application toward the desired state.
#[derive(Debug, Clone)]
pub struct ExecutionPlan {
    pub application: String,
    pub tasks: Vec<Task>,
}

impl ExecutionPlan {
    pub fn new(application: impl Into<String>) -> Self {
        Self { application: application.into(), tasks: Vec::new() }
    }

    pub fn push(&mut self, task: Task) {
        self.tasks.push(task);
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

/// Runs execution plans against the orchestrator and the workload agents.
pub struct Executor {
    context: Arc<ExecutionContext>,
    /// Task ids completed in the current cycle; replayed tasks are skipped.
    completed: Arc<Mutex<HashSet<String>>>,
}

impl Executor {
    pub fn new(context: Arc<ExecutionContext>) -> Self {
        Self {
            context,
            completed: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Resets the per-cycle idempotency record. Called at the start of every
    /// execution phase.
    pub async fn start_cycle(&self) {
        self.completed.lock().await.clear();
    }

    /// Executes the plans one at a time, in order.
    pub async fn execute_plans(&self, plans: Vec<ExecutionPlan>) -> usize {
        let mut executed = 0;
        for plan in plans {
            self.execute_plan(plan).await;
            executed += 1;
        }
        executed
    }

    /// Executes the plans concurrently, bounded by the configured worker
    /// count. Tasks within one plan still run in precondition order.
    pub async fn execute_plans_in_parallel(&self, plans: Vec<ExecutionPlan>) -> usize {
        let semaphore = Arc::new(Semaphore::new(self.context.config.thread_count.max(1)));
        let mut join_set = JoinSet::new();
        let plan_count = plans.len();
        for plan in plans {
            let permit = semaphore.clone().acquire_owned().await.expect("semaphore closed");
            let context = self.context.clone();
            let completed = self.completed.clone();
            join_set.spawn(async move {
                let _permit = permit;
                run_plan(context, completed, plan).await;
            });
        }
        while join_set.join_next().await.is_some() {}
        plan_count
    }

    /// Executes one plan to the point where no further task is runnable.
    /// Never propagates task errors; failures are logged and counted.
    pub async fn execute_plan(&self, plan: ExecutionPlan) -> usize {
        run_plan(self.context.clone(), self.completed.clone(), plan).await
    }
}

async fn run_plan(
    context: Arc<ExecutionContext>,
    completed: Arc<Mutex<HashSet<String>>>,
    plan: ExecutionPlan,
) -> usize {
    let application = plan.application.clone();
    let max_retries = context.config.max_task_retries;
    let mut remaining = plan.tasks;
    let mut attempts: HashMap<String, u32> = HashMap::new();
    let mut done = 0usize;

    loop {
        // A task becomes runnable only when every precondition holds right
        // now; the check runs immediately before execution.
        let runnable = {
            let knowledge = context.knowledge.read().await;
            remaining
                .iter()
                .position(|task| task.preconditions().iter().all(|p| p.holds(&knowledge)))
        };
        let Some(index) = runnable else {
            break;
        };
        let task = remaining.remove(index);

        if completed.lock().await.contains(task.id()) {
            debug!(task = task.id(), "task already completed this cycle");
            continue;
        }

        match task.execute(&context).await {
            Ok(report) if report.success => {
                {
                    let mut knowledge = context.knowledge.write().await;
                    task.update_model(&mut knowledge, &report);
                }
                completed.lock().await.insert(task.id().to_string());
                done += 1;
            }
            Ok(_) | Err(OrchestratorError::NotFound) | Err(OrchestratorError::AlreadyExists) => {
                // Defensive: idempotent answers are normally absorbed inside
                // the task; count them as done without a model update.
                completed.lock().await.insert(task.id().to_string());
                done += 1;
            }
            Err(error) => {
                let attempt = attempts.entry(task.id().to_string()).or_insert(0);
                *attempt += 1;
                if *attempt <= max_retries {
                    warn!(task = task.id(), %error, attempt, "task failed, requeueing");
                    remaining.push(task);
                } else {
                    warn!(
                        task = task.id(),
                        %error,
                        "task abandoned for this cycle; intent will be re-derived"
                    );
                }
            }
        }
    }

    if !remaining.is_empty() {
        debug!(
            application = %application,
            blocked = remaining.len(),
            "plan left blocked tasks for the next cycle"
        );
    }
    info!(application = %application, tasks = done, "plan executed");
    done
}
