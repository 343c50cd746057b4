//! Strato adaptation controller entry point.

use std::sync::Arc;

use clap::Parser;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use strato_admission::{AppRegistry, DeployController, JobInterface};
use strato_aggregator::{PerformanceAggregator, ScaledIsolationModel};
use strato_analyzer::{AggregatorPredictor, Analyzer, PermissivePredictor, Predict};
use strato_controller::{AdaptationController, OfflineAgents};
use strato_executor::{ExecutionContext, Executor, KubernetesClient};
use strato_model::{shared_knowledge, ControllerConfig, QueueFeed};
use strato_monitor::{
    ApplicationMonitor, ClientMonitor, KubernetesClusterApi, KubernetesMonitor, TopLevelMonitor,
    UeMonitor,
};
use strato_planner::ExecutionPlanner;

#[derive(Debug, Parser)]
#[command(name = "strato-controller", about = "QoS-aware cluster adaptation controller")]
struct Args {
    /// Run plans one at a time instead of concurrently.
    #[arg(long)]
    sequential: bool,

    /// Stop after this many cycles (runs until interrupted by default).
    #[arg(long)]
    cycles: Option<u64>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "strato=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let mut config = ControllerConfig::load();
    if args.sequential {
        config.parallel_execution = false;
    }
    info!("starting the strato adaptation controller");

    let knowledge = shared_knowledge(config.clone());
    let kube_client = kube::Client::try_default().await?;

    let registry = Arc::new(AppRegistry::new());
    let aggregator = Arc::new(PerformanceAggregator::new(
        &config,
        Box::new(ScaledIsolationModel::new()),
    ));
    let deploy = Arc::new(DeployController::new(registry.clone(), aggregator.clone()));
    let agents = Arc::new(OfflineAgents);
    let _jobs = JobInterface::new(deploy.clone(), knowledge.clone(), agents.clone());

    let predictor: Arc<dyn Predict> = if config.client_support {
        Arc::new(AggregatorPredictor::new(aggregator.clone()))
    } else {
        Arc::new(PermissivePredictor)
    };

    let mut monitor = TopLevelMonitor::new(knowledge.clone(), config.monitor_timeout);
    monitor.add_monitor(Box::new(ApplicationMonitor::new(registry.clone(), agents.clone())));
    monitor.add_monitor(Box::new(ClientMonitor::new(Arc::new(QueueFeed::new()))));
    monitor.add_monitor(Box::new(UeMonitor::new(Arc::new(QueueFeed::new()))));
    monitor.add_monitor(Box::new(KubernetesMonitor::new(Arc::new(
        KubernetesClusterApi::new(kube_client.clone()),
    ))));

    let analyzer = Analyzer::new(knowledge.clone(), predictor);
    let planner = ExecutionPlanner::new(knowledge.clone());
    let context = Arc::new(ExecutionContext::new(
        knowledge.clone(),
        Arc::new(KubernetesClient::new(kube_client)),
        agents,
        config.clone(),
    ));
    let executor = Executor::new(context);

    let mut controller = AdaptationController::new(
        knowledge,
        monitor,
        analyzer,
        planner,
        executor,
        config.parallel_execution,
    );

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received");
            let _ = shutdown_tx.send(true);
        }
    });

    match args.cycles {
        Some(cycles) => {
            for _ in 0..cycles {
                controller.run_cycle().await;
            }
        }
        None => controller.run(shutdown_rx).await,
    }
    Ok(())
}
