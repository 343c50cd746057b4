//! Admission of applications and jobs into the Strato platform.
//!
//! Architectures arrive from external submitters, get their probes aliased,
//! are measured and judged through the performance aggregator, and are
//! published to the knowledge base once accepted.

pub mod deploy;
pub mod jobs;
pub mod registry;

pub use deploy::*;
pub use jobs::*;
pub use registry::*;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use strato_aggregator::{PerformanceAggregator, ScaledIsolationModel};
    use strato_model::{
        shared_knowledge, AgentError, AgentRegistry, ArchitectureSource, ControllerConfig,
        MiddlewareAgent,
    };

    struct NoAgents;

    #[async_trait::async_trait]
    impl AgentRegistry for NoAgents {
        async fn agent_for(&self, _ip: &str) -> Result<Arc<dyn MiddlewareAgent>, AgentError> {
            Err(AgentError::Unreachable("no agents in tests".into()))
        }
    }

    fn write_samples(scenario: &strato_aggregator::Scenario, elapsed: u64) {
        use std::io::Write;
        std::fs::create_dir_all(scenario.filename_data.parent().unwrap()).unwrap();
        std::fs::write(&scenario.filename_header, "start_time;end_time;elapsed").unwrap();
        let mut file = std::fs::File::create(&scenario.filename_data).unwrap();
        for i in 0..100u64 {
            writeln!(file, "{};{};{}", i, i + elapsed, elapsed).unwrap();
        }
    }

    #[tokio::test]
    async fn test_job_measurement_and_acceptance_flow() {
        let dir = tempfile::tempdir().unwrap();
        let config = ControllerConfig {
            results_path: dir.path().to_path_buf(),
            ..ControllerConfig::default()
        };
        let knowledge = shared_knowledge(config.clone());
        knowledge.write().await.update_access_token("token-1");

        let registry = Arc::new(AppRegistry::new());
        let aggregator = Arc::new(PerformanceAggregator::new(
            &config,
            Box::new(ScaledIsolationModel::new()),
        ));
        let deploy = Arc::new(DeployController::new(registry.clone(), aggregator.clone()));
        let jobs = JobInterface::new(deploy.clone(), knowledge.clone(), Arc::new(NoAgents));

        let description = JobDescription {
            job_id: "ivisjob".into(),
            docker_container: "registry.example/jobs/base:latest".into(),
            code: "print('x')".into(),
            config: "{}".into(),
            signal_set: String::new(),
            execution_time_signal: String::new(),
            run_count_signal: String::new(),
            min_memory_mb: 128,
            max_memory_mb: 256,
            min_cpu_millis: 100,
            max_cpu_millis: 500,
            k8s_labels: Default::default(),
        };
        assert!(jobs.submit_job(description).await);
        assert_eq!(jobs.get_job_status("ivisjob").await, JobStatus::Measuring);

        // The isolation scenario is pending; judging keeps needing data.
        deploy.refresh_admissions();
        assert_eq!(jobs.get_job_status("ivisjob").await, JobStatus::Measuring);

        // Measure the isolation point.
        let scenario = aggregator.fetch_scenario().expect("isolation scenario");
        write_samples(&scenario, 50);
        aggregator
            .on_scenario_done(&scenario, &scenario.filename_data.clone())
            .unwrap();

        // Measured but not complete yet.
        deploy.refresh_admissions();
        assert_eq!(jobs.get_job_status("ivisjob").await, JobStatus::Measured);

        // Attach a satisfiable contract and judge again: accepted and
        // published.
        assert!(jobs.deploy_job("ivisjob", JobContract { time_ms: 100.0, percentile: 95.0 }).await);
        deploy.refresh_admissions();
        assert_eq!(jobs.get_job_status("ivisjob").await, JobStatus::Accepted);
        let published = registry.publish_new_architectures();
        assert_eq!(published.len(), 1);
        assert!(published[0].complete);
    }

    #[tokio::test]
    async fn test_unsatisfiable_contract_rejects_job() {
        let dir = tempfile::tempdir().unwrap();
        let config = ControllerConfig {
            results_path: dir.path().to_path_buf(),
            ..ControllerConfig::default()
        };
        let knowledge = shared_knowledge(config.clone());
        knowledge.write().await.update_access_token("token-1");

        let registry = Arc::new(AppRegistry::new());
        let aggregator = Arc::new(PerformanceAggregator::new(
            &config,
            Box::new(ScaledIsolationModel::new()),
        ));
        let deploy = Arc::new(DeployController::new(registry.clone(), aggregator.clone()));
        let jobs = JobInterface::new(deploy.clone(), knowledge.clone(), Arc::new(NoAgents));

        let description = JobDescription {
            job_id: "slowjob".into(),
            docker_container: "registry.example/jobs/base:latest".into(),
            code: "work()".into(),
            config: "{}".into(),
            signal_set: String::new(),
            execution_time_signal: String::new(),
            run_count_signal: String::new(),
            min_memory_mb: 128,
            max_memory_mb: 256,
            min_cpu_millis: 100,
            max_cpu_millis: 500,
            k8s_labels: Default::default(),
        };
        assert!(jobs.submit_job(description).await);
        let scenario = aggregator.fetch_scenario().unwrap();
        write_samples(&scenario, 500);
        aggregator
            .on_scenario_done(&scenario, &scenario.filename_data.clone())
            .unwrap();

        // 500ms measured against a 100ms contract.
        assert!(jobs.deploy_job("slowjob", JobContract { time_ms: 100.0, percentile: 95.0 }).await);
        deploy.refresh_admissions();
        assert_eq!(jobs.get_job_status("slowjob").await, JobStatus::Rejected);
    }

    #[tokio::test]
    async fn test_access_token_rotation_is_refused_while_jobs_exist() {
        let dir = tempfile::tempdir().unwrap();
        let config = ControllerConfig {
            results_path: dir.path().to_path_buf(),
            ..ControllerConfig::default()
        };
        let knowledge = shared_knowledge(config.clone());
        knowledge.write().await.update_access_token("token-1");

        let registry = Arc::new(AppRegistry::new());
        let aggregator = Arc::new(PerformanceAggregator::new(
            &config,
            Box::new(ScaledIsolationModel::new()),
        ));
        let deploy = Arc::new(DeployController::new(registry.clone(), aggregator));
        let jobs = JobInterface::new(deploy.clone(), knowledge.clone(), Arc::new(NoAgents));

        let description = JobDescription {
            job_id: "busyjob".into(),
            docker_container: "registry.example/jobs/base:latest".into(),
            code: "work()".into(),
            config: "{}".into(),
            signal_set: String::new(),
            execution_time_signal: String::new(),
            run_count_signal: String::new(),
            min_memory_mb: 128,
            max_memory_mb: 256,
            min_cpu_millis: 100,
            max_cpu_millis: 500,
            k8s_labels: Default::default(),
        };
        assert!(jobs.submit_job(description).await);
        // Measuring: rotation refused.
        assert!(!jobs.update_access_token("token-2").await);

        jobs.unschedule_job("busyjob").await;
        assert!(jobs.update_access_token("token-2").await);
        assert_eq!(
            knowledge.read().await.api_access_token.as_deref(),
            Some("token-2")
        );
    }
}
