//! Test harness builders.

use super::executors::{BlockingExecutor, EchoExecutor, FailingExecutor, NoopExecutor};
use jobtree_core::config::{JobtreeConfig, StoreBackend};
use jobtree_core::models::Job;
use jobtree_core::orchestration::{OrchestrationBootstrap, OrchestrationSystem};
use jobtree_core::registry::StepExecutor;
use jobtree_core::resilience::BackoffPolicy;
use jobtree_core::store::JobStore;
use std::path::Path;
use std::sync::atomic::AtomicU32;
use std::sync::Arc;
use std::time::Duration;

pub const WAIT_TIMEOUT: Duration = Duration::from_secs(10);

/// Configuration tuned for fast tests: short retry backoff and wait interval
pub fn test_config() -> JobtreeConfig {
    let mut config = JobtreeConfig::default();
    config.orchestration.step_retry_attempts = 3;
    config.orchestration.step_retry_backoff = BackoffPolicy {
        first: Duration::from_millis(1),
        max: Duration::from_millis(10),
        factor: 2.0,
        jitter: false,
    };
    config.orchestration.wait_poll_interval_ms = 20;
    config
}

pub struct TestHarness {
    pub system: OrchestrationSystem,
    /// Invocation counter shared with the registered `failing` executor
    pub failing_attempts: Arc<AtomicU32>,
}

impl TestHarness {
    pub async fn new() -> Self {
        Self::with_config(test_config()).await
    }

    pub async fn with_fjall(path: &Path) -> Self {
        let mut config = test_config();
        config.store.backend = StoreBackend::Fjall;
        config.store.path = Some(path.to_path_buf());
        Self::with_config(config).await
    }

    pub async fn with_config(config: JobtreeConfig) -> Self {
        let failing = FailingExecutor::default();
        let failing_attempts = Arc::clone(&failing.attempts);
        let executors: Vec<Arc<dyn StepExecutor>> = vec![
            Arc::new(EchoExecutor),
            Arc::new(failing),
            Arc::new(BlockingExecutor),
            Arc::new(NoopExecutor),
        ];
        let system = OrchestrationBootstrap::bootstrap(config, executors)
            .await
            .expect("bootstrap test system");
        Self {
            system,
            failing_attempts,
        }
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.system.store
    }

    /// Wait for the manager to finish, failing the test after [`WAIT_TIMEOUT`]
    pub async fn wait(&self, manager_id: &str) -> Job {
        tokio::time::timeout(
            WAIT_TIMEOUT,
            self.system.orchestrator.wait_for_completion(manager_id),
        )
        .await
        .expect("manager did not finish in time")
        .expect("wait for manager")
    }

    /// Step jobs of a manager keyed by step name
    pub async fn steps(&self, manager_id: &str) -> Vec<Job> {
        self.system.jobs.list_children(manager_id).await.unwrap()
    }

    pub async fn step(&self, manager_id: &str, step_name: &str) -> Job {
        self.steps(manager_id)
            .await
            .into_iter()
            .find(|s| s.step_name() == Some(step_name))
            .unwrap_or_else(|| panic!("step {step_name} was not created"))
    }

    /// Every job in the manager's tree, manager first
    pub async fn tree(&self, manager_id: &str) -> Vec<Job> {
        let jobs = &self.system.jobs;
        let mut all = vec![jobs.get_job(manager_id).await.unwrap()];
        for step in jobs.list_children(manager_id).await.unwrap() {
            let workers = jobs.list_children(&step.id).await.unwrap();
            all.push(step);
            all.extend(workers);
        }
        all
    }

    /// Poll until `check` holds for the manager's tree and return that tree
    pub async fn eventually<F>(&self, manager_id: &str, check: F) -> Vec<Job>
    where
        F: Fn(&[Job]) -> bool,
    {
        let deadline = tokio::time::Instant::now() + WAIT_TIMEOUT;
        loop {
            let tree = self.tree(manager_id).await;
            if check(&tree) {
                return tree;
            }
            assert!(tokio::time::Instant::now() < deadline, "condition not reached in time");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}
