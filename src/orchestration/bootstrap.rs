//! # Orchestration Bootstrap
//!
//! Wires the core together from a [`JobtreeConfig`]:
//!
//! ```text
//! config ─► store ─► event bus ─► job manager ─► registry
//!                                     │
//!                                     ├─► progress aggregator (subscribed)
//!                                     ├─► step router ─► orchestrator
//!                                     └─► transport broadcaster (subscribed)
//! ```
//!
//! ```rust,no_run
//! use jobtree_core::config::JobtreeConfig;
//! use jobtree_core::orchestration::OrchestrationBootstrap;
//!
//! # async fn example() -> Result<(), jobtree_core::error::JobError> {
//! let system = OrchestrationBootstrap::bootstrap(JobtreeConfig::default(), Vec::new()).await?;
//! println!("{:?}", system.status());
//! system.shutdown().await;
//! # Ok(())
//! # }
//! ```

use crate::config::{JobtreeConfig, StoreBackend, StoreConfig};
use crate::error::{JobError, JobResult};
use crate::events::{EventBus, EventBusStats};
use crate::orchestration::job_manager::JobManager;
use crate::orchestration::orchestrator::Orchestrator;
use crate::orchestration::progress_aggregator::ProgressAggregator;
use crate::orchestration::step_router::StepRouter;
use crate::registry::{RegistryStats, StepExecutor, StepExecutorRegistry};
use crate::store::{FjallJobStore, JobStore, MemoryJobStore};
use crate::transport::TransportBroadcaster;
use std::sync::Arc;
use tracing::info;

/// Every long-lived component of a running core
#[derive(Debug, Clone)]
pub struct OrchestrationSystem {
    pub config: JobtreeConfig,
    pub store: Arc<dyn JobStore>,
    pub bus: Arc<EventBus>,
    pub jobs: Arc<JobManager>,
    pub registry: Arc<StepExecutorRegistry>,
    pub aggregator: Arc<ProgressAggregator>,
    pub router: Arc<StepRouter>,
    pub orchestrator: Arc<Orchestrator>,
    pub transport: Arc<TransportBroadcaster>,
}

/// Point-in-time view of the running system
#[derive(Debug, Clone)]
pub struct SystemStatus {
    pub store_backend: StoreBackend,
    pub active_drivers: usize,
    pub monitored_parents: usize,
    pub observers: usize,
    pub registry: RegistryStats,
    pub bus: EventBusStats,
}

impl OrchestrationSystem {
    pub fn status(&self) -> SystemStatus {
        SystemStatus {
            store_backend: self.config.store.backend,
            active_drivers: self.orchestrator.active_drivers(),
            monitored_parents: self.aggregator.monitored_count(),
            observers: self.transport.connection_count(),
            registry: self.registry.stats(),
            bus: self.bus.stats(),
        }
    }

    /// Let running drivers finish, then detach subscribers and drain the bus
    pub async fn shutdown(&self) {
        info!("Shutting down orchestration system");
        self.orchestrator.shutdown().await;
        self.aggregator.stop();
        self.transport.stop();
        self.bus.shutdown().await;
        info!("Orchestration system stopped");
    }
}

pub struct OrchestrationBootstrap;

impl OrchestrationBootstrap {
    /// Initialize logging, validate `config`, open the store and start every component.
    ///
    /// Must be called from within a tokio runtime. Fails on invalid configuration, an
    /// unopenable store or two executors claiming the same step type.
    pub async fn bootstrap(
        config: JobtreeConfig,
        executors: Vec<Arc<dyn StepExecutor>>,
    ) -> JobResult<OrchestrationSystem> {
        crate::logging::init_with(&config.logging);
        config.validate()?;
        let store = Self::open_store(&config.store)?;
        Self::bootstrap_with_store(config, store, executors)
    }

    /// Same as [`bootstrap`](Self::bootstrap) with a caller-provided store
    pub fn bootstrap_with_store(
        config: JobtreeConfig,
        store: Arc<dyn JobStore>,
        executors: Vec<Arc<dyn StepExecutor>>,
    ) -> JobResult<OrchestrationSystem> {
        let bus = Arc::new(EventBus::new(config.events.bus_config()));
        let jobs = Arc::new(
            JobManager::new(Arc::clone(&store), Arc::clone(&bus))
                .with_retry_policy(config.store.retry)
                .with_wait_poll_interval(config.orchestration.wait_poll_interval())
                .with_debug_log_publishing(config.events.publish_debug_logs),
        );

        let registry = Arc::new(StepExecutorRegistry::with_executors(executors)?);
        info!(step_types = ?registry.step_types(), "Step executors registered");

        let aggregator = Arc::new(ProgressAggregator::new(Arc::clone(&jobs)));
        aggregator.start();

        let router = Arc::new(StepRouter::new(
            Arc::clone(&registry),
            Arc::clone(&jobs),
            Arc::clone(&aggregator),
        ));
        let orchestrator = Arc::new(Orchestrator::new(
            Arc::clone(&jobs),
            Arc::clone(&router),
            Arc::clone(&aggregator),
            config.orchestration.clone(),
        ));

        let transport = Arc::new(TransportBroadcaster::new(Arc::clone(&bus)));
        transport.start();

        info!(backend = ?config.store.backend, "Orchestration system ready");
        Ok(OrchestrationSystem {
            config,
            store,
            bus,
            jobs,
            registry,
            aggregator,
            router,
            orchestrator,
            transport,
        })
    }

    pub fn open_store(config: &StoreConfig) -> JobResult<Arc<dyn JobStore>> {
        match config.backend {
            StoreBackend::Memory => Ok(Arc::new(MemoryJobStore::new())),
            StoreBackend::Fjall => {
                let path = config.path.as_ref().ok_or_else(|| {
                    JobError::Configuration("store.path is required for the fjall backend".into())
                })?;
                info!(path = %path.display(), sync_writes = config.sync_writes, "Opening fjall job store");
                let store = FjallJobStore::open(path)?.with_sync_writes(config.sync_writes);
                Ok(Arc::new(store))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{JobDefinition, Step};

    #[tokio::test]
    async fn test_bootstrap_with_defaults() {
        let system = OrchestrationBootstrap::bootstrap(JobtreeConfig::default(), Vec::new())
            .await
            .unwrap();
        let status = system.status();
        assert_eq!(status.store_backend, StoreBackend::Memory);
        assert_eq!(status.registry.total_executors, 0);
        assert_eq!(system.bus.subscriber_count("job.status_changed"), 2);

        let definition = JobDefinition::new("d", vec![Step::new("a", "missing")]);
        assert!(matches!(
            system.orchestrator.execute(definition).await,
            Err(JobError::NoExecutor { .. })
        ));
        system.shutdown().await;
    }

    #[tokio::test]
    async fn test_fjall_backend_requires_a_path() {
        let mut config = JobtreeConfig::default();
        config.store.backend = StoreBackend::Fjall;
        assert!(matches!(
            OrchestrationBootstrap::bootstrap(config, Vec::new()).await,
            Err(JobError::Configuration(_))
        ));
    }
}
