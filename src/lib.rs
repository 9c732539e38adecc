#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # Jobtree Core
//!
//! Orchestration, queue and event core for hierarchical multi-step job execution.
//!
//! ## Overview
//!
//! A declarative [`JobDefinition`](models::JobDefinition) runs as a tree of persisted
//! jobs: one **manager** job per run, one **step** job per routed step, and the
//! **worker** jobs each step's executor creates. Status changes flow through an
//! in-process event bus; the progress aggregator folds child statuses into parent
//! summaries and the transport broadcaster forwards them to real-time observers.
//!
//! ## Module Organization
//!
//! - [`models`] - jobs, job definitions, log entries, child histograms
//! - [`state_machine`] - job statuses and the forward-only transition guard
//! - [`store`] - durable job store (in-memory and fjall backends)
//! - [`events`] - event bus, topics and payload builders
//! - [`registry`] - step executor interface and registry
//! - [`orchestration`] - job manager, step router, orchestrator, progress aggregator
//! - [`transport`] - fan-out to connected observers
//! - [`config`] - configuration loading and validation
//! - [`logging`] - structured logging setup
//! - [`error`] - structured error handling
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use jobtree_core::config::JobtreeConfig;
//! use jobtree_core::models::{JobDefinition, Step};
//! use jobtree_core::orchestration::OrchestrationBootstrap;
//!
//! # async fn example(executors: Vec<std::sync::Arc<dyn jobtree_core::registry::StepExecutor>>)
//! # -> Result<(), jobtree_core::error::JobError> {
//! let system = OrchestrationBootstrap::bootstrap(JobtreeConfig::from_env()?, executors).await?;
//!
//! let definition = JobDefinition::new(
//!     "nightly-crawl",
//!     vec![
//!         Step::new("crawl", "crawler"),
//!         Step::new("summarize", "agent").depends_on("crawl"),
//!     ],
//! );
//! let manager_id = system.orchestrator.execute(definition).await?;
//! let manager = system.orchestrator.wait_for_completion(&manager_id).await?;
//! println!("{} finished as {}", manager.id, manager.status);
//! # Ok(())
//! # }
//! ```
//!
//! ## Testing
//!
//! ```bash
//! cargo test --lib    # Unit tests
//! cargo test          # Unit and integration tests
//! ```

pub mod config;
pub mod constants;
pub mod error;
pub mod events;
pub mod logging;
pub mod models;
pub mod orchestration;
pub mod registry;
pub mod resilience;
pub mod state_machine;
pub mod store;
pub mod transport;
pub mod utils;

pub use config::JobtreeConfig;
pub use error::{ExecutorError, JobError, JobResult, StoreError};
pub use events::{Event, EventBus};
pub use models::{ChildStats, Job, JobDefinition, JobKind, JobLogEntry, JobSpec, LogLevel, Step};
pub use orchestration::{
    JobManager, OrchestrationBootstrap, OrchestrationSystem, Orchestrator, ProgressAggregator,
    StepContext, StepRouter,
};
pub use registry::{StepExecutor, StepExecutorRegistry};
pub use state_machine::JobStatus;
pub use store::{FjallJobStore, JobStore, MemoryJobStore};
pub use transport::{TransportBroadcaster, TransportSink};
