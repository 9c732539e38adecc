pub mod child_stats;
pub mod job;
pub mod job_definition;
pub mod job_log;

// Re-export core models for easy access
pub use child_stats::ChildStats;
pub use job::{Job, JobKind, JobSpec};
pub use job_definition::{ErrorTolerance, FailureAction, JobDefinition, OnError, Step};
pub use job_log::{JobLogEntry, LogLevel};
