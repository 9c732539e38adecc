//! Error types for the job orchestration core.
//!
//! Each layer owns a narrow error enum ([`StoreError`], [`EventError`], [`RegistryError`])
//! and everything converges into [`JobError`], the taxonomy surfaced by the job manager,
//! step router and orchestrator.

use thiserror::Error;

/// Errors raised by a [`JobStore`](crate::store::JobStore) backend.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Another writer committed first; the caller should re-read and retry.
    #[error("Write conflict on key {key}: expected version {expected}, found {actual}")]
    Conflict {
        key: String,
        expected: u64,
        actual: u64,
    },

    #[error("Record already exists: {key}")]
    AlreadyExists { key: String },

    #[error("Record not found: {key}")]
    Missing { key: String },

    #[error("Storage backend error: {0}")]
    Backend(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Contention did not resolve inside the retry budget.
    #[error("Operation {operation} failed after {attempts} attempts: {reason}")]
    RetriesExhausted {
        operation: String,
        attempts: u32,
        reason: String,
    },
}

impl StoreError {
    /// Whether the error is a transient contention failure worth retrying.
    pub fn is_contention(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

impl From<fjall::Error> for StoreError {
    fn from(err: fjall::Error) -> Self {
        StoreError::Backend(err.to_string())
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Errors raised by the event bus.
#[derive(Debug, Error)]
pub enum EventError {
    #[error("Event handler {subscriber} failed for topic {topic}: {reason}")]
    HandlerFailed {
        subscriber: String,
        topic: String,
        reason: String,
    },

    #[error("Subscriber {subscriber} queue is closed")]
    QueueClosed { subscriber: String },

    #[error("Invalid payload for topic {topic}: {reason}")]
    InvalidPayload { topic: String, reason: String },
}

/// Errors raised by a transport sink while delivering to an observer.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum TransportError {
    #[error("Transport sink {sink} is closed")]
    Closed { sink: String },

    #[error("Transport sink {sink} failed to send: {reason}")]
    Send { sink: String, reason: String },

    #[error("Failed to encode transport message: {0}")]
    Encode(String),
}

/// Errors raised while registering step executors.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum RegistryError {
    #[error("Step executor already registered for type '{step_type}'")]
    Duplicate { step_type: String },

    #[error("Step executor type tag must not be empty")]
    EmptyTypeTag,
}

/// Error surfaced by a step executor, attributed to the step and job it was running for.
#[derive(Debug, Error, Clone, PartialEq)]
#[error("step '{step_name}' (job {job_id}) failed: {message}")]
pub struct ExecutorError {
    pub step_name: String,
    pub job_id: String,
    pub message: String,
}

impl ExecutorError {
    pub fn new(
        step_name: impl Into<String>,
        job_id: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            step_name: step_name.into(),
            job_id: job_id.into(),
            message: message.into(),
        }
    }
}

/// Top-level error taxonomy of the orchestration core.
#[derive(Debug, Error)]
pub enum JobError {
    /// Bad job definition or step config; raised before any job is created.
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("No step executor registered for type '{step_type}'")]
    NoExecutor { step_type: String },

    #[error("Job not found: {job_id}")]
    NotFound { job_id: String },

    #[error("Storage error: {0}")]
    Storage(#[from] StoreError),

    #[error("Executor error: {0}")]
    Executor(#[from] ExecutorError),

    /// The job tree was cancelled; no new work may be attached to it.
    #[error("Job tree cancelled: {job_id}")]
    Cancelled { job_id: String },

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl JobError {
    pub fn validation(msg: impl Into<String>) -> Self {
        JobError::Validation(msg.into())
    }

    pub fn not_found(job_id: impl Into<String>) -> Self {
        JobError::NotFound {
            job_id: job_id.into(),
        }
    }

    /// Executor error carried by this error, if any.
    pub fn as_executor_error(&self) -> Option<&ExecutorError> {
        match self {
            JobError::Executor(err) => Some(err),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for JobError {
    fn from(error: serde_json::Error) -> Self {
        JobError::Storage(StoreError::Serialization(error))
    }
}

pub type JobResult<T> = Result<T, JobError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_executor_error_display_carries_attribution() {
        let err = ExecutorError::new("crawl", "job-1", "connection refused");
        assert_eq!(
            err.to_string(),
            "step 'crawl' (job job-1) failed: connection refused"
        );

        let wrapped: JobError = err.clone().into();
        assert_eq!(wrapped.as_executor_error(), Some(&err));
    }

    #[test]
    fn test_contention_classification() {
        let conflict = StoreError::Conflict {
            key: "job:1".to_string(),
            expected: 1,
            actual: 2,
        };
        assert!(conflict.is_contention());
        assert!(!StoreError::Backend("disk full".to_string()).is_contention());
    }
}
