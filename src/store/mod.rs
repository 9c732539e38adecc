//! # Durable Job Store
//!
//! Key-value persistence for job records and append-only per-job log streams.
//!
//! Every backend provides per-key write serialization through an optimistic version
//! check: [`JobStore::update_job`] commits only when the stored `version` still equals
//! the version the caller read, and fails with [`StoreError::Conflict`] otherwise.
//! Callers wrap read-modify-write cycles in [`retry::with_contention_retry`], which
//! re-reads and retries with bounded exponential backoff.
//!
//! - [`MemoryJobStore`]: `dashmap` backed, for tests and ephemeral runs
//! - [`FjallJobStore`]: `fjall` LSM keyspace, survives process restarts
//!
//! [`StoreError::Conflict`]: crate::error::StoreError::Conflict

pub mod fjall;
pub mod memory;
pub mod query;
pub mod retry;

use crate::error::StoreResult;
use crate::models::{Job, JobLogEntry};
use async_trait::async_trait;
use std::fmt::Debug;

pub use self::fjall::FjallJobStore;
pub use memory::MemoryJobStore;
pub use query::{JobListOptions, ParentFilter, SortOrder};
pub use retry::{with_contention_retry, StoreRetryPolicy};

/// Persistence boundary for job records and job logs
#[async_trait]
pub trait JobStore: Send + Sync + Debug {
    /// Insert a new record; fails with `AlreadyExists` when the id is taken
    async fn insert_job(&self, job: &Job) -> StoreResult<()>;

    async fn get_job(&self, job_id: &str) -> StoreResult<Option<Job>>;

    /// Compare-and-swap write. Commits `job` with `version = expected_version + 1` when
    /// the stored version equals `expected_version` and returns the committed record.
    async fn update_job(&self, job: &Job, expected_version: u64) -> StoreResult<Job>;

    /// Direct children of `parent_id`, oldest first. Each record is read atomically.
    async fn list_children(&self, parent_id: &str) -> StoreResult<Vec<Job>>;

    /// Jobs without a parent (manager jobs), oldest first
    async fn list_root_jobs(&self) -> StoreResult<Vec<Job>>;

    /// Every job record, in no particular order
    async fn scan_jobs(&self) -> StoreResult<Vec<Job>>;

    /// Jobs matching `options`, ordered and paged as it requests. Reads through the
    /// parent indexes when the listing is scoped to roots or one parent.
    async fn list_jobs(&self, options: &JobListOptions) -> StoreResult<Vec<Job>> {
        let candidates = match &options.parent {
            ParentFilter::Any => self.scan_jobs().await?,
            ParentFilter::Root => self.list_root_jobs().await?,
            ParentFilter::Children(parent_id) => self.list_children(parent_id).await?,
        };
        Ok(options.apply(candidates))
    }

    /// Number of jobs matching the filters in `options`; paging is ignored
    async fn count_jobs(&self, options: &JobListOptions) -> StoreResult<usize> {
        let unpaged = options.clone().with_page(None, 0);
        Ok(self.list_jobs(&unpaged).await?.len())
    }

    /// Append to the job's log stream, assigning the next sequence number
    async fn append_log(&self, entry: JobLogEntry) -> StoreResult<JobLogEntry>;

    /// Log entries in append order; with a limit, the most recent `limit` entries
    async fn get_logs(&self, job_id: &str, limit: Option<usize>) -> StoreResult<Vec<JobLogEntry>>;
}

pub(crate) fn sort_oldest_first(jobs: &mut [Job]) {
    jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
}

pub(crate) fn tail<T>(mut items: Vec<T>, limit: Option<usize>) -> Vec<T> {
    if let Some(limit) = limit {
        if items.len() > limit {
            items.drain(..items.len() - limit);
        }
    }
    items
}
