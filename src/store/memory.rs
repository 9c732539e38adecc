//! In-process job store backed by `dashmap`.

use super::{sort_oldest_first, tail, JobStore};
use crate::error::{StoreError, StoreResult};
use crate::models::{Job, JobLogEntry};
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::sync::Arc;

/// Volatile [`JobStore`]; cloning shares the underlying maps
#[derive(Debug, Clone, Default)]
pub struct MemoryJobStore {
    jobs: Arc<DashMap<String, Job>>,
    children: Arc<DashMap<String, Vec<String>>>,
    roots: Arc<RwLock<Vec<String>>>,
    logs: Arc<DashMap<String, Vec<JobLogEntry>>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn job_count(&self) -> usize {
        self.jobs.len()
    }

    fn collect(&self, ids: &[String]) -> Vec<Job> {
        let mut jobs: Vec<Job> = ids
            .iter()
            .filter_map(|id| self.jobs.get(id).map(|job| job.value().clone()))
            .collect();
        sort_oldest_first(&mut jobs);
        jobs
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn insert_job(&self, job: &Job) -> StoreResult<()> {
        match self.jobs.entry(job.id.clone()) {
            Entry::Occupied(_) => {
                return Err(StoreError::AlreadyExists {
                    key: job.id.clone(),
                })
            }
            Entry::Vacant(slot) => {
                slot.insert(job.clone());
            }
        }

        match &job.parent_id {
            Some(parent_id) => self
                .children
                .entry(parent_id.clone())
                .or_default()
                .push(job.id.clone()),
            None => self.roots.write().push(job.id.clone()),
        }
        Ok(())
    }

    async fn get_job(&self, job_id: &str) -> StoreResult<Option<Job>> {
        Ok(self.jobs.get(job_id).map(|job| job.value().clone()))
    }

    async fn update_job(&self, job: &Job, expected_version: u64) -> StoreResult<Job> {
        let mut stored = self.jobs.get_mut(&job.id).ok_or_else(|| StoreError::Missing {
            key: job.id.clone(),
        })?;

        if stored.version != expected_version {
            return Err(StoreError::Conflict {
                key: job.id.clone(),
                expected: expected_version,
                actual: stored.version,
            });
        }

        let mut committed = job.clone();
        committed.version = expected_version + 1;
        *stored = committed.clone();
        Ok(committed)
    }

    async fn list_children(&self, parent_id: &str) -> StoreResult<Vec<Job>> {
        let ids = self
            .children
            .get(parent_id)
            .map(|ids| ids.value().clone())
            .unwrap_or_default();
        Ok(self.collect(&ids))
    }

    async fn list_root_jobs(&self) -> StoreResult<Vec<Job>> {
        let ids = self.roots.read().clone();
        Ok(self.collect(&ids))
    }

    async fn scan_jobs(&self) -> StoreResult<Vec<Job>> {
        Ok(self.jobs.iter().map(|job| job.value().clone()).collect())
    }

    async fn append_log(&self, mut entry: JobLogEntry) -> StoreResult<JobLogEntry> {
        let mut stream = self.logs.entry(entry.job_id.clone()).or_default();
        entry.sequence = stream.len() as u64;
        stream.push(entry.clone());
        Ok(entry)
    }

    async fn get_logs(&self, job_id: &str, limit: Option<usize>) -> StoreResult<Vec<JobLogEntry>> {
        let entries = self
            .logs
            .get(job_id)
            .map(|stream| stream.value().clone())
            .unwrap_or_default();
        Ok(tail(entries, limit))
    }
}
