//! Durable job store on a `fjall` LSM keyspace.
//!
//! Layout:
//!
//! | partition | key | value |
//! |---|---|---|
//! | `jobs` | `{job_id}` | JSON [`Job`] |
//! | `job_index` | `child/{parent_id}/{child_id}`, `root/{job_id}` | empty |
//! | `job_logs` | `{job_id}/{sequence:020}` | JSON [`JobLogEntry`] |
//!
//! fjall serializes writes per partition but offers no compare-and-swap, so writers for
//! the same key are serialized through a striped lock and the version check happens
//! under that lock.
//!
//! fjall's API is synchronous and `sync_writes` adds an fsync per write, so every trait
//! method runs on tokio's blocking pool against a clone of the store handle.

use super::{sort_oldest_first, tail, JobStore};
use crate::error::{StoreError, StoreResult};
use crate::models::{Job, JobLogEntry};
use async_trait::async_trait;
use dashmap::DashMap;
use fjall::{Config as FjallConfig, Keyspace, PartitionHandle, PersistMode};
use parking_lot::Mutex;
use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

const LOCK_STRIPES: usize = 64;
const JOBS_PARTITION: &str = "jobs";
const INDEX_PARTITION: &str = "job_index";
const LOGS_PARTITION: &str = "job_logs";

/// Persistent [`JobStore`]; cloning shares the keyspace
#[derive(Clone)]
pub struct FjallJobStore {
    keyspace: Keyspace,
    jobs: PartitionHandle,
    index: PartitionHandle,
    logs: PartitionHandle,
    stripes: Arc<Vec<Mutex<()>>>,
    /// Next log sequence per job, loaded lazily from the tail of the stream
    log_sequences: Arc<DashMap<String, u64>>,
    sync_writes: bool,
}

impl fmt::Debug for FjallJobStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FjallJobStore")
            .field("sync_writes", &self.sync_writes)
            .finish()
    }
}

impl FjallJobStore {
    /// Open (or create) the keyspace at `path`
    pub fn open<P: AsRef<Path>>(path: P) -> StoreResult<Self> {
        let keyspace = FjallConfig::new(path.as_ref()).open()?;
        let jobs = keyspace.open_partition(JOBS_PARTITION, Default::default())?;
        let index = keyspace.open_partition(INDEX_PARTITION, Default::default())?;
        let logs = keyspace.open_partition(LOGS_PARTITION, Default::default())?;

        info!(path = %path.as_ref().display(), "Opened fjall job store");

        Ok(Self {
            keyspace,
            jobs,
            index,
            logs,
            stripes: Arc::new((0..LOCK_STRIPES).map(|_| Mutex::new(())).collect()),
            log_sequences: Arc::new(DashMap::new()),
            sync_writes: false,
        })
    }

    /// fsync the journal after every committed write
    pub fn with_sync_writes(mut self, sync_writes: bool) -> Self {
        self.sync_writes = sync_writes;
        self
    }

    /// Flush the journal to disk
    pub fn persist(&self) -> StoreResult<()> {
        self.keyspace.persist(PersistMode::SyncAll)?;
        Ok(())
    }

    fn stripe(&self, key: &str) -> &Mutex<()> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        &self.stripes[(hasher.finish() as usize) % self.stripes.len()]
    }

    /// Run a synchronous backend call on the blocking pool
    async fn blocking<T, F>(&self, op: F) -> StoreResult<T>
    where
        F: FnOnce(&FjallJobStore) -> StoreResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let store = self.clone();
        tokio::task::spawn_blocking(move || op(&store))
            .await
            .map_err(|err| StoreError::Backend(format!("blocking store task failed: {err}")))?
    }

    fn after_write(&self) -> StoreResult<()> {
        if self.sync_writes {
            self.persist()?;
        }
        Ok(())
    }

    fn read_job(&self, job_id: &str) -> StoreResult<Option<Job>> {
        match self.jobs.get(job_id)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn read_indexed(&self, prefix: &str) -> StoreResult<Vec<Job>> {
        let mut jobs = Vec::new();
        for item in self.index.prefix(prefix) {
            let (key, _) = item?;
            let key = String::from_utf8_lossy(&key);
            let Some(job_id) = key.strip_prefix(prefix) else {
                continue;
            };
            if let Some(job) = self.read_job(job_id)? {
                jobs.push(job);
            }
        }
        sort_oldest_first(&mut jobs);
        Ok(jobs)
    }

    fn next_log_sequence(&self, job_id: &str) -> StoreResult<u64> {
        if let Some(next) = self.log_sequences.get(job_id) {
            return Ok(*next);
        }

        let prefix = format!("{job_id}/");
        let next = match self.logs.prefix(&prefix).next_back() {
            Some(item) => {
                let (key, _) = item?;
                let key = String::from_utf8_lossy(&key);
                key.strip_prefix(&prefix)
                    .and_then(|seq| seq.parse::<u64>().ok())
                    .map(|seq| seq + 1)
                    .unwrap_or(0)
            }
            None => 0,
        };
        debug!(job_id, next_sequence = next, "Loaded log sequence");
        Ok(next)
    }
}

fn log_key(job_id: &str, sequence: u64) -> String {
    format!("{job_id}/{sequence:020}")
}

impl FjallJobStore {
    fn insert_job_sync(&self, job: &Job) -> StoreResult<()> {
        let _guard = self.stripe(&job.id).lock();

        if self.jobs.get(&job.id)?.is_some() {
            return Err(StoreError::AlreadyExists {
                key: job.id.clone(),
            });
        }

        let index_key = match &job.parent_id {
            Some(parent_id) => format!("child/{parent_id}/{}", job.id),
            None => format!("root/{}", job.id),
        };

        let mut batch = self.keyspace.batch();
        batch.insert(&self.jobs, job.id.as_bytes(), serde_json::to_vec(job)?);
        batch.insert(&self.index, index_key.as_bytes(), b"");
        batch.commit()?;
        self.after_write()
    }

    fn update_job_sync(&self, job: &Job, expected_version: u64) -> StoreResult<Job> {
        let _guard = self.stripe(&job.id).lock();

        let stored = self.read_job(&job.id)?.ok_or_else(|| StoreError::Missing {
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
        self.jobs
            .insert(job.id.as_bytes(), serde_json::to_vec(&committed)?)?;
        self.after_write()?;
        Ok(committed)
    }

    fn scan_jobs_sync(&self) -> StoreResult<Vec<Job>> {
        let mut jobs = Vec::new();
        for item in self.jobs.iter() {
            let (_, value) = item?;
            jobs.push(serde_json::from_slice::<Job>(&value)?);
        }
        Ok(jobs)
    }

    fn append_log_sync(&self, mut entry: JobLogEntry) -> StoreResult<JobLogEntry> {
        let _guard = self.stripe(&format!("log/{}", entry.job_id)).lock();

        entry.sequence = self.next_log_sequence(&entry.job_id)?;
        self.logs.insert(
            log_key(&entry.job_id, entry.sequence).as_bytes(),
            serde_json::to_vec(&entry)?,
        )?;
        self.log_sequences
            .insert(entry.job_id.clone(), entry.sequence + 1);
        self.after_write()?;
        Ok(entry)
    }

    fn get_logs_sync(&self, job_id: &str, limit: Option<usize>) -> StoreResult<Vec<JobLogEntry>> {
        let prefix = format!("{job_id}/");
        let mut entries = Vec::new();
        for item in self.logs.prefix(&prefix) {
            let (_, value) = item?;
            entries.push(serde_json::from_slice::<JobLogEntry>(&value)?);
        }
        Ok(tail(entries, limit))
    }
}

#[async_trait]
impl JobStore for FjallJobStore {
    async fn insert_job(&self, job: &Job) -> StoreResult<()> {
        let job = job.clone();
        self.blocking(move |store| store.insert_job_sync(&job)).await
    }

    async fn get_job(&self, job_id: &str) -> StoreResult<Option<Job>> {
        let job_id = job_id.to_string();
        self.blocking(move |store| store.read_job(&job_id)).await
    }

    async fn update_job(&self, job: &Job, expected_version: u64) -> StoreResult<Job> {
        let job = job.clone();
        self.blocking(move |store| store.update_job_sync(&job, expected_version))
            .await
    }

    async fn list_children(&self, parent_id: &str) -> StoreResult<Vec<Job>> {
        let prefix = format!("child/{parent_id}/");
        self.blocking(move |store| store.read_indexed(&prefix)).await
    }

    async fn list_root_jobs(&self) -> StoreResult<Vec<Job>> {
        self.blocking(|store| store.read_indexed("root/")).await
    }

    async fn scan_jobs(&self) -> StoreResult<Vec<Job>> {
        self.blocking(|store| store.scan_jobs_sync()).await
    }

    async fn append_log(&self, entry: JobLogEntry) -> StoreResult<JobLogEntry> {
        self.blocking(move |store| store.append_log_sync(entry)).await
    }

    async fn get_logs(&self, job_id: &str, limit: Option<usize>) -> StoreResult<Vec<JobLogEntry>> {
        let job_id = job_id.to_string();
        self.blocking(move |store| store.get_logs_sync(&job_id, limit))
            .await
    }
}
