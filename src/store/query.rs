//! Filtered, ordered and paged job listings.

use super::sort_oldest_first;
use crate::models::{Job, JobKind};
use crate::state_machine::JobStatus;

/// Which part of the hierarchy a listing covers
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ParentFilter {
    #[default]
    Any,
    /// Jobs without a parent
    Root,
    /// Direct children of one job
    Children(String),
}

/// Ordering by creation time; ties break on the job id
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SortOrder {
    #[default]
    OldestFirst,
    NewestFirst,
}

/// Listing query accepted by [`super::JobStore::list_jobs`]
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobListOptions {
    pub parent: ParentFilter,
    pub kind: Option<JobKind>,
    pub status: Option<JobStatus>,
    pub order: SortOrder,
    /// Maximum number of jobs returned; `None` returns the rest
    pub limit: Option<usize>,
    /// Matching jobs skipped before the page starts
    pub offset: usize,
}

impl JobListOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Root jobs only
    pub fn managers() -> Self {
        Self {
            parent: ParentFilter::Root,
            ..Self::default()
        }
    }

    pub fn children_of(parent_id: impl Into<String>) -> Self {
        Self {
            parent: ParentFilter::Children(parent_id.into()),
            ..Self::default()
        }
    }

    pub fn with_kind(mut self, kind: JobKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn with_status(mut self, status: JobStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn newest_first(mut self) -> Self {
        self.order = SortOrder::NewestFirst;
        self
    }

    pub fn with_page(mut self, limit: Option<usize>, offset: usize) -> Self {
        self.limit = limit;
        self.offset = offset;
        self
    }

    /// Whether `job` passes the parent, kind and status filters
    pub fn matches(&self, job: &Job) -> bool {
        let parent_ok = match &self.parent {
            ParentFilter::Any => true,
            ParentFilter::Root => job.parent_id.is_none(),
            ParentFilter::Children(parent_id) => job.parent_id.as_deref() == Some(parent_id.as_str()),
        };
        parent_ok
            && self.kind.map_or(true, |kind| job.kind == kind)
            && self.status.map_or(true, |status| job.status == status)
    }

    /// Filter, order and page a candidate set
    pub fn apply(&self, candidates: Vec<Job>) -> Vec<Job> {
        let mut jobs: Vec<Job> = candidates.into_iter().filter(|j| self.matches(j)).collect();
        sort_oldest_first(&mut jobs);
        if self.order == SortOrder::NewestFirst {
            jobs.reverse();
        }
        jobs.into_iter()
            .skip(self.offset)
            .take(self.limit.unwrap_or(usize::MAX))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::JobSpec;
    use chrono::{Duration, Utc};

    fn managers(count: i64) -> Vec<Job> {
        let start = Utc::now();
        (0..count)
            .map(|i| {
                let mut job = Job::new(JobKind::Manager, JobSpec::new(format!("m{i}")), None);
                job.created_at = start + Duration::seconds(i);
                job
            })
            .collect()
    }

    #[test]
    fn test_newest_first_pages() {
        let jobs = managers(5);
        let options = JobListOptions::managers().newest_first().with_page(Some(2), 1);
        let names: Vec<String> = options.apply(jobs).into_iter().map(|j| j.name).collect();
        assert_eq!(names, vec!["m3", "m2"]);
    }

    #[test]
    fn test_offset_past_end_is_empty() {
        let options = JobListOptions::managers().with_page(Some(10), 7);
        assert!(options.apply(managers(5)).is_empty());
    }

    #[test]
    fn test_filters_combine() {
        let mut jobs = managers(3);
        jobs[1].status = JobStatus::Completed;
        let step = Job::new(JobKind::Step, JobSpec::new("s"), Some(&jobs[0]));
        jobs.push(step.clone());

        let completed = JobListOptions::new().with_status(JobStatus::Completed).apply(jobs.clone());
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].name, "m1");

        let steps = JobListOptions::new().with_kind(JobKind::Step).apply(jobs.clone());
        assert_eq!(steps.len(), 1);

        let children = JobListOptions::children_of(jobs[0].id.clone()).apply(jobs.clone());
        assert_eq!(children[0].id, step.id);

        assert_eq!(JobListOptions::managers().apply(jobs).len(), 3);
    }
}
