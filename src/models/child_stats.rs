//! Child-state histogram used by progress aggregation.

use crate::state_machine::JobStatus;
use serde::{Deserialize, Serialize};

/// Count of children per status; each child is counted exactly once
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChildStats {
    pub pending: u64,
    pub running: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub total: u64,
}

impl ChildStats {
    pub fn from_statuses<I>(statuses: I) -> Self
    where
        I: IntoIterator<Item = JobStatus>,
    {
        let mut stats = Self::default();
        for status in statuses {
            stats.record(status);
        }
        stats
    }

    pub fn record(&mut self, status: JobStatus) {
        match status {
            JobStatus::Pending => self.pending += 1,
            JobStatus::Running => self.running += 1,
            JobStatus::Completed => self.completed += 1,
            JobStatus::Failed => self.failed += 1,
            JobStatus::Cancelled => self.cancelled += 1,
        }
        self.total += 1;
    }

    pub fn merge(&mut self, other: &ChildStats) {
        self.pending += other.pending;
        self.running += other.running;
        self.completed += other.completed;
        self.failed += other.failed;
        self.cancelled += other.cancelled;
        self.total += other.total;
    }

    pub fn active(&self) -> u64 {
        self.pending + self.running
    }

    pub fn all_terminal(&self) -> bool {
        self.active() == 0
    }

    /// Human-readable summary: `"N pending, N running, N completed, N failed"`
    pub fn progress_text(&self) -> String {
        format!(
            "{} pending, {} running, {} completed, {} failed",
            self.pending, self.running, self.completed, self.failed
        )
    }
}
