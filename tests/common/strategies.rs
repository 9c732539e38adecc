//! Proptest strategies for job statuses and worker outcomes.

use jobtree_core::state_machine::JobStatus;
use proptest::prelude::*;

pub fn status_strategy() -> impl Strategy<Value = JobStatus> {
    prop_oneof![
        Just(JobStatus::Pending),
        Just(JobStatus::Running),
        Just(JobStatus::Completed),
        Just(JobStatus::Failed),
        Just(JobStatus::Cancelled),
    ]
}

pub fn terminal_status_strategy() -> impl Strategy<Value = JobStatus> {
    prop_oneof![
        3 => Just(JobStatus::Completed),
        1 => Just(JobStatus::Failed),
        1 => Just(JobStatus::Cancelled),
    ]
}

/// A sequence of status writes against one job
pub fn status_writes_strategy() -> impl Strategy<Value = Vec<JobStatus>> {
    prop::collection::vec(status_strategy(), 1..12)
}

/// Final worker statuses plus a delivery order containing duplicates: each entry of the
/// order is an index into the worker list
pub fn worker_outcomes_strategy() -> impl Strategy<Value = (Vec<JobStatus>, Vec<usize>)> {
    prop::collection::vec(terminal_status_strategy(), 1..8).prop_flat_map(|outcomes| {
        let len = outcomes.len();
        let order = prop::collection::vec(0..len, len..len * 3).prop_shuffle();
        (Just(outcomes), order)
    })
}
