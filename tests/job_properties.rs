//! Property tests for the job lifecycle: forward-only status, order-independent
//! aggregation, hierarchy shape and log ordering.

mod common;

use common::*;
use jobtree_core::constants::metadata as meta;
use jobtree_core::error::JobError;
use jobtree_core::events::EventBus;
use jobtree_core::models::{ChildStats, Job, JobDefinition, JobKind, JobSpec, LogLevel, OnError, Step};
use jobtree_core::orchestration::{derive_overall_status, JobManager, ProgressAggregator};
use jobtree_core::state_machine::JobStatus;
use jobtree_core::store::MemoryJobStore;
use proptest::prelude::*;
use serde_json::json;
use std::sync::Arc;
use tokio_test::assert_ok;

fn job_manager() -> Arc<JobManager> {
    Arc::new(JobManager::new(
        Arc::new(MemoryJobStore::new()),
        Arc::new(EventBus::default()),
    ))
}

fn rank(status: JobStatus) -> u8 {
    match status {
        JobStatus::Pending => 0,
        JobStatus::Running => 1,
        _ => 2,
    }
}

async fn step_under_manager(jobs: &JobManager, on_error: OnError) -> (Job, Job) {
    let manager = jobs
        .create_job(JobKind::Manager, None, JobSpec::new("def"))
        .await
        .unwrap();
    let step = jobs
        .create_job(
            JobKind::Step,
            Some(&manager.id),
            JobSpec::new("crawl")
                .with_metadata(meta::STEP_NAME, "crawl")
                .with_metadata(meta::ON_ERROR, on_error.as_str()),
        )
        .await
        .unwrap();
    (manager, step)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Property: a job's status never moves backwards and never leaves a terminal status
    #[test]
    fn status_writes_are_forward_only(writes in status_writes_strategy()) {
        let observed = tokio_test::block_on(async {
            let jobs = job_manager();
            let (_, step) = step_under_manager(&jobs, OnError::Fail).await;
            let worker = jobs
                .create_job(JobKind::Worker, Some(&step.id), JobSpec::new("w"))
                .await
                .unwrap();

            let mut observed = Vec::new();
            for status in &writes {
                let update = jobs.update_status(&worker.id, *status, None).await.unwrap();
                observed.push((update.is_applied(), update.job().status));
            }
            observed
        });

        let mut expected = JobStatus::Pending;
        for (status, (applied, stored)) in writes.iter().zip(observed) {
            let should_apply = !expected.is_terminal() && rank(*status) > rank(expected);
            if should_apply {
                expected = *status;
            }
            prop_assert_eq!(applied, should_apply, "write {}", status);
            prop_assert_eq!(stored, expected);
        }
    }

    /// Property: the parent's final status depends only on the children's final
    /// statuses, not on delivery order or duplicate deliveries
    #[test]
    fn aggregation_is_order_independent((outcomes, order) in worker_outcomes_strategy()) {
        let (step, manager) = tokio_test::block_on(async {
            let jobs = job_manager();
            let (manager, step) = step_under_manager(&jobs, OnError::Fail).await;
            let aggregator = ProgressAggregator::new(Arc::clone(&jobs));

            let mut workers = Vec::new();
            for i in 0..outcomes.len() {
                let worker = jobs
                    .create_job(JobKind::Worker, Some(&step.id), JobSpec::new(format!("w{i}")))
                    .await
                    .unwrap();
                workers.push(worker.id);
            }
            aggregator.monitor(&step.id).await.unwrap();

            for i in order.iter().copied().chain(0..outcomes.len()) {
                jobs.update_status(&workers[i], outcomes[i], None).await.unwrap();
                aggregator.refresh(&step.id).await.unwrap();
                aggregator.refresh(&manager.id).await.unwrap();
            }
            aggregator.refresh(&step.id).await.unwrap();

            (
                jobs.get_job(&step.id).await.unwrap(),
                jobs.get_job(&manager.id).await.unwrap(),
            )
        });

        let stats = ChildStats::from_statuses(outcomes.iter().copied());
        let expected = derive_overall_status(&stats, 0);
        prop_assert_eq!(step.status, expected);
        prop_assert_eq!(&step.metadata[meta::CHILD_STATS], &serde_json::to_value(stats).unwrap());
        // The manager is never monitored here, so it must not be finalized
        prop_assert!(!manager.is_terminal());
    }

    /// Property: every finished tree is manager -> steps -> workers with a shared root
    #[test]
    fn orchestrated_trees_keep_their_shape(counts in prop::collection::vec(0u64..4, 1..4)) {
        let tree = tokio_test::block_on(async {
            let harness = TestHarness::new().await;
            let steps = counts
                .iter()
                .enumerate()
                .map(|(i, count)| Step::new(format!("s{i}"), "echo").with_config(json!({"count": count})))
                .collect();
            let manager_id = harness
                .system
                .orchestrator
                .execute(JobDefinition::new("shape", steps))
                .await
                .unwrap();
            harness.wait(&manager_id).await;
            harness.tree(&manager_id).await
        });

        let manager = &tree[0];
        prop_assert_eq!(manager.kind, JobKind::Manager);
        prop_assert!(manager.parent_id.is_none() && manager.manager_id.is_none());
        let total_workers: u64 = counts.iter().sum();
        prop_assert_eq!(tree.len() as u64, 1 + counts.len() as u64 + total_workers);

        for job in &tree[1..] {
            prop_assert_eq!(job.manager_id.as_deref(), Some(manager.id.as_str()));
            let parent = tree
                .iter()
                .find(|p| Some(p.id.as_str()) == job.parent_id.as_deref())
                .unwrap();
            let expected_parent = match job.kind {
                JobKind::Step => JobKind::Manager,
                JobKind::Worker => JobKind::Step,
                JobKind::Manager => unreachable!("managers are roots"),
            };
            prop_assert_eq!(parent.kind, expected_parent);
            prop_assert!(job.is_terminal());
        }
    }
}

#[tokio::test]
async fn test_hierarchy_violations_are_rejected() {
    let jobs = job_manager();
    let (manager, step) = step_under_manager(&jobs, OnError::Fail).await;
    let worker = jobs
        .create_job(JobKind::Worker, Some(&step.id), JobSpec::new("w"))
        .await
        .unwrap();

    let cases = [
        (JobKind::Worker, Some(manager.id.as_str())),
        (JobKind::Step, Some(worker.id.as_str())),
        (JobKind::Step, None),
        (JobKind::Manager, Some(manager.id.as_str())),
    ];
    for (kind, parent) in cases {
        let result = jobs.create_job(kind, parent, JobSpec::new("bad")).await;
        assert!(
            matches!(result, Err(JobError::Validation(_))),
            "{kind} under {parent:?} was accepted"
        );
    }

    assert!(matches!(
        jobs.create_job(JobKind::Worker, Some("missing"), JobSpec::new("w")).await,
        Err(JobError::NotFound { .. })
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_log_appends_stay_ordered() {
    let jobs = job_manager();
    let (manager, step) = step_under_manager(&jobs, OnError::Fail).await;

    // Two writers per job so appends race both within and across jobs
    let writers: Vec<_> = (0..4)
        .map(|writer| {
            let jobs = Arc::clone(&jobs);
            let job_id = if writer % 2 == 0 { step.id.clone() } else { manager.id.clone() };
            tokio::spawn(async move {
                for i in 0..20 {
                    jobs.add_job_log(&job_id, LogLevel::Info, format!("writer {writer} line {i}"))
                        .await?;
                }
                Ok::<_, JobError>(())
            })
        })
        .collect();
    for writer in writers {
        assert_ok!(assert_ok!(writer.await));
    }

    let logs = jobs.get_job_logs(&step.id, None).await.unwrap();
    assert_eq!(logs.len(), 40);
    for pair in logs.windows(2) {
        assert!(pair[0].sequence < pair[1].sequence);
        assert!(pair[0].timestamp < pair[1].timestamp);
    }
    assert!(logs.iter().all(|l| l.step_name.as_deref() == Some("crawl")));

    let manager_logs = jobs.get_job_logs(&manager.id, None).await.unwrap();
    // Plus the "Status changed: running" entry from the first step's creation
    assert_eq!(manager_logs.len(), 41);
    assert!(manager_logs
        .windows(2)
        .all(|pair| pair[0].sequence < pair[1].sequence && pair[0].timestamp < pair[1].timestamp));

    let tail = jobs.get_job_logs(&step.id, Some(10)).await.unwrap();
    assert_eq!(tail.len(), 10);
    assert_eq!(tail.last(), logs.last());
}
