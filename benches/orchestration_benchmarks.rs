use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use jobtree_core::models::{ChildStats, JobDefinition, Step};
use jobtree_core::orchestration::placeholders::{resolve, PlaceholderScope};
use jobtree_core::orchestration::{derive_overall_status, ExecutionPlan};
use jobtree_core::state_machine::JobStatus;
use serde_json::{json, Map, Value};
use std::collections::HashMap;

fn benchmark_status_derivation(c: &mut Criterion) {
    let statuses: Vec<JobStatus> = (0..10_000)
        .map(|i| match i % 10 {
            0 => JobStatus::Failed,
            1 => JobStatus::Running,
            2 => JobStatus::Cancelled,
            _ => JobStatus::Completed,
        })
        .collect();

    c.bench_function("child_stats_10k", |b| {
        b.iter(|| ChildStats::from_statuses(black_box(statuses.iter().copied())))
    });

    let stats = ChildStats::from_statuses(statuses.iter().copied());
    c.bench_function("derive_overall_status", |b| {
        b.iter(|| derive_overall_status(black_box(&stats), black_box(100)))
    });
}

fn benchmark_placeholder_resolution(c: &mut Criterion) {
    let mut variables = Map::new();
    variables.insert("base_url".into(), json!("https://example.com"));
    variables.insert("depth".into(), json!(3));
    let mut crawl = Map::new();
    crawl.insert("count".into(), json!(1200));
    crawl.insert("source_id".into(), json!("src-42"));
    let outputs = HashMap::from([("crawl".to_string(), crawl)]);
    let scope = PlaceholderScope::new(&variables, &outputs);

    let config: Value = json!({
        "start_url": "{base_url}/docs",
        "max_depth": "{depth}",
        "documents": "{crawl.count}",
        "filters": [{"source": "{crawl.source_id}", "label": "run {crawl.source_id} at depth {depth}"}],
        "untouched": "{missing.value}",
    });

    c.bench_function("resolve_step_config", |b| {
        b.iter(|| resolve(black_box(&config), &scope))
    });
}

fn chain_definition(steps: usize) -> JobDefinition {
    let steps = (0..steps)
        .map(|i| {
            let step = Step::new(format!("step-{i}"), "noop");
            match i {
                0 => step,
                // Fan in on the two previous steps
                1 => step.depends_on("step-0"),
                _ => step
                    .depends_on(format!("step-{}", i - 1))
                    .depends_on(format!("step-{}", i - 2)),
            }
        })
        .collect();
    JobDefinition::new("bench", steps)
}

fn benchmark_plan_build(c: &mut Criterion) {
    let mut group = c.benchmark_group("execution_plan");
    for size in [10, 100, 500] {
        let definition = chain_definition(size);
        group.bench_with_input(BenchmarkId::from_parameter(size), &definition, |b, def| {
            b.iter(|| ExecutionPlan::build(black_box(def)))
        });
    }
    group.finish();
}

criterion_group!(
    benches,
    benchmark_status_derivation,
    benchmark_placeholder_resolution,
    benchmark_plan_build
);
criterion_main!(benches);
