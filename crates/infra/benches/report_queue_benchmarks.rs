use std::sync::Arc;

use chrono::Utc;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use tokio::runtime::Runtime;

use playreport_ai::{ScriptedReportGenerator, SessionFacts};
use playreport_core::SessionId;
use playreport_infra::jobs::{
    InMemoryJobStore, JobStore, ReportJobRunner, RetryPolicy, RunRequest, RunnerSettings,
};
use playreport_infra::sessions::InMemorySessionFacts;

fn runtime() -> Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

async fn seeded_store(jobs: usize) -> Arc<InMemoryJobStore> {
    let store = InMemoryJobStore::arc();
    for _ in 0..jobs {
        store.enqueue(SessionId::new(), 5).await.unwrap();
    }
    store
}

/// Claim + release over a queue of 1k jobs, per batch size.
fn bench_claim_release(c: &mut Criterion) {
    let rt = runtime();
    let store = rt.block_on(seeded_store(1_000));

    let mut group = c.benchmark_group("claim_release");
    for batch in [1usize, 3, 10] {
        group.throughput(Throughput::Elements(batch as u64));
        group.bench_with_input(BenchmarkId::from_parameter(batch), &batch, |b, &batch| {
            b.iter(|| {
                rt.block_on(async {
                    let claimed = store.claim(batch, "bench").await.unwrap();
                    black_box(store.release(&claimed).await.unwrap());
                })
            });
        });
    }
    group.finish();
}

/// Full runs against the scripted generator: claim, execute, record.
fn bench_run_jobs(c: &mut Criterion) {
    let rt = runtime();

    let mut group = c.benchmark_group("run_jobs");
    group.throughput(Throughput::Elements(10));
    group.bench_function("batch_of_10", |b| {
        b.iter_batched(
            || {
                rt.block_on(async {
                    let store = InMemoryJobStore::arc();
                    let sessions = InMemorySessionFacts::arc();
                    for _ in 0..10 {
                        let session_id = SessionId::new();
                        sessions.insert(SessionFacts::new(session_id, "u", "d", Utc::now()));
                        store.enqueue(session_id, 5).await.unwrap();
                    }
                    ReportJobRunner::new(
                        store,
                        sessions,
                        Arc::new(ScriptedReportGenerator::succeeding()),
                        RunnerSettings::default(),
                    )
                })
            },
            |runner| {
                rt.block_on(async {
                    black_box(runner.run_jobs(RunRequest::new(10, "bench")).await.unwrap())
                })
            },
            criterion::BatchSize::SmallInput,
        );
    });
    group.finish();
}

fn bench_backoff(c: &mut Criterion) {
    let policy = RetryPolicy::default();
    c.bench_function("backoff_decide", |b| {
        b.iter(|| {
            for attempts in 0..20u32 {
                black_box(policy.decide(black_box(attempts), 20));
            }
        })
    });
}

criterion_group!(benches, bench_claim_release, bench_run_jobs, bench_backoff);
criterion_main!(benches);
