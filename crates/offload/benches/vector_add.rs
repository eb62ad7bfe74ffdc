//! Vector-add benchmarks
//!
//! Compares the single-thread baseline launch with the parallel launch over
//! the same routine, including allocation and free.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use tokio::runtime::Runtime as TokioRuntime;

use offload::prelude::*;
use offload::vector_add::{self, VectorAddOptions};

fn bench_launch_policy(c: &mut Criterion) {
    let mut group = c.benchmark_group("vector_add");
    group.sample_size(20);
    group.measurement_time(std::time::Duration::from_secs(5));

    let rt = TokioRuntime::new().unwrap();
    let runtime = rt.block_on(Offload::new()).unwrap();

    for len in [1usize << 12, 1 << 16, 1 << 20] {
        for policy in [LaunchPolicy::SingleThread, LaunchPolicy::parallel()] {
            let options = VectorAddOptions {
                len,
                policy,
                sync_timeout: None,
                verify: false,
            };

            group.bench_with_input(BenchmarkId::new(policy.to_string(), len), &options, |b, options| {
                b.iter(|| {
                    rt.block_on(async {
                        let report = vector_add::run(&runtime, options).await.unwrap();
                        black_box(report);
                    });
                });
            });
        }
    }

    group.finish();
}

fn bench_block_size(c: &mut Criterion) {
    let mut group = c.benchmark_group("vector_add_block_size");
    group.sample_size(20);

    let rt = TokioRuntime::new().unwrap();
    let runtime = rt.block_on(Offload::new()).unwrap();

    for block_size in [32u32, 128, 256, 1024] {
        let options = VectorAddOptions {
            len: 1 << 20,
            policy: LaunchPolicy::Parallel { block_size },
            sync_timeout: None,
            verify: false,
        };

        group.bench_with_input(BenchmarkId::from_parameter(block_size), &options, |b, options| {
            b.iter(|| {
                rt.block_on(async {
                    black_box(vector_add::run(&runtime, options).await.unwrap());
                });
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_launch_policy, bench_block_size);
criterion_main!(benches);
