//! Stage throughput benchmarks
//!
//! Toyota Way: Genchi Genbutsu (measure, don't guess)
//!
//! Measures Stage 1 trial throughput across worker counts and samplers, and
//! the cost of Top-K promotion on large stage results.
//!
//! Run with: cargo bench --bench stage_throughput

use std::sync::Arc;
use std::time::Duration;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use hybrid_optimizer::evaluator::{ObjectiveEvaluator, SimulationEvaluator};
use hybrid_optimizer::params::ParameterVector;
use hybrid_optimizer::runner::{ExecutionMode, StageRunner};
use hybrid_optimizer::sampler::{RandomSampler, TpeSampler};
use hybrid_optimizer::trial::{Stage, StageResult, TrialRecord};
use hybrid_optimizer::{select_top_k, ParameterSchema};

const SCHEMA: ParameterSchema = ParameterSchema::Risk;
const STAGE1_TRIALS: usize = 200;

fn proxy() -> Arc<dyn ObjectiveEvaluator> {
    Arc::new(SimulationEvaluator::for_schema(SCHEMA, 42))
}

/// Benchmark Stage 1 with random search at several pool sizes
fn bench_stage1_random(c: &mut Criterion) {
    let mut group = c.benchmark_group("stage1_random");
    group.sample_size(20);
    let evaluator = proxy();
    let validator = SCHEMA.validator();

    for workers in [1usize, 4, 8] {
        let runner = StageRunner::new(Stage::Stage1).with_mode(ExecutionMode::Parallel { workers });
        group.bench_with_input(BenchmarkId::new("workers", workers), &runner, |b, runner| {
            b.iter(|| {
                let mut sampler = RandomSampler::new(SCHEMA.search_space(), 42);
                runner
                    .run_stage(black_box(STAGE1_TRIALS), &mut sampler, &evaluator, &validator)
                    .map(|o| o.result.len())
            });
        });
    }

    group.finish();
}

/// Benchmark Stage 1 with TPE (history-dependent sampling cost)
fn bench_stage1_tpe(c: &mut Criterion) {
    let mut group = c.benchmark_group("stage1_tpe");
    group.sample_size(10);
    let evaluator = proxy();
    let validator = SCHEMA.validator();
    let runner = StageRunner::new(Stage::Stage1).with_mode(ExecutionMode::Parallel { workers: 4 });

    group.bench_function(BenchmarkId::new("trials", STAGE1_TRIALS), |b| {
        b.iter(|| {
            let mut sampler = TpeSampler::new(SCHEMA.search_space(), 42);
            runner
                .run_stage(black_box(STAGE1_TRIALS), &mut sampler, &evaluator, &validator)
                .map(|o| o.result.len())
        });
    });

    group.finish();
}

/// Benchmark Top-K promotion (bounded heap)
fn bench_select_top_k(c: &mut Criterion) {
    let mut group = c.benchmark_group("select_top_k");

    for n in [1_000u64, 100_000] {
        let mut builder = StageResult::builder(Stage::Stage1);
        for id in 0..n {
            #[allow(clippy::cast_precision_loss)]
            let score = ((id * 7919) % 1009) as f64;
            builder.push(TrialRecord::complete(
                id,
                Stage::Stage1,
                ParameterVector::new().with("x", score),
                score,
                Duration::ZERO,
            ));
        }
        let result = builder.build(Duration::ZERO);

        group.bench_with_input(BenchmarkId::new("k20", n), &result, |b, result| {
            b.iter(|| select_top_k(black_box(result), 20));
        });
    }

    group.finish();
}

criterion_group!(benches, bench_stage1_random, bench_stage1_tpe, bench_select_top_k);
criterion_main!(benches);
