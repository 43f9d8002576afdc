use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use simchain::harness::gain_chain;
use simchain::{EngineConfig, Interpreter, Scheduler, ThreadingMode};

fn bench_strategies(c: &mut Criterion) {
    let strategies = [
        ("serial", EngineConfig::default().with_interpreter(Interpreter::Standard)),
        ("per_node", EngineConfig::default().with_num_threads(4)),
        (
            "per_chain",
            EngineConfig::default()
                .with_num_threads(4)
                .with_thread_mode(ThreadingMode::PerChain),
        ),
    ];

    let mut group = c.benchmark_group("gain_chain_64ch");
    for (name, config) in strategies {
        let scheduler = Scheduler::new(config).unwrap();
        let mut sim = gain_chain(64, 4096, 12).unwrap();
        group.bench_function(BenchmarkId::from_parameter(name), |b| {
            b.iter(|| {
                let outcome = scheduler.execute(black_box(&mut sim), None).unwrap();
                black_box(outcome);
            })
        });
    }
    group.finish();
}

fn bench_thread_counts(c: &mut Criterion) {
    let mut group = c.benchmark_group("per_chain_threads");
    for threads in [1usize, 2, 4, 8] {
        let scheduler = Scheduler::new(
            EngineConfig::default()
                .with_num_threads(threads)
                .with_thread_mode(ThreadingMode::PerChain),
        )
        .unwrap();
        let mut sim = gain_chain(64, 1024, 12).unwrap();
        group.bench_with_input(BenchmarkId::from_parameter(threads), &threads, |b, _| {
            b.iter(|| scheduler.execute(black_box(&mut sim), None).unwrap())
        });
    }
    group.finish();
}

criterion_group!(benches, bench_strategies, bench_thread_counts);
criterion_main!(benches);
