//! Benchmarks for breaker bookkeeping and retry delay computation.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use flowguard::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
use flowguard::retry::{JitterStrategy, RetryDelayStrategy};
use std::time::Duration;

fn breaker_benchmark(c: &mut Criterion) {
    // A short window keeps the record queue small across millions of iterations.
    let window = Duration::from_millis(10);
    let open = Duration::from_secs(30);
    let presets = [
        (
            "consecutive",
            CircuitBreakerConfig {
                sampling_window: window,
                ..CircuitBreakerConfig::consecutive(1_000_000, open)
            },
        ),
        ("rolling_rate", CircuitBreakerConfig::rolling_rate(100, 0.99, window, open)),
        ("hybrid", CircuitBreakerConfig::hybrid(1_000_000, 0.99, window, open)),
    ];

    let mut group = c.benchmark_group("circuit_breaker");
    for (name, config) in presets {
        let breaker = CircuitBreaker::new("bench", config);
        group.bench_with_input(BenchmarkId::new("record_and_allow", name), &breaker, |b, breaker| {
            b.iter(|| {
                breaker.record_success();
                breaker.record_failure();
                black_box(breaker.allow())
            });
        });
    }
    group.finish();
}

fn delay_benchmark(c: &mut Criterion) {
    let preset = || {
        RetryDelayStrategy::exponential(Duration::from_millis(100), 2.0, Duration::from_secs(30))
            .expect("valid preset")
    };
    let jittered = |jitter| preset().with_jitter(jitter).expect("valid jitter").with_seed(7);
    let strategies = [
        ("none", preset()),
        ("full", jittered(JitterStrategy::Full)),
        ("decorrelated", jittered(JitterStrategy::Decorrelated { multiplier: 3.0 })),
    ];

    let mut group = c.benchmark_group("retry_delay");
    for (name, strategy) in &strategies {
        group.bench_function(*name, |b| {
            b.iter(|| {
                for attempt in 0..10 {
                    black_box(strategy.delay(black_box(attempt)));
                }
            });
        });
    }
    group.finish();
}

criterion_group!(benches, breaker_benchmark, delay_benchmark);
criterion_main!(benches);
