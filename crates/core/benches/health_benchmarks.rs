use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use std::time::Duration;

use chrono::Utc;
use conductor_core::{BackoffPolicy, HealthOutcome, ProviderHealth, ProviderId};

/// Alternating outcomes with a failure burst every 16 calls.
fn outcome_for(i: u64) -> HealthOutcome {
    if i % 16 < 3 {
        HealthOutcome::Failure {
            error: format!("upstream error {i}"),
        }
    } else {
        HealthOutcome::Success {
            response_time_ms: 80 + (i % 40),
        }
    }
}

fn bench_health_apply(c: &mut Criterion) {
    let mut group = c.benchmark_group("provider_health_apply");

    for count in [100u64, 1_000, 10_000] {
        group.throughput(Throughput::Elements(count));
        group.bench_with_input(BenchmarkId::from_parameter(count), &count, |b, &count| {
            b.iter(|| {
                let mut health = ProviderHealth::new(ProviderId::new("alpha"));
                let now = Utc::now();
                for i in 0..count {
                    health.apply(&outcome_for(i), now);
                }
                black_box(health.success_rate)
            })
        });
    }

    group.finish();
}

fn bench_provider_ranking(c: &mut Criterion) {
    let mut group = c.benchmark_group("provider_ranking");

    for providers in [3usize, 16, 64] {
        let now = Utc::now();
        let records: Vec<ProviderHealth> = (0..providers)
            .map(|p| {
                let mut health = ProviderHealth::new(ProviderId::new(format!("provider-{p}")));
                for i in 0..(p as u64 * 7) {
                    health.apply(&outcome_for(i), now);
                }
                health
            })
            .collect();

        group.bench_with_input(
            BenchmarkId::from_parameter(providers),
            &records,
            |b, records| {
                b.iter(|| {
                    let mut ranked: Vec<&ProviderHealth> = records.iter().collect();
                    ranked.sort_by(|a, b| b.score().total_cmp(&a.score()));
                    black_box(ranked.first().map(|h| h.provider_id.clone()))
                })
            },
        );
    }

    group.finish();
}

fn bench_backoff(c: &mut Criterion) {
    let policy = BackoffPolicy::exponential(Duration::from_secs(2));
    c.bench_function("backoff_delay_for_attempt", |b| {
        b.iter(|| {
            let mut total = Duration::ZERO;
            for attempt in 1..=20 {
                total += policy.delay_for_attempt(black_box(attempt), 0.5);
            }
            black_box(total)
        })
    });
}

criterion_group!(benches, bench_health_apply, bench_provider_ranking, bench_backoff);
criterion_main!(benches);
