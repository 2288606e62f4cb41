//! Debouncer benchmarks.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::time::Duration;
use themesync_bench::theme_keys;
use themesync_engine::{Debouncer, RawChange};
use themesync_protocol::ChangeKind;
use tokio::time::Instant;

/// Benchmark a burst of saves collapsing into settled events.
fn bench_burst(c: &mut Criterion) {
    let mut group = c.benchmark_group("debounce_burst");

    for (keys, edits) in [(10, 1_000), (1_000, 10_000)].iter() {
        let keys = theme_keys(*keys);
        group.throughput(Throughput::Elements(*edits as u64));
        group.bench_with_input(
            BenchmarkId::new(format!("{}_keys", keys.len()), edits),
            edits,
            |b, &edits| {
                b.iter(|| {
                    let mut debouncer = Debouncer::new(Duration::from_millis(300));
                    let start = Instant::now();
                    for i in 0..edits {
                        let change = RawChange {
                            key: keys[i % keys.len()].clone(),
                            kind: ChangeKind::Modified,
                        };
                        debouncer.push(change, start + Duration::from_micros(i as u64));
                    }
                    let settled = debouncer.drain_ready(start + Duration::from_secs(1));
                    black_box(settled);
                });
            },
        );
    }

    group.finish();
}

criterion_group!(benches, bench_burst);

criterion_main!(benches);
