//! Ring rebuild and routing benchmark

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use rookery::discovery::HashRing;

fn weighted_labels(instances: i32, weight: u32) -> Vec<String> {
    let mut labels = Vec::new();
    for sid in 0..instances {
        for i in 0..weight {
            labels.push(format!("{sid}-{i}"));
        }
    }
    labels
}

fn bench_rebuild(c: &mut Criterion) {
    let mut group = c.benchmark_group("ring_rebuild");
    for instances in [4, 16, 64] {
        let labels = weighted_labels(instances, 100);
        group.throughput(Throughput::Elements(labels.len() as u64));
        group.bench_function(format!("{instances}_instances"), |b| {
            b.iter(|| HashRing::from_labels(black_box(&labels)))
        });
    }
    group.finish();
}

fn bench_route(c: &mut Criterion) {
    let ring = HashRing::from_labels(weighted_labels(16, 100));
    let keys: Vec<String> = (0..1024).map(|i| format!("key-{i}")).collect();

    c.bench_function("route_1024_keys", |b| {
        b.iter(|| {
            for key in &keys {
                black_box(ring.get(black_box(key)));
            }
        })
    });
}

criterion_group!(benches, bench_rebuild, bench_route);
criterion_main!(benches);
