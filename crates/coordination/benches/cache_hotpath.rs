use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use std::time::Duration;

use cadence_coordination::cache::{coordinate_key, LruTier};
use cadence_coordination::{CachedValue, ReadThroughCache, ReadThroughCacheConfig};

const TTL: Duration = Duration::from_secs(3600);

fn bench_coordinate_key(c: &mut Criterion) {
    c.bench_function("coordinate_key", |b| {
        b.iter(|| coordinate_key(black_box(39.73921234), black_box(-104.99034567)))
    });
}

fn bench_lru_tier(c: &mut Criterion) {
    let mut group = c.benchmark_group("lru_tier");
    for capacity in [100usize, 1_000, 10_000] {
        group.throughput(Throughput::Elements(capacity as u64));
        group.bench_with_input(
            BenchmarkId::new("insert_then_get", capacity),
            &capacity,
            |b, &capacity| {
                let now = tokio::time::Instant::now();
                let expires = now + TTL;
                b.iter(|| {
                    let mut lru = LruTier::new(capacity);
                    for i in 0..capacity * 2 {
                        lru.insert(i.to_string(), i, expires);
                    }
                    for i in capacity..capacity * 2 {
                        black_box(lru.get(&i.to_string(), now));
                    }
                });
            },
        );
    }
    group.finish();
}

fn bench_local_hit(c: &mut Criterion) {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .unwrap();
    let cache = ReadThroughCache::<String>::new(ReadThroughCacheConfig::new("bench"));
    let keys: Vec<String> = (0..500)
        .map(|i| coordinate_key(39.0 + i as f64 * 0.001, -105.0))
        .collect();
    rt.block_on(async {
        for key in &keys {
            cache
                .set(key, CachedValue::Found(format!("place {key}")), TTL)
                .await;
        }
    });

    c.bench_function("read_through_local_hit", |b| {
        b.iter(|| {
            rt.block_on(async {
                for key in &keys {
                    black_box(cache.get(key).await);
                }
            })
        })
    });
}

criterion_group!(benches, bench_coordinate_key, bench_lru_tier, bench_local_hit);
criterion_main!(benches);
