use std::hint::black_box;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use criterion::Criterion;
use rtcore::util::ConcurrentMap;

const KEYS: u64 = 4096;

fn filled() -> Arc<ConcurrentMap<u64, u64>> {
    let map = Arc::new(ConcurrentMap::with_capacity(32));
    for k in 0..KEYS {
        map.insert(k, k * 2);
    }
    map
}

pub fn bench(c: &mut Criterion) {
    let map = filled();
    let mut key = 0;
    c.bench_function("concurrent_map_lookup_hit", |b| {
        b.iter(|| {
            key = (key + 7) % KEYS;
            black_box(map.lookup(black_box(&key)))
        })
    });
    c.bench_function("concurrent_map_lookup_miss", |b| {
        b.iter(|| {
            key = (key + 7) % KEYS;
            black_box(map.lookup(black_box(&(key + KEYS))))
        })
    });

    // Readers against a writer that keeps inserting and removing, forcing rehashes.
    let stop = Arc::new(AtomicBool::new(false));
    let writer = {
        let (map, stop) = (map.clone(), stop.clone());
        std::thread::spawn(move || {
            let mut k = KEYS;
            while !stop.load(Ordering::Relaxed) {
                map.insert(k, k);
                if k >= KEYS + 64 {
                    map.remove(&(k - 64));
                }
                k += 1;
            }
        })
    };
    c.bench_function("concurrent_map_lookup_with_writer", |b| {
        b.iter(|| {
            key = (key + 7) % KEYS;
            black_box(map.lookup(black_box(&key)))
        })
    });
    stop.store(true, Ordering::Relaxed);
    writer.join().unwrap();
}
