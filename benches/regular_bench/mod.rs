pub mod concurrent_map;

pub use criterion::Criterion;

pub fn bench(c: &mut Criterion) {
    concurrent_map::bench(c);
}
