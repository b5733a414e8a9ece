pub mod dispatch;

pub use criterion::Criterion;

pub fn bench(c: &mut Criterion) {
    dispatch::bench(c);
}
