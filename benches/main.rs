use criterion::criterion_group;
use criterion::criterion_main;
use criterion::Criterion;

#[cfg(feature = "mock_test")]
pub mod mock_bench;

#[cfg(not(feature = "mock_test"))]
pub mod regular_bench;

pub fn bench_main(c: &mut Criterion) {
    cfg_if::cfg_if! {
        if #[cfg(feature = "mock_test")] {
            // With "mock_test", only the benchmarks that need a runtime are run.
            mock_bench::bench(c);
        } else {
            regular_bench::bench(c);
        }
    }
}

criterion_group!(benches, bench_main);
criterion_main!(benches);
