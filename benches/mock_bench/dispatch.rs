use std::hint::black_box;

use criterion::Criterion;
use rtcore::util::test_util::fixtures::*;
use rtcore::util::test_util::mock_vm::runtime;

pub fn bench(c: &mut Criterion) {
    let rt = runtime();
    let i = interface(&rt, "I", &["M", "N"]);
    let j = interface(&rt, "J", &["P"]);
    let base = class(&rt, "Base", None, &[&i], &["M", "N"]);
    let derived = class(&rt, "Derived", Some(&base), &[&j], &["N", "P"]);
    let n = method(&i, "N");
    let p = method(&j, "P");
    rt.build_vtable(&derived).unwrap();

    c.bench_function("dispatch_interface", |b| {
        b.iter(|| black_box(rt.dispatch_interface(&derived, black_box(&p))))
    });
    c.bench_function("dispatch_interface_inherited", |b| {
        b.iter(|| black_box(rt.dispatch_interface(&derived, black_box(&n))))
    });
    c.bench_function("dispatch_by_name", |b| {
        b.iter(|| black_box(rt.dispatch_by_name(&derived, black_box("P"))))
    });
}
