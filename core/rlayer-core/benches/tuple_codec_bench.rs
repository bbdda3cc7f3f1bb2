//! Tuple pack/unpack throughput across a range of shapes: a bare integer, a
//! small mixed-type tuple (the common index-entry shape), and a tuple with a
//! nested tuple element (exercises the escape/terminator scheme).

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use rlayer_core::tuple::{Element, Tuple};

fn int_tuple() -> Tuple {
    Tuple::from_elements(vec![Element::Int(42)])
}

fn mixed_tuple() -> Tuple {
    Tuple::from_elements(vec![
        Element::String("user".into()),
        Element::Int(1001),
        Element::Bytes(vec![1, 2, 3, 4]),
    ])
}

fn nested_tuple() -> Tuple {
    Tuple::from_elements(vec![
        Element::String("parent".into()),
        Element::Tuple(Tuple::from_elements(vec![Element::Int(1), Element::Int(2)])),
    ])
}

fn bench_pack(c: &mut Criterion) {
    let mut group = c.benchmark_group("tuple_pack");
    group.bench_function("int", |b| b.iter(|| black_box(int_tuple()).pack_bytes().unwrap()));
    group.bench_function("mixed", |b| b.iter(|| black_box(mixed_tuple()).pack_bytes().unwrap()));
    group.bench_function("nested", |b| b.iter(|| black_box(nested_tuple()).pack_bytes().unwrap()));
    group.finish();
}

fn bench_unpack(c: &mut Criterion) {
    let mut group = c.benchmark_group("tuple_unpack");

    let int_bytes = int_tuple().pack_bytes().unwrap();
    group.bench_function("int", |b| b.iter(|| Tuple::unpack(black_box(&int_bytes)).unwrap()));

    let mixed_bytes = mixed_tuple().pack_bytes().unwrap();
    group.bench_function("mixed", |b| b.iter(|| Tuple::unpack(black_box(&mixed_bytes)).unwrap()));

    let nested_bytes = nested_tuple().pack_bytes().unwrap();
    group.bench_function("nested", |b| b.iter(|| Tuple::unpack(black_box(&nested_bytes)).unwrap()));

    group.finish();
}

criterion_group!(benches, bench_pack, bench_unpack);
criterion_main!(benches);
