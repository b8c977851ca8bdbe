use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use xrpc::{Arity, Dispatcher, Registry, Value, decode_value, encode_call, encode_value};

fn sample(width: i32) -> Value {
    Value::Array(
        (0..width)
            .map(|n| {
                Value::structure([
                    ("id", Value::Int(n)),
                    ("label", Value::from(format!("item <{n}>"))),
                    ("ratio", Value::Double(f64::from(n) / 7.0)),
                ])
            })
            .collect(),
    )
}

fn bench_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("codec");

    for width in [8, 256] {
        let value = sample(width);
        group.throughput(Throughput::Bytes(encode_value(&value).len() as u64));
        group.bench_function(format!("encode_{width}_members"), |b| {
            b.iter(|| {
                black_box(encode_value(&value));
            });
        });
    }

    group.finish();
}

fn bench_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("codec");

    for width in [8, 256] {
        let encoded = encode_value(&sample(width));
        group.throughput(Throughput::Bytes(encoded.len() as u64));
        group.bench_function(format!("decode_{width}_members"), |b| {
            b.iter(|| {
                black_box(decode_value(&encoded).unwrap());
            });
        });
    }

    // Deep nesting exercises the explicit container stack.
    let mut deep = Value::Int(0);
    for _ in 0..1000 {
        deep = Value::Array(vec![deep]);
    }
    let encoded = encode_value(&deep);
    group.throughput(Throughput::Bytes(encoded.len() as u64));
    group.bench_function("decode_depth_1000", |b| {
        b.iter(|| {
            black_box(decode_value(&encoded).unwrap());
        });
    });

    group.finish();
}

fn bench_dispatch(c: &mut Criterion) {
    let mut group = c.benchmark_group("dispatch");

    let registry = Arc::new(Registry::new());
    registry.register_fn("echo", Arity::exactly(1), |args| Ok(args[0].clone()));
    let mut dispatcher = Dispatcher::new(registry);
    let request = encode_call("echo", &[sample(64)]);

    group.throughput(Throughput::Bytes(request.len() as u64));
    group.bench_function("echo_64_members", |b| {
        b.iter(|| {
            black_box(dispatcher.handle(request.as_bytes()).unwrap());
        });
    });

    group.finish();
}

criterion_group!(benches, bench_encode, bench_decode, bench_dispatch);
criterion_main!(benches);
