use std::hint::black_box;

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};

use pg_proto::{Param, WriteBuffer};

fn bench_query_frame(c: &mut Criterion) {
    let mut group = c.benchmark_group("query_frame");

    let queries = vec![
        ("short", "SELECT 1"),
        (
            "medium",
            "SELECT * FROM users WHERE id = 1 AND status = 'active'",
        ),
        (
            "long",
            "SELECT u.id, u.name, u.email, o.order_id, o.total FROM users u JOIN orders o ON u.id = o.user_id WHERE u.created_at > '2024-01-01' AND o.status IN ('pending', 'completed') ORDER BY o.created_at DESC LIMIT 100",
        ),
    ];

    for (name, query) in queries {
        group.bench_with_input(BenchmarkId::from_parameter(name), &query, |b, &query| {
            b.iter(|| {
                let mut buf = WriteBuffer::new();
                buf.start_message(b'Q');
                buf.write_cstring(black_box(query.as_bytes()));
                buf.finish_message();
                buf
            });
        });
    }

    group.finish();
}

fn bench_bind_params(c: &mut Criterion) {
    let mut group = c.benchmark_group("bind_params");

    let params_small: Vec<Param> = vec![];
    let params_medium: Vec<Param> = vec![Param::Int4(42), Param::Text("alice".into()), Param::Null];
    let params_large: Vec<Param> = (0..10).map(Param::Int4).collect();

    for (name, params) in [
        ("none", &params_small),
        ("three", &params_medium),
        ("ten", &params_large),
    ] {
        group.bench_with_input(BenchmarkId::from_parameter(name), params, |b, params| {
            b.iter(|| {
                let mut buf = WriteBuffer::new();
                buf.start_message(b'B');
                buf.write_cstring(b"");
                buf.write_cstring(black_box(b"stmt"));
                buf.write_i16(0);
                buf.write_i16(params.len() as i16);
                for param in params.iter() {
                    buf.start_param();
                    match param.append(buf.bytes_mut()) {
                        Some(()) => buf.finish_param(),
                        None => buf.finish_null_param(),
                    }
                }
                buf.write_i16(0);
                buf.finish_message();
                buf
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_query_frame, bench_bind_params);
criterion_main!(benches);
