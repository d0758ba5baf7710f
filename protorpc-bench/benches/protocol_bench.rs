//! Envelope encoding/decoding benchmarks.

use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use protorpc_protocol::codec::summarize;
use protorpc_protocol::{Decoder, Encoder, ErrorCode, Headers, Request, Response};

fn create_test_request(payload_size: usize) -> Request {
    Request::new(
        "bench.EchoService",
        "Echo",
        Bytes::from(vec![0x42u8; payload_size]),
    )
    .with_id("bench-1")
    .with_headers(Headers::current().with_user_id("bench"))
    .with_allowed_error_codes([7, 11])
}

fn create_test_response(payload_size: usize) -> Response {
    Response::ok("bench-1", Bytes::from(vec![0x42u8; payload_size]))
}

fn bench_request_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("request_encode");

    for size in [100, 1000, 10000] {
        let request = create_test_request(size);

        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &request, |b, request| {
            b.iter(|| black_box(Encoder::encode_request(request).unwrap()));
        });
    }

    group.finish();
}

fn bench_request_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("request_decode");

    for size in [100, 1000, 10000] {
        let encoded = Encoder::encode_request(&create_test_request(size)).unwrap();

        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &encoded, |b, encoded| {
            b.iter(|| black_box(Decoder::decode_request(encoded).unwrap()));
        });
    }

    group.finish();
}

fn bench_response_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("response_encode");

    for size in [100, 1000, 10000] {
        let response = create_test_response(size);

        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(size),
            &response,
            |b, response| {
                b.iter(|| black_box(Encoder::encode_response(response).unwrap()));
            },
        );
    }

    let error = Response::error("bench-1", ErrorCode::ApplicationError, "not found")
        .with_application_error_code(7);
    group.bench_function("error", |b| {
        b.iter(|| black_box(Encoder::encode_response(&error).unwrap()));
    });

    group.finish();
}

fn bench_response_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("response_decode");

    for size in [100, 1000, 10000] {
        let encoded = Encoder::encode_response(&create_test_response(size)).unwrap();

        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &encoded, |b, encoded| {
            b.iter(|| {
                let response = Decoder::decode_response(encoded).unwrap();
                black_box(response.validate().unwrap())
            });
        });
    }

    group.finish();
}

fn bench_summarize(c: &mut Criterion) {
    let payload = vec![0x42u8; 10000];
    c.bench_function("summarize_10000", |b| {
        b.iter(|| black_box(summarize(&payload)));
    });
}

criterion_group!(
    benches,
    bench_request_encode,
    bench_request_decode,
    bench_response_encode,
    bench_response_decode,
    bench_summarize,
);

criterion_main!(benches);
