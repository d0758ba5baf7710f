//! End-to-end client-server benchmarks.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use protorpc_client::{CallOptions, ChannelConfig, Client, ConnectionConfig};
use protorpc_protocol::ServiceDescriptor;
use protorpc_server::{
    BrokerStrategy, ExecutionStrategy, PooledStrategy, Server, ServiceBuilder,
};
use std::sync::Arc;
use tokio::runtime::Runtime;

#[derive(Clone, PartialEq, prost::Message)]
struct Blob {
    #[prost(bytes = "vec", tag = "1")]
    data: Vec<u8>,
}

const SERVICE: &str = "bench.EchoService";

fn start_server<S: ExecutionStrategy>(rt: &Runtime, strategy: S) -> (Arc<Server<S>>, Client) {
    let service = Arc::new(
        ServiceBuilder::new(SERVICE)
            .method::<Blob, _>("Echo", |req, done| done.run(&req))
            .build(),
    );
    let server = Arc::new(Server::new(service, strategy));
    let endpoint = rt.block_on(server.bind("tcp://127.0.0.1:0")).unwrap();

    let runner = server.clone();
    rt.spawn(async move {
        let _ = runner.run().await;
    });

    let config = ChannelConfig::new(ConnectionConfig::new([endpoint])).with_pool_size(16);
    let client = Client::new(ServiceDescriptor::new(SERVICE).with_method("Echo"), config);
    (server, client)
}

async fn echo(client: &Client, request: &Blob) -> Blob {
    client
        .call::<Blob, Blob>("Echo", request, &CallOptions::new())
        .await
        .unwrap()
        .unwrap()
}

fn bench_echo_latency(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let (server, client) = start_server(&rt, PooledStrategy::default());

    let mut group = c.benchmark_group("e2e_echo");
    group.throughput(Throughput::Elements(1));

    for size in [16, 1024, 65536] {
        let request = Blob {
            data: vec![0x42; size],
        };
        group.bench_with_input(BenchmarkId::from_parameter(size), &request, |b, request| {
            b.to_async(&rt)
                .iter(|| async { black_box(echo(&client, request).await) });
        });
    }

    group.finish();
    server.shutdown();
}

fn bench_concurrent<S: ExecutionStrategy>(c: &mut Criterion, name: &str, strategy: S) {
    let rt = Runtime::new().unwrap();
    let (server, client) = start_server(&rt, strategy);
    let request = Blob {
        data: vec![0x42; 256],
    };

    let mut group = c.benchmark_group(name);
    for concurrency in [8u64, 32] {
        group.throughput(Throughput::Elements(concurrency));
        group.bench_with_input(
            BenchmarkId::from_parameter(concurrency),
            &concurrency,
            |b, &concurrency| {
                b.to_async(&rt).iter(|| {
                    let client = client.clone();
                    let request = request.clone();
                    async move {
                        let calls = (0..concurrency).map(|_| {
                            let client = client.clone();
                            let request = request.clone();
                            tokio::spawn(async move { echo(&client, &request).await })
                        });
                        for handle in futures::future::join_all(calls).await {
                            black_box(handle.unwrap());
                        }
                    }
                });
            },
        );
    }

    group.finish();
    server.shutdown();
}

fn bench_pooled_concurrent(c: &mut Criterion) {
    bench_concurrent(c, "e2e_pooled_concurrent", PooledStrategy::new(64));
}

fn bench_broker_concurrent(c: &mut Criterion) {
    bench_concurrent(c, "e2e_broker_concurrent", BrokerStrategy::new(4));
}

criterion_group!(
    benches,
    bench_echo_latency,
    bench_pooled_concurrent,
    bench_broker_concurrent
);
criterion_main!(benches);
