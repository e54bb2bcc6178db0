//! Routing overhead benchmarks.
//!
//! Everything runs against the in-memory nodes in `routis::mocks`, so the
//! numbers measure slot hashing, table lookups, pooling and executor logic
//! rather than the network.
//!
//! ```bash
//! cargo bench --bench routing_benchmark
//! ```

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use routis::cluster::{command_slot, key_slot, ClusterConfig};
use routis::core::command;
use routis::failover::{
    CircuitBreakerExecutor, EndpointConfig, MultiEndpointConfig, MultiEndpointProvider,
};
use routis::mocks::{MockCluster, MockConnector};
use routis::{Client, ClientBuilder, HostAndPort};
use tokio::runtime::Runtime;

fn cluster_client(rt: &Runtime, cluster: &MockCluster) -> Client {
    rt.block_on(async {
        ClientBuilder::new()
            .cluster("127.0.0.1:7000,127.0.0.1:7001,127.0.0.1:7002")
            .unwrap()
            .cluster_config(ClusterConfig::default())
            .connector(Arc::new(cluster.connector()))
            .build()
            .await
            .expect("failed to build cluster client")
    })
}

/// Benchmark: slot calculation.
fn bench_slot_calculation(c: &mut Criterion) {
    let mut group = c.benchmark_group("key_slot");

    for key in ["foo", "user:1000:profile", "{user:1000}:followers"] {
        group.bench_with_input(BenchmarkId::from_parameter(key), key, |b, key| {
            b.iter(|| key_slot(black_box(key)));
        });
    }

    group.finish();
}

/// Benchmark: same-slot validation for multi-key commands.
fn bench_command_slot(c: &mut Criterion) {
    let mut group = c.benchmark_group("command_slot");

    for count in [1usize, 10, 100] {
        let keys: Vec<String> = (0..count).map(|i| format!("{{tag}}:key:{i}")).collect();
        let cmd = command::mget(keys);
        group.throughput(Throughput::Elements(count as u64));
        group.bench_with_input(BenchmarkId::from_parameter(count), &cmd, |b, cmd| {
            b.iter(|| command_slot(black_box(cmd)).expect("same slot"));
        });
    }

    group.finish();
}

/// Benchmark: routed GET/SET through the cluster executor.
fn bench_cluster_routing(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let cluster = MockCluster::three_nodes();
    let client = cluster_client(&rt, &cluster);
    rt.block_on(async { client.set("bench:key", "value").await.expect("SET failed") });

    c.bench_function("cluster_get", |b| {
        b.to_async(&rt).iter(|| async {
            client.get(black_box("bench:key")).await.expect("GET failed");
        });
    });

    c.bench_function("cluster_set", |b| {
        b.to_async(&rt).iter(|| async {
            client
                .set(black_box("bench:key"), "value")
                .await
                .expect("SET failed");
        });
    });

    c.bench_function("cluster_concurrent_gets", |b| {
        b.to_async(&rt).iter(|| async {
            let calls = (0..16).map(|i| {
                let client = client.clone();
                async move { client.get(&format!("bench:key:{i}")).await }
            });
            for result in futures::future::join_all(calls).await {
                result.expect("GET failed");
            }
        });
    });
}

/// Benchmark: breaker and retry bookkeeping on the active endpoint.
fn bench_failover_executor(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let connector = MockConnector::new();
    let config = MultiEndpointConfig::new(vec![
        EndpointConfig::new(HostAndPort::new("primary.example", 6379), 1),
        EndpointConfig::new(HostAndPort::new("standby.example", 6379), 2),
    ]);
    let provider = MultiEndpointProvider::with_connector(config, Arc::new(connector))
        .expect("failed to build provider");
    let client = Client::with_executor(Arc::new(CircuitBreakerExecutor::new(Arc::new(provider))));

    c.bench_function("failover_ping", |b| {
        b.to_async(&rt).iter(|| async {
            client.ping().await.expect("PING failed");
        });
    });
}

criterion_group!(
    benches,
    bench_slot_calculation,
    bench_command_slot,
    bench_cluster_routing,
    bench_failover_executor
);

criterion_main!(benches);
