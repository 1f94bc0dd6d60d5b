//! Benchmarks for the edge gateway hot paths.

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use http::{HeaderMap, HeaderValue, Method};
use rust_edgemesh::balancer::WeightedRoundRobin;
use rust_edgemesh::cache::{CacheConfig, CachedResponse, ResponseCache};
use rust_edgemesh::model::{
    BackendInstance, HealthState, InstanceId, InstanceSpec, PathPattern, RequiredHeader,
    ServiceRoute,
};
use rust_edgemesh::registry::RegistryStore;
use rust_edgemesh::router::Router;
use std::time::Duration;

fn build_router() -> Router {
    let registry = RegistryStore::default();
    let routes = [
        ServiceRoute::new("auth", "/auth/*", 11).unwrap(),
        ServiceRoute::new("api-users", "/api/v?/users/*", 20).unwrap(),
        ServiceRoute::new("static", "/static/*", 30).unwrap(),
        ServiceRoute::new("private", "/private/*", 40)
            .unwrap()
            .with_required_header(RequiredHeader::new("x-edge-token", "s3cret")),
        ServiceRoute::new("webapp", "/*", 50_000).unwrap(),
    ];
    for (i, route) in routes.into_iter().enumerate() {
        let name = route.name.clone();
        registry.upsert_route(route).unwrap();
        for port in 0..3u16 {
            let address = format!("10.0.{}.{}:8080", i, port + 1);
            let id = registry
                .add_instance(&name, InstanceSpec::new(address).with_weight(u32::from(port) + 1))
                .unwrap();
            registry.set_instance_health(id, HealthState::Healthy).unwrap();
        }
    }
    Router::new(registry, Duration::from_secs(30))
}

fn bench_router(c: &mut Criterion) {
    let mut group = c.benchmark_group("router");
    group.throughput(Throughput::Elements(1));

    let router = build_router();
    let headers = HeaderMap::new();
    let mut token = HeaderMap::new();
    token.insert("x-edge-token", HeaderValue::from_static("s3cret"));

    group.bench_function("route_prefix_match", |b| {
        b.iter(|| black_box(router.route("/auth/login", &headers)));
    });

    group.bench_function("route_glob_match", |b| {
        b.iter(|| black_box(router.route("/api/v2/users/42", &headers)));
    });

    group.bench_function("route_catch_all", |b| {
        b.iter(|| black_box(router.route("/index.html", &headers)));
    });

    group.bench_function("route_required_header", |b| {
        b.iter(|| black_box(router.route("/private/report", &token)));
    });

    group.finish();
}

fn bench_path_pattern(c: &mut Criterion) {
    let mut group = c.benchmark_group("path_pattern");

    let exact = PathPattern::parse("/api/v1/users").unwrap();
    let prefix = PathPattern::parse("/api/*").unwrap();
    let glob = PathPattern::parse("/api/*/users/?").unwrap();

    group.bench_function("exact_hit", |b| {
        b.iter(|| black_box(exact.matches("/api/v1/users")));
    });

    group.bench_function("prefix_hit", |b| {
        b.iter(|| black_box(prefix.matches("/api/v1/users")));
    });

    group.bench_function("prefix_miss", |b| {
        b.iter(|| black_box(prefix.matches("/other/path")));
    });

    group.bench_function("glob_hit", |b| {
        b.iter(|| black_box(glob.matches("/api/v1/users/7")));
    });

    group.bench_function("glob_miss", |b| {
        b.iter(|| black_box(glob.matches("/api/v1/products/abc")));
    });

    group.finish();
}

fn bench_weighted_selection(c: &mut Criterion) {
    let mut group = c.benchmark_group("balancer");
    group.throughput(Throughput::Elements(1));

    let instances: Vec<BackendInstance> = (1..=8u32)
        .map(|i| {
            BackendInstance::new(
                InstanceId(u64::from(i)),
                "api",
                &InstanceSpec::new(format!("10.0.0.{}:8080", i)).with_weight(i),
            )
        })
        .collect();
    let candidates: Vec<&BackendInstance> = instances.iter().collect();
    let balancer = WeightedRoundRobin::new();

    group.bench_function("select_8_weighted", |b| {
        b.iter(|| black_box(balancer.select("api", &candidates)));
    });

    group.bench_function("select_2_weighted", |b| {
        b.iter(|| black_box(balancer.select("pair", &candidates[..2])));
    });

    group.finish();
}

fn bench_cache(c: &mut Criterion) {
    let mut group = c.benchmark_group("cache");

    let cache = ResponseCache::new(CacheConfig::default());
    let uri: http::Uri = "/static/logo.png".parse().unwrap();
    let mut headers = HeaderMap::new();
    headers.insert("accept", HeaderValue::from_static("image/png"));
    let key = cache.key("static", 1, &Method::GET, &uri, &headers);
    cache.insert(
        key.clone(),
        CachedResponse {
            status: http::StatusCode::OK,
            headers: HeaderMap::new(),
            body: bytes::Bytes::from_static(b"png"),
        },
        Duration::from_secs(60),
    );

    group.bench_function("key", |b| {
        b.iter(|| black_box(cache.key("static", 1, &Method::GET, &uri, &headers)));
    });

    group.bench_function("get_hit", |b| {
        b.iter(|| black_box(cache.get(&key)));
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_router,
    bench_path_pattern,
    bench_weighted_selection,
    bench_cache,
);

criterion_main!(benches);
