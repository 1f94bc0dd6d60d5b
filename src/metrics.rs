//! Prometheus metrics collection and export.

use crate::model::HealthState;
use once_cell::sync::Lazy;
use prometheus_client::encoding::text::encode;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;
use std::io;
use std::sync::{Arc, Mutex};

/// Labels for gateway request metrics.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct RequestLabels {
    pub method: String,
    pub status: String,
    /// Matched route name, or `none`.
    pub route: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct CacheLabels {
    pub route: String,
    /// `hit`, `miss` or `bypass`.
    pub result: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct HealthLabels {
    pub route: String,
    pub state: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct MutationLabels {
    pub op: String,
}

/// Global metrics registry, shared across all tasks.
static METRICS: Lazy<Arc<Mutex<Metrics>>> = Lazy::new(|| Arc::new(Mutex::new(Metrics::new())));

/// Metrics collector for the gateway and control plane.
pub struct Metrics {
    registry: Registry,
    requests_total: Family<RequestLabels, Counter>,
    request_duration_seconds: Family<RequestLabels, Histogram>,
    cache_lookups_total: Family<CacheLabels, Counter>,
    health_transitions_total: Family<HealthLabels, Counter>,
    registry_mutations_total: Family<MutationLabels, Counter>,
}

impl Metrics {
    fn new() -> Self {
        let mut registry = Registry::default();

        let requests_total = Family::<RequestLabels, Counter>::default();
        registry.register(
            "edge_requests",
            "Total number of requests handled by the gateway",
            requests_total.clone(),
        );

        let request_duration_seconds =
            Family::<RequestLabels, Histogram>::new_with_constructor(|| {
                Histogram::new(exponential_buckets(0.001, 2.0, 10))
            });
        registry.register(
            "edge_request_duration_seconds",
            "Gateway request latency in seconds",
            request_duration_seconds.clone(),
        );

        let cache_lookups_total = Family::<CacheLabels, Counter>::default();
        registry.register(
            "edge_cache_lookups",
            "Response cache lookups by result",
            cache_lookups_total.clone(),
        );

        let health_transitions_total = Family::<HealthLabels, Counter>::default();
        registry.register(
            "edge_health_transitions",
            "Backend instance health state transitions",
            health_transitions_total.clone(),
        );

        let registry_mutations_total = Family::<MutationLabels, Counter>::default();
        registry.register(
            "edge_registry_mutations",
            "Published registry mutations by operation",
            registry_mutations_total.clone(),
        );

        Self {
            registry,
            requests_total,
            request_duration_seconds,
            cache_lookups_total,
            health_transitions_total,
            registry_mutations_total,
        }
    }

    /// Records a gateway request with method, status, route and duration.
    pub fn record_request(method: &str, status: u16, route: &str, duration_secs: f64) {
        let labels = RequestLabels {
            method: method.to_string(),
            status: status.to_string(),
            route: route.to_string(),
        };

        if let Ok(metrics) = METRICS.lock() {
            metrics.requests_total.get_or_create(&labels).inc();
            metrics
                .request_duration_seconds
                .get_or_create(&labels)
                .observe(duration_secs);
        }
    }

    pub fn record_cache_lookup(route: &str, result: &str) {
        let labels = CacheLabels {
            route: route.to_string(),
            result: result.to_string(),
        };
        if let Ok(metrics) = METRICS.lock() {
            metrics.cache_lookups_total.get_or_create(&labels).inc();
        }
    }

    pub fn record_health_transition(route: &str, state: HealthState) {
        let labels = HealthLabels {
            route: route.to_string(),
            state: state.as_str().to_string(),
        };
        if let Ok(metrics) = METRICS.lock() {
            metrics.health_transitions_total.get_or_create(&labels).inc();
        }
    }

    pub fn record_registry_mutation(op: &str) {
        let labels = MutationLabels { op: op.to_string() };
        if let Ok(metrics) = METRICS.lock() {
            metrics.registry_mutations_total.get_or_create(&labels).inc();
        }
    }

    /// Encodes all metrics in Prometheus text format.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails or the mutex is poisoned.
    pub fn encode() -> Result<String, io::Error> {
        let metrics = METRICS
            .lock()
            .map_err(|e| io::Error::other(format!("mutex poisoned: {}", e)))?;

        let mut buffer = String::new();
        encode(&mut buffer, &metrics.registry)
            .map_err(|e| io::Error::other(format!("encoding error: {}", e)))?;

        Ok(buffer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_request() {
        Metrics::record_request("GET", 200, "auth", 0.05);
        Metrics::record_request("POST", 503, "none", 0.1);

        let encoded = Metrics::encode().unwrap();
        assert!(encoded.contains("edge_requests_total"));
        assert!(encoded.contains("edge_request_duration_seconds"));
    }

    #[test]
    fn test_control_plane_counters() {
        Metrics::record_cache_lookup("auth", "hit");
        Metrics::record_health_transition("auth", HealthState::Unhealthy);
        Metrics::record_registry_mutation("upsert_route");

        let encoded = Metrics::encode().unwrap();
        assert!(encoded.contains("edge_cache_lookups_total"));
        assert!(encoded.contains("state=\"unhealthy\""));
        assert!(encoded.contains("op=\"upsert_route\""));
    }
}
