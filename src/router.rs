//! Request routing: path pattern, priority and header gate, then weighted
//! selection among healthy instances.

use crate::balancer::WeightedRoundRobin;
use crate::error::RouteError;
use crate::model::{BackendInstance, InflightGuard, InstanceId, RouteId, ServiceRoute};
use crate::registry::{RegistryStore, RouteEntry};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info};

/// Result of a successful routing decision.
///
/// Holds an in-flight slot on the chosen instance from the moment it is
/// picked, so a drain cannot purge the instance while the request is still
/// being prepared.
#[derive(Debug)]
pub struct RouteTarget {
    pub route: Arc<ServiceRoute>,
    pub route_id: RouteId,
    /// Revision of the route definition at decision time.
    pub revision: u64,
    pub instance: BackendInstance,
    inflight: InflightGuard,
}

impl RouteTarget {
    /// Gives up the target, keeping its in-flight slot.
    pub fn into_guard(self) -> InflightGuard {
        self.inflight
    }
}

#[derive(Debug)]
struct Outage {
    since: Instant,
    alerted: bool,
}

/// Routes requests against the current registry snapshot.
pub struct Router {
    registry: RegistryStore,
    balancer: WeightedRoundRobin,
    outages: DashMap<String, Outage>,
    alert_after: Duration,
    pruned_version: AtomicU64,
}

impl Router {
    /// Creates a router. A route without healthy instances for longer than
    /// `alert_after` raises one error-level alert per outage.
    pub fn new(registry: RegistryStore, alert_after: Duration) -> Self {
        Self {
            registry,
            balancer: WeightedRoundRobin::new(),
            outages: DashMap::new(),
            alert_after,
            pruned_version: AtomicU64::new(0),
        }
    }

    pub fn registry(&self) -> &RegistryStore {
        &self.registry
    }

    /// Picks a route and a healthy backend instance for a request.
    ///
    /// Routes are evaluated by ascending priority, then registration order.
    /// The first route whose pattern matches and whose required header is
    /// present wins.
    pub fn route(&self, path: &str, headers: &http::HeaderMap) -> Result<RouteTarget, RouteError> {
        let snapshot = self.registry.snapshot();
        self.prune(snapshot.version(), |name| snapshot.route(name).is_some());

        let mut path_matched = false;
        for entry in snapshot.routes() {
            if !entry.route.path_pattern.matches(path) {
                continue;
            }
            path_matched = true;

            if let Some(header) = &entry.route.required_header {
                if !header.is_satisfied_by(headers) {
                    debug!(route = %entry.route.name, header = %header.name, "required header not satisfied");
                    continue;
                }
            }

            debug!(route = %entry.route.name, path = %path, "matched route");
            return self.pick(entry, None);
        }

        if path_matched {
            Err(RouteError::ForbiddenHeaderMismatch {
                path: path.to_string(),
            })
        } else {
            debug!(path = %path, "no matching route found");
            Err(RouteError::NoMatchingRoute {
                path: path.to_string(),
            })
        }
    }

    /// Picks another healthy instance of the same route, skipping the one
    /// already tried. Returns `None` if there is no alternative.
    pub fn select_other(&self, previous: &RouteTarget) -> Option<RouteTarget> {
        let snapshot = self.registry.snapshot();
        let entry = snapshot
            .routes()
            .iter()
            .find(|e| e.id == previous.route_id)?;
        self.pick(entry, Some(previous.instance.id)).ok()
    }

    /// Returns true if the current snapshot still routes new requests of the
    /// target's route to its instance.
    pub fn admits(&self, target: &RouteTarget) -> bool {
        let snapshot = self.registry.snapshot();
        snapshot
            .routes()
            .iter()
            .find(|e| e.id == target.route_id)
            .is_some_and(|e| {
                e.instances
                    .iter()
                    .any(|i| i.id == target.instance.id && i.is_routable())
            })
    }

    fn pick(
        &self,
        entry: &RouteEntry,
        exclude: Option<InstanceId>,
    ) -> Result<RouteTarget, RouteError> {
        let candidates: Vec<&BackendInstance> = entry
            .instances
            .iter()
            .filter(|i| i.is_routable() && Some(i.id) != exclude)
            .collect();

        let name = entry.route.name.as_str();
        let Some(instance) = self.balancer.select(name, &candidates) else {
            if exclude.is_none() {
                self.note_outage(name);
            }
            return Err(RouteError::NoHealthyInstance {
                route: name.to_string(),
            });
        };

        if exclude.is_none() {
            self.clear_outage(name);
        }
        Ok(RouteTarget {
            route: Arc::clone(&entry.route),
            route_id: entry.id,
            revision: entry.revision,
            inflight: instance.inflight.acquire(),
            instance: instance.clone(),
        })
    }

    fn note_outage(&self, route: &str) {
        let mut outage = self.outages.entry(route.to_string()).or_insert_with(|| Outage {
            since: Instant::now(),
            alerted: false,
        });
        let elapsed = outage.since.elapsed();
        if !outage.alerted && elapsed >= self.alert_after {
            outage.alerted = true;
            error!(
                route = %route,
                outage_secs = elapsed.as_secs(),
                "route has had no healthy instance beyond the alert threshold"
            );
        }
    }

    fn clear_outage(&self, route: &str) {
        if !self.outages.contains_key(route) {
            return;
        }
        if let Some((_, outage)) = self.outages.remove(route) {
            if outage.alerted {
                info!(route = %route, outage_secs = outage.since.elapsed().as_secs(), "route recovered");
            }
        }
    }

    /// Returns true if a sustained outage alert was raised for the route.
    pub fn is_alerting(&self, route: &str) -> bool {
        self.outages.get(route).is_some_and(|o| o.alerted)
    }

    fn prune(&self, version: u64, live: impl Fn(&str) -> bool) {
        if self.pruned_version.swap(version, Ordering::Relaxed) == version {
            return;
        }
        self.balancer.retain(&live);
        self.outages.retain(|name, _| live(name.as_str()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{HealthState, InstanceSpec, RequiredHeader};
    use http::{HeaderMap, HeaderValue};

    fn store_with(routes: &[(&str, &str, u32)]) -> RegistryStore {
        let store = RegistryStore::default();
        for (name, pattern, priority) in routes {
            store
                .upsert_route(ServiceRoute::new(*name, pattern, *priority).unwrap())
                .unwrap();
        }
        store
    }

    fn healthy(store: &RegistryStore, route: &str, address: &str, weight: u32) {
        let id = store
            .add_instance(route, InstanceSpec::new(address).with_weight(weight))
            .unwrap();
        store.set_instance_health(id, HealthState::Healthy).unwrap();
    }

    #[test]
    fn test_specific_route_beats_catch_all() {
        let store = store_with(&[("catch-all", "/*", 100), ("auth", "/auth/*", 11)]);
        healthy(&store, "catch-all", "10.0.0.1:80", 1);
        healthy(&store, "auth", "10.0.0.2:80", 1);
        let router = Router::new(store, Duration::from_secs(30));

        let target = router.route("/auth/health", &HeaderMap::new()).unwrap();
        assert_eq!(target.route.name, "auth");
        assert_eq!(target.instance.address, "10.0.0.2:80");

        let target = router.route("/other", &HeaderMap::new()).unwrap();
        assert_eq!(target.route.name, "catch-all");
    }

    #[test]
    fn test_lower_priority_value_wins_regardless_of_order() {
        let store = store_with(&[("late", "/api/v1/*", 5), ("early", "/api/*", 20)]);
        healthy(&store, "late", "10.0.0.1:80", 1);
        healthy(&store, "early", "10.0.0.2:80", 1);
        let router = Router::new(store, Duration::from_secs(30));

        let target = router.route("/api/v1/users", &HeaderMap::new()).unwrap();
        assert_eq!(target.route.name, "late");
    }

    #[test]
    fn test_priority_tie_uses_registration_order() {
        let store = store_with(&[("first", "/api/*", 10), ("second", "/api/v1/*", 10)]);
        healthy(&store, "first", "10.0.0.1:80", 1);
        healthy(&store, "second", "10.0.0.2:80", 1);
        let router = Router::new(store, Duration::from_secs(30));

        let target = router.route("/api/v1/x", &HeaderMap::new()).unwrap();
        assert_eq!(target.route.name, "first");
    }

    #[test]
    fn test_no_matching_route() {
        let store = store_with(&[("auth", "/auth/*", 11)]);
        let router = Router::new(store, Duration::from_secs(30));
        assert_eq!(
            router.route("/nope", &HeaderMap::new()).unwrap_err(),
            RouteError::NoMatchingRoute {
                path: "/nope".to_string()
            }
        );
    }

    #[test]
    fn test_unknown_and_unhealthy_instances_excluded() {
        let store = store_with(&[("api", "/api/*", 1)]);
        let unknown = store
            .add_instance("api", InstanceSpec::new("10.0.0.1:80"))
            .unwrap();
        let sick = store
            .add_instance("api", InstanceSpec::new("10.0.0.2:80"))
            .unwrap();
        store.set_instance_health(sick, HealthState::Unhealthy).unwrap();
        let router = Router::new(store.clone(), Duration::from_secs(30));

        assert!(matches!(
            router.route("/api/x", &HeaderMap::new()),
            Err(RouteError::NoHealthyInstance { .. })
        ));

        store.set_instance_health(unknown, HealthState::Healthy).unwrap();
        let target = router.route("/api/x", &HeaderMap::new()).unwrap();
        assert_eq!(target.instance.id, unknown);
    }

    #[test]
    fn test_required_header_gate() {
        let store = RegistryStore::default();
        store
            .upsert_route(
                ServiceRoute::new("gated", "/gateway/*", 1)
                    .unwrap()
                    .with_required_header(RequiredHeader::new("x-edge-token", "s3cret")),
            )
            .unwrap();
        healthy(&store, "gated", "10.0.0.1:80", 1);
        let router = Router::new(store, Duration::from_secs(30));

        assert!(matches!(
            router.route("/gateway/x", &HeaderMap::new()),
            Err(RouteError::ForbiddenHeaderMismatch { .. })
        ));

        let mut headers = HeaderMap::new();
        headers.insert("x-edge-token", HeaderValue::from_static("wrong"));
        assert!(matches!(
            router.route("/gateway/x", &headers),
            Err(RouteError::ForbiddenHeaderMismatch { .. })
        ));

        headers.insert("x-edge-token", HeaderValue::from_static("s3cret"));
        assert_eq!(router.route("/gateway/x", &headers).unwrap().route.name, "gated");
    }

    #[test]
    fn test_header_mismatch_falls_through_to_next_route() {
        let store = RegistryStore::default();
        store
            .upsert_route(
                ServiceRoute::new("internal", "/api/*", 1)
                    .unwrap()
                    .with_required_header(RequiredHeader::new("x-internal", "1")),
            )
            .unwrap();
        store
            .upsert_route(ServiceRoute::new("public", "/api/*", 2).unwrap())
            .unwrap();
        healthy(&store, "internal", "10.0.0.1:80", 1);
        healthy(&store, "public", "10.0.0.2:80", 1);
        let router = Router::new(store, Duration::from_secs(30));

        assert_eq!(router.route("/api/x", &HeaderMap::new()).unwrap().route.name, "public");
    }

    #[test]
    fn test_weighted_selection_through_router() {
        let store = store_with(&[("api", "/api/*", 1)]);
        healthy(&store, "api", "10.0.0.1:80", 1);
        healthy(&store, "api", "10.0.0.2:80", 2);
        let router = Router::new(store, Duration::from_secs(30));

        let heavy = (0..300)
            .filter(|_| {
                router.route("/api/x", &HeaderMap::new()).unwrap().instance.address == "10.0.0.2:80"
            })
            .count();
        assert!((190..=210).contains(&heavy), "got {}", heavy);
    }

    #[test]
    fn test_select_other_skips_previous_instance() {
        let store = store_with(&[("api", "/api/*", 1)]);
        healthy(&store, "api", "10.0.0.1:80", 1);
        let router = Router::new(store.clone(), Duration::from_secs(30));

        let first = router.route("/api/x", &HeaderMap::new()).unwrap();
        assert!(router.select_other(&first).is_none());

        healthy(&store, "api", "10.0.0.2:80", 1);
        let other = router.select_other(&first).unwrap();
        assert_ne!(other.instance.id, first.instance.id);
    }

    #[test]
    fn test_sustained_outage_alerts_once() {
        let store = store_with(&[("api", "/api/*", 1)]);
        let router = Router::new(store.clone(), Duration::ZERO);

        assert!(router.route("/api/x", &HeaderMap::new()).is_err());
        assert!(router.is_alerting("api"));

        healthy(&store, "api", "10.0.0.1:80", 1);
        assert!(router.route("/api/x", &HeaderMap::new()).is_ok());
        assert!(!router.is_alerting("api"));
    }

    #[test]
    fn test_target_holds_inflight_slot() {
        let store = store_with(&[("api", "/api/*", 1)]);
        healthy(&store, "api", "10.0.0.1:80", 1);
        let router = Router::new(store.clone(), Duration::from_secs(30));

        let target = router.route("/api/x", &HeaderMap::new()).unwrap();
        let id = target.instance.id;
        assert_eq!(store.snapshot().instance(id).unwrap().inflight.current(), 1);

        let guard = target.into_guard();
        assert_eq!(store.snapshot().instance(id).unwrap().inflight.current(), 1);
        drop(guard);
        assert_eq!(store.snapshot().instance(id).unwrap().inflight.current(), 0);
    }

    #[test]
    fn test_admits_only_while_instance_attached_and_healthy() {
        let store = store_with(&[("api", "/api/*", 1)]);
        healthy(&store, "api", "10.0.0.1:80", 1);
        let router = Router::new(store.clone(), Duration::from_secs(30));

        let target = router.route("/api/x", &HeaderMap::new()).unwrap();
        assert!(router.admits(&target));

        store
            .set_instance_health(target.instance.id, HealthState::Unhealthy)
            .unwrap();
        assert!(!router.admits(&target));

        store
            .set_instance_health(target.instance.id, HealthState::Healthy)
            .unwrap();
        store.remove_route("api").unwrap();
        assert!(!router.admits(&target));
        assert!(store.snapshot().instance(target.instance.id).is_some());
    }
}
