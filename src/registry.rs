//! Route and backend instance registry.
//!
//! All mutations are serialized through a single writer lock. Each mutation
//! clones the current snapshot, edits the copy and publishes it with one
//! atomic swap, so readers (router, health monitor, admin listing) never
//! block and never observe a half-applied change.

use crate::error::RegistryError;
use crate::metrics::Metrics;
use crate::model::{
    BackendInstance, HealthCheckSpec, HealthState, InstanceId, InstanceSpec, RouteId,
    ServiceRoute,
};
use arc_swap::ArcSwap;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Registry tuning.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Upper bound on how long a draining instance is kept.
    pub drain_timeout: Duration,
    /// How often draining instances are checked for completion.
    pub drain_poll_interval: Duration,
    /// Health check used by routes that do not define their own.
    pub default_health_check: HealthCheckSpec,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            drain_timeout: Duration::from_secs(30),
            drain_poll_interval: Duration::from_millis(50),
            default_health_check: HealthCheckSpec::default(),
        }
    }
}

/// A registered route together with its live instances.
#[derive(Debug, Clone)]
pub struct RouteEntry {
    pub id: RouteId,
    /// Registration order, used to break priority ties.
    pub seq: u64,
    /// Bumped every time the route definition changes.
    pub revision: u64,
    pub route: Arc<ServiceRoute>,
    pub instances: Vec<BackendInstance>,
}

/// Immutable view of the registry.
#[derive(Debug, Clone, Default)]
pub struct RegistrySnapshot {
    version: u64,
    /// Sorted by (priority, seq).
    routes: Vec<RouteEntry>,
    /// Instances detached from their route and waiting to be purged.
    draining: Vec<BackendInstance>,
}

impl RegistrySnapshot {
    /// Monotonic version, bumped on every published mutation.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Routes in evaluation order.
    pub fn routes(&self) -> &[RouteEntry] {
        &self.routes
    }

    /// Looks up a route by name.
    pub fn route(&self, name: &str) -> Option<&RouteEntry> {
        self.routes.iter().find(|e| e.route.name == name)
    }

    /// Instances whose route was removed or that were deregistered.
    pub fn draining(&self) -> &[BackendInstance] {
        &self.draining
    }

    /// Finds an instance, attached or draining.
    pub fn instance(&self, id: InstanceId) -> Option<&BackendInstance> {
        self.routes
            .iter()
            .flat_map(|e| e.instances.iter())
            .chain(self.draining.iter())
            .find(|i| i.id == id)
    }

    /// Iterates over every instance, attached or draining.
    pub fn instances(&self) -> impl Iterator<Item = &BackendInstance> {
        self.routes
            .iter()
            .flat_map(|e| e.instances.iter())
            .chain(self.draining.iter())
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.routes.iter().position(|e| e.route.name == name)
    }

    fn sort_routes(&mut self) {
        self.routes.sort_by_key(|e| (e.route.priority, e.seq));
    }

    fn attached_mut(&mut self, id: InstanceId) -> Option<(usize, usize)> {
        self.routes.iter().enumerate().find_map(|(r, e)| {
            e.instances
                .iter()
                .position(|i| i.id == id)
                .map(|pos| (r, pos))
        })
    }

    fn check_pattern_conflict(&self, route: &ServiceRoute) -> Result<(), RegistryError> {
        if let Some(existing) = self.routes.iter().find(|e| {
            e.route.name != route.name
                && e.route.priority == route.priority
                && e.route.path_pattern == route.path_pattern
        }) {
            return Err(RegistryError::ConflictingPattern {
                pattern: route.path_pattern.to_string(),
                priority: route.priority,
                existing: existing.route.name.clone(),
            });
        }
        Ok(())
    }
}

/// Result of an upsert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpsertOutcome {
    pub id: RouteId,
    /// The route did not exist before.
    pub created: bool,
    /// The registry changed.
    pub changed: bool,
}

#[derive(Debug, Default)]
struct WriterState {
    next_route_id: u64,
    next_instance_id: u64,
    next_seq: u64,
}

struct Inner {
    writer: Mutex<WriterState>,
    current: ArcSwap<RegistrySnapshot>,
    config: RegistryConfig,
}

/// Shared handle to the registry. Cloning is cheap.
#[derive(Clone)]
pub struct RegistryStore {
    inner: Arc<Inner>,
}

impl RegistryStore {
    /// Creates an empty registry.
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                writer: Mutex::new(WriterState::default()),
                current: ArcSwap::from_pointee(RegistrySnapshot::default()),
                config,
            }),
        }
    }

    /// Returns the registry configuration.
    pub fn config(&self) -> &RegistryConfig {
        &self.inner.config
    }

    /// Returns the current snapshot without blocking.
    pub fn snapshot(&self) -> Arc<RegistrySnapshot> {
        self.inner.current.load_full()
    }

    /// Returns the health check that applies to a route.
    pub fn health_spec(&self, route: &ServiceRoute) -> HealthCheckSpec {
        route
            .health_check
            .clone()
            .unwrap_or_else(|| self.inner.config.default_health_check.clone())
    }

    /// Runs `f` against a private copy of the snapshot under the writer lock
    /// and publishes the copy if `f` reports a change.
    fn mutate<T>(
        &self,
        op: &'static str,
        f: impl FnOnce(&mut WriterState, &mut RegistrySnapshot) -> Result<(T, bool), RegistryError>,
    ) -> Result<T, RegistryError> {
        let mut writer = self.inner.writer.lock();
        let mut next = RegistrySnapshot::clone(&self.inner.current.load());
        let (out, changed) = f(&mut writer, &mut next)?;
        if changed {
            next.version += 1;
            self.inner.current.store(Arc::new(next));
            Metrics::record_registry_mutation(op);
        }
        Ok(out)
    }

    fn insert_route(
        writer: &mut WriterState,
        snap: &mut RegistrySnapshot,
        route: ServiceRoute,
    ) -> Result<RouteId, RegistryError> {
        snap.check_pattern_conflict(&route)?;
        writer.next_route_id += 1;
        writer.next_seq += 1;
        let id = RouteId(writer.next_route_id);
        snap.routes.push(RouteEntry {
            id,
            seq: writer.next_seq,
            revision: 1,
            route: Arc::new(route),
            instances: Vec::new(),
        });
        snap.sort_routes();
        Ok(id)
    }

    /// Registers a route or replaces the definition of an existing one.
    ///
    /// Re-registering identical fields is a no-op that returns the same id.
    /// A replaced route keeps its id, registration order and instances.
    pub fn upsert_route(&self, route: ServiceRoute) -> Result<UpsertOutcome, RegistryError> {
        route.validate()?;
        let name = route.name.clone();
        let outcome = self.mutate("upsert_route", |writer, snap| {
            match snap.position(&route.name) {
                Some(pos) => {
                    let entry = &snap.routes[pos];
                    if *entry.route == route {
                        let outcome = UpsertOutcome {
                            id: entry.id,
                            created: false,
                            changed: false,
                        };
                        return Ok((outcome, false));
                    }
                    snap.check_pattern_conflict(&route)?;
                    let entry = &mut snap.routes[pos];
                    entry.route = Arc::new(route);
                    entry.revision += 1;
                    let id = entry.id;
                    snap.sort_routes();
                    Ok((
                        UpsertOutcome {
                            id,
                            created: false,
                            changed: true,
                        },
                        true,
                    ))
                }
                None => {
                    let id = Self::insert_route(writer, snap, route)?;
                    Ok((
                        UpsertOutcome {
                            id,
                            created: true,
                            changed: true,
                        },
                        true,
                    ))
                }
            }
        })?;

        if outcome.changed {
            info!(route = %name, id = %outcome.id, created = outcome.created, "route registered");
        }
        Ok(outcome)
    }

    /// Registers a new route, rejecting an existing name.
    pub fn create_route(&self, route: ServiceRoute) -> Result<RouteId, RegistryError> {
        route.validate()?;
        let name = route.name.clone();
        let id = self.mutate("create_route", |writer, snap| {
            if snap.position(&route.name).is_some() {
                return Err(RegistryError::DuplicateName {
                    name: route.name.clone(),
                });
            }
            Self::insert_route(writer, snap, route).map(|id| (id, true))
        })?;
        info!(route = %name, id = %id, "route created");
        Ok(id)
    }

    /// Removes a route. Its instances stop receiving traffic immediately and
    /// are purged once their in-flight requests finish.
    pub fn remove_route(&self, name: &str) -> Result<Vec<InstanceId>, RegistryError> {
        let now = Instant::now();
        let drained = self.mutate("remove_route", |_, snap| {
            let pos = snap
                .position(name)
                .ok_or_else(|| RegistryError::RouteNotFound {
                    name: name.to_string(),
                })?;
            let entry = snap.routes.remove(pos);
            let mut ids = Vec::with_capacity(entry.instances.len());
            for mut instance in entry.instances {
                instance.start_draining(now);
                ids.push(instance.id);
                snap.draining.push(instance);
            }
            Ok((ids, true))
        })?;

        info!(route = %name, draining = drained.len(), "route removed");
        self.schedule_drain(drained.clone());
        Ok(drained)
    }

    /// Adds a backend instance to a route in the `unknown` state.
    pub fn add_instance(
        &self,
        route_name: &str,
        spec: InstanceSpec,
    ) -> Result<InstanceId, RegistryError> {
        spec.validate()?;
        let id = self.mutate("add_instance", |writer, snap| {
            let pos = snap
                .position(route_name)
                .ok_or_else(|| RegistryError::RouteNotFound {
                    name: route_name.to_string(),
                })?;
            let entry = &mut snap.routes[pos];
            if entry.instances.iter().any(|i| i.address == spec.address) {
                return Err(RegistryError::DuplicateInstance {
                    route: route_name.to_string(),
                    address: spec.address.clone(),
                });
            }
            writer.next_instance_id += 1;
            let id = InstanceId(writer.next_instance_id);
            entry
                .instances
                .push(BackendInstance::new(id, route_name, &spec));
            Ok((id, true))
        })?;

        info!(route = %route_name, instance = %id, address = %spec.address, weight = spec.weight, "instance added");
        Ok(id)
    }

    /// Overrides the health state of an instance.
    ///
    /// Setting `draining` starts a graceful removal.
    pub fn set_instance_health(
        &self,
        id: InstanceId,
        state: HealthState,
    ) -> Result<(), RegistryError> {
        if state == HealthState::Draining {
            return self.remove_instance(id);
        }
        self.mutate("set_instance_health", |_, snap| {
            if let Some((r, i)) = snap.attached_mut(id) {
                let instance = &mut snap.routes[r].instances[i];
                instance.health_state = state;
                instance.consecutive_failures = 0;
                instance.consecutive_successes = 0;
                return Ok(((), true));
            }
            if snap.draining.iter().any(|i| i.id == id) {
                return Err(RegistryError::InstanceDraining { id });
            }
            Err(RegistryError::InstanceNotFound { id })
        })?;
        info!(instance = %id, state = %state, "instance health overridden");
        Ok(())
    }

    /// Applies a probe result and returns the new state on a transition.
    pub fn record_probe(
        &self,
        id: InstanceId,
        success: bool,
        at: Instant,
    ) -> Result<Option<HealthState>, RegistryError> {
        let default_spec = &self.inner.config.default_health_check;
        let (route, transition) = self.mutate("record_probe", |_, snap| {
            if let Some((r, i)) = snap.attached_mut(id) {
                let entry = &mut snap.routes[r];
                let spec = entry.route.health_check.as_ref().unwrap_or(default_spec);
                let transition = entry.instances[i].apply_probe(success, spec, at);
                return Ok(((entry.route.name.clone(), transition), true));
            }
            if let Some(instance) = snap.draining.iter_mut().find(|i| i.id == id) {
                instance.last_probe_at = Some(at);
                return Ok(((instance.route_name.clone(), None), true));
            }
            Err(RegistryError::InstanceNotFound { id })
        })?;

        if let Some(state) = transition {
            Metrics::record_health_transition(&route, state);
            match state {
                HealthState::Healthy => {
                    info!(route = %route, instance = %id, "instance became healthy")
                }
                _ => warn!(route = %route, instance = %id, state = %state, "instance health changed"),
            }
        }
        Ok(transition)
    }

    /// Starts draining an instance. Removing an instance that is already
    /// draining is accepted; one that was purged is not found.
    pub fn remove_instance(&self, id: InstanceId) -> Result<(), RegistryError> {
        let now = Instant::now();
        let started = self.mutate("remove_instance", |_, snap| {
            if let Some((r, i)) = snap.attached_mut(id) {
                let mut instance = snap.routes[r].instances.remove(i);
                instance.start_draining(now);
                snap.draining.push(instance);
                return Ok((true, true));
            }
            if snap.draining.iter().any(|i| i.id == id) {
                return Ok((false, false));
            }
            Err(RegistryError::InstanceNotFound { id })
        })?;

        if started {
            info!(instance = %id, "instance draining");
            self.schedule_drain(vec![id]);
        }
        Ok(())
    }

    /// Removes an instance immediately, skipping the drain.
    pub fn force_remove_instance(&self, id: InstanceId) -> Result<(), RegistryError> {
        self.mutate("force_remove_instance", |_, snap| {
            if let Some((r, i)) = snap.attached_mut(id) {
                snap.routes[r].instances.remove(i);
                return Ok(((), true));
            }
            if let Some(pos) = snap.draining.iter().position(|i| i.id == id) {
                snap.draining.remove(pos);
                return Ok(((), true));
            }
            Err(RegistryError::InstanceNotFound { id })
        })?;
        info!(instance = %id, "instance removed without drain");
        Ok(())
    }

    /// Purges every draining instance whose drain completed or timed out.
    pub fn purge_drained(&self) -> Vec<InstanceId> {
        self.purge_where(|_| true)
    }

    fn purge_where(&self, selected: impl Fn(InstanceId) -> bool) -> Vec<InstanceId> {
        let timeout = self.inner.config.drain_timeout;
        let result = self.mutate("purge_drained", |_, snap| {
            let mut purged = Vec::new();
            snap.draining.retain(|instance| {
                if !selected(instance.id) {
                    return true;
                }
                let inflight = instance.inflight.current();
                let timed_out = instance
                    .draining_since
                    .is_some_and(|since| since.elapsed() >= timeout);
                if inflight == 0 || timed_out {
                    if inflight > 0 {
                        warn!(instance = %instance.id, inflight, "drain timed out, purging with requests in flight");
                    }
                    purged.push(instance.id);
                    false
                } else {
                    true
                }
            });
            let changed = !purged.is_empty();
            Ok((purged, changed))
        });

        match result {
            Ok(purged) => {
                for id in &purged {
                    info!(instance = %id, "drained instance purged");
                }
                purged
            }
            Err(e) => {
                warn!(error = %e, "failed to purge drained instances");
                Vec::new()
            }
        }
    }

    /// Spawns a task that purges the given instances once drained.
    ///
    /// Outside a tokio runtime the instances stay draining until
    /// [`purge_drained`](Self::purge_drained) is called.
    fn schedule_drain(&self, ids: Vec<InstanceId>) {
        if ids.is_empty() {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            debug!(count = ids.len(), "no runtime, drain left to explicit purge");
            return;
        };

        let store = self.clone();
        handle.spawn(async move {
            let mut pending = ids;
            let poll = store.inner.config.drain_poll_interval;
            while !pending.is_empty() {
                tokio::time::sleep(poll).await;
                let purged = store.purge_where(|id| pending.contains(&id));
                let snapshot = store.snapshot();
                pending.retain(|id| {
                    !purged.contains(id) && snapshot.draining.iter().any(|i| i.id == *id)
                });
            }
        });
    }
}

impl Default for RegistryStore {
    fn default() -> Self {
        Self::new(RegistryConfig::default())
    }
}
