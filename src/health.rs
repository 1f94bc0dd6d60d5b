//! Active health checking of backend instances.
//!
//! Every attached instance gets its own probe task, so a hanging probe only
//! delays that instance. A shared semaphore caps how many probes run at once
//! across all instances. Results are reported through
//! [`RegistryStore::record_probe`], which owns the state transitions.

use crate::error::RegistryError;
use crate::model::{HealthCheckSpec, InstanceId};
use crate::registry::RegistryStore;
use bytes::Bytes;
use http::Uri;
use http_body_util::Empty;
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use hyper_util::rt::TokioExecutor;
use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{timeout, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Why a probe failed. Never fatal; only feeds health transitions.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProbeError {
    #[error("probe timed out after {0:?}")]
    Timeout(Duration),

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("unexpected status {0}")]
    Status(u16),

    #[error("invalid probe target: {0}")]
    InvalidTarget(String),
}

/// Health monitor settings.
#[derive(Debug, Clone)]
pub struct HealthMonitorConfig {
    /// Upper bound on probes in flight across all instances.
    pub max_concurrent_probes: usize,
    /// How often the set of probe tasks is reconciled with the registry.
    pub reconcile_interval: Duration,
}

impl Default for HealthMonitorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_probes: 64,
            reconcile_interval: Duration::from_secs(1),
        }
    }
}

type ProbeClient = Client<HttpConnector, Empty<Bytes>>;

/// Issues one probe: HTTP GET on `spec.path`, or a TCP connect when no path
/// is set. Any 2xx or 3xx status counts as success.
pub async fn probe(
    client: &ProbeClient,
    address: &str,
    spec: &HealthCheckSpec,
) -> Result<(), ProbeError> {
    let attempt = async {
        match &spec.path {
            Some(path) => {
                let uri: Uri = format!("http://{}{}", address, path)
                    .parse()
                    .map_err(|e: http::uri::InvalidUri| ProbeError::InvalidTarget(e.to_string()))?;
                let response = client
                    .get(uri)
                    .await
                    .map_err(|e| ProbeError::Connect(e.to_string()))?;
                let status = response.status();
                if status.is_success() || status.is_redirection() {
                    Ok(())
                } else {
                    Err(ProbeError::Status(status.as_u16()))
                }
            }
            None => TcpStream::connect(address)
                .await
                .map(|_| ())
                .map_err(|e| ProbeError::Connect(e.to_string())),
        }
    };

    match timeout(spec.timeout(), attempt).await {
        Ok(result) => result,
        Err(_) => Err(ProbeError::Timeout(spec.timeout())),
    }
}

struct ProbeTask {
    handle: JoinHandle<()>,
    spec: HealthCheckSpec,
}

/// Keeps one probe task per attached instance.
pub struct HealthMonitor {
    registry: RegistryStore,
    client: ProbeClient,
    permits: Arc<Semaphore>,
    config: HealthMonitorConfig,
    tasks: HashMap<InstanceId, ProbeTask>,
}

impl HealthMonitor {
    pub fn new(registry: RegistryStore, config: HealthMonitorConfig) -> Self {
        Self {
            registry,
            client: Client::builder(TokioExecutor::new()).build_http(),
            permits: Arc::new(Semaphore::new(config.max_concurrent_probes.max(1))),
            config,
            tasks: HashMap::new(),
        }
    }

    /// Runs until a shutdown signal is received, then aborts all probes.
    pub async fn run(mut self, mut shutdown_rx: broadcast::Receiver<()>) {
        info!(
            max_concurrent_probes = self.config.max_concurrent_probes,
            "health monitor started"
        );
        let mut ticker = tokio::time::interval(self.config.reconcile_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => self.reconcile(),
                _ = shutdown_rx.recv() => {
                    info!("health monitor stopping");
                    break;
                }
            }
        }

        for (_, task) in self.tasks.drain() {
            task.handle.abort();
        }
    }

    /// Starts probe tasks for new instances, restarts those whose route
    /// changed its health check, and stops those no longer attached.
    pub fn reconcile(&mut self) {
        let snapshot = self.registry.snapshot();
        let mut live = HashMap::new();
        for entry in snapshot.routes() {
            let spec = self.registry.health_spec(&entry.route);
            for instance in &entry.instances {
                live.insert(instance.id, (instance.address.clone(), instance.registered_at, spec.clone()));
            }
        }

        self.tasks.retain(|id, task| {
            let keep = !task.handle.is_finished()
                && live.get(id).is_some_and(|(_, _, spec)| *spec == task.spec);
            if !keep {
                debug!(instance = %id, "stopping probe task");
                task.handle.abort();
            }
            keep
        });

        for (id, (address, registered_at, spec)) in live {
            if self.tasks.contains_key(&id) {
                continue;
            }
            debug!(instance = %id, address = %address, "starting probe task");
            let handle = tokio::spawn(probe_loop(
                self.registry.clone(),
                self.client.clone(),
                Arc::clone(&self.permits),
                id,
                address,
                registered_at,
                spec.clone(),
            ));
            self.tasks.insert(id, ProbeTask { handle, spec });
        }
    }

    /// Number of running probe tasks.
    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }
}

async fn probe_loop(
    registry: RegistryStore,
    client: ProbeClient,
    permits: Arc<Semaphore>,
    id: InstanceId,
    address: String,
    registered_at: Instant,
    spec: HealthCheckSpec,
) {
    let Some(grace_end) = registered_at.checked_add(spec.grace()) else {
        warn!(instance = %id, "grace period out of range, not probing");
        return;
    };
    let now = Instant::now();
    if grace_end > now {
        tokio::time::sleep(grace_end - now).await;
    }

    let interval = spec.interval();
    let max_jitter = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX);
    let jitter_ms = rand::thread_rng().gen_range(0..=max_jitter);
    tokio::time::sleep(Duration::from_millis(jitter_ms)).await;

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;

        let result = {
            let Ok(_permit) = permits.acquire().await else {
                break;
            };
            probe(&client, &address, &spec).await
        };

        if let Err(e) = &result {
            debug!(instance = %id, address = %address, error = %e, "probe failed");
        }

        match registry.record_probe(id, result.is_ok(), Instant::now()) {
            Ok(_) => {}
            Err(RegistryError::InstanceNotFound { .. }) => {
                debug!(instance = %id, "instance gone, stopping probes");
                break;
            }
            Err(e) => {
                warn!(instance = %id, error = %e, "failed to record probe, retrying next cycle");
            }
        }
    }
}
