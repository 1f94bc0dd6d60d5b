//! Connection limiting for listeners.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

#[derive(Debug, Default)]
struct Counters {
    active: AtomicUsize,
    accepted: AtomicUsize,
    rejected: AtomicUsize,
}

/// Caps the number of concurrently served connections.
///
/// Cloning shares the same limit.
#[derive(Debug, Clone)]
pub struct ConnectionLimiter {
    semaphore: Arc<Semaphore>,
    counters: Arc<Counters>,
    max_connections: usize,
}

impl ConnectionLimiter {
    pub fn new(max_connections: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_connections)),
            counters: Arc::new(Counters::default()),
            max_connections,
        }
    }

    /// Returns a guard if below the limit, `None` otherwise.
    ///
    /// The guard is owned so it can move into the connection task.
    pub fn try_acquire(&self) -> Option<ConnectionGuard> {
        match Arc::clone(&self.semaphore).try_acquire_owned() {
            Ok(permit) => {
                let active = self.counters.active.fetch_add(1, Ordering::Relaxed) + 1;
                self.counters.accepted.fetch_add(1, Ordering::Relaxed);
                debug!(active, "connection acquired");
                Some(ConnectionGuard {
                    _permit: permit,
                    counters: Arc::clone(&self.counters),
                })
            }
            Err(_) => {
                self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                warn!(max = self.max_connections, "connection limit reached, rejecting");
                None
            }
        }
    }

    pub fn stats(&self) -> ConnectionStats {
        ConnectionStats {
            active: self.counters.active.load(Ordering::Relaxed),
            total_accepted: self.counters.accepted.load(Ordering::Relaxed),
            total_rejected: self.counters.rejected.load(Ordering::Relaxed),
            max_connections: self.max_connections,
        }
    }
}

/// Releases a connection slot when dropped.
#[derive(Debug)]
pub struct ConnectionGuard {
    _permit: OwnedSemaphorePermit,
    counters: Arc<Counters>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        let active = self.counters.active.fetch_sub(1, Ordering::Relaxed) - 1;
        debug!(active, "connection released");
    }
}

/// Snapshot of connection usage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionStats {
    pub active: usize,
    pub total_accepted: usize,
    pub total_rejected: usize,
    pub max_connections: usize,
}
