//! Live connection tracking
//!
//! The [`ConnectionManager`] is the one piece of state shared by every
//! connection: a map from [`ConnectionId`] to [`Connection`] plus two
//! counters used to enforce connection quotas and to drain on shutdown.
//! The map lock is held only for single map operations; callbacks run on a
//! snapshot taken outside it.

use super::clock::Debugger;
use super::connection::{AbortReason, Connection};
use super::connection_id::ConnectionId;
use super::heartbeat::HeartbeatHandler;
use super::limits::ServerLimits;
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Saturating counter with an optional upper bound
#[derive(Debug)]
pub struct ResourceCounter {
    max: Option<u64>,
    count: AtomicU64,
}

impl ResourceCounter {
    pub fn unlimited() -> Self {
        ResourceCounter {
            max: None,
            count: AtomicU64::new(0),
        }
    }

    pub fn quota(max: u64) -> Self {
        ResourceCounter {
            max: Some(max),
            count: AtomicU64::new(0),
        }
    }

    fn from_limit(max: Option<u64>) -> Self {
        max.map_or_else(Self::unlimited, Self::quota)
    }

    /// Take one unit. Returns false if the quota is exhausted.
    pub fn try_lock_one(&self) -> bool {
        let max = self.max.unwrap_or(u64::MAX);
        self.count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                (count < max).then_some(count + 1)
            })
            .is_ok()
    }

    /// Give one unit back. Returns false if the count was already zero.
    pub fn release_one(&self) -> bool {
        self.count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| count.checked_sub(1))
            .is_ok()
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Acquire)
    }

    pub fn max(&self) -> Option<u64> {
        self.max
    }
}

/// Registry of live connections
pub struct ConnectionManager {
    connections: Mutex<HashMap<ConnectionId, Arc<Connection>>>,
    drained: Condvar,
    normal: ResourceCounter,
    upgraded: ResourceCounter,
    total_added: AtomicU64,
    total_removed: AtomicU64,
}

impl ConnectionManager {
    pub fn new(limits: &ServerLimits) -> Self {
        ConnectionManager {
            connections: Mutex::new(HashMap::new()),
            drained: Condvar::new(),
            normal: ResourceCounter::from_limit(limits.max_concurrent_connections()),
            upgraded: ResourceCounter::from_limit(limits.max_concurrent_upgraded_connections()),
            total_added: AtomicU64::new(0),
            total_removed: AtomicU64::new(0),
        }
    }

    /// Register a connection under its id
    pub fn add(&self, connection: Arc<Connection>) {
        let id = *connection.id();
        let previous = self.connections.lock().insert(id, connection);
        debug_assert!(previous.is_none(), "duplicate connection id {}", id);
        self.total_added.fetch_add(1, Ordering::AcqRel);
    }

    /// Deregister a connection. Returns false if it was not registered.
    pub fn remove(&self, id: &ConnectionId) -> bool {
        let mut connections = self.connections.lock();
        if connections.remove(id).is_none() {
            return false;
        }
        self.total_removed.fetch_add(1, Ordering::AcqRel);
        if connections.is_empty() {
            self.drained.notify_all();
        }
        true
    }

    pub fn get(&self, id: &ConnectionId) -> Option<Arc<Connection>> {
        self.connections.lock().get(id).cloned()
    }

    pub fn active_count(&self) -> usize {
        self.connections.lock().len()
    }

    /// Connections ever added
    pub fn total_added(&self) -> u64 {
        self.total_added.load(Ordering::Acquire)
    }

    /// Connections ever removed
    pub fn total_removed(&self) -> u64 {
        self.total_removed.load(Ordering::Acquire)
    }

    /// Counter for connections that have not been upgraded
    pub fn normal_connections(&self) -> &ResourceCounter {
        &self.normal
    }

    /// Counter for upgraded (e.g. WebSocket) connections
    pub fn upgraded_connections(&self) -> &ResourceCounter {
        &self.upgraded
    }

    /// Call `f` for every live connection
    pub fn walk(&self, mut f: impl FnMut(&Arc<Connection>)) {
        let snapshot: Vec<Arc<Connection>> = self.connections.lock().values().cloned().collect();
        for connection in &snapshot {
            f(connection);
        }
    }

    /// Block until no connection is registered or `timeout` elapses
    pub fn wait_all_closed(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut connections = self.connections.lock();
        while !connections.is_empty() {
            if self.drained.wait_until(&mut connections, deadline).timed_out() {
                return connections.is_empty();
            }
        }
        true
    }

    /// Ask every connection to stop and wait for them to close
    pub fn close_all_gracefully(&self, timeout: Duration) -> bool {
        let mut count = 0;
        self.walk(|connection| {
            connection.request_graceful_stop();
            count += 1;
        });
        tracing::debug!(connections = count, "requested graceful stop");
        self.wait_all_closed(timeout)
    }

    /// Abort every connection and wait for them to close
    pub fn abort_all(&self, timeout: Duration) -> bool {
        self.walk(|connection| {
            connection.abort(AbortReason::ServerShutdown);
        });
        let closed = self.wait_all_closed(timeout);
        if !closed {
            tracing::warn!(
                remaining = self.active_count(),
                "connections still open after abort"
            );
        }
        closed
    }
}

impl HeartbeatHandler for ConnectionManager {
    fn on_heartbeat(&self, now: i64, debugger: &dyn Debugger) {
        self.walk(|connection| connection.tick(now, debugger));
    }
}
