//! Shared service context

use super::clock::{Clock, Debugger, ProcessDebugger, SystemClock};
use super::connection_id::ConnectionIdGenerator;
use super::limits::ServerLimits;
use super::registry::ConnectionManager;
use std::fmt;
use std::sync::Arc;

/// Services shared by every connection of a server
///
/// Built once at startup and handed to the [`ConnectionHandler`] and the
/// [`Heartbeat`]. Tests swap in a manual clock, a fixed debugger state or a
/// seeded identifier generator.
///
/// [`ConnectionHandler`]: super::ConnectionHandler
/// [`Heartbeat`]: super::Heartbeat
pub struct ServiceContext {
    pub limits: ServerLimits,
    pub clock: Arc<dyn Clock>,
    pub debugger: Arc<dyn Debugger>,
    pub connection_manager: Arc<ConnectionManager>,
    pub id_generator: Arc<ConnectionIdGenerator>,
}

impl ServiceContext {
    /// Create a context with the system clock and process debugger detection
    pub fn new(limits: ServerLimits) -> Self {
        ServiceContext {
            connection_manager: Arc::new(ConnectionManager::new(&limits)),
            limits,
            clock: Arc::new(SystemClock::new()),
            debugger: Arc::new(ProcessDebugger),
            id_generator: Arc::new(ConnectionIdGenerator::new()),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_debugger(mut self, debugger: Arc<dyn Debugger>) -> Self {
        self.debugger = debugger;
        self
    }

    pub fn with_id_generator(mut self, id_generator: Arc<ConnectionIdGenerator>) -> Self {
        self.id_generator = id_generator;
        self
    }
}

impl fmt::Debug for ServiceContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceContext")
            .field("limits", &self.limits)
            .field("connections", &self.connection_manager.active_count())
            .finish()
    }
}
