//! Accept entry point and the request engine boundary

use super::adapter::{AdapterChain, ConnectionAdapter, ConnectionFeatures};
use super::connection::{AbortReason, Connection, ConnectionPipes};
use super::connection_id::ConnectionId;
use super::context::ServiceContext;
use super::limits::ServerLimits;
use super::timeout::{TimeoutNotifiable, TimeoutReason};
use crate::pipe::{BoxedStream, ConnectionStream};
use crate::transport::Transport;
use bytes::Bytes;
use std::io;
use std::net::Shutdown;
use std::sync::Arc;

/// Request engine errors
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Application error: {0}")]
    Application(String),
}

/// The request-processing engine (an HTTP implementation, typically)
///
/// `process` runs the whole protocol loop for one connection and returns
/// when the connection should close. It reports progress through
/// [`ProcessContext::timeout_control`] so that deadlines and data rates can
/// be enforced.
pub trait RequestProcessor: Send + Sync + 'static {
    fn process(&self, ctx: &mut ProcessContext<'_>) -> Result<(), ProcessError>;

    /// Bytes to send when a deadline armed with
    /// [`TimeoutAction::SendTimeoutResponse`](super::TimeoutAction) fires
    ///
    /// Called on the heartbeat thread. `None` closes without a response.
    fn timeout_response(&self, reason: TimeoutReason) -> Option<Bytes> {
        let _ = reason;
        None
    }
}

/// What the request engine gets to see of its connection
pub struct ProcessContext<'a> {
    connection: &'a Connection,
    stream: &'a mut BoxedStream,
    features: &'a ConnectionFeatures,
}

impl<'a> ProcessContext<'a> {
    pub(crate) fn new(
        connection: &'a Connection,
        stream: &'a mut BoxedStream,
        features: &'a ConnectionFeatures,
    ) -> Self {
        ProcessContext {
            connection,
            stream,
            features,
        }
    }

    pub fn connection_id(&self) -> &ConnectionId {
        self.connection.id()
    }

    /// The stream produced by the adapter chain
    pub fn stream(&mut self) -> &mut dyn ConnectionStream {
        &mut **self.stream
    }

    /// Timing operations for this connection
    pub fn timeout_control(&self) -> &dyn TimeoutNotifiable {
        self.connection
    }

    pub fn features(&self) -> &ConnectionFeatures {
        self.features
    }

    pub fn limits(&self) -> &ServerLimits {
        self.connection.limits()
    }

    /// Whether the server asked this connection to wind down
    pub fn is_stop_requested(&self) -> bool {
        self.connection.is_stop_requested()
    }

    /// Move the connection to the upgraded quota (e.g. after a WebSocket handshake)
    pub fn upgrade(&self) -> super::Result<()> {
        self.connection.upgrade()
    }

    /// Abort the connection from inside the engine
    pub fn abort(&self, reason: impl Into<String>) {
        self.connection.abort(AbortReason::Requested(reason.into()));
    }
}

/// Turns accepted transports into running connections
pub struct ConnectionHandler {
    context: Arc<ServiceContext>,
    processor: Arc<dyn RequestProcessor>,
    adapters: AdapterChain,
}

impl ConnectionHandler {
    pub fn new(context: Arc<ServiceContext>, processor: Arc<dyn RequestProcessor>) -> Self {
        ConnectionHandler {
            context,
            processor,
            adapters: AdapterChain::default(),
        }
    }

    /// Set the adapters applied to every connection, outermost first
    pub fn with_adapters(mut self, adapters: Vec<Arc<dyn ConnectionAdapter>>) -> Self {
        self.adapters = AdapterChain::new(adapters);
        self
    }

    pub fn context(&self) -> &Arc<ServiceContext> {
        &self.context
    }

    /// Start a connection for `transport`
    ///
    /// Never blocks on the connection: its id and pipes are allocated, it is
    /// registered and its thread started, then this returns. Fails with
    /// [`ConnectionLimitReached`](super::Error::ConnectionLimitReached) over
    /// quota, or with the spawn error if the connection could not be started;
    /// either way the transport has been closed.
    pub fn on_accept(&self, transport: Arc<dyn Transport>) -> super::Result<Arc<Connection>> {
        let manager = &self.context.connection_manager;
        if !manager.normal_connections().try_lock_one() {
            tracing::warn!(
                remote_addr = ?transport.peer_addr(),
                limit = ?manager.normal_connections().max(),
                "connection limit reached, rejecting connection"
            );
            if let Err(e) = transport.shutdown(Shutdown::Both) {
                tracing::trace!(error = %e, "transport shutdown failed");
            }
            return Err(super::Error::ConnectionLimitReached);
        }

        let id = self.context.id_generator.next_id();
        let pipes = ConnectionPipes::new(&self.context.limits);
        let connection = Arc::new(Connection::new(
            id,
            Arc::clone(&self.context),
            Arc::clone(&self.processor),
            self.adapters.clone(),
            transport,
            &pipes,
        ));
        manager.add(Arc::clone(&connection));

        connection.start(pipes)?;
        Ok(connection)
    }
}
