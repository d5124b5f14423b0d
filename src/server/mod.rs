//! Connection lifecycle core
//!
//! This module turns accepted transport connections into running
//! [`Connection`]s and keeps them honest: bounded pipes in both directions,
//! deadlines and minimum data rates evaluated by a process-wide
//! [`Heartbeat`], an ordered chain of [`ConnectionAdapter`]s (TLS) in front of
//! the request engine, and a [`ConnectionManager`] that tracks every live
//! connection for graceful shutdown.
//!
//! # Architecture
//!
//! ```text
//! transport -> ConnectionHandler::on_accept
//!                 |  id, pipes, registry entry
//!                 v
//!              Connection (own thread)
//!                 |  adapters -> RequestProcessor::process
//!                 |  Heartbeat -> Connection::tick
//!                 v
//!              teardown: adapters disposed in reverse, pumps joined,
//!                        transport closed, registry entry removed
//! ```
//!
//! Each connection runs on its own thread, with an input pump and an output
//! pump moving bytes between the transport and the pipes. The pipes are the
//! only backpressure mechanism: a slow peer blocks the engine's writes, a slow
//! engine blocks the input pump.
//!
//! # Examples
//!
//! ```no_run
//! use std::sync::Arc;
//! use vconn::server::{
//!     ConnectionHandler, Heartbeat, ProcessContext, ProcessError, RequestProcessor,
//!     ServerLimits, ServiceContext,
//! };
//! use vconn::transport::TcpAcceptor;
//!
//! struct Echo;
//!
//! impl RequestProcessor for Echo {
//!     fn process(&self, ctx: &mut ProcessContext<'_>) -> Result<(), ProcessError> {
//!         std::io::copy(&mut ctx.stream(), &mut Vec::new())?;
//!         Ok(())
//!     }
//! }
//!
//! let context = Arc::new(ServiceContext::new(ServerLimits::default()));
//! let _heartbeat = Heartbeat::for_context(&context).unwrap();
//!
//! let handler = Arc::new(ConnectionHandler::new(context, Arc::new(Echo)));
//! let acceptor = TcpAcceptor::bind("127.0.0.1:8080".parse().unwrap(), 128).unwrap();
//! let _accept_loop = acceptor.serve(handler).unwrap();
//! ```

pub mod adapter;
pub mod clock;
pub mod connection;
pub mod connection_id;
pub mod context;
pub mod handler;
pub mod heartbeat;
pub mod limits;
pub mod pump;
pub mod registry;
pub mod signal;
pub mod timeout;

pub use adapter::{
    AdaptedConnection, AdapterChain, AdapterError, AdapterHandle, AdapterHandles, ConnectionAdapter,
    ConnectionFeatures, NoopHandle,
};
pub use clock::{Clock, Debugger, ManualClock, ProcessDebugger, StaticDebugger, SystemClock};
pub use connection::{AbortReason, Connection, ConnectionPipes, ConnectionState};
pub use connection_id::{ConnectionId, ConnectionIdGenerator};
pub use context::ServiceContext;
pub use handler::{ConnectionHandler, ProcessContext, ProcessError, RequestProcessor};
pub use heartbeat::{Heartbeat, HeartbeatHandler};
pub use limits::{ConfigError, MinDataRate, ServerLimits, ServerLimitsBuilder};
pub use registry::{ConnectionManager, ResourceCounter};
pub use signal::Completion;
pub use timeout::{TimeoutAction, TimeoutControl, TimeoutFired, TimeoutNotifiable, TimeoutReason};

/// Result type for server operations
pub type Result<T> = std::result::Result<T, Error>;

/// Server errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connection limit reached")]
    ConnectionLimitReached,

    #[error("Upgraded connection limit reached")]
    UpgradedConnectionLimitReached,

    #[error("Connection already upgraded")]
    AlreadyUpgraded,
}

/// Thread name prefix for connection threads
pub const CONNECTION_THREAD_PREFIX: &str = "vconn-conn";
