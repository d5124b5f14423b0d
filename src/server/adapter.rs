//! Connection adapters
//!
//! An adapter wraps the connection's byte stream before the request engine
//! sees it (TLS termination is the usual one). Adapters run in configured
//! order; each returns the wrapped stream plus a handle that is disposed
//! when the connection tears down, innermost adapter first.

use crate::pipe::duplex::BoxedStream;
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

/// Adapter errors
#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    #[error("Handshake failed: {0}")]
    Handshake(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Connection rejected: {0}")]
    Rejected(String),
}

/// Disposable resource created by an adapter
pub trait AdapterHandle: Send {
    fn dispose(self: Box<Self>);
}

/// Handle for adapters with nothing to release
#[derive(Debug, Default)]
pub struct NoopHandle;

impl AdapterHandle for NoopHandle {
    fn dispose(self: Box<Self>) {}
}

/// Result of a successful [`ConnectionAdapter::wrap`]
pub struct AdaptedConnection {
    pub stream: BoxedStream,
    pub handle: Box<dyn AdapterHandle>,
}

impl AdaptedConnection {
    pub fn new(stream: BoxedStream, handle: Box<dyn AdapterHandle>) -> Self {
        AdaptedConnection { stream, handle }
    }

    /// Wrap a stream that needs no teardown of its own
    pub fn without_handle(stream: BoxedStream) -> Self {
        Self::new(stream, Box::new(NoopHandle))
    }
}

/// Stream-wrapping stage applied before request processing
pub trait ConnectionAdapter: Send + Sync {
    /// Name used in logs
    fn name(&self) -> &str;

    /// Whether connections through this adapter are HTTPS
    fn is_https(&self) -> bool {
        false
    }

    /// Wrap `stream`. Must not block indefinitely; the handshake deadline
    /// aborts the underlying pipes if it does.
    fn wrap(
        &self,
        stream: BoxedStream,
        features: &mut ConnectionFeatures,
    ) -> Result<AdaptedConnection, AdapterError>;
}

/// Per-connection feature collection
///
/// Adapters publish what they negotiated here (for example TLS session
/// details) for the request engine to read.
#[derive(Default)]
pub struct ConnectionFeatures {
    remote_addr: Option<SocketAddr>,
    local_addr: Option<SocketAddr>,
    is_https: bool,
    extensions: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
}

impl ConnectionFeatures {
    pub fn new(remote_addr: Option<SocketAddr>, local_addr: Option<SocketAddr>) -> Self {
        ConnectionFeatures {
            remote_addr,
            local_addr,
            ..Default::default()
        }
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn is_https(&self) -> bool {
        self.is_https
    }

    pub fn set_https(&mut self, is_https: bool) {
        self.is_https = is_https;
    }

    /// Store a feature, replacing any previous value of the same type
    pub fn insert<T: Any + Send + Sync>(&mut self, value: T) -> Option<T> {
        self.extensions
            .insert(TypeId::of::<T>(), Box::new(value))
            .and_then(|old| old.downcast::<T>().ok())
            .map(|old| *old)
    }

    pub fn get<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.extensions
            .get(&TypeId::of::<T>())
            .and_then(|value| value.downcast_ref::<T>())
    }

    pub fn contains<T: Any + Send + Sync>(&self) -> bool {
        self.extensions.contains_key(&TypeId::of::<T>())
    }

    /// Drop every feature, addresses included
    pub fn clear(&mut self) {
        self.remote_addr = None;
        self.local_addr = None;
        self.is_https = false;
        self.extensions.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.remote_addr.is_none()
            && self.local_addr.is_none()
            && !self.is_https
            && self.extensions.is_empty()
    }
}

impl fmt::Debug for ConnectionFeatures {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionFeatures")
            .field("remote_addr", &self.remote_addr)
            .field("local_addr", &self.local_addr)
            .field("is_https", &self.is_https)
            .field("extensions", &self.extensions.len())
            .finish()
    }
}

/// Handles collected while applying a chain, disposed in reverse order
#[derive(Default)]
pub struct AdapterHandles {
    handles: Vec<(String, Box<dyn AdapterHandle>)>,
}

impl AdapterHandles {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    fn push(&mut self, name: &str, handle: Box<dyn AdapterHandle>) {
        self.handles.push((name.to_string(), handle));
    }

    /// Dispose every handle, last created first
    ///
    /// A panicking handle is logged and does not stop the others.
    pub fn dispose_all(&mut self) {
        while let Some((name, handle)) = self.handles.pop() {
            if panic::catch_unwind(AssertUnwindSafe(|| handle.dispose())).is_err() {
                tracing::error!(adapter = %name, "adapter handle panicked during dispose");
            }
        }
    }
}

impl Drop for AdapterHandles {
    fn drop(&mut self) {
        self.dispose_all();
    }
}

/// Ordered list of adapters for one endpoint
#[derive(Clone, Default)]
pub struct AdapterChain {
    adapters: Vec<Arc<dyn ConnectionAdapter>>,
}

impl AdapterChain {
    pub fn new(adapters: Vec<Arc<dyn ConnectionAdapter>>) -> Self {
        AdapterChain { adapters }
    }

    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }

    /// Run every adapter over `stream` in order
    ///
    /// Each adapter's handle is pushed to `handles` as soon as it exists.
    /// On the first failure (error or panic) the error is logged, `features`
    /// is cleared and `None` is returned; handles already collected stay in
    /// `handles` for the caller to dispose.
    pub fn apply(
        &self,
        connection_id: &str,
        mut stream: BoxedStream,
        features: &mut ConnectionFeatures,
        handles: &mut AdapterHandles,
    ) -> Option<BoxedStream> {
        for adapter in &self.adapters {
            let result = panic::catch_unwind(AssertUnwindSafe(|| adapter.wrap(stream, features)));
            match result {
                Ok(Ok(adapted)) => {
                    if adapter.is_https() {
                        features.set_https(true);
                    }
                    handles.push(adapter.name(), adapted.handle);
                    stream = adapted.stream;
                }
                Ok(Err(e)) => {
                    tracing::error!(
                        connection_id,
                        adapter = adapter.name(),
                        error = %e,
                        "connection adapter failed"
                    );
                    features.clear();
                    return None;
                }
                Err(_) => {
                    tracing::error!(
                        connection_id,
                        adapter = adapter.name(),
                        "connection adapter panicked"
                    );
                    features.clear();
                    return None;
                }
            }
        }
        Some(stream)
    }
}

impl fmt::Debug for AdapterChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.adapters.iter().map(|adapter| adapter.name()))
            .finish()
    }
}
