//! Transport abstraction
//!
//! A [`Transport`] is one accepted, raw, duplex connection. The connection
//! core only reads, writes, polls and shuts it down; everything else (TLS,
//! HTTP) sits above it. Plain TCP is provided by [`TcpTransport`] and
//! [`TcpAcceptor`].

pub mod listener;
pub mod tcp;

pub use listener::{AcceptLoop, TcpAcceptor};
pub use tcp::TcpTransport;

use std::io;
use std::net::{Shutdown, SocketAddr};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Poll events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollEvents {
    Read,
    Write,
    Both,
}

/// Where a connection's pump work runs
///
/// The transport supplies one for its input side and one for its output
/// side. The default starts a named thread per job.
pub trait IoScheduler: Send + Sync {
    fn schedule(&self, name: String, job: Box<dyn FnOnce() + Send>) -> io::Result<()>;
}

/// Runs every job on a fresh named thread
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadScheduler;

impl IoScheduler for ThreadScheduler {
    fn schedule(&self, name: String, job: Box<dyn FnOnce() + Send>) -> io::Result<()> {
        thread::Builder::new().name(name).spawn(job).map(|_| ())
    }
}

/// A raw accepted connection
///
/// All operations take `&self` so that the input pump, the output pump and
/// the owning connection can share one transport.
pub trait Transport: Send + Sync {
    /// Wait until the transport is ready for `events`
    ///
    /// Returns false on timeout. `None` waits indefinitely.
    fn poll(&self, events: PollEvents, timeout: Option<Duration>) -> io::Result<bool>;

    fn read(&self, buf: &mut [u8]) -> io::Result<usize>;

    fn write(&self, buf: &[u8]) -> io::Result<usize>;

    fn flush(&self) -> io::Result<()>;

    fn shutdown(&self, how: Shutdown) -> io::Result<()>;

    fn peer_addr(&self) -> Option<SocketAddr>;

    fn local_addr(&self) -> Option<SocketAddr>;

    /// Scheduler for the input pump
    fn input_scheduler(&self) -> Arc<dyn IoScheduler> {
        Arc::new(ThreadScheduler)
    }

    /// Scheduler for the output pump
    fn output_scheduler(&self) -> Arc<dyn IoScheduler> {
        Arc::new(ThreadScheduler)
    }

    /// Write the whole buffer
    fn write_all(&self, mut buf: &[u8]) -> io::Result<()> {
        while !buf.is_empty() {
            match self.write(buf) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "failed to write whole buffer",
                    ))
                }
                Ok(n) => buf = &buf[n..],
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}
