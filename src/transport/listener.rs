//! TCP accept loop
//!
//! [`TcpAcceptor`] binds a listening socket through socket2 and hands every
//! accepted connection to a [`ConnectionHandler`]. The accept loop never
//! waits on a connection: `on_accept` returns as soon as the connection's
//! own thread has been started.

use super::tcp::{poll_fd, TcpTransport};
use super::PollEvents;
use crate::server::ConnectionHandler;
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{SocketAddr, TcpListener};
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// How often the accept loop checks for a stop request
const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// A bound, listening TCP socket
#[derive(Debug)]
pub struct TcpAcceptor {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl TcpAcceptor {
    /// Bind and listen on `addr`
    pub fn bind(addr: SocketAddr, backlog: u32) -> io::Result<Self> {
        let domain = if addr.is_ipv4() {
            Domain::IPV4
        } else {
            Domain::IPV6
        };

        let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
        socket.set_reuse_address(true)?;
        socket.bind(&addr.into())?;
        socket.listen(i32::try_from(backlog).unwrap_or(i32::MAX))?;

        let listener: TcpListener = socket.into();
        let local_addr = listener.local_addr()?;
        tracing::info!(%local_addr, "listening");

        Ok(TcpAcceptor {
            listener,
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accept one connection, blocking
    pub fn accept(&self) -> io::Result<TcpTransport> {
        let (stream, _) = self.listener.accept()?;
        TcpTransport::new(stream)
    }

    /// Start the accept loop on its own thread
    pub fn serve(self, handler: Arc<ConnectionHandler>) -> io::Result<AcceptLoop> {
        let stop = Arc::new(AtomicBool::new(false));
        let local_addr = self.local_addr;
        let thread_stop = stop.clone();

        let thread = thread::Builder::new()
            .name("vconn-accept".to_string())
            .spawn(move || self.accept_loop(&handler, &thread_stop))?;

        Ok(AcceptLoop {
            stop,
            local_addr,
            thread: Some(thread),
        })
    }

    fn accept_loop(&self, handler: &ConnectionHandler, stop: &AtomicBool) {
        while !stop.load(Ordering::Acquire) {
            match poll_fd(
                self.listener.as_raw_fd(),
                PollEvents::Read,
                Some(ACCEPT_POLL_INTERVAL),
            ) {
                Ok(false) => continue,
                Ok(true) => {}
                Err(e) => {
                    tracing::error!(error = %e, "poll on listener failed");
                    break;
                }
            }

            match self.accept() {
                Ok(transport) => {
                    if let Err(e) = handler.on_accept(Arc::new(transport)) {
                        tracing::debug!(error = %e, "connection not started");
                    }
                }
                Err(e) => {
                    // Running out of descriptors must not end the loop, but
                    // the listener stays readable, so back off
                    if let Some(pause) = accept_backoff(&e) {
                        tracing::warn!(error = %e, "accept failed");
                        thread::sleep(pause);
                    }
                }
            }
        }
        tracing::debug!(local_addr = %self.local_addr, "accept loop stopped");
    }
}

/// How long to pause after a failed accept; `None` to retry at once
fn accept_backoff(error: &io::Error) -> Option<Duration> {
    match error.kind() {
        io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock => None,
        _ => Some(ACCEPT_POLL_INTERVAL),
    }
}

/// Handle to a running accept loop; stops it on drop
#[derive(Debug)]
pub struct AcceptLoop {
    stop: Arc<AtomicBool>,
    local_addr: SocketAddr,
    thread: Option<JoinHandle<()>>,
}

impl AcceptLoop {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting and wait for the loop to exit
    ///
    /// Connections already accepted keep running.
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::error!("accept loop panicked");
            }
        }
    }
}

impl Drop for AcceptLoop {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::Transport;
    use std::io::Read;
    use std::net::{Shutdown, TcpStream};

    #[test]
    fn test_bind_ephemeral_port() {
        let acceptor = TcpAcceptor::bind("127.0.0.1:0".parse().unwrap(), 16).unwrap();
        assert_ne!(acceptor.local_addr().port(), 0);
    }

    #[test]
    fn test_accept_one() {
        let acceptor = TcpAcceptor::bind("127.0.0.1:0".parse().unwrap(), 16).unwrap();
        let addr = acceptor.local_addr();

        let client = thread::spawn(move || {
            let mut stream = TcpStream::connect(addr).unwrap();
            let mut buf = Vec::new();
            stream.read_to_end(&mut buf).unwrap();
            buf
        });

        let transport = acceptor.accept().unwrap();
        transport.write_all(b"hi").unwrap();
        transport.shutdown(Shutdown::Both).unwrap();

        assert_eq!(client.join().unwrap(), b"hi");
    }

    #[test]
    fn test_accept_backoff_on_persistent_errors() {
        let emfile = io::Error::from_raw_os_error(libc::EMFILE);
        assert_eq!(accept_backoff(&emfile), Some(ACCEPT_POLL_INTERVAL));
        let aborted = io::Error::from(io::ErrorKind::ConnectionAborted);
        assert_eq!(accept_backoff(&aborted), Some(ACCEPT_POLL_INTERVAL));

        let interrupted = io::Error::from(io::ErrorKind::Interrupted);
        assert_eq!(accept_backoff(&interrupted), None);
    }
}
