//! Plain TCP transport

use super::{PollEvents, Transport};
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::os::fd::AsRawFd;
use std::time::Duration;

/// Poll a raw descriptor with `libc::poll`
pub(crate) fn poll_fd(fd: i32, events: PollEvents, timeout: Option<Duration>) -> io::Result<bool> {
    use libc::{poll, pollfd, POLLIN, POLLOUT};

    let mut pfd = pollfd {
        fd,
        events: match events {
            PollEvents::Read => POLLIN,
            PollEvents::Write => POLLOUT,
            PollEvents::Both => POLLIN | POLLOUT,
        },
        revents: 0,
    };

    let timeout_ms = timeout
        .map(|d| i32::try_from(d.as_millis()).unwrap_or(i32::MAX))
        .unwrap_or(-1); // -1 = infinite

    let result = unsafe { poll(&mut pfd as *mut pollfd, 1, timeout_ms) };

    if result < 0 {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::Interrupted {
            return Ok(false);
        }
        return Err(err);
    }

    Ok(result > 0)
}

/// An accepted TCP connection
#[derive(Debug)]
pub struct TcpTransport {
    stream: TcpStream,
    peer_addr: Option<SocketAddr>,
    local_addr: Option<SocketAddr>,
}

impl TcpTransport {
    /// Wrap a connected stream
    ///
    /// The stream is switched to blocking mode with Nagle disabled.
    pub fn new(stream: TcpStream) -> io::Result<Self> {
        stream.set_nonblocking(false)?;
        stream.set_nodelay(true)?;
        Ok(TcpTransport {
            peer_addr: stream.peer_addr().ok(),
            local_addr: stream.local_addr().ok(),
            stream,
        })
    }

    /// Get a reference to the underlying stream
    pub fn stream(&self) -> &TcpStream {
        &self.stream
    }
}

impl Transport for TcpTransport {
    fn poll(&self, events: PollEvents, timeout: Option<Duration>) -> io::Result<bool> {
        poll_fd(self.stream.as_raw_fd(), events, timeout)
    }

    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        (&self.stream).read(buf)
    }

    fn write(&self, buf: &[u8]) -> io::Result<usize> {
        (&self.stream).write(buf)
    }

    fn flush(&self) -> io::Result<()> {
        (&self.stream).flush()
    }

    fn shutdown(&self, how: Shutdown) -> io::Result<()> {
        match self.stream.shutdown(how) {
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
            other => other,
        }
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::thread;

    #[test]
    fn test_tcp_transport_poll_and_read() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let handle = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            stream.write_all(b"Hello").unwrap();
        });

        let transport = TcpTransport::new(TcpStream::connect(addr).unwrap()).unwrap();
        assert_eq!(transport.peer_addr(), Some(addr));

        assert!(transport
            .poll(PollEvents::Read, Some(Duration::from_secs(1)))
            .unwrap());

        let mut buf = [0u8; 5];
        let n = transport.read(&mut buf).unwrap();
        assert_eq!(n, 5);
        assert_eq!(&buf, b"Hello");

        handle.join().unwrap();
    }

    #[test]
    fn test_tcp_transport_poll_timeout() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let transport = TcpTransport::new(TcpStream::connect(addr).unwrap()).unwrap();
        let (_server, _) = listener.accept().unwrap();

        assert!(!transport
            .poll(PollEvents::Read, Some(Duration::from_millis(50)))
            .unwrap());
    }

    #[test]
    fn test_tcp_transport_shutdown_write() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let transport = TcpTransport::new(TcpStream::connect(addr).unwrap()).unwrap();
        let (mut server, _) = listener.accept().unwrap();

        transport.write_all(b"bye").unwrap();
        transport.shutdown(Shutdown::Write).unwrap();

        let mut received = Vec::new();
        server.read_to_end(&mut received).unwrap();
        assert_eq!(received, b"bye");
    }
}
