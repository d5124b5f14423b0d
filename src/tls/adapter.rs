//! Server-side TLS adapter

use super::config::TlsServerConfig;
use super::info::TlsConnectionInfo;
use crate::pipe::{BoxedStream, ConnectionStream};
use crate::server::{AdaptedConnection, AdapterError, ConnectionAdapter, ConnectionFeatures};
use openssl::ssl::{ErrorCode, HandshakeError, Ssl, SslStream};
use std::io::{self, Read, Write};

/// Terminates TLS on every connection it wraps
pub struct TlsAdapter {
    config: TlsServerConfig,
}

impl TlsAdapter {
    pub fn new(config: TlsServerConfig) -> Self {
        TlsAdapter { config }
    }
}

impl ConnectionAdapter for TlsAdapter {
    fn name(&self) -> &str {
        "tls"
    }

    fn is_https(&self) -> bool {
        true
    }

    fn wrap(
        &self,
        stream: BoxedStream,
        features: &mut ConnectionFeatures,
    ) -> Result<AdaptedConnection, AdapterError> {
        let ssl = Ssl::new(&self.config.ctx)
            .map_err(|e| AdapterError::Handshake(format!("Failed to create session: {}", e)))?;

        // The inner stream blocks, so accept runs the whole handshake
        let stream = ssl.accept(stream).map_err(|e| {
            AdapterError::Handshake(match e {
                HandshakeError::SetupFailure(stack) => stack.to_string(),
                HandshakeError::Failure(mid) | HandshakeError::WouldBlock(mid) => {
                    mid.error().to_string()
                }
            })
        })?;

        let info = TlsConnectionInfo::from_ssl(stream.ssl());
        tracing::debug!(
            version = %info.version,
            cipher = ?info.cipher,
            alpn = ?info.alpn,
            "TLS handshake completed"
        );
        features.insert(info);

        Ok(AdaptedConnection::without_handle(Box::new(TlsStream { inner: stream })))
    }
}

/// Decrypted stream over an inner [`ConnectionStream`]
pub struct TlsStream {
    inner: SslStream<BoxedStream>,
}

impl TlsStream {
    /// Negotiated session
    pub fn info(&self) -> TlsConnectionInfo {
        TlsConnectionInfo::from_ssl(self.inner.ssl())
    }
}

impl Read for TlsStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.inner.ssl_read(buf) {
            Ok(n) => Ok(n),
            Err(e) if e.code() == ErrorCode::ZERO_RETURN => Ok(0),
            // Peer closed without close_notify
            Err(e) if e.code() == ErrorCode::SYSCALL && e.io_error().is_none() => Ok(0),
            Err(e) => Err(e
                .into_io_error()
                .unwrap_or_else(|e| io::Error::new(io::ErrorKind::Other, e))),
        }
    }
}

impl Write for TlsStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl ConnectionStream for TlsStream {
    /// Send close_notify, then close the inner stream
    fn close(&mut self) -> io::Result<()> {
        match self.inner.shutdown() {
            Ok(_) => {}
            Err(e) if e.code() == ErrorCode::ZERO_RETURN => {}
            Err(e) => {
                tracing::trace!(error = %e, "TLS shutdown failed");
            }
        }
        self.inner.get_mut().close()
    }
}
