//! TLS termination as a connection adapter
//!
//! [`TlsAdapter`] performs the server side of a TLS handshake over the
//! connection's pipe-backed stream and hands the decrypted stream on to the
//! next adapter or the request engine. What was negotiated is published in
//! the connection features as a [`TlsConnectionInfo`].
//!
//! # Examples
//!
//! ```no_run
//! use std::sync::Arc;
//! use vconn::tls::{TlsAdapter, TlsServerConfig, TlsVersion};
//!
//! let config = TlsServerConfig::builder()
//!     .cert_file("server.pem")
//!     .unwrap()
//!     .version_range(TlsVersion::Tls12, TlsVersion::Tls13)
//!     .alpn(&["http/1.1"])
//!     .unwrap()
//!     .build()
//!     .unwrap();
//!
//! let adapter = Arc::new(TlsAdapter::new(config));
//! ```

pub mod adapter;
pub mod builtin_cert;
pub mod config;
pub mod info;

pub use adapter::{TlsAdapter, TlsStream};
pub use config::{ClientVerify, TlsServerConfig, TlsServerConfigBuilder, TlsVersion};
pub use info::{CertInfo, TlsConnectionInfo};

/// TLS errors
#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    #[error("OpenSSL error: {0}")]
    OpenSsl(#[from] openssl::error::ErrorStack),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid TLS version: {0}")]
    InvalidVersion(String),

    #[error("Certificate error: {0}")]
    Certificate(String),

    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),
}

/// Result type for TLS operations
pub type Result<T> = std::result::Result<T, TlsError>;
