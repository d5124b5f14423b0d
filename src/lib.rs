//! vconn - connection lifecycle core for an embedded HTTP server
//!
//! This crate sits between a listening socket and a request-processing
//! engine. It accepts raw connections, wraps them in bounded pipes, runs
//! connection adapters such as TLS, enforces deadlines and minimum data
//! rates, and tears every connection down exactly once.
//!
//! - [`pipe`]: bounded byte pipes with watermark backpressure
//! - [`server`]: connections, timeouts, heartbeat, registry, accept handler
//! - [`transport`]: the raw connection abstraction and a TCP implementation
//! - [`tls`]: TLS termination as a connection adapter

pub mod pipe;
pub mod server;
pub mod tls;
pub mod transport;
