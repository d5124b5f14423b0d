//! Connection identifiers
//!
//! Identifiers are a 64-bit counter rendered as 13 base-32 characters, most
//! significant first. Fixed width plus an ASCII-ordered alphabet means the
//! string order matches creation order, which keeps logs sortable.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Base-32 alphabet, ascending in ASCII order
const ENCODE_32_CHARS: &[u8; 32] = b"0123456789ABCDEFGHIJKLMNOPQRSTUV";

/// Encoded identifier length
pub const CONNECTION_ID_LEN: usize = 13;

/// Opaque, sortable connection identifier
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId([u8; CONNECTION_ID_LEN]);

impl ConnectionId {
    /// Encode a raw counter value
    pub fn encode(value: u64) -> Self {
        let mut chars = [0u8; CONNECTION_ID_LEN];
        for (i, c) in chars.iter_mut().enumerate() {
            let shift = 60 - 5 * i as u32;
            *c = ENCODE_32_CHARS[((value >> shift) & 31) as usize];
        }
        ConnectionId(chars)
    }

    /// Get the identifier as a string slice
    pub fn as_str(&self) -> &str {
        // The alphabet is pure ASCII
        std::str::from_utf8(&self.0).unwrap_or_default()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Debug for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ConnectionId({})", self.as_str())
    }
}

/// Process-wide source of connection identifiers
///
/// Construct once and share through the service context. Tests can fix the
/// starting point with [`with_seed`](Self::with_seed).
#[derive(Debug)]
pub struct ConnectionIdGenerator {
    last: AtomicU64,
}

impl ConnectionIdGenerator {
    /// Seed from wall-clock time in 100ns units
    pub fn new() -> Self {
        let seed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| (d.as_nanos() / 100) as u64)
            .unwrap_or(0);
        Self::with_seed(seed)
    }

    /// Start counting from `seed`; the first identifier encodes `seed + 1`
    pub fn with_seed(seed: u64) -> Self {
        ConnectionIdGenerator {
            last: AtomicU64::new(seed),
        }
    }

    /// Produce the next identifier
    pub fn next_id(&self) -> ConnectionId {
        let value = self.last.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        ConnectionId::encode(value)
    }
}

impl Default for ConnectionIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}
