//! Server limits
//!
//! The read-only configuration surface consumed by the connection core:
//! buffer sizes, minimum data rates, deadlines and connection quotas.
//! Built with [`ServerLimitsBuilder`] and validated once.

use std::fmt;
use std::time::Duration;

/// Default maximum request buffer size (1 MiB)
pub const DEFAULT_MAX_REQUEST_BUFFER_SIZE: usize = 1024 * 1024;

/// Default maximum response buffer size (64 KiB)
pub const DEFAULT_MAX_RESPONSE_BUFFER_SIZE: usize = 64 * 1024;

/// Default minimum data rate in bytes per second
pub const DEFAULT_MIN_DATA_RATE: f64 = 240.0;

/// Default minimum data rate grace period
pub const DEFAULT_MIN_DATA_RATE_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// Default keep-alive timeout
pub const DEFAULT_KEEP_ALIVE_TIMEOUT: Duration = Duration::from_secs(130);

/// Default request headers timeout
pub const DEFAULT_REQUEST_HEADERS_TIMEOUT: Duration = Duration::from_secs(30);

/// Default time allowed for the adapter chain (TLS handshake)
pub const DEFAULT_ADAPTER_TIMEOUT: Duration = Duration::from_secs(10);

/// Default time an engine gets to honour a graceful stop
pub const DEFAULT_GRACEFUL_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Default heartbeat interval
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);

/// Configuration errors
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid data rate: {0} bytes/second")]
    InvalidDataRate(f64),

    #[error("Invalid duration for {name}: must be non-zero")]
    ZeroDuration { name: &'static str },

    #[error("Invalid limit for {name}: {reason}")]
    InvalidLimit { name: &'static str, reason: String },
}

/// Minimum data rate with a grace period
///
/// A transfer is only judged against the rate once it has been timed for
/// longer than the grace period.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MinDataRate {
    bytes_per_second: f64,
    grace_period: Duration,
}

impl MinDataRate {
    /// Create a rate; `bytes_per_second` must be finite and non-negative
    pub fn new(bytes_per_second: f64, grace_period: Duration) -> Result<Self, ConfigError> {
        if !bytes_per_second.is_finite() || bytes_per_second < 0.0 {
            return Err(ConfigError::InvalidDataRate(bytes_per_second));
        }
        Ok(MinDataRate {
            bytes_per_second,
            grace_period,
        })
    }

    /// Minimum bytes per second
    pub fn bytes_per_second(&self) -> f64 {
        self.bytes_per_second
    }

    /// Grace period before the rate is enforced
    pub fn grace_period(&self) -> Duration {
        self.grace_period
    }

    /// Whether this rate is actually enforced
    pub fn is_enforced(&self) -> bool {
        self.bytes_per_second > 0.0
    }

    /// Time allowed to transfer `size` bytes: `max(grace, size / rate)`
    pub fn timeout_for(&self, size: u64) -> Duration {
        if !self.is_enforced() {
            return self.grace_period;
        }
        let transfer = Duration::try_from_secs_f64(size as f64 / self.bytes_per_second)
            .unwrap_or(Duration::MAX);
        transfer.max(self.grace_period)
    }
}

impl Default for MinDataRate {
    fn default() -> Self {
        MinDataRate {
            bytes_per_second: DEFAULT_MIN_DATA_RATE,
            grace_period: DEFAULT_MIN_DATA_RATE_GRACE_PERIOD,
        }
    }
}

impl fmt::Display for MinDataRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} bytes/s after {:?} grace",
            self.bytes_per_second, self.grace_period
        )
    }
}

/// Connection limits
#[derive(Debug, Clone, PartialEq)]
pub struct ServerLimits {
    max_request_buffer_size: Option<usize>,
    max_response_buffer_size: Option<usize>,
    min_request_body_data_rate: Option<MinDataRate>,
    min_response_data_rate: Option<MinDataRate>,
    keep_alive_timeout: Duration,
    request_headers_timeout: Duration,
    adapter_timeout: Duration,
    graceful_stop_timeout: Duration,
    heartbeat_interval: Duration,
    max_concurrent_connections: Option<u64>,
    max_concurrent_upgraded_connections: Option<u64>,
}

impl ServerLimits {
    /// Create a limits builder starting from the defaults
    pub fn builder() -> ServerLimitsBuilder {
        ServerLimitsBuilder::new()
    }

    /// Input pipe limit; `None` is unbounded, `Some(0)` synchronous
    pub fn max_request_buffer_size(&self) -> Option<usize> {
        self.max_request_buffer_size
    }

    /// Output pipe limit; `None` is unbounded, `Some(0)` synchronous
    pub fn max_response_buffer_size(&self) -> Option<usize> {
        self.max_response_buffer_size
    }

    pub fn min_request_body_data_rate(&self) -> Option<MinDataRate> {
        self.min_request_body_data_rate
    }

    pub fn min_response_data_rate(&self) -> Option<MinDataRate> {
        self.min_response_data_rate
    }

    pub fn keep_alive_timeout(&self) -> Duration {
        self.keep_alive_timeout
    }

    pub fn request_headers_timeout(&self) -> Duration {
        self.request_headers_timeout
    }

    pub fn adapter_timeout(&self) -> Duration {
        self.adapter_timeout
    }

    pub fn graceful_stop_timeout(&self) -> Duration {
        self.graceful_stop_timeout
    }

    pub fn heartbeat_interval(&self) -> Duration {
        self.heartbeat_interval
    }

    pub fn max_concurrent_connections(&self) -> Option<u64> {
        self.max_concurrent_connections
    }

    pub fn max_concurrent_upgraded_connections(&self) -> Option<u64> {
        self.max_concurrent_upgraded_connections
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let durations = [
            ("keep_alive_timeout", self.keep_alive_timeout),
            ("request_headers_timeout", self.request_headers_timeout),
            ("adapter_timeout", self.adapter_timeout),
            ("heartbeat_interval", self.heartbeat_interval),
        ];
        for (name, value) in durations {
            if value.is_zero() {
                return Err(ConfigError::ZeroDuration { name });
            }
        }

        if self.max_concurrent_connections == Some(0) {
            return Err(ConfigError::InvalidLimit {
                name: "max_concurrent_connections",
                reason: "must allow at least one connection".to_string(),
            });
        }

        Ok(())
    }
}

impl Default for ServerLimits {
    fn default() -> Self {
        ServerLimits {
            max_request_buffer_size: Some(DEFAULT_MAX_REQUEST_BUFFER_SIZE),
            max_response_buffer_size: Some(DEFAULT_MAX_RESPONSE_BUFFER_SIZE),
            min_request_body_data_rate: Some(MinDataRate::default()),
            min_response_data_rate: Some(MinDataRate::default()),
            keep_alive_timeout: DEFAULT_KEEP_ALIVE_TIMEOUT,
            request_headers_timeout: DEFAULT_REQUEST_HEADERS_TIMEOUT,
            adapter_timeout: DEFAULT_ADAPTER_TIMEOUT,
            graceful_stop_timeout: DEFAULT_GRACEFUL_STOP_TIMEOUT,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            max_concurrent_connections: None,
            max_concurrent_upgraded_connections: None,
        }
    }
}

/// Builder for [`ServerLimits`]
pub struct ServerLimitsBuilder {
    limits: ServerLimits,
}

impl ServerLimitsBuilder {
    /// Create a new builder with default limits
    pub fn new() -> Self {
        ServerLimitsBuilder {
            limits: ServerLimits::default(),
        }
    }

    /// Set max request buffer size (`None` = unbounded)
    pub fn max_request_buffer_size(mut self, size: Option<usize>) -> Self {
        self.limits.max_request_buffer_size = size;
        self
    }

    /// Set max response buffer size (`None` = unbounded)
    pub fn max_response_buffer_size(mut self, size: Option<usize>) -> Self {
        self.limits.max_response_buffer_size = size;
        self
    }

    /// Set minimum request body data rate (`None` disables it)
    pub fn min_request_body_data_rate(mut self, rate: Option<MinDataRate>) -> Self {
        self.limits.min_request_body_data_rate = rate;
        self
    }

    /// Set minimum response data rate (`None` disables it)
    pub fn min_response_data_rate(mut self, rate: Option<MinDataRate>) -> Self {
        self.limits.min_response_data_rate = rate;
        self
    }

    /// Set keep-alive timeout
    pub fn keep_alive_timeout(mut self, timeout: Duration) -> Self {
        self.limits.keep_alive_timeout = timeout;
        self
    }

    /// Set request headers timeout
    pub fn request_headers_timeout(mut self, timeout: Duration) -> Self {
        self.limits.request_headers_timeout = timeout;
        self
    }

    /// Set adapter chain timeout
    pub fn adapter_timeout(mut self, timeout: Duration) -> Self {
        self.limits.adapter_timeout = timeout;
        self
    }

    /// Set graceful stop timeout
    pub fn graceful_stop_timeout(mut self, timeout: Duration) -> Self {
        self.limits.graceful_stop_timeout = timeout;
        self
    }

    /// Set heartbeat interval
    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.limits.heartbeat_interval = interval;
        self
    }

    /// Set max concurrent connections (`None` = unlimited)
    pub fn max_concurrent_connections(mut self, max: Option<u64>) -> Self {
        self.limits.max_concurrent_connections = max;
        self
    }

    /// Set max concurrent upgraded connections (`None` = unlimited)
    pub fn max_concurrent_upgraded_connections(mut self, max: Option<u64>) -> Self {
        self.limits.max_concurrent_upgraded_connections = max;
        self
    }

    /// Build the limits
    pub fn build(self) -> Result<ServerLimits, ConfigError> {
        self.limits.validate()?;
        Ok(self.limits)
    }
}

impl Default for ServerLimitsBuilder {
    fn default() -> Self {
        Self::new()
    }
}
