//! Time sources and debugger detection
//!
//! Timestamps are `i64` nanoseconds on a clock-specific monotonic scale.
//! [`INFINITE`] marks "no deadline".

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::{Duration, Instant};

/// Timestamp value meaning "never"
pub const INFINITE: i64 = i64::MAX;

/// Convert a duration to clock ticks, saturating at [`INFINITE`]
pub fn ticks(duration: Duration) -> i64 {
    i64::try_from(duration.as_nanos()).unwrap_or(INFINITE)
}

/// Monotonic time source driving the heartbeat
pub trait Clock: Send + Sync {
    /// Current timestamp in nanoseconds
    fn now(&self) -> i64;
}

/// Clock backed by `std::time::Instant`
#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    /// Create a clock whose zero is the moment of construction
    pub fn new() -> Self {
        SystemClock {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> i64 {
        ticks(self.origin.elapsed())
    }
}

/// Manually advanced clock for tests and simulations
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    /// Create a clock starting at `start` nanoseconds
    pub fn new(start: i64) -> Self {
        ManualClock {
            now: AtomicI64::new(start),
        }
    }

    /// Move the clock forward and return the new timestamp
    pub fn advance(&self, by: Duration) -> i64 {
        self.now.fetch_add(ticks(by), Ordering::SeqCst) + ticks(by)
    }

    /// Set the clock to an absolute timestamp
    pub fn set(&self, now: i64) {
        self.now.store(now, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// Reports whether a debugger is attached to the process
///
/// Timeouts are suppressed while one is, so stepping through code does not
/// abort connections.
pub trait Debugger: Send + Sync {
    fn is_attached(&self) -> bool;
}

/// Detects a tracer through `/proc/self/status` on Linux
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessDebugger;

impl Debugger for ProcessDebugger {
    #[cfg(target_os = "linux")]
    fn is_attached(&self) -> bool {
        std::fs::read_to_string("/proc/self/status")
            .ok()
            .and_then(|status| {
                status
                    .lines()
                    .find_map(|line| line.strip_prefix("TracerPid:"))
                    .and_then(|pid| pid.trim().parse::<u32>().ok())
            })
            .is_some_and(|pid| pid != 0)
    }

    #[cfg(not(target_os = "linux"))]
    fn is_attached(&self) -> bool {
        false
    }
}

/// Debugger state set explicitly
#[derive(Debug, Default)]
pub struct StaticDebugger {
    attached: AtomicBool,
}

impl StaticDebugger {
    pub fn new(attached: bool) -> Self {
        StaticDebugger {
            attached: AtomicBool::new(attached),
        }
    }

    pub fn set_attached(&self, attached: bool) {
        self.attached.store(attached, Ordering::SeqCst);
    }
}

impl Debugger for StaticDebugger {
    fn is_attached(&self) -> bool {
        self.attached.load(Ordering::SeqCst)
    }
}
