//! Per-connection timeout control
//!
//! [`TimeoutControl`] holds the timing state of one connection:
//!
//! - a single absolute deadline with the action to take when it passes,
//! - read-rate tracking (elapsed time under timing, bytes read),
//! - write-rate tracking (outstanding writes, cumulative write deadline).
//!
//! The request engine mutates it through [`TimeoutNotifiable`] while the
//! heartbeat thread evaluates it with [`TimeoutControl::tick`]. Plain
//! counters are atomics; the compound read and write calculations each sit
//! behind a narrow mutex that is never held across I/O.
//!
//! Deadlines are measured from the last heartbeat, plus one heartbeat
//! interval, because a call can land right before the next tick.

use super::clock::{ticks, Debugger, INFINITE};
use super::limits::{MinDataRate, ServerLimits};
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::Duration;

/// What to do when an absolute deadline passes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutAction {
    /// Write the engine's timeout response (if any) before closing
    SendTimeoutResponse,
    /// Sever the connection immediately
    AbortConnection,
}

/// Why a deadline was set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimeoutReason {
    None,
    KeepAlive,
    RequestHeaders,
    Handshake,
    RequestBodyDrain,
    ReadDataRate,
    WriteDataRate,
    GracefulStop,
    Custom,
}

impl TimeoutReason {
    /// Get reason name
    pub fn name(&self) -> &'static str {
        match self {
            TimeoutReason::None => "none",
            TimeoutReason::KeepAlive => "keep-alive",
            TimeoutReason::RequestHeaders => "request-headers",
            TimeoutReason::Handshake => "handshake",
            TimeoutReason::RequestBodyDrain => "request-body-drain",
            TimeoutReason::ReadDataRate => "read-data-rate",
            TimeoutReason::WriteDataRate => "write-data-rate",
            TimeoutReason::GracefulStop => "graceful-stop",
            TimeoutReason::Custom => "custom",
        }
    }
}

impl fmt::Display for TimeoutReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A timeout detected by [`TimeoutControl::tick`]
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TimeoutFired {
    /// The absolute deadline passed
    Deadline {
        action: TimeoutAction,
        reason: TimeoutReason,
    },
    /// Request body arrived slower than the minimum rate
    ReadDataRate { observed: f64, minimum: f64 },
    /// Response was drained slower than the minimum rate
    WriteDataRate { outstanding_writes: u64 },
}

impl TimeoutFired {
    /// The reason to report
    pub fn reason(&self) -> TimeoutReason {
        match self {
            TimeoutFired::Deadline { reason, .. } => *reason,
            TimeoutFired::ReadDataRate { .. } => TimeoutReason::ReadDataRate,
            TimeoutFired::WriteDataRate { .. } => TimeoutReason::WriteDataRate,
        }
    }

    /// The action to apply; data rate violations always abort
    pub fn action(&self) -> TimeoutAction {
        match self {
            TimeoutFired::Deadline { action, .. } => *action,
            _ => TimeoutAction::AbortConnection,
        }
    }
}

/// Timing operations the request engine drives
///
/// This is the narrow capability handed to the engine. It is implemented by
/// [`TimeoutControl`] and by [`Connection`](super::Connection).
pub trait TimeoutNotifiable: Send + Sync {
    /// Arm the deadline; panics if one is already pending
    fn set_timeout(&self, timeout: Duration, action: TimeoutAction, reason: TimeoutReason);

    /// Replace any pending deadline
    fn reset_timeout(&self, timeout: Duration, action: TimeoutAction, reason: TimeoutReason);

    /// Clear the pending deadline
    fn cancel_timeout(&self);

    fn start_timing_reads(&self);

    fn stop_timing_reads(&self);

    /// Pause read timing at the next tick
    fn pause_timing_reads(&self);

    fn resume_timing_reads(&self);

    fn bytes_read(&self, count: u64);

    fn start_timing_write(&self, size: u64);

    fn stop_timing_write(&self);

    /// Time the final flush of up to `max_response_buffer_size` bytes
    fn start_drain_timeout(&self, min_rate: Option<MinDataRate>, max_response_buffer_size: Option<usize>);

    /// Override the request body rate for the current request
    fn set_min_request_body_data_rate(&self, rate: Option<MinDataRate>);

    /// Override the response rate for the current request
    fn set_min_response_data_rate(&self, rate: Option<MinDataRate>);

    /// Whether a timeout has fired on this connection
    fn timed_out(&self) -> bool;
}

#[derive(Debug)]
struct Deadline {
    action: TimeoutAction,
    reason: TimeoutReason,
}

#[derive(Debug)]
struct ReadTiming {
    enabled: bool,
    pause_requested: bool,
    elapsed: i64,
    min_rate: Option<MinDataRate>,
}

#[derive(Debug)]
struct WriteTiming {
    writes: u64,
    timeout_timestamp: i64,
    min_rate: Option<MinDataRate>,
}

/// Timing state for one connection
#[derive(Debug)]
pub struct TimeoutControl {
    heartbeat_interval: i64,
    last_timestamp: AtomicI64,
    timeout_timestamp: AtomicI64,
    deadline: Mutex<Deadline>,
    timed_out: AtomicBool,
    read_bytes: AtomicI64,
    read_timing: Mutex<ReadTiming>,
    write_timing: Mutex<WriteTiming>,
}

impl TimeoutControl {
    /// Create timing state using the rates and heartbeat interval in `limits`
    pub fn new(limits: &ServerLimits, now: i64) -> Self {
        TimeoutControl {
            heartbeat_interval: ticks(limits.heartbeat_interval()),
            last_timestamp: AtomicI64::new(now),
            timeout_timestamp: AtomicI64::new(INFINITE),
            deadline: Mutex::new(Deadline {
                action: TimeoutAction::AbortConnection,
                reason: TimeoutReason::None,
            }),
            timed_out: AtomicBool::new(false),
            read_bytes: AtomicI64::new(0),
            read_timing: Mutex::new(ReadTiming {
                enabled: false,
                pause_requested: false,
                elapsed: 0,
                min_rate: limits.min_request_body_data_rate(),
            }),
            write_timing: Mutex::new(WriteTiming {
                writes: 0,
                timeout_timestamp: 0,
                min_rate: limits.min_response_data_rate(),
            }),
        }
    }

    /// Timestamp of the last tick (or of construction)
    pub fn last_timestamp(&self) -> i64 {
        self.last_timestamp.load(Ordering::Acquire)
    }

    /// Absolute deadline, if one is pending
    pub fn deadline(&self) -> Option<i64> {
        match self.timeout_timestamp.load(Ordering::Acquire) {
            INFINITE => None,
            ts => Some(ts),
        }
    }

    /// Reason of the pending deadline
    pub fn timeout_reason(&self) -> TimeoutReason {
        if self.deadline().is_none() {
            return TimeoutReason::None;
        }
        self.deadline.lock().reason
    }

    /// Whether read timing is currently active
    pub fn is_timing_reads(&self) -> bool {
        self.read_timing.lock().enabled
    }

    /// Number of writes currently being timed
    pub fn outstanding_writes(&self) -> u64 {
        self.write_timing.lock().writes
    }

    fn assign_timeout(&self, timeout: Duration, action: TimeoutAction, reason: TimeoutReason) {
        let mut deadline = self.deadline.lock();
        deadline.action = action;
        deadline.reason = reason;
        let timestamp = self
            .last_timestamp()
            .saturating_add(ticks(timeout))
            .saturating_add(self.heartbeat_interval);
        self.timeout_timestamp.store(timestamp, Ordering::Release);
    }

    fn add_write_timing(timing: &mut WriteTiming, rate: MinDataRate, size: u64, last: i64, interval: i64) {
        if !rate.is_enforced() {
            return;
        }
        if timing.writes == 0 {
            timing.timeout_timestamp = last.saturating_add(interval);
        }
        timing.timeout_timestamp = timing
            .timeout_timestamp
            .saturating_add(ticks(rate.timeout_for(size)));
        timing.writes += 1;
    }

    /// Cancel everything: deadline, read timing and outstanding writes
    pub fn cancel_all(&self) {
        self.cancel_timeout();
        self.stop_timing_reads();
        self.write_timing.lock().writes = 0;
    }

    /// Evaluate all timers at `now`
    ///
    /// Checks, in order, the absolute deadline, the read rate (only when no
    /// deadline is pending) and the write rate. Returns the first violation.
    /// Once a timeout has fired, later ticks only watch the write rate, so
    /// the flush of a timeout response stays bounded; a write rate violation
    /// is reported once per run of outstanding writes. Nothing fires while
    /// `debugger` reports an attached debugger.
    pub fn tick(&self, now: i64, debugger: &dyn Debugger) -> Option<TimeoutFired> {
        let fired = self.check(now, debugger);
        self.last_timestamp.store(now, Ordering::Release);
        fired
    }

    fn check(&self, now: i64, debugger: &dyn Debugger) -> Option<TimeoutFired> {
        if !self.timed_out() {
            if let Some(fired) = self.check_deadline(now, debugger) {
                return Some(fired);
            }
            if let Some(fired) = self.check_read_data_rate(now, debugger) {
                return Some(fired);
            }
        }
        self.check_write_data_rate(now, debugger)
    }

    fn check_deadline(&self, now: i64, debugger: &dyn Debugger) -> Option<TimeoutFired> {
        if now <= self.timeout_timestamp.load(Ordering::Acquire) || debugger.is_attached() {
            return None;
        }

        let deadline = self.deadline.lock();
        self.timeout_timestamp.store(INFINITE, Ordering::Release);
        self.timed_out.store(true, Ordering::Release);
        Some(TimeoutFired::Deadline {
            action: deadline.action,
            reason: deadline.reason,
        })
    }

    fn check_read_data_rate(&self, now: i64, debugger: &dyn Debugger) -> Option<TimeoutFired> {
        // Draining a request body is the one case where a deadline and read
        // timing overlap; the deadline wins.
        if self.timeout_timestamp.load(Ordering::Acquire) != INFINITE {
            return None;
        }

        let mut timing = self.read_timing.lock();
        if !timing.enabled {
            return None;
        }

        let mut fired = None;
        timing.elapsed = timing
            .elapsed
            .saturating_add(now.saturating_sub(self.last_timestamp()));

        if let Some(rate) = timing.min_rate.filter(MinDataRate::is_enforced) {
            if timing.elapsed > ticks(rate.grace_period()) {
                let elapsed_seconds = timing.elapsed as f64 / 1_000_000_000.0;
                let observed = self.read_bytes.load(Ordering::Acquire) as f64 / elapsed_seconds;
                if observed < rate.bytes_per_second() && !debugger.is_attached() {
                    self.timed_out.store(true, Ordering::Release);
                    fired = Some(TimeoutFired::ReadDataRate {
                        observed,
                        minimum: rate.bytes_per_second(),
                    });
                }
            }
        }

        // A pause takes effect only after the tick that follows it, so the
        // time elapsed before the pause is still counted.
        if timing.pause_requested {
            timing.enabled = false;
            timing.pause_requested = false;
        }

        fired
    }

    fn check_write_data_rate(&self, now: i64, debugger: &dyn Debugger) -> Option<TimeoutFired> {
        let mut timing = self.write_timing.lock();
        if timing.writes > 0 && now > timing.timeout_timestamp && !debugger.is_attached() {
            // Stays disarmed until the outstanding writes drop back to zero
            timing.timeout_timestamp = INFINITE;
            self.timed_out.store(true, Ordering::Release);
            return Some(TimeoutFired::WriteDataRate {
                outstanding_writes: timing.writes,
            });
        }
        None
    }
}

impl TimeoutNotifiable for TimeoutControl {
    fn set_timeout(&self, timeout: Duration, action: TimeoutAction, reason: TimeoutReason) {
        assert!(
            self.timeout_timestamp.load(Ordering::Acquire) == INFINITE,
            "concurrent timeouts are not supported (pending: {}, new: {})",
            self.timeout_reason(),
            reason
        );
        self.assign_timeout(timeout, action, reason);
    }

    fn reset_timeout(&self, timeout: Duration, action: TimeoutAction, reason: TimeoutReason) {
        self.assign_timeout(timeout, action, reason);
    }

    fn cancel_timeout(&self) {
        self.timeout_timestamp.store(INFINITE, Ordering::Release);
    }

    fn start_timing_reads(&self) {
        let mut timing = self.read_timing.lock();
        timing.elapsed = 0;
        timing.pause_requested = false;
        self.read_bytes.store(0, Ordering::Release);
        timing.enabled = true;
    }

    fn stop_timing_reads(&self) {
        let mut timing = self.read_timing.lock();
        timing.enabled = false;
        timing.pause_requested = false;
    }

    fn pause_timing_reads(&self) {
        self.read_timing.lock().pause_requested = true;
    }

    fn resume_timing_reads(&self) {
        let mut timing = self.read_timing.lock();
        timing.enabled = true;
        // Pause and resume may both land between two ticks
        timing.pause_requested = false;
    }

    fn bytes_read(&self, count: u64) {
        let count = i64::try_from(count).unwrap_or(i64::MAX);
        self.read_bytes.fetch_add(count, Ordering::AcqRel);
    }

    fn start_timing_write(&self, size: u64) {
        let mut timing = self.write_timing.lock();
        if let Some(rate) = timing.min_rate {
            let last = self.last_timestamp();
            Self::add_write_timing(&mut timing, rate, size, last, self.heartbeat_interval);
        }
    }

    fn stop_timing_write(&self) {
        let mut timing = self.write_timing.lock();
        timing.writes = timing.writes.saturating_sub(1);
    }

    fn start_drain_timeout(&self, min_rate: Option<MinDataRate>, max_response_buffer_size: Option<usize>) {
        // Without a bounded output buffer there is nothing sensible to time
        let (Some(rate), Some(size)) = (min_rate, max_response_buffer_size) else {
            return;
        };
        let mut timing = self.write_timing.lock();
        let last = self.last_timestamp();
        Self::add_write_timing(&mut timing, rate, size as u64, last, self.heartbeat_interval);
    }

    fn set_min_request_body_data_rate(&self, rate: Option<MinDataRate>) {
        self.read_timing.lock().min_rate = rate;
    }

    fn set_min_response_data_rate(&self, rate: Option<MinDataRate>) {
        self.write_timing.lock().min_rate = rate;
    }

    fn timed_out(&self) -> bool {
        self.timed_out.load(Ordering::Acquire)
    }
}
