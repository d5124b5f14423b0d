//! Process-wide heartbeat
//!
//! One thread ticks every registered [`HeartbeatHandler`] once per interval.
//! The connection manager is the usual handler; it forwards each beat to
//! every live connection's timeout evaluation.

use super::clock::{Clock, Debugger, StaticDebugger};
use super::context::ServiceContext;
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Heartbeat thread name
pub const HEARTBEAT_THREAD_NAME: &str = "vconn-heartbeat";

/// Receives heartbeat ticks
pub trait HeartbeatHandler: Send + Sync {
    /// Called once per beat with the current timestamp
    ///
    /// `debugger` reflects debugger state sampled once for this beat.
    fn on_heartbeat(&self, now: i64, debugger: &dyn Debugger);
}

struct Shared {
    clock: Arc<dyn Clock>,
    debugger: Arc<dyn Debugger>,
    interval: Duration,
    handlers: Vec<Arc<dyn HeartbeatHandler>>,
    busy: AtomicBool,
    beats: AtomicU64,
    stopped: Mutex<bool>,
    wake: Condvar,
}

impl Shared {
    fn beat(&self) -> bool {
        if self.busy.swap(true, Ordering::AcqRel) {
            tracing::warn!("previous heartbeat still running, skipping beat");
            return false;
        }

        let started = Instant::now();
        let now = self.clock.now();
        let debugger = StaticDebugger::new(self.debugger.is_attached());
        for handler in &self.handlers {
            handler.on_heartbeat(now, &debugger);
        }
        self.beats.fetch_add(1, Ordering::AcqRel);

        let elapsed = started.elapsed();
        if elapsed > self.interval {
            tracing::warn!(
                elapsed_ms = elapsed.as_millis() as u64,
                interval_ms = self.interval.as_millis() as u64,
                "heartbeat took longer than its interval"
            );
        }

        self.busy.store(false, Ordering::Release);
        true
    }

    fn run(&self) {
        let mut stopped = self.stopped.lock();
        while !*stopped {
            self.wake.wait_for(&mut stopped, self.interval);
            if *stopped {
                break;
            }
            MutexGuard::unlocked(&mut stopped, || {
                self.beat();
            });
        }
    }
}

/// Periodic tick source
///
/// Stops and joins its thread on drop.
pub struct Heartbeat {
    shared: Arc<Shared>,
    thread: Option<JoinHandle<()>>,
}

impl Heartbeat {
    /// Create a heartbeat without starting its thread
    ///
    /// Drive it with [`beat`](Self::beat); used with a manual clock.
    pub fn new(
        clock: Arc<dyn Clock>,
        debugger: Arc<dyn Debugger>,
        interval: Duration,
        handlers: Vec<Arc<dyn HeartbeatHandler>>,
    ) -> Self {
        Heartbeat {
            shared: Arc::new(Shared {
                clock,
                debugger,
                interval,
                handlers,
                busy: AtomicBool::new(false),
                beats: AtomicU64::new(0),
                stopped: Mutex::new(false),
                wake: Condvar::new(),
            }),
            thread: None,
        }
    }

    /// Create a heartbeat and start its thread
    pub fn start(
        clock: Arc<dyn Clock>,
        debugger: Arc<dyn Debugger>,
        interval: Duration,
        handlers: Vec<Arc<dyn HeartbeatHandler>>,
    ) -> io::Result<Self> {
        let mut heartbeat = Self::new(clock, debugger, interval, handlers);
        let shared = heartbeat.shared.clone();
        let thread = thread::Builder::new()
            .name(HEARTBEAT_THREAD_NAME.to_string())
            .spawn(move || shared.run())?;
        heartbeat.thread = Some(thread);
        tracing::debug!(interval_ms = interval.as_millis() as u64, "heartbeat started");
        Ok(heartbeat)
    }

    /// Start a heartbeat driving the context's connection manager
    pub fn for_context(context: &ServiceContext) -> io::Result<Self> {
        Self::start(
            context.clock.clone(),
            context.debugger.clone(),
            context.limits.heartbeat_interval(),
            vec![context.connection_manager.clone() as Arc<dyn HeartbeatHandler>],
        )
    }

    /// Tick every handler now
    ///
    /// Returns false if a beat was already in progress, in which case this
    /// one is skipped.
    pub fn beat(&self) -> bool {
        self.shared.beat()
    }

    /// Number of completed beats
    pub fn beats(&self) -> u64 {
        self.shared.beats.load(Ordering::Acquire)
    }

    pub fn interval(&self) -> Duration {
        self.shared.interval
    }

    /// Stop the thread and wait for it to exit
    pub fn stop(&mut self) {
        *self.shared.stopped.lock() = true;
        self.shared.wake.notify_all();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::error!("heartbeat thread panicked");
            }
        }
    }
}

impl Drop for Heartbeat {
    fn drop(&mut self) {
        self.stop();
    }
}
