//! Per-connection state machine
//!
//! A [`Connection`] owns one accepted transport from accept to close:
//!
//! ```text
//! Created -> AdaptersRunning -> RequestLoopActive -> Draining -> Closed
//! ```
//!
//! Its thread runs the adapter chain, then the request engine, then tears
//! down. Meanwhile the heartbeat thread calls [`Connection::tick`], and any
//! thread may call [`Connection::abort`] or
//! [`Connection::request_graceful_stop`]. Every fault ends up in `abort`,
//! which is idempotent and unblocks both pipes immediately.

use super::adapter::{AdapterChain, AdapterHandles, ConnectionFeatures};
use super::clock::{ticks, Debugger, INFINITE};
use super::connection_id::ConnectionId;
use super::context::ServiceContext;
use super::handler::{ProcessContext, RequestProcessor};
use super::limits::{MinDataRate, ServerLimits};
use super::pump;
use super::signal::Completion;
use super::timeout::{
    TimeoutAction, TimeoutControl, TimeoutFired, TimeoutNotifiable, TimeoutReason,
};
use super::{Error, Result, CONNECTION_THREAD_PREFIX};
use crate::pipe::{BoxedStream, BufferPipe, DuplexStream, PipeControl, PipeOptions, PipeReader, PipeWriter};
use crate::transport::Transport;
use parking_lot::Mutex;
use std::any::Any;
use std::fmt;
use std::io;
use std::net::{Shutdown, SocketAddr};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Lifecycle state; only ever moves forward
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum ConnectionState {
    Created = 0,
    AdaptersRunning = 1,
    RequestLoopActive = 2,
    Draining = 3,
    Closed = 4,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ConnectionState::Created,
            1 => ConnectionState::AdaptersRunning,
            2 => ConnectionState::RequestLoopActive,
            3 => ConnectionState::Draining,
            _ => ConnectionState::Closed,
        }
    }
}

/// Why a connection was torn down early
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AbortReason {
    #[error("transport fault: {0}")]
    TransportFault(String),

    #[error("{0} timeout")]
    Timeout(TimeoutReason),

    #[error("connection adapter failed")]
    AdapterFailure,

    #[error("request processing failed: {0}")]
    ProcessFailure(String),

    #[error("request processing panicked")]
    Panicked,

    #[error("graceful stop timed out")]
    GracefulStopTimeout,

    #[error("{0}")]
    Requested(String),

    #[error("server shutdown")]
    ServerShutdown,
}

/// Endpoints of a connection's two pipes
pub struct ConnectionPipes {
    pub input_reader: PipeReader,
    pub input_writer: PipeWriter,
    pub output_reader: PipeReader,
    pub output_writer: PipeWriter,
}

impl ConnectionPipes {
    /// Allocate pipes sized by the request and response buffer limits
    pub fn new(limits: &ServerLimits) -> Self {
        Self::with_options(
            PipeOptions::from_limit(limits.max_request_buffer_size()),
            PipeOptions::from_limit(limits.max_response_buffer_size()),
        )
    }

    pub fn with_options(input: PipeOptions, output: PipeOptions) -> Self {
        let (input_reader, input_writer) = BufferPipe::new(input);
        let (output_reader, output_writer) = BufferPipe::new(output);
        ConnectionPipes {
            input_reader,
            input_writer,
            output_reader,
            output_writer,
        }
    }
}

/// One accepted connection
pub struct Connection {
    id: ConnectionId,
    context: Arc<ServiceContext>,
    processor: Arc<dyn RequestProcessor>,
    adapters: AdapterChain,
    transport: Arc<dyn Transport>,
    timeout_control: TimeoutControl,
    state: AtomicU8,
    input: PipeControl,
    output: PipeControl,
    output_in_flight: AtomicUsize,
    aborted: AtomicBool,
    close_reason: Mutex<Option<AbortReason>>,
    stop_requested_at: AtomicI64,
    upgraded: AtomicBool,
    ticking: AtomicBool,
    started: AtomicBool,
    completion: Completion,
}

impl Connection {
    /// Create a connection over `transport` using the given pipes
    ///
    /// Keeps control handles to the pipes; the endpoints themselves are
    /// consumed by [`start`](Self::start).
    pub fn new(
        id: ConnectionId,
        context: Arc<ServiceContext>,
        processor: Arc<dyn RequestProcessor>,
        adapters: AdapterChain,
        transport: Arc<dyn Transport>,
        pipes: &ConnectionPipes,
    ) -> Self {
        let timeout_control = TimeoutControl::new(&context.limits, context.clock.now());
        Connection {
            id,
            processor,
            adapters,
            transport,
            timeout_control,
            state: AtomicU8::new(ConnectionState::Created as u8),
            input: pipes.input_writer.control(),
            output: pipes.output_writer.control(),
            output_in_flight: AtomicUsize::new(0),
            aborted: AtomicBool::new(false),
            close_reason: Mutex::new(None),
            stop_requested_at: AtomicI64::new(INFINITE),
            upgraded: AtomicBool::new(false),
            ticking: AtomicBool::new(false),
            started: AtomicBool::new(false),
            completion: Completion::new(),
            context,
        }
    }

    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.transport.peer_addr()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.transport.local_addr()
    }

    pub fn limits(&self) -> &ServerLimits {
        &self.context.limits
    }

    pub fn timeout_control(&self) -> &TimeoutControl {
        &self.timeout_control
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }

    pub fn is_upgraded(&self) -> bool {
        self.upgraded.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.completion.is_set()
    }

    /// The first abort or timeout reason recorded, if any
    pub fn close_reason(&self) -> Option<AbortReason> {
        self.close_reason.lock().clone()
    }

    pub fn is_stop_requested(&self) -> bool {
        self.stop_requested_at.load(Ordering::Acquire) != INFINITE
    }

    /// Block until the connection is closed or `timeout` elapses
    pub fn wait_closed(&self, timeout: Duration) -> bool {
        self.completion.wait_timeout(timeout)
    }

    fn advance_state(&self, to: ConnectionState) {
        self.state.fetch_max(to as u8, Ordering::SeqCst);
    }

    fn record_reason(&self, reason: AbortReason) {
        self.close_reason.lock().get_or_insert(reason);
    }

    /// Start the connection's thread
    ///
    /// Returns once the thread exists. If it cannot be spawned the
    /// connection is torn down before returning the error.
    pub fn start(self: &Arc<Self>, pipes: ConnectionPipes) -> io::Result<()> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                "connection already started",
            ));
        }

        let connection = Arc::clone(self);
        let spawned = thread::Builder::new()
            .name(format!("{}-{}", CONNECTION_THREAD_PREFIX, self.id))
            .spawn(move || connection.run(pipes));

        if let Err(e) = spawned {
            tracing::error!(connection_id = %self.id, error = %e, "failed to start connection thread");
            self.abort(AbortReason::ProcessFailure(e.to_string()));
            self.finish();
            return Err(e);
        }
        Ok(())
    }

    fn run(self: Arc<Self>, pipes: ConnectionPipes) {
        let ConnectionPipes {
            input_reader,
            input_writer,
            output_reader,
            output_writer,
        } = pipes;

        tracing::debug!(
            connection_id = %self.id,
            remote_addr = ?self.remote_addr(),
            "connection started"
        );

        let input_done = Arc::new(Completion::new());
        let output_done = Arc::new(Completion::new());
        self.start_pumps(input_writer, output_reader, &input_done, &output_done);

        let mut features = ConnectionFeatures::new(self.remote_addr(), self.local_addr());
        let mut handles = AdapterHandles::new();
        let stream: BoxedStream = Box::new(DuplexStream::new(input_reader, output_writer));

        if let Some(stream) = self.run_adapters(stream, &mut features, &mut handles) {
            self.run_processor(stream, &features);
        }

        self.advance_state(ConnectionState::Draining);
        handles.dispose_all();
        drop(features);
        self.drain(&input_done, &output_done);
        self.finish();
    }

    fn start_pumps(
        self: &Arc<Self>,
        input_writer: PipeWriter,
        output_reader: PipeReader,
        input_done: &Arc<Completion>,
        output_done: &Arc<Completion>,
    ) {
        let connection = Arc::clone(self);
        let done = Arc::clone(input_done);
        let input_job = Box::new(move || {
            pump::run_input(&*connection.transport, input_writer, |e| {
                connection.on_transport_fault(e)
            });
            done.set();
        });
        let scheduled = self
            .transport
            .input_scheduler()
            .schedule(format!("{}-{}-in", CONNECTION_THREAD_PREFIX, self.id), input_job);
        if let Err(e) = scheduled {
            tracing::error!(connection_id = %self.id, error = %e, "failed to schedule input pump");
            self.abort(AbortReason::TransportFault(e.to_string()));
            input_done.set();
        }

        let connection = Arc::clone(self);
        let done = Arc::clone(output_done);
        let output_job = Box::new(move || {
            pump::run_output(
                &*connection.transport,
                output_reader,
                &connection.output_in_flight,
                |e| connection.on_transport_fault(e),
            );
            done.set();
        });
        let scheduled = self
            .transport
            .output_scheduler()
            .schedule(format!("{}-{}-out", CONNECTION_THREAD_PREFIX, self.id), output_job);
        if let Err(e) = scheduled {
            tracing::error!(connection_id = %self.id, error = %e, "failed to schedule output pump");
            self.abort(AbortReason::TransportFault(e.to_string()));
            output_done.set();
        }
    }

    fn run_adapters(
        &self,
        stream: BoxedStream,
        features: &mut ConnectionFeatures,
        handles: &mut AdapterHandles,
    ) -> Option<BoxedStream> {
        self.advance_state(ConnectionState::AdaptersRunning);
        if self.adapters.is_empty() {
            return Some(stream);
        }

        self.timeout_control.set_timeout(
            self.context.limits.adapter_timeout(),
            TimeoutAction::AbortConnection,
            TimeoutReason::Handshake,
        );
        let adapted = self.adapters.apply(self.id.as_str(), stream, features, handles);
        self.timeout_control.cancel_timeout();

        if adapted.is_none() {
            self.abort(AbortReason::AdapterFailure);
        }
        adapted
    }

    fn run_processor(&self, mut stream: BoxedStream, features: &ConnectionFeatures) {
        if self.is_aborted() {
            return;
        }
        self.advance_state(ConnectionState::RequestLoopActive);
        // A stop requested while the adapters ran was not delivered to them
        if self.stop_requested_at.load(Ordering::SeqCst) != INFINITE {
            self.input.cancel_pending_read();
        }

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            let mut ctx = ProcessContext::new(self, &mut stream, features);
            self.processor.process(&mut ctx)
        }));

        match outcome {
            Ok(Ok(())) => {
                if let Err(e) = stream.close() {
                    tracing::debug!(connection_id = %self.id, error = %e, "failed to close stream");
                }
            }
            Ok(Err(e)) if self.is_aborted() || self.timeout_control.timed_out() => {
                tracing::debug!(connection_id = %self.id, error = %e, "request processing ended after abort");
            }
            Ok(Err(e)) => {
                tracing::error!(connection_id = %self.id, error = %e, "request processing failed");
                self.abort(AbortReason::ProcessFailure(e.to_string()));
            }
            Err(payload) => {
                tracing::error!(
                    connection_id = %self.id,
                    panic = panic_message(&*payload),
                    "request processing panicked"
                );
                self.abort(AbortReason::Panicked);
            }
        }
    }

    fn drain(&self, input_done: &Completion, output_done: &Completion) {
        // Whatever is still on its way out, buffered or mid-write, goes out
        // at the minimum response rate
        if !self.output.is_aborted() && !output_done.is_set() {
            let pending = self.output.buffered() + self.output_in_flight.load(Ordering::Acquire);
            self.timeout_control.start_drain_timeout(
                self.context.limits.min_response_data_rate(),
                Some(pending),
            );
        }
        self.output.complete_with(None);
        output_done.wait();
        input_done.wait();

        if let Err(e) = self.transport.shutdown(Shutdown::Both) {
            tracing::trace!(connection_id = %self.id, error = %e, "transport shutdown failed");
        }
    }

    fn finish(&self) {
        let previous = self.state.swap(ConnectionState::Closed as u8, Ordering::AcqRel);
        if previous == ConnectionState::Closed as u8 {
            return;
        }
        self.timeout_control.cancel_all();

        let manager = &self.context.connection_manager;
        if self.is_upgraded() {
            manager.upgraded_connections().release_one();
        } else {
            manager.normal_connections().release_one();
        }
        manager.remove(&self.id);

        tracing::debug!(
            connection_id = %self.id,
            reason = ?self.close_reason(),
            "connection closed"
        );
        self.completion.set();
    }

    /// Sever the connection
    ///
    /// Idempotent: only the first call has an effect and returns true. Both
    /// pipes are aborted, so any read or write blocked on them fails at once,
    /// and the transport is shut down.
    pub fn abort(&self, reason: AbortReason) -> bool {
        if self
            .aborted
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        tracing::debug!(connection_id = %self.id, reason = %reason, "aborting connection");
        let message = reason.to_string();
        self.record_reason(reason);
        self.advance_state(ConnectionState::Draining);

        self.input.abort(message.clone());
        self.output.abort(message);
        if let Err(e) = self.transport.shutdown(Shutdown::Both) {
            tracing::trace!(connection_id = %self.id, error = %e, "transport shutdown failed");
        }
        true
    }

    fn on_transport_fault(&self, error: io::Error) {
        tracing::debug!(connection_id = %self.id, error = %error, "transport fault");
        self.abort(AbortReason::TransportFault(error.to_string()));
    }

    /// Ask the request engine to finish its current exchange and close
    ///
    /// Once the request loop runs, a pending read on the input pipe is
    /// canceled so an idle engine can notice. Adapters are left alone: a
    /// handshake cannot resume an interrupted read. If the connection is
    /// still open after the graceful stop timeout, the next tick aborts it.
    pub fn request_graceful_stop(&self) {
        let now = self.context.clock.now().min(INFINITE - 1);
        if self
            .stop_requested_at
            .compare_exchange(INFINITE, now, Ordering::SeqCst, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        tracing::debug!(connection_id = %self.id, "graceful stop requested");
        if self.state.load(Ordering::SeqCst) == ConnectionState::RequestLoopActive as u8 {
            self.input.cancel_pending_read();
        }
    }

    /// Move this connection from the normal to the upgraded quota
    pub fn upgrade(&self) -> Result<()> {
        if self.is_upgraded() {
            return Err(Error::AlreadyUpgraded);
        }

        let manager = &self.context.connection_manager;
        if !manager.upgraded_connections().try_lock_one() {
            return Err(Error::UpgradedConnectionLimitReached);
        }
        if self.upgraded.swap(true, Ordering::AcqRel) {
            manager.upgraded_connections().release_one();
            return Err(Error::AlreadyUpgraded);
        }
        manager.normal_connections().release_one();

        tracing::debug!(connection_id = %self.id, "connection upgraded");
        Ok(())
    }

    /// Evaluate timeouts and graceful stop escalation at `now`
    ///
    /// Called by the heartbeat. Overlapping calls for the same connection
    /// are skipped; closed connections are ignored.
    pub fn tick(&self, now: i64, debugger: &dyn Debugger) {
        if self.state() == ConnectionState::Closed {
            return;
        }
        if self.ticking.swap(true, Ordering::AcqRel) {
            return;
        }

        if let Some(fired) = self.timeout_control.tick(now, debugger) {
            self.on_timeout(fired);
        }
        self.check_graceful_stop(now, debugger);

        self.ticking.store(false, Ordering::Release);
    }

    fn check_graceful_stop(&self, now: i64, debugger: &dyn Debugger) {
        let requested = self.stop_requested_at.load(Ordering::Acquire);
        if requested == INFINITE || self.is_aborted() || debugger.is_attached() {
            return;
        }
        if now.saturating_sub(requested) > ticks(self.context.limits.graceful_stop_timeout()) {
            tracing::warn!(connection_id = %self.id, "connection did not stop gracefully in time");
            self.abort(AbortReason::GracefulStopTimeout);
        }
    }

    fn on_timeout(&self, fired: TimeoutFired) {
        match fired {
            TimeoutFired::Deadline {
                action: TimeoutAction::SendTimeoutResponse,
                reason,
            } => {
                tracing::info!(connection_id = %self.id, %reason, "connection timed out, sending timeout response");
                self.send_timeout_response(reason);
            }
            TimeoutFired::Deadline {
                action: TimeoutAction::AbortConnection,
                reason,
            } => {
                tracing::info!(connection_id = %self.id, %reason, "connection timed out");
                self.abort(AbortReason::Timeout(reason));
            }
            TimeoutFired::ReadDataRate { observed, minimum } => {
                tracing::info!(
                    connection_id = %self.id,
                    observed_bytes_per_second = observed,
                    minimum_bytes_per_second = minimum,
                    "request body data rate below minimum"
                );
                self.abort(AbortReason::Timeout(TimeoutReason::ReadDataRate));
            }
            TimeoutFired::WriteDataRate { outstanding_writes } => {
                tracing::info!(
                    connection_id = %self.id,
                    outstanding_writes,
                    "response data rate below minimum"
                );
                self.abort(AbortReason::Timeout(TimeoutReason::WriteDataRate));
            }
        }
    }

    /// Stop reading, queue the engine's timeout response and close the output
    fn send_timeout_response(&self, reason: TimeoutReason) {
        if self.is_aborted() {
            return;
        }
        self.record_reason(AbortReason::Timeout(reason));

        let payload = panic::catch_unwind(AssertUnwindSafe(|| self.processor.timeout_response(reason)))
            .unwrap_or_else(|payload| {
                tracing::error!(
                    connection_id = %self.id,
                    panic = panic_message(&*payload),
                    "timeout response panicked"
                );
                None
            });

        self.input.abort(AbortReason::Timeout(reason).to_string());
        self.output.complete_with(payload);
        if let Err(e) = self.transport.shutdown(Shutdown::Read) {
            tracing::trace!(connection_id = %self.id, error = %e, "transport shutdown failed");
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}

impl TimeoutNotifiable for Connection {
    fn set_timeout(&self, timeout: Duration, action: TimeoutAction, reason: TimeoutReason) {
        self.timeout_control.set_timeout(timeout, action, reason)
    }

    fn reset_timeout(&self, timeout: Duration, action: TimeoutAction, reason: TimeoutReason) {
        self.timeout_control.reset_timeout(timeout, action, reason)
    }

    fn cancel_timeout(&self) {
        self.timeout_control.cancel_timeout()
    }

    fn start_timing_reads(&self) {
        self.timeout_control.start_timing_reads()
    }

    fn stop_timing_reads(&self) {
        self.timeout_control.stop_timing_reads()
    }

    fn pause_timing_reads(&self) {
        self.timeout_control.pause_timing_reads()
    }

    fn resume_timing_reads(&self) {
        self.timeout_control.resume_timing_reads()
    }

    fn bytes_read(&self, count: u64) {
        self.timeout_control.bytes_read(count)
    }

    fn start_timing_write(&self, size: u64) {
        self.timeout_control.start_timing_write(size)
    }

    fn stop_timing_write(&self) {
        self.timeout_control.stop_timing_write()
    }

    fn start_drain_timeout(&self, min_rate: Option<MinDataRate>, max_response_buffer_size: Option<usize>) {
        self.timeout_control
            .start_drain_timeout(min_rate, max_response_buffer_size)
    }

    fn set_min_request_body_data_rate(&self, rate: Option<MinDataRate>) {
        self.timeout_control.set_min_request_body_data_rate(rate)
    }

    fn set_min_response_data_rate(&self, rate: Option<MinDataRate>) {
        self.timeout_control.set_min_response_data_rate(rate)
    }

    fn timed_out(&self) -> bool {
        self.timeout_control.timed_out()
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("remote_addr", &self.remote_addr())
            .field("aborted", &self.is_aborted())
            .field("upgraded", &self.is_upgraded())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::clock::{ManualClock, StaticDebugger};
    use crate::pipe::PipeError;
    use crate::server::handler::ProcessError;
    use crate::transport::TcpTransport;
    use bytes::Bytes;
    use std::net::{TcpListener, TcpStream};
    use std::sync::Barrier;

    struct Idle;

    impl RequestProcessor for Idle {
        fn process(&self, _ctx: &mut ProcessContext<'_>) -> std::result::Result<(), ProcessError> {
            Ok(())
        }
    }

    fn transport() -> (Arc<dyn Transport>, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        (Arc::new(TcpTransport::new(server).unwrap()), client)
    }

    /// Counts how often it is asked for a timeout response
    #[derive(Default)]
    struct CountingTimeouts(AtomicUsize);

    impl RequestProcessor for CountingTimeouts {
        fn process(&self, _ctx: &mut ProcessContext<'_>) -> std::result::Result<(), ProcessError> {
            Ok(())
        }

        fn timeout_response(&self, _reason: TimeoutReason) -> Option<Bytes> {
            self.0.fetch_add(1, Ordering::SeqCst);
            None
        }
    }

    fn connection(context: Arc<ServiceContext>) -> (Connection, ConnectionPipes, TcpStream) {
        connection_with(context, Arc::new(Idle))
    }

    fn connection_with(
        context: Arc<ServiceContext>,
        processor: Arc<dyn RequestProcessor>,
    ) -> (Connection, ConnectionPipes, TcpStream) {
        let (transport, client) = transport();
        let pipes = ConnectionPipes::new(&context.limits);
        let connection = Connection::new(
            context.id_generator.next_id(),
            context,
            processor,
            AdapterChain::default(),
            transport,
            &pipes,
        );
        (connection, pipes, client)
    }

    #[test]
    fn test_state_only_moves_forward() {
        let context = Arc::new(ServiceContext::new(ServerLimits::default()));
        let (connection, _pipes, _client) = connection(context);

        assert_eq!(connection.state(), ConnectionState::Created);
        connection.advance_state(ConnectionState::Draining);
        connection.advance_state(ConnectionState::RequestLoopActive);
        assert_eq!(connection.state(), ConnectionState::Draining);
    }

    #[test]
    fn test_abort_is_idempotent_and_faults_pipes() {
        let context = Arc::new(ServiceContext::new(ServerLimits::default()));
        let (connection, mut pipes, _client) = connection(context);

        assert!(connection.abort(AbortReason::Requested("first".into())));
        assert!(!connection.abort(AbortReason::Requested("second".into())));
        assert_eq!(
            connection.close_reason(),
            Some(AbortReason::Requested("first".into()))
        );
        assert_eq!(connection.state(), ConnectionState::Draining);

        let mut buf = [0u8; 4];
        assert!(pipes.input_reader.read(&mut buf).is_err());
        assert!(pipes.output_writer.write(b"late").is_err());
    }

    #[test]
    fn test_tick_applies_deadline_and_ignores_closed() {
        let clock = Arc::new(ManualClock::new(0));
        let context = Arc::new(ServiceContext::new(ServerLimits::default()).with_clock(clock));
        let (connection, _pipes, _client) = connection(context);
        let debugger = StaticDebugger::new(false);

        connection.set_timeout(
            Duration::from_secs(1),
            TimeoutAction::AbortConnection,
            TimeoutReason::KeepAlive,
        );
        connection.tick(2_000_000_000, &debugger);
        assert!(!connection.is_aborted());
        connection.tick(2_000_000_001, &debugger);
        assert!(connection.is_aborted());
        assert!(connection.timed_out());
        assert_eq!(
            connection.close_reason(),
            Some(AbortReason::Timeout(TimeoutReason::KeepAlive))
        );
    }

    #[test]
    fn test_graceful_stop_escalates_after_timeout() {
        let clock = Arc::new(ManualClock::new(0));
        let limits = ServerLimits::builder()
            .graceful_stop_timeout(Duration::from_secs(5))
            .build()
            .unwrap();
        let context = Arc::new(ServiceContext::new(limits).with_clock(clock.clone()));
        let (connection, _pipes, _client) = connection(context);
        let debugger = StaticDebugger::new(false);

        connection.request_graceful_stop();
        assert!(connection.is_stop_requested());

        connection.tick(clock.advance(Duration::from_secs(5)), &debugger);
        assert!(!connection.is_aborted());
        connection.tick(clock.advance(Duration::from_secs(1)), &debugger);
        assert_eq!(
            connection.close_reason(),
            Some(AbortReason::GracefulStopTimeout)
        );
    }

    #[test]
    fn test_graceful_stop_leaves_adapter_reads_alone() {
        let context = Arc::new(ServiceContext::new(ServerLimits::default()));
        let (connection, mut pipes, _client) = connection(context);
        let mut buf = [0u8; 4];

        connection.advance_state(ConnectionState::AdaptersRunning);
        connection.request_graceful_stop();
        pipes.input_writer.write(b"tls").unwrap();
        assert_eq!(pipes.input_reader.read(&mut buf), Ok(3));
    }

    #[test]
    fn test_graceful_stop_cancels_request_loop_read() {
        let context = Arc::new(ServiceContext::new(ServerLimits::default()));
        let (connection, mut pipes, _client) = connection(context);
        let mut buf = [0u8; 4];

        connection.advance_state(ConnectionState::RequestLoopActive);
        connection.request_graceful_stop();
        assert_eq!(pipes.input_reader.read(&mut buf), Err(PipeError::ReadCanceled));
    }

    #[test]
    fn test_tick_skipped_while_another_tick_runs() {
        let context = Arc::new(ServiceContext::new(ServerLimits::default()));
        let (connection, _pipes, _client) = connection(context);
        let debugger = StaticDebugger::new(false);
        connection.set_timeout(
            Duration::from_secs(1),
            TimeoutAction::AbortConnection,
            TimeoutReason::KeepAlive,
        );

        connection.ticking.store(true, Ordering::Release);
        connection.tick(10_000_000_000, &debugger);
        assert!(!connection.is_aborted());
        assert!(!connection.timed_out());

        connection.ticking.store(false, Ordering::Release);
        connection.tick(10_000_000_000, &debugger);
        assert!(connection.is_aborted());
    }

    #[test]
    fn test_concurrent_ticks_fire_timeout_once() {
        let context = Arc::new(ServiceContext::new(ServerLimits::default()));
        let processor = Arc::new(CountingTimeouts::default());
        let (connection, _pipes, _client) = connection_with(context, processor.clone());
        let connection = Arc::new(connection);
        connection.set_timeout(
            Duration::from_secs(5),
            TimeoutAction::SendTimeoutResponse,
            TimeoutReason::KeepAlive,
        );

        let barrier = Arc::new(Barrier::new(8));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let connection = connection.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    let debugger = StaticDebugger::new(false);
                    barrier.wait();
                    connection.tick(6_000_000_001, &debugger);
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(processor.0.load(Ordering::SeqCst), 1);
        assert!(!connection.ticking.load(Ordering::Acquire));
        assert_eq!(
            connection.close_reason(),
            Some(AbortReason::Timeout(TimeoutReason::KeepAlive))
        );
    }

    #[test]
    fn test_upgrade_moves_between_quotas() {
        let limits = ServerLimits::builder()
            .max_concurrent_upgraded_connections(Some(1))
            .build()
            .unwrap();
        let context = Arc::new(ServiceContext::new(limits));
        let manager = context.connection_manager.clone();
        let (first, _p1, _c1) = connection(context.clone());
        let (second, _p2, _c2) = connection(context);
        manager.normal_connections().try_lock_one();
        manager.normal_connections().try_lock_one();

        first.upgrade().unwrap();
        assert!(matches!(first.upgrade(), Err(Error::AlreadyUpgraded)));
        assert!(matches!(
            second.upgrade(),
            Err(Error::UpgradedConnectionLimitReached)
        ));
        assert_eq!(manager.normal_connections().count(), 1);
        assert_eq!(manager.upgraded_connections().count(), 1);
    }

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(&*payload), "boom");
        let payload: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(&*payload), "bang");
        let payload: Box<dyn Any + Send> = Box::new(7);
        assert_eq!(panic_message(&*payload), "unknown panic");
    }
}
