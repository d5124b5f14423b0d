//! Shared helpers for integration tests

#![allow(dead_code)]

use socket2::{Domain, Protocol, SockRef, Socket, Type};
use std::net::{TcpListener, TcpStream};
use std::sync::{Arc, Once};
use std::thread;
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;
use vconn::server::{
    Connection, ConnectionHandler, Heartbeat, HeartbeatHandler, ManualClock, ServerLimits,
    ServiceContext, StaticDebugger,
};
use vconn::transport::TcpTransport;

static INIT_LOGGING: Once = Once::new();

/// Route `tracing` output to the test harness; filter with `RUST_LOG`
pub fn init_test_logging() {
    INIT_LOGGING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("vconn=debug")),
            )
            .with_test_writer()
            .with_thread_names(true)
            .with_ansi(false)
            .try_init();
    });
}

/// A context driven by a manual clock starting at zero, with no debugger
pub fn manual_context(limits: ServerLimits) -> (Arc<ServiceContext>, Arc<ManualClock>) {
    init_test_logging();
    let clock = Arc::new(ManualClock::new(0));
    let context = ServiceContext::new(limits)
        .with_clock(clock.clone())
        .with_debugger(Arc::new(StaticDebugger::new(false)));
    (Arc::new(context), clock)
}

/// A heartbeat over the context's connection manager, beaten by hand
pub fn manual_heartbeat(context: &ServiceContext) -> Heartbeat {
    Heartbeat::new(
        context.clock.clone(),
        context.debugger.clone(),
        context.limits.heartbeat_interval(),
        vec![context.connection_manager.clone() as Arc<dyn HeartbeatHandler>],
    )
}

/// Connect a loopback client and hand the server side to `handler`
pub fn accept(handler: &ConnectionHandler) -> (vconn::server::Result<Arc<Connection>>, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
    let (server, _) = listener.accept().unwrap();
    client
        .set_read_timeout(Some(Duration::from_secs(10)))
        .unwrap();
    let transport = Arc::new(TcpTransport::new(server).unwrap());
    (handler.on_accept(transport), client)
}

/// Socket buffer size for peers that stop reading
pub const SMALL_SOCKET_BUFFER: usize = 4096;

/// Like [`accept`], but with small socket buffers on both ends
///
/// A client that never reads stalls the server's transport writes after a
/// few kilobytes.
pub fn accept_small_buffers(
    handler: &ConnectionHandler,
) -> (vconn::server::Result<Arc<Connection>>, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP)).unwrap();
    socket.set_recv_buffer_size(SMALL_SOCKET_BUFFER).unwrap();
    socket.connect(&listener.local_addr().unwrap().into()).unwrap();
    let client: TcpStream = socket.into();

    let (server, _) = listener.accept().unwrap();
    SockRef::from(&server)
        .set_send_buffer_size(SMALL_SOCKET_BUFFER)
        .unwrap();
    let transport = Arc::new(TcpTransport::new(server).unwrap());
    (handler.on_accept(transport), client)
}

/// Poll `condition` until it holds or `timeout` elapses
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}

pub const SECOND: i64 = 1_000_000_000;
