//! Full stack: accept loop, heartbeat thread and connection limits

mod common;

use bytes::Bytes;
use common::{init_test_logging, wait_until};
use std::io::{Read, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::Arc;
use std::time::{Duration, Instant};
use vconn::server::{
    ConnectionHandler, Heartbeat, ProcessContext, ProcessError, RequestProcessor, ServerLimits,
    ServiceContext, TimeoutAction, TimeoutReason,
};
use vconn::transport::TcpAcceptor;

const WAIT: Duration = Duration::from_secs(5);

/// Line-oriented echo that arms a keep-alive deadline between lines
struct KeepAliveEcho;

impl RequestProcessor for KeepAliveEcho {
    fn process(&self, ctx: &mut ProcessContext<'_>) -> Result<(), ProcessError> {
        let keep_alive = ctx.limits().keep_alive_timeout();
        let mut buf = [0u8; 1024];
        loop {
            ctx.timeout_control().reset_timeout(
                keep_alive,
                TimeoutAction::SendTimeoutResponse,
                TimeoutReason::KeepAlive,
            );
            let n = ctx.stream().read(&mut buf)?;
            ctx.timeout_control().cancel_timeout();
            if n == 0 {
                return Ok(());
            }
            ctx.stream().write_all(&buf[..n])?;
        }
    }

    fn timeout_response(&self, _reason: TimeoutReason) -> Option<Bytes> {
        Some(Bytes::from_static(b"bye\n"))
    }
}

fn connect(addr: std::net::SocketAddr) -> TcpStream {
    let stream = TcpStream::connect(addr).unwrap();
    stream.set_read_timeout(Some(WAIT)).unwrap();
    stream
}

#[test]
fn test_idle_connection_gets_timeout_response() {
    init_test_logging();
    let limits = ServerLimits::builder()
        .keep_alive_timeout(Duration::from_millis(200))
        .heartbeat_interval(Duration::from_millis(50))
        .build()
        .unwrap();
    let context = Arc::new(ServiceContext::new(limits));
    let _heartbeat = Heartbeat::for_context(&context).unwrap();
    let handler = Arc::new(ConnectionHandler::new(context.clone(), Arc::new(KeepAliveEcho)));
    let acceptor = TcpAcceptor::bind("127.0.0.1:0".parse().unwrap(), 16).unwrap();
    let accept_loop = acceptor.serve(handler).unwrap();

    let mut client = connect(accept_loop.local_addr());
    client.write_all(b"one\n").unwrap();
    let mut line = [0u8; 4];
    client.read_exact(&mut line).unwrap();
    assert_eq!(&line, b"one\n");

    let started = Instant::now();
    let mut rest = Vec::new();
    client.read_to_end(&mut rest).unwrap();
    assert_eq!(rest, b"bye\n");
    assert!(started.elapsed() >= Duration::from_millis(150));

    assert!(context.connection_manager.wait_all_closed(WAIT));
}

#[test]
fn test_connection_limit_through_accept_loop() {
    init_test_logging();
    let limits = ServerLimits::builder()
        .max_concurrent_connections(Some(2))
        .build()
        .unwrap();
    let context = Arc::new(ServiceContext::new(limits));
    let handler = Arc::new(ConnectionHandler::new(context.clone(), Arc::new(KeepAliveEcho)));
    let acceptor = TcpAcceptor::bind("127.0.0.1:0".parse().unwrap(), 16).unwrap();
    let mut accept_loop = acceptor.serve(handler).unwrap();
    let addr = accept_loop.local_addr();
    let manager = &context.connection_manager;

    let first = connect(addr);
    let second = connect(addr);
    assert!(wait_until(WAIT, || manager.active_count() == 2));

    let mut rejected = connect(addr);
    let mut buf = Vec::new();
    assert_eq!(rejected.read_to_end(&mut buf).unwrap_or(0), 0);
    assert_eq!(manager.total_added(), 2);

    first.shutdown(Shutdown::Both).unwrap();
    drop(first);
    assert!(wait_until(WAIT, || manager.active_count() == 1));

    let mut third = connect(addr);
    third.write_all(b"hi\n").unwrap();
    let mut echoed = [0u8; 3];
    third.read_exact(&mut echoed).unwrap();
    assert_eq!(&echoed, b"hi\n");
    assert_eq!(manager.normal_connections().count(), 2);

    accept_loop.stop();
    drop(second);
    drop(third);
    assert!(manager.wait_all_closed(WAIT));
    assert_eq!(manager.normal_connections().count(), 0);
}
