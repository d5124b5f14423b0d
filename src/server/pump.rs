//! Byte pumps between a transport and a connection's pipes
//!
//! The input pump copies transport reads into the input pipe and the output
//! pump copies the output pipe to the transport. Both run on threads from
//! the transport's schedulers and both end when the pipe they feed or drain
//! is aborted, so an abort never leaves a pump behind.

use crate::pipe::{PipeError, PipeReader, PipeWriter};
use crate::transport::{PollEvents, Transport};
use std::io;
use std::net::Shutdown;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// Read size for the input pump
pub const INPUT_CHUNK_SIZE: usize = 16 * 1024;

/// Largest chunk the output pump writes at once
pub const OUTPUT_CHUNK_SIZE: usize = 64 * 1024;

/// How long the input pump waits on the transport before rechecking the pipe
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Copy transport reads into `writer` until EOF, fault or abort
///
/// A peer close completes the pipe; a transport error is passed to
/// `on_fault` instead.
pub fn run_input(transport: &dyn Transport, mut writer: PipeWriter, on_fault: impl Fn(io::Error)) {
    let control = writer.control();
    let mut buf = vec![0u8; INPUT_CHUNK_SIZE];

    loop {
        if control.is_aborted() || control.is_reader_closed() {
            break;
        }

        match transport.poll(PollEvents::Read, Some(POLL_INTERVAL)) {
            Ok(false) => continue,
            Ok(true) => {}
            Err(e) => {
                on_fault(e);
                break;
            }
        }

        match transport.read(&mut buf) {
            Ok(0) => {
                writer.complete();
                break;
            }
            Ok(n) => {
                if let Err(e) = writer.write(&buf[..n]) {
                    tracing::trace!(error = %e, "input pipe closed");
                    break;
                }
            }
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock
                ) => {}
            Err(e) => {
                on_fault(e);
                break;
            }
        }
    }
}

/// Copy `reader` to the transport until the pipe completes or aborts
///
/// `in_flight` holds the size of the chunk taken from the pipe but not yet
/// accepted by the transport. On completion the transport is flushed and
/// its write side shut down.
pub fn run_output(
    transport: &dyn Transport,
    mut reader: PipeReader,
    in_flight: &AtomicUsize,
    on_fault: impl Fn(io::Error),
) {
    loop {
        match reader.read_chunk(OUTPUT_CHUNK_SIZE) {
            Ok(Some(chunk)) => {
                in_flight.store(chunk.len(), Ordering::Release);
                let written = transport.write_all(&chunk);
                in_flight.store(0, Ordering::Release);
                if let Err(e) = written {
                    on_fault(e);
                    break;
                }
            }
            Ok(None) => {
                if let Err(e) = transport.flush().and_then(|_| transport.shutdown(Shutdown::Write)) {
                    tracing::trace!(error = %e, "failed to close transport write side");
                }
                break;
            }
            Err(PipeError::ReadCanceled) => continue,
            Err(e) => {
                tracing::trace!(error = %e, "output pipe closed");
                break;
            }
        }
    }
}
