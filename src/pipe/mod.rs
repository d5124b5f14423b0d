//! Bounded byte pipes
//!
//! A [`BufferPipe`] is a single-producer/single-consumer byte channel with
//! high/low watermark backpressure. Every connection owns two of them: the
//! input pipe (transport -> request engine) and the output pipe (request
//! engine -> transport).
//!
//! # Backpressure
//!
//! A write always appends its whole chunk. If the buffered length is then at
//! or above the pause threshold, the writer blocks until the reader has
//! drained the buffer down to the resume threshold. The buffered length is
//! therefore never larger than `pause + one write`.
//!
//! - `PipeOptions::unbounded()` never blocks the writer.
//! - `PipeOptions::synchronous()` (pause = resume = 0) blocks after every
//!   non-empty write until the reader has consumed all of it.
//!
//! # Faults
//!
//! The owner keeps a [`PipeControl`] after handing the endpoints away. Aborting
//! through it discards buffered data and wakes any blocked reader or writer
//! with [`PipeError::Aborted`], which surfaces as
//! `io::ErrorKind::ConnectionAborted` through the `std::io` impls.

pub mod duplex;

pub use duplex::{BoxedStream, ConnectionStream, DuplexStream};

use bytes::{Buf, Bytes, BytesMut};
use parking_lot::{Condvar, Mutex};
use std::io;
use std::sync::Arc;

/// Result type for pipe operations
pub type Result<T> = std::result::Result<T, PipeError>;

/// Pipe errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PipeError {
    #[error("Pipe aborted: {0}")]
    Aborted(String),

    #[error("Pipe writer already completed")]
    Closed,

    #[error("Pipe reader closed")]
    ReaderClosed,

    #[error("Pending read canceled")]
    ReadCanceled,

    #[error("Invalid watermarks: resume threshold {resume} exceeds pause threshold {pause}")]
    InvalidWatermarks { pause: usize, resume: usize },
}

impl From<PipeError> for io::Error {
    fn from(err: PipeError) -> Self {
        let kind = match err {
            PipeError::Aborted(_) => io::ErrorKind::ConnectionAborted,
            PipeError::Closed | PipeError::ReaderClosed => io::ErrorKind::BrokenPipe,
            PipeError::ReadCanceled => io::ErrorKind::Interrupted,
            PipeError::InvalidWatermarks { .. } => io::ErrorKind::InvalidInput,
        };
        io::Error::new(kind, err)
    }
}

/// Watermark configuration for a pipe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipeOptions {
    pause_writer_threshold: Option<usize>,
    resume_writer_threshold: usize,
}

impl PipeOptions {
    /// Never block the writer
    pub fn unbounded() -> Self {
        PipeOptions {
            pause_writer_threshold: None,
            resume_writer_threshold: 0,
        }
    }

    /// Block after every write until the reader has consumed everything
    pub fn synchronous() -> Self {
        PipeOptions {
            pause_writer_threshold: Some(0),
            resume_writer_threshold: 0,
        }
    }

    /// Pause the writer at `pause` buffered bytes, resume at `resume` or below
    pub fn bounded(pause: usize, resume: usize) -> Result<Self> {
        if resume > pause {
            return Err(PipeError::InvalidWatermarks { pause, resume });
        }
        Ok(PipeOptions {
            pause_writer_threshold: Some(pause),
            resume_writer_threshold: resume,
        })
    }

    /// Map a configured buffer limit onto watermarks
    ///
    /// `None` is unbounded, `Some(0)` is synchronous, `Some(n)` pauses and
    /// resumes at `n`.
    pub fn from_limit(limit: Option<usize>) -> Self {
        match limit {
            None => Self::unbounded(),
            Some(n) => PipeOptions {
                pause_writer_threshold: Some(n),
                resume_writer_threshold: n,
            },
        }
    }

    /// Pause threshold, `None` when unbounded
    pub fn pause_writer_threshold(&self) -> Option<usize> {
        self.pause_writer_threshold
    }

    /// Resume threshold
    pub fn resume_writer_threshold(&self) -> usize {
        self.resume_writer_threshold
    }
}

impl Default for PipeOptions {
    fn default() -> Self {
        Self::unbounded()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriterState {
    Open,
    Completed,
}

struct PipeState {
    buffer: BytesMut,
    writer: WriterState,
    reader_open: bool,
    aborted: Option<String>,
    read_canceled: bool,
}

struct Shared {
    options: PipeOptions,
    state: Mutex<PipeState>,
    readable: Condvar,
    writable: Condvar,
}

impl Shared {
    fn wake_all(&self) {
        self.readable.notify_all();
        self.writable.notify_all();
    }
}

/// Constructor for a reader/writer pair
pub struct BufferPipe;

impl BufferPipe {
    /// Create a new pipe and return its two endpoints
    #[allow(clippy::new_ret_no_self)]
    pub fn new(options: PipeOptions) -> (PipeReader, PipeWriter) {
        let shared = Arc::new(Shared {
            options,
            state: Mutex::new(PipeState {
                buffer: BytesMut::new(),
                writer: WriterState::Open,
                reader_open: true,
                aborted: None,
                read_canceled: false,
            }),
            readable: Condvar::new(),
            writable: Condvar::new(),
        });

        (
            PipeReader {
                shared: Arc::clone(&shared),
            },
            PipeWriter { shared },
        )
    }
}

/// Consuming end of a pipe
pub struct PipeReader {
    shared: Arc<Shared>,
}

impl PipeReader {
    /// Read buffered bytes into `buf`, blocking until data, EOF or a fault
    ///
    /// Returns `Ok(0)` once the writer has completed and the buffer is empty.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        let mut state = self.shared.state.lock();
        loop {
            if let Some(reason) = &state.aborted {
                return Err(PipeError::Aborted(reason.clone()));
            }
            if state.read_canceled {
                state.read_canceled = false;
                return Err(PipeError::ReadCanceled);
            }
            if !state.buffer.is_empty() {
                let n = buf.len().min(state.buffer.len());
                buf[..n].copy_from_slice(&state.buffer[..n]);
                state.buffer.advance(n);
                self.shared.writable.notify_all();
                return Ok(n);
            }
            if state.writer == WriterState::Completed {
                return Ok(0);
            }
            self.shared.readable.wait(&mut state);
        }
    }

    /// Take up to `max` buffered bytes as one chunk
    ///
    /// Blocks like [`read`](Self::read); `Ok(None)` signals EOF.
    pub fn read_chunk(&mut self, max: usize) -> Result<Option<Bytes>> {
        let mut state = self.shared.state.lock();
        loop {
            if let Some(reason) = &state.aborted {
                return Err(PipeError::Aborted(reason.clone()));
            }
            if state.read_canceled {
                state.read_canceled = false;
                return Err(PipeError::ReadCanceled);
            }
            if !state.buffer.is_empty() {
                let n = max.max(1).min(state.buffer.len());
                let chunk = state.buffer.split_to(n).freeze();
                self.shared.writable.notify_all();
                return Ok(Some(chunk));
            }
            if state.writer == WriterState::Completed {
                return Ok(None);
            }
            self.shared.readable.wait(&mut state);
        }
    }

    /// Number of bytes currently buffered
    pub fn buffered(&self) -> usize {
        self.shared.state.lock().buffer.len()
    }

    /// Handle for aborting or completing the pipe from elsewhere
    pub fn control(&self) -> PipeControl {
        PipeControl {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl io::Read for PipeReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        PipeReader::read(self, buf).map_err(io::Error::from)
    }
}

impl Drop for PipeReader {
    fn drop(&mut self) {
        let mut state = self.shared.state.lock();
        state.reader_open = false;
        state.buffer.clear();
        drop(state);
        self.shared.writable.notify_all();
    }
}

/// Producing end of a pipe
pub struct PipeWriter {
    shared: Arc<Shared>,
}

impl PipeWriter {
    /// Append `data`, then block while the buffer is above the watermarks
    pub fn write(&mut self, data: &[u8]) -> Result<usize> {
        let mut state = self.shared.state.lock();
        Self::check_writable(&state)?;

        state.buffer.extend_from_slice(data);
        if !data.is_empty() {
            self.shared.readable.notify_all();
        }

        let Some(pause) = self.shared.options.pause_writer_threshold else {
            return Ok(data.len());
        };
        let resume = self.shared.options.resume_writer_threshold;

        if state.buffer.is_empty() || state.buffer.len() < pause {
            return Ok(data.len());
        }

        while state.buffer.len() > resume {
            Self::check_writable(&state)?;
            self.shared.writable.wait(&mut state);
        }
        Self::check_writable(&state)?;

        Ok(data.len())
    }

    fn check_writable(state: &PipeState) -> Result<()> {
        if let Some(reason) = &state.aborted {
            return Err(PipeError::Aborted(reason.clone()));
        }
        if state.writer == WriterState::Completed {
            return Err(PipeError::Closed);
        }
        if !state.reader_open {
            return Err(PipeError::ReaderClosed);
        }
        Ok(())
    }

    /// Signal end of stream; the reader sees EOF once the buffer is drained
    pub fn complete(&mut self) {
        let mut state = self.shared.state.lock();
        state.writer = WriterState::Completed;
        drop(state);
        self.shared.readable.notify_all();
    }

    /// Number of bytes currently buffered
    pub fn buffered(&self) -> usize {
        self.shared.state.lock().buffer.len()
    }

    /// Handle for aborting or completing the pipe from elsewhere
    pub fn control(&self) -> PipeControl {
        PipeControl {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl io::Write for PipeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        PipeWriter::write(self, buf).map_err(io::Error::from)
    }

    fn flush(&mut self) -> io::Result<()> {
        let state = self.shared.state.lock();
        Self::check_writable(&state).map_err(io::Error::from)
    }
}

impl Drop for PipeWriter {
    fn drop(&mut self) {
        self.complete();
    }
}

/// Out-of-band handle to a pipe
///
/// Held by the connection that created the pipe. Never blocks.
#[derive(Clone)]
pub struct PipeControl {
    shared: Arc<Shared>,
}

impl PipeControl {
    /// Fault the pipe, waking blocked readers and writers
    ///
    /// Returns `true` for the call that actually aborted the pipe.
    pub fn abort(&self, reason: impl Into<String>) -> bool {
        let mut state = self.shared.state.lock();
        if state.aborted.is_some() {
            return false;
        }
        state.aborted = Some(reason.into());
        state.buffer.clear();
        drop(state);
        self.shared.wake_all();
        true
    }

    /// Complete the writer side, optionally appending a final payload
    ///
    /// The payload bypasses the watermarks. Any later write by the writer
    /// endpoint fails with [`PipeError::Closed`]. Returns `false` if the pipe
    /// was aborted or already completed.
    pub fn complete_with(&self, payload: Option<Bytes>) -> bool {
        let mut state = self.shared.state.lock();
        if state.aborted.is_some() || state.writer == WriterState::Completed {
            return false;
        }
        if let Some(payload) = payload {
            state.buffer.extend_from_slice(&payload);
        }
        state.writer = WriterState::Completed;
        drop(state);
        self.shared.wake_all();
        true
    }

    /// Make the next (or current) read return [`PipeError::ReadCanceled`] once
    pub fn cancel_pending_read(&self) {
        self.shared.state.lock().read_canceled = true;
        self.shared.readable.notify_all();
    }

    /// Number of bytes currently buffered
    pub fn buffered(&self) -> usize {
        self.shared.state.lock().buffer.len()
    }

    /// Whether the pipe has been aborted
    pub fn is_aborted(&self) -> bool {
        self.shared.state.lock().aborted.is_some()
    }

    /// Whether the writer side has completed
    pub fn is_completed(&self) -> bool {
        self.shared.state.lock().writer == WriterState::Completed
    }

    /// Whether the reader endpoint has been dropped
    pub fn is_reader_closed(&self) -> bool {
        !self.shared.state.lock().reader_open
    }

    /// Watermarks this pipe was created with
    pub fn options(&self) -> PipeOptions {
        self.shared.options
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_pipe_options_validation() {
        assert!(PipeOptions::bounded(10, 5).is_ok());
        assert!(PipeOptions::bounded(0, 0).is_ok());
        assert_eq!(
            PipeOptions::bounded(5, 10).unwrap_err(),
            PipeError::InvalidWatermarks { pause: 5, resume: 10 }
        );
        assert_eq!(PipeOptions::from_limit(None), PipeOptions::unbounded());
        assert_eq!(PipeOptions::from_limit(Some(0)), PipeOptions::synchronous());
        assert_eq!(
            PipeOptions::from_limit(Some(1024)).pause_writer_threshold(),
            Some(1024)
        );
    }

    #[test]
    fn test_fifo_order() {
        let (mut reader, mut writer) = BufferPipe::new(PipeOptions::unbounded());
        writer.write(b"hello ").unwrap();
        writer.write(b"world").unwrap();
        writer.complete();

        let mut out = String::new();
        reader.read_to_string(&mut out).unwrap();
        assert_eq!(out, "hello world");
    }

    #[test]
    fn test_eof_after_complete() {
        let (mut reader, mut writer) = BufferPipe::new(PipeOptions::unbounded());
        writer.write(b"ab").unwrap();
        drop(writer);

        let mut buf = [0u8; 8];
        assert_eq!(reader.read(&mut buf).unwrap(), 2);
        assert_eq!(reader.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn test_writer_blocks_at_high_watermark() {
        let (mut reader, mut writer) = BufferPipe::new(PipeOptions::bounded(8, 4).unwrap());
        let control = writer.control();
        let returned = Arc::new(AtomicBool::new(false));
        let returned_clone = Arc::clone(&returned);

        let handle = thread::spawn(move || {
            writer.write(&[1u8; 10]).unwrap();
            returned_clone.store(true, Ordering::SeqCst);
            writer
        });

        thread::sleep(Duration::from_millis(100));
        assert!(!returned.load(Ordering::SeqCst));
        assert_eq!(control.buffered(), 10);

        // Draining to 6 is still above the resume threshold
        let mut buf = [0u8; 4];
        reader.read(&mut buf).unwrap();
        thread::sleep(Duration::from_millis(50));
        assert!(!returned.load(Ordering::SeqCst));

        // Draining to 2 releases the writer
        reader.read(&mut buf).unwrap();
        let _writer = handle.join().unwrap();
        assert!(returned.load(Ordering::SeqCst));
        assert_eq!(control.buffered(), 2);
    }

    #[test]
    fn test_buffered_never_exceeds_watermark_plus_write() {
        let (mut reader, mut writer) = BufferPipe::new(PipeOptions::bounded(16, 8).unwrap());
        let control = writer.control();

        let producer = thread::spawn(move || {
            for _ in 0..200 {
                writer.write(&[7u8; 5]).unwrap();
            }
            writer.complete();
        });

        let mut total = 0;
        let mut buf = [0u8; 3];
        loop {
            assert!(control.buffered() <= 16 + 5);
            let n = reader.read(&mut buf).unwrap();
            if n == 0 {
                break;
            }
            total += n;
        }
        producer.join().unwrap();
        assert_eq!(total, 1000);
    }

    #[test]
    fn test_synchronous_pipe_waits_for_every_byte() {
        let (mut reader, mut writer) = BufferPipe::new(PipeOptions::synchronous());
        let returned = Arc::new(AtomicBool::new(false));
        let returned_clone = Arc::clone(&returned);

        let handle = thread::spawn(move || {
            writer.write(b"x").unwrap();
            returned_clone.store(true, Ordering::SeqCst);
        });

        thread::sleep(Duration::from_millis(100));
        assert!(!returned.load(Ordering::SeqCst));

        let mut buf = [0u8; 1];
        assert_eq!(reader.read(&mut buf).unwrap(), 1);
        handle.join().unwrap();
        assert!(returned.load(Ordering::SeqCst));
    }

    #[test]
    fn test_unbounded_never_blocks() {
        let (reader, mut writer) = BufferPipe::new(PipeOptions::unbounded());
        for _ in 0..1024 {
            writer.write(&[0u8; 1024]).unwrap();
        }
        assert_eq!(reader.buffered(), 1024 * 1024);
    }

    #[test]
    fn test_abort_unblocks_reader() {
        let (mut reader, writer) = BufferPipe::new(PipeOptions::unbounded());
        let control = writer.control();

        let handle = thread::spawn(move || {
            let mut buf = [0u8; 4];
            reader.read(&mut buf)
        });

        thread::sleep(Duration::from_millis(50));
        assert!(control.abort("test"));
        assert!(!control.abort("again"));

        let result = handle.join().unwrap();
        assert_eq!(result, Err(PipeError::Aborted("test".to_string())));
        drop(writer);
    }

    #[test]
    fn test_abort_unblocks_writer() {
        let (reader, mut writer) = BufferPipe::new(PipeOptions::synchronous());
        let control = reader.control();

        let handle = thread::spawn(move || writer.write(b"blocked"));

        thread::sleep(Duration::from_millis(50));
        control.abort("timeout");

        let err = handle.join().unwrap().unwrap_err();
        assert!(matches!(err, PipeError::Aborted(_)));
        let io_err: io::Error = err.into();
        assert_eq!(io_err.kind(), io::ErrorKind::ConnectionAborted);
        drop(reader);
    }

    #[test]
    fn test_complete_with_payload() {
        let (mut reader, mut writer) = BufferPipe::new(PipeOptions::synchronous());
        let control = writer.control();

        assert!(control.complete_with(Some(Bytes::from_static(b"bye"))));
        assert!(!control.complete_with(None));
        assert_eq!(writer.write(b"late"), Err(PipeError::Closed));

        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"bye");
    }

    #[test]
    fn test_cancel_pending_read_is_one_shot() {
        let (mut reader, mut writer) = BufferPipe::new(PipeOptions::unbounded());
        reader.control().cancel_pending_read();

        let mut buf = [0u8; 4];
        assert_eq!(reader.read(&mut buf), Err(PipeError::ReadCanceled));

        writer.write(b"ok").unwrap();
        assert_eq!(reader.read(&mut buf).unwrap(), 2);
    }

    #[test]
    fn test_writer_fails_after_reader_dropped() {
        let (reader, mut writer) = BufferPipe::new(PipeOptions::unbounded());
        drop(reader);
        assert_eq!(writer.write(b"x"), Err(PipeError::ReaderClosed));
        assert!(writer.control().is_reader_closed());
    }

    #[test]
    fn test_read_chunk() {
        let (mut reader, mut writer) = BufferPipe::new(PipeOptions::unbounded());
        writer.write(b"abcdef").unwrap();
        writer.complete();

        assert_eq!(reader.read_chunk(4).unwrap(), Some(Bytes::from_static(b"abcd")));
        assert_eq!(reader.read_chunk(4).unwrap(), Some(Bytes::from_static(b"ef")));
        assert_eq!(reader.read_chunk(4).unwrap(), None);
    }

    #[test]
    fn test_io_write_impl() {
        let (mut reader, mut writer) = BufferPipe::new(PipeOptions::unbounded());
        write!(writer, "{}-{}", 1, 2).unwrap();
        writer.flush().unwrap();
        drop(writer);

        let mut out = String::new();
        reader.read_to_string(&mut out).unwrap();
        assert_eq!(out, "1-2");
    }
}
