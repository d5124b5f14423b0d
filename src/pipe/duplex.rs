//! Pipe-backed duplex streams
//!
//! The raw stream a connection hands to its adapter chain: reads come from the
//! input pipe, writes go to the output pipe. Adapters wrap it in further
//! [`ConnectionStream`]s (TLS, logging) and the request engine sees whatever
//! the last adapter produced.

use super::{PipeReader, PipeWriter};
use std::io::{self, Read, Write};

/// A bidirectional byte stream owned by a connection
pub trait ConnectionStream: Read + Write + Send {
    /// Gracefully close the stream
    ///
    /// Wrapping streams close their own layer first (e.g. TLS close_notify),
    /// then the stream they wrap.
    fn close(&mut self) -> io::Result<()> {
        self.flush()
    }
}

/// Boxed connection stream, as passed along the adapter chain
pub type BoxedStream = Box<dyn ConnectionStream>;

/// Raw stream over a connection's input and output pipes
pub struct DuplexStream {
    input: PipeReader,
    output: PipeWriter,
}

impl DuplexStream {
    /// Create a duplex stream from the input pipe's reader and the output
    /// pipe's writer
    pub fn new(input: PipeReader, output: PipeWriter) -> Self {
        DuplexStream { input, output }
    }

    /// Get a reference to the input side
    pub fn input(&self) -> &PipeReader {
        &self.input
    }

    /// Get a reference to the output side
    pub fn output(&self) -> &PipeWriter {
        &self.output
    }
}

impl Read for DuplexStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Read::read(&mut self.input, buf)
    }
}

impl Write for DuplexStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Write::write(&mut self.output, buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Write::flush(&mut self.output)
    }
}

impl ConnectionStream for DuplexStream {
    fn close(&mut self) -> io::Result<()> {
        self.output.complete();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipe::{BufferPipe, PipeOptions};

    #[test]
    fn test_duplex_routes_reads_and_writes() {
        let (input_reader, mut input_writer) = BufferPipe::new(PipeOptions::unbounded());
        let (mut output_reader, output_writer) = BufferPipe::new(PipeOptions::unbounded());
        let mut stream = DuplexStream::new(input_reader, output_writer);

        input_writer.write(b"ping").unwrap();
        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ping");

        stream.write_all(b"pong").unwrap();
        stream.close().unwrap();

        let mut out = Vec::new();
        output_reader.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"pong");
    }

    #[test]
    fn test_duplex_close_rejects_further_writes() {
        let (input_reader, _input_writer) = BufferPipe::new(PipeOptions::unbounded());
        let (_output_reader, output_writer) = BufferPipe::new(PipeOptions::unbounded());
        let mut stream = DuplexStream::new(input_reader, output_writer);

        stream.close().unwrap();
        let err = stream.write(b"late").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }
}
