//! Wire primitives: buffered line and exact-byte reads over a byte stream.
//!
//! [`WireStream`] wraps the connection's transport with a read buffer and
//! provides the two operations the protocol engine is built on: reading a
//! CRLF-terminated line and reading an exact number of bytes. Leftover
//! buffered bytes carry over between requests on a persistent connection.

use std::io;

use bytes::BytesMut;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum length of a single head line (request line or header line).
const MAX_LINE: usize = 8 * 1024;

/// Upper bound on a single buffered read while draining large payloads.
const READ_CHUNK: usize = 64 * 1024;

/// Errors produced by the wire primitives.
#[derive(Debug, Error)]
pub enum WireError {
    /// The peer closed the connection.
    #[error("connection closed by peer")]
    ConnectionClosed,

    /// A bare CR or LF appeared where a CRLF line ending was required.
    #[error("malformed line: bare CR or LF")]
    MalformedLine,

    /// A head line exceeded the per-line limit.
    #[error("line exceeds maximum length of {max} bytes")]
    LineTooLong { max: usize },

    /// Transport failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// A buffered reader/writer over the connection's transport.
///
/// One `WireStream` exists per connection and is owned by the task driving
/// that connection, so every read and write on the transport is serialized
/// through it.
pub struct WireStream<S> {
    stream: S,
    buf: BytesMut,
}

impl<S> WireStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Wraps a transport with the given initial read-buffer capacity.
    pub fn new(stream: S, buf_capacity: usize) -> Self {
        Self {
            stream,
            buf: BytesMut::with_capacity(buf_capacity.max(64)),
        }
    }

    /// Reads one line terminated by CRLF and returns it without the
    /// terminator.
    ///
    /// # Errors
    ///
    /// - [`WireError::ConnectionClosed`] if the peer closes before a full
    ///   line arrives (including EOF before any byte).
    /// - [`WireError::MalformedLine`] if a lone CR or LF appears, or the
    ///   line is not valid UTF-8.
    /// - [`WireError::LineTooLong`] past the per-line limit.
    pub async fn read_line(&mut self) -> Result<String, WireError> {
        let mut scanned = 0;
        loop {
            if let Some(pos) = self.buf[scanned..]
                .iter()
                .position(|&b| b == b'\r' || b == b'\n')
            {
                let at = scanned + pos;
                if self.buf[at] == b'\n' {
                    // LF with no preceding CR
                    return Err(WireError::MalformedLine);
                }
                if at + 1 < self.buf.len() {
                    if self.buf[at + 1] != b'\n' {
                        return Err(WireError::MalformedLine);
                    }
                    let mut line = self.buf.split_to(at + 2);
                    line.truncate(at);
                    return String::from_utf8(line.to_vec())
                        .map_err(|_| WireError::MalformedLine);
                }
                // CR is the last buffered byte: need one more to decide.
                scanned = at;
            } else {
                scanned = self.buf.len();
            }

            if self.buf.len() > MAX_LINE {
                return Err(WireError::LineTooLong { max: MAX_LINE });
            }
            if self.fill().await? == 0 {
                return Err(WireError::ConnectionClosed);
            }
        }
    }

    /// Reads exactly `n` bytes, draining the buffer first.
    ///
    /// Large reads are chunked internally; the caller sees one contiguous
    /// result. Fails with [`WireError::ConnectionClosed`] if the peer closes
    /// before `n` bytes arrive.
    pub async fn read_exact(&mut self, n: usize) -> Result<BytesMut, WireError> {
        let mut out = BytesMut::with_capacity(n.min(READ_CHUNK));
        while out.len() < n {
            if self.buf.is_empty() {
                self.buf.reserve((n - out.len()).min(READ_CHUNK));
                if self.fill().await? == 0 {
                    return Err(WireError::ConnectionClosed);
                }
            }
            let take = self.buf.len().min(n - out.len());
            out.extend_from_slice(&self.buf.split_to(take));
        }
        Ok(out)
    }

    /// Reads up to `max` bytes, returning at least one.
    ///
    /// Used to stream large bodies to their spool file one buffer at a time.
    pub async fn read_chunk(&mut self, max: usize) -> Result<BytesMut, WireError> {
        if self.buf.is_empty() {
            self.buf.reserve(max.min(READ_CHUNK));
            if self.fill().await? == 0 {
                return Err(WireError::ConnectionClosed);
            }
        }
        let take = self.buf.len().min(max);
        Ok(self.buf.split_to(take))
    }

    async fn fill(&mut self) -> Result<usize, WireError> {
        Ok(self.stream.read_buf(&mut self.buf).await?)
    }

    /// Writes the whole buffer to the transport.
    pub async fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        self.stream.write_all(data).await
    }

    /// Flushes the transport.
    pub async fn flush(&mut self) -> io::Result<()> {
        self.stream.flush().await
    }

    /// Shuts down the write side of the transport.
    pub async fn shutdown(&mut self) -> io::Result<()> {
        self.stream.shutdown().await
    }

    /// Direct access to the transport, for writers that frame their own
    /// output.
    pub fn inner_mut(&mut self) -> &mut S {
        &mut self.stream
    }
}
