//! Single-byte terminator framing.
//!
//! Most lab instruments speak line-oriented ASCII: every command ends in a
//! transmit terminator (usually `\r`) and every reply ends in a receive
//! terminator. [`FramedStream`] appends the transmit terminator on the way
//! out and reassembles replies that arrive across several physical reads,
//! stripping the receive terminator before handing the payload back.
//!
//! # Example
//!
//! ```
//! use labcomm::framed::{FramedStream, Terminators};
//! use tokio::io::{AsyncReadExt, AsyncWriteExt};
//!
//! # tokio_test::block_on(async {
//! let (mut instrument, host) = tokio::io::duplex(64);
//! let mut link = FramedStream::new(host, Terminators::default());
//!
//! link.send(b"RD?").await.unwrap();
//! let mut cmd = [0u8; 4];
//! instrument.read_exact(&mut cmd).await.unwrap();
//! assert_eq!(&cmd, b"RD?\r");
//!
//! instrument.write_all(b"21.5\r").await.unwrap();
//! assert_eq!(&link.recv().await.unwrap()[..], b"21.5");
//! # });
//! ```

use crate::capabilities::{Receive, Transmit};
use crate::deadline::DeadlineStream;
use crate::error::{CommError, Result};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

/// Default terminator for both directions (carriage return).
pub const DEFAULT_TERMINATOR: u8 = b'\r';

/// Default upper bound on a single received frame.
pub const DEFAULT_MAX_FRAME_LEN: usize = 64 * 1024;

const READ_CHUNK: usize = 1500;

/// Receive and transmit terminators. They may be equal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Terminators {
    /// Marks the end of a received frame.
    pub rx: u8,
    /// Appended to every transmitted frame.
    pub tx: u8,
}

impl Terminators {
    /// Same terminator in both directions.
    #[must_use]
    pub const fn symmetric(term: u8) -> Self {
        Self { rx: term, tx: term }
    }
}

impl Default for Terminators {
    fn default() -> Self {
        Self::symmetric(DEFAULT_TERMINATOR)
    }
}

/// Copy `payload` into a new frame with `terminator` appended.
#[must_use]
pub fn append_terminator(payload: &[u8], terminator: u8) -> Bytes {
    let mut frame = BytesMut::with_capacity(payload.len() + 1);
    frame.extend_from_slice(payload);
    frame.extend_from_slice(&[terminator]);
    frame.freeze()
}

/// Strip everything from the first `terminator` onward.
///
/// Returns `None` if the terminator does not occur in `frame`.
#[must_use]
pub fn strip_terminator(frame: &[u8], terminator: u8) -> Option<&[u8]> {
    frame
        .iter()
        .position(|&b| b == terminator)
        .map(|idx| &frame[..idx])
}

/// Wraps a duplex stream with terminator framing.
///
/// Bytes received after a terminator are kept for the next [`recv`](Self::recv).
pub struct FramedStream<S> {
    inner: S,
    terminators: Terminators,
    rx_buf: BytesMut,
    max_frame_len: usize,
    call_hook: Option<fn(&mut S)>,
}

impl<S> FramedStream<S> {
    /// Wrap `inner` with the given terminators.
    pub fn new(inner: S, terminators: Terminators) -> Self {
        Self {
            inner,
            terminators,
            rx_buf: BytesMut::with_capacity(READ_CHUNK),
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            call_hook: None,
        }
    }

    /// Override the maximum received frame length.
    #[must_use]
    pub fn with_max_frame_len(mut self, max_frame_len: usize) -> Self {
        self.max_frame_len = max_frame_len;
        self
    }

    /// The configured terminators.
    #[must_use]
    pub fn terminators(&self) -> Terminators {
        self.terminators
    }

    /// Number of received bytes waiting to be framed.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.rx_buf.len()
    }

    /// Shared access to the wrapped stream.
    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    /// Mutable access to the wrapped stream.
    ///
    /// Reading from it directly bypasses the frame buffer.
    pub fn get_mut(&mut self) -> &mut S {
        &mut self.inner
    }

    /// Unwrap, dropping any buffered bytes.
    pub fn into_inner(self) -> S {
        self.inner
    }

    fn take_frame(&mut self, from: usize) -> Option<Bytes> {
        let idx = self.rx_buf[from..]
            .iter()
            .position(|&b| b == self.terminators.rx)?;
        let mut frame = self.rx_buf.split_to(from + idx + 1);
        frame.truncate(from + idx);
        Some(frame.freeze())
    }
}

impl<S> FramedStream<DeadlineStream<S>> {
    /// Frame `inner` with every read and write bounded by `deadline`.
    ///
    /// Each [`send`](Self::send) and [`recv`](Self::recv) starts with fresh
    /// deadlines, even if an earlier call was abandoned mid-flight.
    pub fn with_deadline(inner: S, deadline: Duration, terminators: Terminators) -> Self {
        let mut framed = Self::new(DeadlineStream::new(inner, deadline), terminators);
        framed.call_hook = Some(DeadlineStream::rearm as fn(&mut DeadlineStream<S>));
        framed
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> FramedStream<S> {
    fn begin_call(&mut self) {
        if let Some(hook) = self.call_hook {
            hook(&mut self.inner);
        }
    }

    /// Append the transmit terminator and write the frame in one go.
    pub async fn send(&mut self, payload: &[u8]) -> Result<()> {
        self.begin_call();
        let frame = append_terminator(payload, self.terminators.tx);
        self.inner.write_all(&frame).await?;
        self.inner.flush().await?;
        trace!(len = frame.len(), "Frame sent");
        Ok(())
    }

    /// Read until the receive terminator and return the payload without it.
    ///
    /// End of input with nothing received is [`CommError::PeerClosed`]; end of
    /// input after a partial frame is [`CommError::TerminatorNotFound`].
    pub async fn recv(&mut self) -> Result<Bytes> {
        self.begin_call();
        let mut scanned = 0;
        loop {
            if let Some(frame) = self.take_frame(scanned) {
                trace!(len = frame.len(), "Frame received");
                return Ok(frame);
            }
            scanned = self.rx_buf.len();

            if scanned > self.max_frame_len {
                self.rx_buf.clear();
                return Err(CommError::FrameTooLong {
                    limit: self.max_frame_len,
                });
            }

            self.rx_buf.reserve(READ_CHUNK);
            let n = self.inner.read_buf(&mut self.rx_buf).await?;
            if n == 0 {
                if self.rx_buf.is_empty() {
                    return Err(CommError::PeerClosed);
                }
                return Err(CommError::TerminatorNotFound {
                    terminator: self.terminators.rx,
                    partial: self.rx_buf.split().freeze(),
                });
            }
        }
    }
}

#[async_trait]
impl<S: AsyncRead + AsyncWrite + Unpin + Send> Transmit for FramedStream<S> {
    async fn transmit(&mut self, payload: &[u8]) -> Result<()> {
        self.send(payload).await
    }
}

#[async_trait]
impl<S: AsyncRead + AsyncWrite + Unpin + Send> Receive for FramedStream<S> {
    async fn receive(&mut self) -> Result<Bytes> {
        self.recv().await
    }
}
