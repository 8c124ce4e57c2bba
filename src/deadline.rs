//! Per-call deadlines for duplex streams.
//!
//! [`DeadlineStream`] bounds every individual read, write and flush on the
//! wrapped stream. The timer is armed the first time an operation would
//! block and is re-armed for the next operation once it completes, so a
//! deadline applies per call rather than per transaction.
//!
//! The timer is polled inside the same `poll_*` call as the I/O it guards.
//! When it fires, the caller gets an `io::ErrorKind::TimedOut` error and the
//! pending operation is simply no longer polled; no detached task is left
//! blocked on the stream.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::{sleep, Instant, Sleep};

/// Payload of the `TimedOut` I/O error produced by [`DeadlineStream`].
#[derive(Debug, Clone, Copy, Error)]
#[error("{op} exceeded deadline of {deadline:?}")]
pub struct DeadlineElapsed {
    /// Which operation timed out (`"read"`, `"write"` or `"flush"`).
    pub op: &'static str,
    /// The deadline that elapsed.
    pub deadline: Duration,
}

impl DeadlineElapsed {
    /// Extract the deadline details from an I/O error, if it came from a
    /// [`DeadlineStream`].
    #[must_use]
    pub fn from_io(err: &io::Error) -> Option<Self> {
        if err.kind() != io::ErrorKind::TimedOut {
            return None;
        }
        err.get_ref()
            .and_then(|inner| inner.downcast_ref::<DeadlineElapsed>())
            .copied()
    }
}

struct Timer {
    sleep: Pin<Box<Sleep>>,
    armed: bool,
}

impl Timer {
    fn new() -> Self {
        Self {
            sleep: Box::pin(sleep(Duration::ZERO)),
            armed: false,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }

    /// Poll the timer for an operation that just returned `Pending`.
    fn poll_expired(
        &mut self,
        cx: &mut Context<'_>,
        deadline: Duration,
        op: &'static str,
    ) -> Poll<io::Error> {
        if !self.armed {
            self.sleep.as_mut().reset(Instant::now() + deadline);
            self.armed = true;
        }
        match self.sleep.as_mut().poll(cx) {
            Poll::Ready(()) => {
                self.armed = false;
                Poll::Ready(io::Error::new(
                    io::ErrorKind::TimedOut,
                    DeadlineElapsed { op, deadline },
                ))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Wraps a duplex stream so that no single read or write blocks longer than
/// a fixed duration.
pub struct DeadlineStream<S> {
    inner: S,
    deadline: Duration,
    read_timer: Timer,
    write_timer: Timer,
}

impl<S> DeadlineStream<S> {
    /// Wrap `inner`, bounding each I/O call by `deadline`.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(inner: S, deadline: Duration) -> Self {
        Self {
            inner,
            deadline,
            read_timer: Timer::new(),
            write_timer: Timer::new(),
        }
    }

    /// The per-call deadline.
    #[must_use]
    pub fn deadline(&self) -> Duration {
        self.deadline
    }

    /// Start a fresh deadline for the next read and the next write.
    ///
    /// A timer stays armed while its operation is pending, so an operation
    /// abandoned by the caller (dropped by `select!` or an outer timeout)
    /// leaves its deadline running. Call this at the start of each logical
    /// operation to keep that deadline from leaking into it.
    pub fn rearm(&mut self) {
        self.read_timer.disarm();
        self.write_timer.disarm();
    }

    /// Shared access to the wrapped stream.
    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    /// Mutable access to the wrapped stream.
    pub fn get_mut(&mut self) -> &mut S {
        &mut self.inner
    }

    /// Unwrap, discarding the deadline.
    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for DeadlineStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Ready(result) => {
                this.read_timer.disarm();
                Poll::Ready(result)
            }
            Poll::Pending => this
                .read_timer
                .poll_expired(cx, this.deadline, "read")
                .map(Err),
        }
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for DeadlineStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_write(cx, buf) {
            Poll::Ready(result) => {
                this.write_timer.disarm();
                Poll::Ready(result)
            }
            Poll::Pending => this
                .write_timer
                .poll_expired(cx, this.deadline, "write")
                .map(Err),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_flush(cx) {
            Poll::Ready(result) => {
                this.write_timer.disarm();
                Poll::Ready(result)
            }
            Poll::Pending => this
                .write_timer
                .poll_expired(cx, this.deadline, "flush")
                .map(Err),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}
