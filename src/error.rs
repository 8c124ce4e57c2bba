//! Error types for instrument communication.
//!
//! This module defines [`CommError`], the single error type that crosses the
//! [`execute`](crate::transaction::ResilientTransport::execute) boundary. It is built
//! with `thiserror`, and each variant maps onto one class of the failure
//! taxonomy ([`ErrorKind`]):
//!
//! - **Transient**: the peer closed or reset the connection. Retried
//!   internally by replacing the connection; only surfaced wrapped in
//!   [`CommError::RetriesExhausted`] once the retry budget is spent.
//! - **Timeout**: a per-call deadline elapsed. Fatal for the attempt, since
//!   silently retrying timeouts would mask a dead link.
//! - **Framing**: bytes arrived but the terminator never did, or the frame
//!   grew past its limit. The hardware link should be treated as suspect.
//! - **Connect**: the dialer could not establish a connection.
//! - **Pool**: the pool was closed.
//! - **Config**: configuration could not be loaded or failed validation.
//!
//! Nothing here is fatal to the process: a dead instrument degrades to an
//! error return, never a panic.

use crate::deadline::DeadlineElapsed;
use bytes::Bytes;
use labcomm_pool::PoolError;
use std::fmt;
use std::io;
use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results using [`CommError`].
pub type Result<T> = std::result::Result<T, CommError>;

/// Which half of a write-then-read transaction an error belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Sending the framed command.
    Write,
    /// Receiving the framed reply.
    Read,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Phase::Write => "write",
            Phase::Read => "read",
        };
        write!(f, "{}", label)
    }
}

/// Coarse classification of a [`CommError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Peer closed or reset the connection; recoverable by reconnecting.
    Transient,
    /// A per-call deadline elapsed.
    Timeout,
    /// Response was unterminated or oversized.
    Framing,
    /// Connection establishment failed.
    Connect,
    /// Pool closed.
    Pool,
    /// Bad configuration.
    Config,
    /// Anything else.
    Other,
}

/// Primary error type for the transport layer.
#[derive(Error, Debug)]
pub enum CommError {
    /// Underlying I/O failure not covered by a more specific variant.
    #[error("I/O error: {0}")]
    Io(#[source] io::Error),

    /// The remote host actively refused the connection. Not retried.
    #[error("connection to {target} refused")]
    Refused {
        /// Address or port path that was dialed.
        target: String,
        /// Error reported by the OS.
        #[source]
        source: io::Error,
    },

    /// The dialer's elapsed-time budget ran out before a connection was made.
    #[error("could not connect to {target} after {attempts} attempts in {elapsed:?}")]
    ConnectTimeout {
        /// Address or port path that was dialed.
        target: String,
        /// Number of connection attempts made.
        attempts: u32,
        /// Time spent dialing.
        elapsed: Duration,
        /// The last failure seen.
        #[source]
        source: io::Error,
    },

    /// A single read or write exceeded its deadline.
    #[error("{op} timed out after {deadline:?}")]
    Timeout {
        /// `"read"`, `"write"` or `"flush"`.
        op: &'static str,
        /// The per-call deadline that elapsed.
        deadline: Duration,
    },

    /// End of input arrived before the receive terminator.
    #[error("termination byte {terminator:#04x} not found after {} bytes", .partial.len())]
    TerminatorNotFound {
        /// The receive terminator that was expected.
        terminator: u8,
        /// Whatever was received before the stream ended.
        partial: Bytes,
    },

    /// The response grew past the configured frame limit without a terminator.
    #[error("frame exceeded {limit} bytes without a terminator")]
    FrameTooLong {
        /// The configured maximum frame length.
        limit: usize,
    },

    /// The peer closed the connection gracefully without sending anything.
    #[error("peer closed the connection without replying")]
    PeerClosed,

    /// The connection pool has been closed.
    #[error("connection pool is closed")]
    PoolClosed,

    /// Every attempt of a phase failed with a transient error.
    #[error("{phase} failed after {attempts} attempts: {source}")]
    RetriesExhausted {
        /// Phase that ran out of retries.
        phase: Phase,
        /// Attempts made (equal to the retry budget).
        attempts: u32,
        /// The last underlying error.
        #[source]
        source: Box<CommError>,
    },

    /// A non-transient error ended a phase.
    #[error("{phase} attempt {attempt} failed: {source}")]
    Fatal {
        /// Phase in which the error occurred.
        phase: Phase,
        /// 1-based attempt number.
        attempt: u32,
        /// The underlying error.
        #[source]
        source: Box<CommError>,
    },

    /// Configuration could not be loaded.
    #[error("configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// Configuration loaded but is semantically invalid.
    #[error("configuration validation error: {0}")]
    InvalidConfig(String),
}

impl CommError {
    /// Classify this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            CommError::Io(e) if is_reset_kind(e.kind()) => ErrorKind::Transient,
            CommError::Io(e) if e.kind() == io::ErrorKind::TimedOut => ErrorKind::Timeout,
            CommError::Io(_) => ErrorKind::Other,
            CommError::Refused { .. } | CommError::ConnectTimeout { .. } => ErrorKind::Connect,
            CommError::Timeout { .. } => ErrorKind::Timeout,
            CommError::TerminatorNotFound { .. } | CommError::FrameTooLong { .. } => {
                ErrorKind::Framing
            }
            CommError::PeerClosed => ErrorKind::Other,
            CommError::PoolClosed => ErrorKind::Pool,
            CommError::RetriesExhausted { source, .. } | CommError::Fatal { source, .. } => {
                source.kind()
            }
            CommError::Config(_) | CommError::InvalidConfig(_) => ErrorKind::Config,
        }
    }

    /// True if the peer closed or reset the connection mid-operation.
    ///
    /// Only bare I/O errors qualify; an error already wrapped by the retry
    /// machinery is final.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, CommError::Io(e) if is_reset_kind(e.kind()))
    }

    /// The innermost error, looking through retry wrappers.
    #[must_use]
    pub fn root(&self) -> &CommError {
        match self {
            CommError::RetriesExhausted { source, .. } | CommError::Fatal { source, .. } => {
                source.root()
            }
            other => other,
        }
    }
}

fn is_reset_kind(kind: io::ErrorKind) -> bool {
    matches!(
        kind,
        io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionAborted | io::ErrorKind::BrokenPipe
    )
}

impl From<io::Error> for CommError {
    /// Deadline expiries from [`DeadlineStream`](crate::deadline::DeadlineStream)
    /// become [`CommError::Timeout`]; everything else stays an I/O error.
    fn from(e: io::Error) -> Self {
        match DeadlineElapsed::from_io(&e) {
            Some(elapsed) => CommError::Timeout {
                op: elapsed.op,
                deadline: elapsed.deadline,
            },
            None => CommError::Io(e),
        }
    }
}

impl From<figment::Error> for CommError {
    fn from(e: figment::Error) -> Self {
        CommError::Config(Box::new(e))
    }
}

impl From<PoolError<CommError>> for CommError {
    fn from(e: PoolError<CommError>) -> Self {
        match e {
            PoolError::Closed => CommError::PoolClosed,
            PoolError::Factory(inner) => inner,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reset_kinds_are_transient() {
        for kind in [
            io::ErrorKind::ConnectionReset,
            io::ErrorKind::ConnectionAborted,
            io::ErrorKind::BrokenPipe,
        ] {
            let err = CommError::from(io::Error::from(kind));
            assert!(err.is_transient(), "{kind:?} should be transient");
            assert_eq!(err.kind(), ErrorKind::Transient);
        }
    }

    #[test]
    fn test_other_errors_are_not_transient() {
        assert!(!CommError::from(io::Error::from(io::ErrorKind::TimedOut)).is_transient());
        assert!(!CommError::PeerClosed.is_transient());
        let timeout = CommError::Timeout {
            op: "read",
            deadline: Duration::from_millis(50),
        };
        assert!(!timeout.is_transient());
        assert_eq!(timeout.kind(), ErrorKind::Timeout);
    }

    #[test]
    fn test_wrapped_errors_keep_kind_and_root() {
        let err = CommError::RetriesExhausted {
            phase: Phase::Write,
            attempts: 3,
            source: Box::new(CommError::from(io::Error::from(
                io::ErrorKind::ConnectionReset,
            ))),
        };
        assert!(!err.is_transient());
        assert_eq!(err.kind(), ErrorKind::Transient);
        assert!(err.root().is_transient());
        assert!(err.to_string().starts_with("write failed after 3 attempts"));
    }

    #[test]
    fn test_pool_error_conversion() {
        assert!(matches!(
            CommError::from(PoolError::<CommError>::Closed),
            CommError::PoolClosed
        ));
        let refused = PoolError::Factory(CommError::Refused {
            target: "10.0.0.1:5000".into(),
            source: io::Error::from(io::ErrorKind::ConnectionRefused),
        });
        assert_eq!(CommError::from(refused).kind(), ErrorKind::Connect);
    }

    #[test]
    fn test_deadline_io_error_becomes_timeout() {
        let io_err = io::Error::new(
            io::ErrorKind::TimedOut,
            DeadlineElapsed {
                op: "read",
                deadline: Duration::from_millis(50),
            },
        );
        match CommError::from(io_err) {
            CommError::Timeout { op, deadline } => {
                assert_eq!(op, "read");
                assert_eq!(deadline, Duration::from_millis(50));
            }
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    #[test]
    fn test_terminator_not_found_message() {
        let err = CommError::TerminatorNotFound {
            terminator: b'\r',
            partial: Bytes::from_static(b"12.5"),
        };
        assert_eq!(err.to_string(), "termination byte 0x0d not found after 4 bytes");
    }
}
