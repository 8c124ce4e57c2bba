//! Resilient write-then-read transactions over a connection pool.
//!
//! [`ResilientTransport`] is what device drivers call. Each
//! [`execute`](ResilientTransport::execute) runs one transaction:
//!
//! ```text
//! Idle -> Writing -> Written -> Reading -> Done
//!            \                     \
//!             +------> Error <------+
//! ```
//!
//! 1. Lease a connection from the pool.
//! 2. **Write phase**: send the framed command. A connection reset discards
//!    the connection and retries on a fresh one, up to `max_tries` attempts.
//! 3. **Read phase**: receive one framed reply on the same (or replaced)
//!    connection. A reset again replaces the connection, but the command is
//!    *not* re-sent: the instrument already acted on it, so the retry only
//!    recovers the acknowledgment channel.
//! 4. Return the connection to the pool on success; any error has already
//!    destroyed the connection it happened on.
//!
//! Some firmware does not acknowledge write-only commands at all and just
//! closes the line. With [`TransactionConfig::accept_empty_reply`] set, a
//! graceful end of input with zero bytes is the distinguished
//! [`Reply::NoBody`] success rather than an error. This is a per-device
//! setting; it is never inferred from the reply length.

use crate::capabilities::{Query, Receive, Transmit};
use crate::config::{CommConfig, TargetConfig};
use crate::deadline::DeadlineStream;
use crate::dialer::{Dialer, DynConn, TcpConnect};
use crate::error::{CommError, Phase, Result};
use crate::framed::{FramedStream, Terminators, DEFAULT_MAX_FRAME_LEN};
use crate::mock::MockConnector;
use crate::retry::{is_connection_reset, retry_phase, Attempt, TransientPredicate, DEFAULT_MAX_TRIES};
use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;
use labcomm_pool::{Pool, PoolConfig};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, instrument, trace};

/// A pooled connection: deadline-bounded I/O under terminator framing.
pub type Link<C> = FramedStream<DeadlineStream<C>>;

/// Default per-call deadline.
pub const DEFAULT_DEADLINE: Duration = Duration::from_secs(3);

/// Settings for a [`ResilientTransport`].
#[derive(Debug, Clone)]
pub struct TransactionConfig {
    /// Frame terminators for links built by [`ResilientTransport::framed`].
    pub terminators: Terminators,
    /// Deadline applied to every individual read and write.
    pub deadline: Duration,
    /// Attempts per phase (write and read are budgeted independently).
    pub max_tries: u32,
    /// Treat zero bytes followed by a graceful close as a successful,
    /// body-less reply.
    pub accept_empty_reply: bool,
    /// Largest reply accepted before the link is declared broken.
    pub max_frame_len: usize,
    /// Which errors are retried with a fresh connection.
    pub is_transient: TransientPredicate,
}

impl Default for TransactionConfig {
    fn default() -> Self {
        Self {
            terminators: Terminators::default(),
            deadline: DEFAULT_DEADLINE,
            max_tries: DEFAULT_MAX_TRIES,
            accept_empty_reply: false,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            is_transient: is_connection_reset,
        }
    }
}

/// Outcome of a successful transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// A framed reply, terminator stripped.
    Body(Bytes),
    /// The device closed the line without replying and the transport is
    /// configured to accept that.
    NoBody,
}

impl Reply {
    /// The reply bytes; empty for [`Reply::NoBody`].
    #[must_use]
    pub fn into_bytes(self) -> Bytes {
        match self {
            Reply::Body(body) => body,
            Reply::NoBody => Bytes::new(),
        }
    }

    /// True for [`Reply::NoBody`] and for an empty body.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        match self {
            Reply::Body(body) => body.is_empty(),
            Reply::NoBody => true,
        }
    }
}

/// Where a transaction currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    /// Not started.
    Idle,
    /// Sending the command.
    Writing,
    /// Command sent.
    Written,
    /// Waiting for the reply.
    Reading,
    /// Finished successfully.
    Done,
    /// Finished with an error.
    Error,
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            TransactionState::Idle => "idle",
            TransactionState::Writing => "writing",
            TransactionState::Written => "written",
            TransactionState::Reading => "reading",
            TransactionState::Done => "done",
            TransactionState::Error => "error",
        };
        write!(f, "{}", label)
    }
}

struct Tracker(TransactionState);

impl Tracker {
    fn enter(&mut self, next: TransactionState) {
        trace!(from = %self.0, to = %next, "Transaction state");
        self.0 = next;
    }

    fn fail(&mut self, err: CommError) -> CommError {
        debug!(from = %self.0, error = %err, "Transaction failed");
        self.0 = TransactionState::Error;
        err
    }
}

struct WriteCommand<'a> {
    command: &'a [u8],
}

#[async_trait]
impl<L: Transmit> Attempt<L> for WriteCommand<'_> {
    type Output = ();

    async fn attempt(&mut self, link: &mut L) -> Result<()> {
        link.transmit(self.command).await
    }
}

struct ReadReply {
    accept_empty: bool,
}

#[async_trait]
impl<L: Receive> Attempt<L> for ReadReply {
    type Output = Reply;

    async fn attempt(&mut self, link: &mut L) -> Result<Reply> {
        match link.receive().await {
            Ok(body) => Ok(Reply::Body(body)),
            Err(CommError::PeerClosed) if self.accept_empty => Ok(Reply::NoBody),
            Err(e) => Err(e),
        }
    }
}

/// Pooled, retrying request/response transport to one instrument.
///
/// Generic over the link type `L`; anything that can [`Transmit`] and
/// [`Receive`] works. Cheap to share: wrap in an `Arc` and call
/// [`execute`](Self::execute) from as many tasks as needed. The pool bounds
/// how many conversations are in flight.
pub struct ResilientTransport<L> {
    pool: Arc<Pool<L, CommError>>,
    config: TransactionConfig,
}

impl<L> ResilientTransport<L>
where
    L: Transmit + Receive + 'static,
{
    /// Build a transport whose pool opens links with `factory`.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new<F>(pool_config: PoolConfig, factory: F, config: TransactionConfig) -> Self
    where
        F: Fn() -> BoxFuture<'static, Result<L>> + Send + Sync + 'static,
    {
        Self::with_pool(Pool::new(pool_config, factory), config)
    }

    /// Build a transport on an existing pool.
    pub fn with_pool(pool: Arc<Pool<L, CommError>>, config: TransactionConfig) -> Self {
        Self { pool, config }
    }

    /// Send `command` and read one reply.
    ///
    /// Transient resets are retried per phase up to `max_tries`; everything
    /// else is returned immediately. On return, success or failure, the pool
    /// holds exactly as many leases as before the call.
    #[instrument(level = "debug", skip(self, command), fields(len = command.len()))]
    pub async fn execute(&self, command: &[u8]) -> Result<Reply> {
        let mut state = Tracker(TransactionState::Idle);
        let lease = self.pool.get().await.map_err(|e| state.fail(e.into()))?;

        state.enter(TransactionState::Writing);
        let (lease, ()) = retry_phase(
            self.pool.as_ref(),
            lease,
            self.config.max_tries,
            self.config.is_transient,
            Phase::Write,
            &mut WriteCommand { command },
        )
        .await
        .map_err(|e| state.fail(e))?;
        state.enter(TransactionState::Written);

        state.enter(TransactionState::Reading);
        let (lease, reply) = retry_phase(
            self.pool.as_ref(),
            lease,
            self.config.max_tries,
            self.config.is_transient,
            Phase::Read,
            &mut ReadReply {
                accept_empty: self.config.accept_empty_reply,
            },
        )
        .await
        .map_err(|e| state.fail(e))?;

        match reply {
            // The peer hung up after its silent acknowledgment.
            Reply::NoBody => self.pool.destroy(lease),
            Reply::Body(_) => self.pool.put(lease),
        }
        state.enter(TransactionState::Done);
        Ok(reply)
    }

    /// Send `command` without waiting for a reply.
    ///
    /// For instruments that never answer certain commands. Only the write
    /// phase runs; the connection goes back to the pool afterwards.
    #[instrument(level = "debug", skip(self, command), fields(len = command.len()))]
    pub async fn send_only(&self, command: &[u8]) -> Result<()> {
        let lease = self.pool.get().await?;
        let (lease, ()) = retry_phase(
            self.pool.as_ref(),
            lease,
            self.config.max_tries,
            self.config.is_transient,
            Phase::Write,
            &mut WriteCommand { command },
        )
        .await?;
        self.pool.put(lease);
        Ok(())
    }

    /// The underlying pool, for statistics.
    #[must_use]
    pub fn pool(&self) -> &Arc<Pool<L, CommError>> {
        &self.pool
    }

    /// Transaction settings.
    #[must_use]
    pub fn config(&self) -> &TransactionConfig {
        &self.config
    }

    /// Close the pool. Further transactions fail with [`CommError::PoolClosed`].
    pub fn close(&self) {
        self.pool.close();
    }
}

impl<C> ResilientTransport<Link<C>>
where
    C: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Build a transport over raw connections from `connect`, wrapping each
    /// in per-call deadlines and the configured framing.
    pub fn framed<F>(pool_config: PoolConfig, connect: F, config: TransactionConfig) -> Self
    where
        F: Fn() -> BoxFuture<'static, Result<C>> + Send + Sync + 'static,
    {
        let terminators = config.terminators;
        let deadline = config.deadline;
        let max_frame_len = config.max_frame_len;

        let factory = move || -> BoxFuture<'static, Result<Link<C>>> {
            let dialing = connect();
            Box::pin(async move {
                let conn = dialing.await?;
                Ok(FramedStream::with_deadline(conn, deadline, terminators)
                    .with_max_frame_len(max_frame_len))
            })
        };
        Self::new(pool_config, factory, config)
    }
}

impl ResilientTransport<Link<DynConn>> {
    /// Build a transport for the target described in `config`.
    ///
    /// Fails with [`CommError::InvalidConfig`] if `config` does not validate,
    /// or for a serial target when the `serial` feature is disabled.
    pub fn from_config(config: &CommConfig) -> Result<Self> {
        config.validate()?;
        let pool_config = config.pool_config();
        let tx_config = config.transaction_config();

        let transport = match &config.target {
            TargetConfig::Tcp {
                address,
                connect_timeout,
            } => {
                let dialer = Dialer::new(
                    TcpConnect::new(address.clone(), *connect_timeout),
                    config.dialer,
                );
                Self::framed(pool_config, dialer.into_dyn_factory(), tx_config)
            }
            #[cfg(feature = "serial")]
            TargetConfig::Serial { path, baud_rate } => {
                let dialer = Dialer::new(
                    crate::dialer::SerialConnect::new(path.clone(), *baud_rate),
                    config.dialer,
                );
                Self::framed(pool_config, dialer.into_dyn_factory(), tx_config)
            }
            #[cfg(not(feature = "serial"))]
            TargetConfig::Serial { path, .. } => {
                return Err(CommError::InvalidConfig(format!(
                    "serial target {} requires the `serial` feature",
                    path
                )));
            }
            TargetConfig::Mock => {
                let dialer = Dialer::new(MockConnector::echo(), config.dialer);
                Self::framed(pool_config, dialer.into_dyn_factory(), tx_config)
            }
        };
        Ok(transport)
    }
}

#[async_trait]
impl<L> Query for ResilientTransport<L>
where
    L: Transmit + Receive + 'static,
{
    async fn query(&self, command: &[u8]) -> Result<Reply> {
        self.execute(command).await
    }
}

impl<L> fmt::Debug for ResilientTransport<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResilientTransport")
            .field("pool", &self.pool)
            .field("config", &self.config)
            .finish()
    }
}
