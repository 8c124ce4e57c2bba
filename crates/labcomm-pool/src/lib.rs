//! Bounded connection pool for point-to-point instrument links.
//!
//! Lab hardware only accepts a handful of simultaneous conversations, is slow
//! to accept new connections, and some controllers misbehave when they are
//! connection-thrashed. This crate keeps a small set of connections to a
//! single fixed address and lends them out one caller at a time:
//!
//! - [`Pool::get`]: reuse an idle connection, grow via the factory, or wait
//! - [`Pool::put`]: return a healthy connection to the idle set
//! - [`Pool::destroy`]: discard a connection that has gone bad
//! - [`Pool::close`]: stop reclamation, drain idle connections, reject new leases
//!
//! # Capacity Model
//!
//! A `tokio::sync::Semaphore` holds one permit per connection that may still
//! be leased. A caller first takes a permit, then decides under the state lock
//! whether to reuse an idle connection or reserve a slot for a new one, so two
//! callers can never both observe "room to grow" past `max_size`:
//!
//! ```text
//! idle.len() + leased <= max_size        (always)
//! available permits == max_size - leased (outside of get/put critical sections)
//! ```
//!
//! Running out of connections is not an error. `get` waits until another
//! caller returns or destroys a lease, so every lease must be disposed of.
//! A [`Lease`] dropped without an explicit disposition is treated as
//! destroyed, which keeps the invariant intact when a task is cancelled.
//!
//! # Idle Reclamation
//!
//! Whenever the pool becomes fully idle (no outstanding leases) a background
//! task is armed to close every idle connection after `idle_timeout`. Any
//! `get` before that disarms it. See [`PoolConfig::idle_timeout`].
//!
//! # Example
//!
//! ```
//! use labcomm_pool::{Pool, PoolConfig};
//! use std::time::Duration;
//!
//! # tokio_test::block_on(async {
//! let pool = Pool::new(
//!     PoolConfig { max_size: 2, idle_timeout: Duration::from_secs(30) },
//!     || Box::pin(async { Ok::<_, std::io::Error>(vec![0u8; 16]) }),
//! );
//!
//! let conn = pool.get().await.unwrap();
//! assert_eq!(pool.active(), 1);
//! pool.put(conn);
//! assert_eq!(pool.idle(), 1);
//! # });
//! ```

mod reclaim;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Notify, Semaphore};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

/// Type alias for the async factory used to open new connections.
pub type FactoryFn<C, E> = Arc<dyn Fn() -> BoxFuture<'static, Result<C, E>> + Send + Sync>;

/// Sizing and reclamation settings for a [`Pool`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolConfig {
    /// Maximum number of connections alive at once (idle + leased).
    pub max_size: usize,
    /// How long the pool must sit fully idle before idle connections are closed.
    pub idle_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_size: 1,
            idle_timeout: Duration::from_secs(30),
        }
    }
}

/// Errors returned by [`Pool::get`].
#[derive(Debug, Error)]
pub enum PoolError<E> {
    /// The pool was closed before or while waiting for a connection.
    #[error("connection pool is closed")]
    Closed,

    /// The connection factory failed; no lease was taken.
    #[error("connection factory failed: {0}")]
    Factory(#[source] E),
}

struct State<C> {
    idle: VecDeque<C>,
    leased: usize,
    closed: bool,
    /// Pending reclamation deadline. `None` while any lease is outstanding.
    reclaim_at: Option<Instant>,
}

pub(crate) struct Shared<C> {
    config: PoolConfig,
    state: Mutex<State<C>>,
    permits: Semaphore,
    rearm: Notify,
}

impl<C> Shared<C> {
    /// Give back a lease slot without returning a connection.
    fn forfeit(&self) {
        {
            let mut state = self.state.lock();
            state.leased = state.leased.saturating_sub(1);
            self.arm_if_quiescent(&mut state);
        }
        self.permits.add_permits(1);
    }

    /// Return a connection to the idle set, or hand it back if the pool is closed.
    fn check_in(&self, conn: C) -> Option<C> {
        let rejected = {
            let mut state = self.state.lock();
            state.leased = state.leased.saturating_sub(1);
            let rejected = if state.closed {
                Some(conn)
            } else {
                state.idle.push_back(conn);
                None
            };
            self.arm_if_quiescent(&mut state);
            rejected
        };
        self.permits.add_permits(1);
        rejected
    }

    fn arm_if_quiescent(&self, state: &mut State<C>) {
        if state.closed || state.leased > 0 || state.idle.is_empty() {
            return;
        }
        let deadline = Instant::now() + self.config.idle_timeout;
        state.reclaim_at = Some(deadline);
        trace!(
            idle = state.idle.len(),
            idle_timeout = ?self.config.idle_timeout,
            "Pool fully idle, reclamation armed"
        );
        self.rearm.notify_one();
    }
}

/// Bounded pool of connections to one fixed target.
///
/// Created once per target address with [`Pool::new`] and shared as
/// `Arc<Pool<C, E>>` between every task that talks to that target.
pub struct Pool<C, E> {
    shared: Arc<Shared<C>>,
    factory: FactoryFn<C, E>,
    shutdown: CancellationToken,
}

impl<C: Send + 'static, E> Pool<C, E> {
    /// Create a new pool and start its reclamation task.
    ///
    /// No connection is opened until the first [`get`](Self::get).
    ///
    /// # Panics
    ///
    /// Panics if `config.max_size` is 0, or if called outside a Tokio runtime.
    pub fn new<F>(config: PoolConfig, factory: F) -> Arc<Self>
    where
        F: Fn() -> BoxFuture<'static, Result<C, E>> + Send + Sync + 'static,
    {
        assert!(config.max_size > 0, "pool size must be greater than 0");

        let shared = Arc::new(Shared {
            config,
            state: Mutex::new(State {
                idle: VecDeque::with_capacity(config.max_size),
                leased: 0,
                closed: false,
                reclaim_at: None,
            }),
            permits: Semaphore::new(config.max_size),
            rearm: Notify::new(),
        });
        let shutdown = CancellationToken::new();

        tokio::spawn(reclaim::run(Arc::clone(&shared), shutdown.clone()));

        Arc::new(Self {
            shared,
            factory: Arc::new(factory),
            shutdown,
        })
    }

    /// Lease a connection, waiting if all `max_size` connections are leased.
    ///
    /// Reuses an idle connection when one exists, otherwise opens a new one
    /// through the factory. A factory error is returned as
    /// [`PoolError::Factory`] and does not consume capacity.
    pub async fn get(&self) -> Result<Lease<C>, PoolError<E>> {
        let permit = self
            .shared
            .permits
            .acquire()
            .await
            .map_err(|_| PoolError::Closed)?;
        permit.forget();

        let reused = {
            let mut state = self.shared.state.lock();
            if state.closed {
                drop(state);
                self.shared.permits.add_permits(1);
                return Err(PoolError::Closed);
            }
            state.reclaim_at = None;
            state.leased += 1;
            state.idle.pop_front()
        };

        if let Some(conn) = reused {
            trace!(active = self.active(), "Reusing idle connection");
            return Ok(Lease::new(conn, Arc::clone(&self.shared)));
        }

        // The slot is reserved; give it back if the factory fails or this
        // future is dropped mid-dial.
        let reservation = Reservation {
            shared: self.shared.as_ref(),
            committed: false,
        };
        match (self.factory)().await {
            Ok(conn) => {
                reservation.commit();
                debug!(
                    active = self.active(),
                    max_size = self.shared.config.max_size,
                    "Opened new pooled connection"
                );
                Ok(Lease::new(conn, Arc::clone(&self.shared)))
            }
            Err(e) => Err(PoolError::Factory(e)),
        }
    }

    /// Return a healthy connection to the pool for reuse.
    ///
    /// If the pool has been closed the connection is dropped instead.
    pub fn put(&self, mut lease: Lease<C>) {
        if let Some(conn) = lease.conn.take() {
            lease.disposed = true;
            if self.shared.check_in(conn).is_some() {
                debug!("Pool closed, dropping returned connection");
            }
        }
    }

    /// Close and discard a connection that has gone bad.
    ///
    /// The connection is never returned to the idle set; its slot becomes
    /// available to the next [`get`](Self::get).
    pub fn destroy(&self, mut lease: Lease<C>) {
        if let Some(conn) = lease.conn.take() {
            drop(conn);
            lease.disposed = true;
            self.shared.forfeit();
            debug!(active = self.active(), "Destroyed pooled connection");
        }
    }

    /// [`put`](Self::put) the lease if `healthy`, otherwise [`destroy`](Self::destroy) it.
    pub fn release(&self, lease: Lease<C>, healthy: bool) {
        if healthy {
            self.put(lease);
        } else {
            self.destroy(lease);
        }
    }

    /// Stop reclamation, close every idle connection and reject further leases.
    ///
    /// Callers blocked in [`get`](Self::get) wake with [`PoolError::Closed`].
    /// Connections still on lease are closed when they come back.
    pub fn close(&self) {
        self.shutdown.cancel();
        let drained: Vec<C> = {
            let mut state = self.shared.state.lock();
            state.closed = true;
            state.reclaim_at = None;
            state.idle.drain(..).collect()
        };
        self.shared.permits.close();
        info!(closed = drained.len(), "Connection pool closed");
        drop(drained);
    }

    /// Number of connections owned by the pool: idle plus leased.
    #[must_use]
    pub fn size(&self) -> usize {
        let state = self.shared.state.lock();
        state.idle.len() + state.leased
    }

    /// Number of connections currently on lease.
    #[must_use]
    pub fn active(&self) -> usize {
        self.shared.state.lock().leased
    }

    /// Number of idle connections waiting for reuse.
    #[must_use]
    pub fn idle(&self) -> usize {
        self.shared.state.lock().idle.len()
    }

    /// Configured capacity.
    #[must_use]
    pub fn max_size(&self) -> usize {
        self.shared.config.max_size
    }

    /// Whether [`close`](Self::close) has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().closed
    }
}

impl<C, E> Drop for Pool<C, E> {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl<C, E> fmt::Debug for Pool<C, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("Pool")
            .field("max_size", &self.shared.config.max_size)
            .field("idle", &state.idle.len())
            .field("leased", &state.leased)
            .field("closed", &state.closed)
            .finish()
    }
}

struct Reservation<'a, C> {
    shared: &'a Shared<C>,
    committed: bool,
}

impl<C> Reservation<'_, C> {
    fn commit(mut self) {
        self.committed = true;
    }
}

impl<C> Drop for Reservation<'_, C> {
    fn drop(&mut self) {
        if !self.committed {
            self.shared.forfeit();
        }
    }
}

/// Exclusive lease on one pooled connection.
///
/// Dereferences to the connection. Hand it back with [`Pool::put`] or
/// [`Pool::destroy`]; dropping it without either counts as destroy.
pub struct Lease<C> {
    conn: Option<C>,
    shared: Arc<Shared<C>>,
    disposed: bool,
}

impl<C> Lease<C> {
    fn new(conn: C, shared: Arc<Shared<C>>) -> Self {
        Self {
            conn: Some(conn),
            shared,
            disposed: false,
        }
    }
}

impl<C> Deref for Lease<C> {
    type Target = C;

    #[inline]
    fn deref(&self) -> &C {
        self.conn
            .as_ref()
            .expect("lease used after disposal - internal invariant violated")
    }
}

impl<C> DerefMut for Lease<C> {
    #[inline]
    fn deref_mut(&mut self) -> &mut C {
        self.conn
            .as_mut()
            .expect("lease used after disposal - internal invariant violated")
    }
}

impl<C> Drop for Lease<C> {
    fn drop(&mut self) {
        if self.disposed {
            return;
        }
        if self.conn.take().is_some() {
            debug!("Lease dropped without put/destroy, discarding connection");
        }
        self.shared.forfeit();
    }
}

impl<C> fmt::Debug for Lease<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lease")
            .field("held", &self.conn.is_some())
            .finish()
    }
}
