//! Retry with connection replacement.
//!
//! Instrument links fail in two ways: the peer resets or closes the
//! connection (recoverable by dialing again), or something else goes wrong
//! (timeouts, bad framing, refusals) that a retry would only hide.
//! [`retry_phase`] runs one phase of a transaction against a leased
//! connection and, on a transient failure, throws the connection away,
//! leases a replacement and tries again, up to a fixed budget.
//!
//! The combinator is parameterized by:
//! - an [`Attempt`]: the work done on the connection,
//! - a [`TransientPredicate`]: which errors count as "connection reset",
//! - a [`LeaseSource`]: where replacements come from and where bad
//!   connections go (a [`Pool`] in practice).

use crate::error::{CommError, Phase, Result};
use async_trait::async_trait;
use labcomm_pool::{Lease, Pool};
use std::ops::DerefMut;
use tracing::{debug, warn};

/// Default number of attempts per phase.
pub const DEFAULT_MAX_TRIES: u32 = 3;

/// Decides whether an error is a transient connection failure.
pub type TransientPredicate = fn(&CommError) -> bool;

/// The default [`TransientPredicate`]: the peer reset, aborted or closed the
/// connection underneath us.
#[must_use]
pub fn is_connection_reset(err: &CommError) -> bool {
    err.is_transient()
}

/// One attempt at a transaction phase on a leased connection.
#[async_trait]
pub trait Attempt<L: Send>: Send {
    /// Value produced by a successful attempt.
    type Output: Send;

    /// Run the attempt against `link`.
    async fn attempt(&mut self, link: &mut L) -> Result<Self::Output>;
}

/// Source of leased connections and sink for broken ones.
#[async_trait]
pub trait LeaseSource<L>: Send + Sync {
    /// A leased connection.
    type Lease: DerefMut<Target = L> + Send;

    /// Lease a connection (a replacement, after the first).
    async fn acquire(&self) -> Result<Self::Lease>;

    /// Discard a connection that failed.
    fn discard(&self, lease: Self::Lease);
}

#[async_trait]
impl<L: Send + 'static> LeaseSource<L> for Pool<L, CommError> {
    type Lease = Lease<L>;

    async fn acquire(&self) -> Result<Lease<L>> {
        self.get().await.map_err(CommError::from)
    }

    fn discard(&self, lease: Lease<L>) {
        self.destroy(lease);
    }
}

/// Run `attempt` on `lease`, replacing the connection on transient errors.
///
/// Returns the (possibly replaced) lease together with the attempt output.
/// On any error the failing connection has already been discarded, so the
/// caller holds nothing that needs returning:
///
/// - transient error, budget left: discard, acquire a replacement, retry
/// - transient error, budget spent: [`CommError::RetriesExhausted`]
/// - any other error: [`CommError::Fatal`]
/// - replacement could not be acquired: that error, unwrapped
pub async fn retry_phase<L, S, A>(
    source: &S,
    mut lease: S::Lease,
    max_tries: u32,
    is_transient: TransientPredicate,
    phase: Phase,
    attempt: &mut A,
) -> Result<(S::Lease, A::Output)>
where
    L: Send,
    S: LeaseSource<L> + ?Sized,
    A: Attempt<L>,
{
    let max_tries = max_tries.max(1);
    let mut tries = 0;

    loop {
        tries += 1;
        let err = match attempt.attempt(&mut *lease).await {
            Ok(output) => {
                if tries > 1 {
                    debug!(%phase, attempts = tries, "Phase recovered after reconnect");
                }
                return Ok((lease, output));
            }
            Err(err) => err,
        };

        source.discard(lease);

        if !is_transient(&err) {
            debug!(%phase, attempt = tries, error = %err, "Fatal error, giving up");
            return Err(CommError::Fatal {
                phase,
                attempt: tries,
                source: Box::new(err),
            });
        }

        if tries >= max_tries {
            warn!(%phase, attempts = tries, error = %err, "Retry budget exhausted");
            return Err(CommError::RetriesExhausted {
                phase,
                attempts: tries,
                source: Box::new(err),
            });
        }

        warn!(
            %phase,
            attempt = tries,
            max_tries,
            error = %err,
            "Connection reset, replacing connection and retrying"
        );
        lease = source.acquire().await?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::io;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Plays back a fixed list of outcomes, one per attempt.
    struct Scripted {
        outcomes: VecDeque<Result<u32>>,
        seen: Vec<usize>,
    }

    #[async_trait]
    impl Attempt<usize> for Scripted {
        type Output = u32;

        async fn attempt(&mut self, link: &mut usize) -> Result<u32> {
            self.seen.push(*link);
            self.outcomes
                .pop_front()
                .unwrap_or_else(|| Err(CommError::PeerClosed))
        }
    }

    /// Hands out sequential ids and records discards.
    #[derive(Default)]
    struct Counter {
        next: AtomicUsize,
        discarded: Mutex<Vec<usize>>,
    }

    #[derive(Debug)]
    struct Held(usize);

    impl std::ops::Deref for Held {
        type Target = usize;
        fn deref(&self) -> &usize {
            &self.0
        }
    }

    impl DerefMut for Held {
        fn deref_mut(&mut self) -> &mut usize {
            &mut self.0
        }
    }

    #[async_trait]
    impl LeaseSource<usize> for Counter {
        type Lease = Held;

        async fn acquire(&self) -> Result<Held> {
            Ok(Held(self.next.fetch_add(1, Ordering::SeqCst)))
        }

        fn discard(&self, lease: Held) {
            self.discarded.lock().push(lease.0);
        }
    }

    fn reset() -> Result<u32> {
        Err(io::Error::from(io::ErrorKind::ConnectionReset).into())
    }

    #[tokio::test]
    async fn test_recovers_after_transient_errors() {
        let source = Counter::default();
        let first = source.acquire().await.unwrap();
        let mut attempt = Scripted {
            outcomes: VecDeque::from([reset(), reset(), Ok(7)]),
            seen: Vec::new(),
        };

        let (lease, out) = retry_phase(&source, first, 3, is_connection_reset, Phase::Write, &mut attempt)
            .await
            .unwrap();

        assert_eq!(out, 7);
        assert_eq!(*lease, 2);
        assert_eq!(attempt.seen, vec![0, 1, 2]);
        assert_eq!(*source.discarded.lock(), vec![0, 1]);
    }

    #[tokio::test]
    async fn test_exhaustion_reports_last_error() {
        let source = Counter::default();
        let first = source.acquire().await.unwrap();
        let mut attempt = Scripted {
            outcomes: VecDeque::from([reset(), reset(), reset()]),
            seen: Vec::new(),
        };

        let err = retry_phase(&source, first, 3, is_connection_reset, Phase::Read, &mut attempt)
            .await
            .unwrap_err();

        match err {
            CommError::RetriesExhausted { phase, attempts, source: last } => {
                assert_eq!(phase, Phase::Read);
                assert_eq!(attempts, 3);
                assert!(last.is_transient());
            }
            other => panic!("expected exhaustion, got {other:?}"),
        }
        // Every connection used was discarded, none left outstanding.
        assert_eq!(*source.discarded.lock(), vec![0, 1, 2]);
        assert_eq!(source.next.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_fatal_error_not_retried() {
        let source = Counter::default();
        let first = source.acquire().await.unwrap();
        let mut attempt = Scripted {
            outcomes: VecDeque::from([Err(CommError::Timeout {
                op: "write",
                deadline: std::time::Duration::from_secs(1),
            })]),
            seen: Vec::new(),
        };

        let err = retry_phase(&source, first, 3, is_connection_reset, Phase::Write, &mut attempt)
            .await
            .unwrap_err();

        assert!(matches!(err, CommError::Fatal { attempt: 1, .. }));
        assert_eq!(attempt.seen.len(), 1);
        assert_eq!(*source.discarded.lock(), vec![0]);
    }

    #[tokio::test]
    async fn test_custom_predicate() {
        // A device whose firmware drops the line with a timeout instead of a reset.
        fn timeouts_are_transient(err: &CommError) -> bool {
            matches!(err, CommError::Timeout { .. }) || err.is_transient()
        }

        let source = Counter::default();
        let first = source.acquire().await.unwrap();
        let mut attempt = Scripted {
            outcomes: VecDeque::from([
                Err(CommError::Timeout {
                    op: "read",
                    deadline: std::time::Duration::from_millis(10),
                }),
                Ok(1),
            ]),
            seen: Vec::new(),
        };

        let (_, out) = retry_phase(&source, first, 3, timeouts_are_transient, Phase::Read, &mut attempt)
            .await
            .unwrap();
        assert_eq!(out, 1);
    }

    #[tokio::test]
    async fn test_pool_as_lease_source() {
        let opened = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&opened);
        let pool: Arc<Pool<usize, CommError>> = Pool::new(
            labcomm_pool::PoolConfig::default(),
            move || {
                let id = counter.fetch_add(1, Ordering::SeqCst);
                Box::pin(async move { Ok(id) })
            },
        );

        let first = pool.acquire().await.unwrap();
        let mut attempt = Scripted {
            outcomes: VecDeque::from([reset(), Ok(3)]),
            seen: Vec::new(),
        };
        let (lease, _) = retry_phase(pool.as_ref(), first, 3, is_connection_reset, Phase::Write, &mut attempt)
            .await
            .unwrap();

        assert_eq!(*lease, 1);
        assert_eq!(opened.load(Ordering::SeqCst), 2);
        assert_eq!(pool.active(), 1);
        pool.put(lease);
        assert_eq!(pool.active(), 0);
    }
}
