//! Connection establishment with exponential backoff.
//!
//! Instruments behind terminal servers and USB-serial adapters are often slow
//! to accept a connection, or briefly unavailable while rebooting. A
//! [`Dialer`] keeps retrying a [`Connect`] implementation with growing delays
//! until it succeeds or an overall time budget is spent. An explicit refusal
//! is the exception: nothing is listening, and waiting will not change that.
//!
//! The dialer is also the pool's connection factory, via
//! [`Dialer::into_factory`].

use crate::error::{CommError, Result};
use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

/// Backoff schedule for connection attempts.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffPolicy {
    /// Delay after the first failed attempt.
    #[serde(with = "humantime_serde")]
    pub initial_interval: Duration,
    /// Growth factor applied to the delay after each failure.
    pub multiplier: f64,
    /// Upper bound on a single delay.
    #[serde(with = "humantime_serde")]
    pub max_interval: Duration,
    /// Give up once this much time has been spent dialing.
    #[serde(with = "humantime_serde")]
    pub max_elapsed: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_millis(100),
            multiplier: 2.0,
            max_interval: Duration::from_secs(20),
            max_elapsed: Duration::from_secs(30),
        }
    }
}

impl BackoffPolicy {
    /// Shorter profile for interactive opens.
    #[must_use]
    pub fn connect_defaults() -> Self {
        Self {
            initial_interval: Duration::from_millis(25),
            multiplier: 2.0,
            max_interval: Duration::from_secs(1),
            max_elapsed: Duration::from_secs(3),
        }
    }

    /// Start a fresh schedule, measuring elapsed time from now.
    #[must_use]
    pub fn start(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            policy: *self,
            current: self.initial_interval,
            started: Instant::now(),
        }
    }
}

/// Iterator over backoff delays.
///
/// Yields `None` once sleeping for the next delay would overrun
/// [`BackoffPolicy::max_elapsed`].
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    policy: BackoffPolicy,
    current: Duration,
    started: Instant,
}

impl ExponentialBackoff {
    /// Time since the schedule started.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

impl Iterator for ExponentialBackoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        let finish = self.started.elapsed().checked_add(self.current)?;
        if finish > self.policy.max_elapsed {
            return None;
        }
        let delay = self.current;
        // Non-finite or overflowing growth saturates at the cap.
        self.current =
            Duration::try_from_secs_f64(self.current.as_secs_f64() * self.policy.multiplier)
                .map_or(self.policy.max_interval, |next| next.min(self.policy.max_interval));
        Some(delay)
    }
}

/// Opens one raw connection to a fixed endpoint.
#[async_trait]
pub trait Connect: Send + Sync {
    /// The connection type produced.
    type Conn: Send + 'static;

    /// Make a single connection attempt.
    async fn connect(&self) -> io::Result<Self::Conn>;

    /// Human-readable endpoint, for errors and logs.
    fn describe(&self) -> String;
}

/// TCP endpoint (terminal servers, Ethernet-enabled controllers).
#[derive(Debug, Clone)]
pub struct TcpConnect {
    addr: String,
    connect_timeout: Duration,
}

impl TcpConnect {
    /// Connect to `addr` (`host:port`), bounding each attempt by `connect_timeout`.
    pub fn new(addr: impl Into<String>, connect_timeout: Duration) -> Self {
        Self {
            addr: addr.into(),
            connect_timeout,
        }
    }
}

#[async_trait]
impl Connect for TcpConnect {
    type Conn = TcpStream;

    async fn connect(&self) -> io::Result<TcpStream> {
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(&self.addr))
            .await
            .map_err(|_| {
                io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("connect timed out after {:?}", self.connect_timeout),
                )
            })??;
        // Commands are tiny and latency-sensitive.
        stream.set_nodelay(true)?;
        Ok(stream)
    }

    fn describe(&self) -> String {
        self.addr.clone()
    }
}

/// Serial port endpoint, 8N1 without flow control.
#[cfg(feature = "serial")]
#[derive(Debug, Clone)]
pub struct SerialConnect {
    path: String,
    baud_rate: u32,
}

#[cfg(feature = "serial")]
impl SerialConnect {
    /// Open `path` (e.g. `/dev/ttyUSB0`) at `baud_rate`.
    pub fn new(path: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            path: path.into(),
            baud_rate,
        }
    }
}

#[cfg(feature = "serial")]
#[async_trait]
impl Connect for SerialConnect {
    type Conn = tokio_serial::SerialStream;

    async fn connect(&self) -> io::Result<tokio_serial::SerialStream> {
        use tokio_serial::SerialPortBuilderExt;

        let path = self.path.clone();
        let baud_rate = self.baud_rate;
        // Opening a port can block on the driver.
        tokio::task::spawn_blocking(move || {
            tokio_serial::new(&path, baud_rate)
                .data_bits(tokio_serial::DataBits::Eight)
                .parity(tokio_serial::Parity::None)
                .stop_bits(tokio_serial::StopBits::One)
                .flow_control(tokio_serial::FlowControl::None)
                .open_native_async()
                .map_err(io::Error::from)
        })
        .await
        .map_err(io::Error::other)?
    }

    fn describe(&self) -> String {
        format!("{}@{}", self.path, self.baud_rate)
    }
}

/// Any duplex byte stream, boxed.
pub trait Duplex: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Duplex for T {}

/// Type-erased connection, so one transport type covers every endpoint kind.
pub type DynConn = Box<dyn Duplex>;

/// Retries a [`Connect`] with exponential backoff.
#[derive(Debug, Clone)]
pub struct Dialer<K> {
    connector: K,
    policy: BackoffPolicy,
}

impl<K: Connect> Dialer<K> {
    /// Dial `connector` according to `policy`.
    pub fn new(connector: K, policy: BackoffPolicy) -> Self {
        Self { connector, policy }
    }

    /// The endpoint being dialed.
    pub fn connector(&self) -> &K {
        &self.connector
    }

    /// The backoff schedule.
    #[must_use]
    pub fn policy(&self) -> BackoffPolicy {
        self.policy
    }

    /// Connect, retrying until success or the elapsed budget runs out.
    ///
    /// # Errors
    ///
    /// - [`CommError::Refused`] on the first refusal, without retrying
    /// - [`CommError::ConnectTimeout`] once the backoff budget is spent
    #[instrument(level = "debug", skip(self), fields(endpoint = %self.connector.describe()))]
    pub async fn dial(&self) -> Result<K::Conn> {
        let mut backoff = self.policy.start();
        let mut attempts = 0;

        loop {
            attempts += 1;
            let err = match self.connector.connect().await {
                Ok(conn) => {
                    debug!(attempts, "Connected");
                    return Ok(conn);
                }
                Err(err) => err,
            };

            if err.kind() == io::ErrorKind::ConnectionRefused {
                debug!(error = %err, "Connection refused");
                return Err(CommError::Refused {
                    target: self.connector.describe(),
                    source: err,
                });
            }

            match backoff.next() {
                Some(delay) => {
                    debug!(attempt = attempts, ?delay, error = %err, "Connect failed, backing off");
                    tokio::time::sleep(delay).await;
                }
                None => {
                    warn!(attempts, error = %err, "Giving up on connection");
                    return Err(CommError::ConnectTimeout {
                        target: self.connector.describe(),
                        attempts,
                        elapsed: backoff.elapsed(),
                        source: err,
                    });
                }
            }
        }
    }
}

impl<K: Connect + 'static> Dialer<K> {
    /// Turn the dialer into a pool connection factory.
    pub fn into_factory(
        self,
    ) -> impl Fn() -> BoxFuture<'static, Result<K::Conn>> + Send + Sync + 'static {
        let dialer = Arc::new(self);
        move || {
            let dialer = Arc::clone(&dialer);
            Box::pin(async move { dialer.dial().await })
        }
    }

    /// Like [`into_factory`](Self::into_factory), boxing each connection.
    pub fn into_dyn_factory(
        self,
    ) -> impl Fn() -> BoxFuture<'static, Result<DynConn>> + Send + Sync + 'static
    where
        K::Conn: AsyncRead + AsyncWrite + Unpin,
    {
        let dialer = Arc::new(self);
        move || {
            let dialer = Arc::clone(&dialer);
            Box::pin(async move {
                let conn = dialer.dial().await?;
                Ok(Box::new(conn) as DynConn)
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockConnector;
    use tokio::net::TcpListener;

    fn quick() -> BackoffPolicy {
        BackoffPolicy {
            initial_interval: Duration::from_millis(10),
            multiplier: 2.0,
            max_interval: Duration::from_millis(40),
            max_elapsed: Duration::from_millis(100),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_default_schedule() {
        let delays: Vec<_> = BackoffPolicy::default().start().take(9).collect();
        let millis: Vec<u128> = delays.iter().map(Duration::as_millis).collect();
        assert_eq!(
            millis,
            vec![100, 200, 400, 800, 1600, 3200, 6400, 12800, 20000]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_attempt_success() {
        let mock = MockConnector::new();
        let dialer = Dialer::new(mock.clone(), quick());

        dialer.dial().await.unwrap();
        assert_eq!(mock.attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_until_connected() {
        let mock = MockConnector::new();
        mock.fail_connect(io::ErrorKind::TimedOut);
        mock.fail_connect(io::ErrorKind::NotConnected);
        let dialer = Dialer::new(mock.clone(), quick());

        let start = Instant::now();
        dialer.dial().await.unwrap();

        assert_eq!(mock.attempts(), 3);
        assert_eq!(start.elapsed(), Duration::from_millis(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_finite_multiplier_saturates() {
        for multiplier in [f64::INFINITY, f64::NAN, f64::MAX] {
            let policy = BackoffPolicy {
                multiplier,
                ..quick()
            };
            let millis: Vec<u128> = policy.start().take(3).map(|d| d.as_millis()).collect();
            assert_eq!(millis, vec![10, 40, 40], "multiplier = {multiplier}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_infinite_multiplier_dial_recovers() {
        let mock = MockConnector::new();
        mock.fail_connect(io::ErrorKind::TimedOut);
        mock.fail_connect(io::ErrorKind::TimedOut);
        let policy = BackoffPolicy {
            multiplier: f64::INFINITY,
            ..quick()
        };
        let dialer = Dialer::new(mock.clone(), policy);

        let start = Instant::now();
        dialer.dial().await.unwrap();

        assert_eq!(mock.attempts(), 3);
        assert_eq!(start.elapsed(), Duration::from_millis(50));
    }

    #[tokio::test(start_paused = true)]
    async fn test_refused_short_circuits() {
        let mock = MockConnector::new();
        mock.fail_connect(io::ErrorKind::ConnectionRefused);
        let dialer = Dialer::new(mock.clone(), quick());

        let err = dialer.dial().await.unwrap_err();

        assert!(matches!(err, CommError::Refused { .. }));
        assert_eq!(mock.attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_budget_exhausted() {
        let mock = MockConnector::new();
        for _ in 0..10 {
            mock.fail_connect(io::ErrorKind::TimedOut);
        }
        let dialer = Dialer::new(mock.clone(), quick());

        match dialer.dial().await {
            Err(CommError::ConnectTimeout {
                target,
                attempts,
                elapsed,
                ..
            }) => {
                assert_eq!(target, "mock");
                // Delays 10 + 20 + 40; a further 40 would overrun 100 ms.
                assert_eq!(attempts, 4);
                assert_eq!(elapsed, Duration::from_millis(70));
            }
            other => panic!("expected ConnectTimeout, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_tcp_loopback() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accept = tokio::spawn(async move { listener.accept().await.unwrap() });

        let dialer = Dialer::new(
            TcpConnect::new(addr.to_string(), Duration::from_secs(1)),
            BackoffPolicy::connect_defaults(),
        );
        let stream = dialer.dial().await.unwrap();

        assert!(stream.nodelay().unwrap());
        accept.await.unwrap();
    }

    #[tokio::test]
    async fn test_tcp_refused() {
        // Bind then drop to find a port with nothing listening.
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };
        let dialer = Dialer::new(
            TcpConnect::new(addr.to_string(), Duration::from_secs(1)),
            BackoffPolicy::connect_defaults(),
        );

        assert!(matches!(
            dialer.dial().await,
            Err(CommError::Refused { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_factory_dials_each_call() {
        let mock = MockConnector::new();
        let factory = Dialer::new(mock.clone(), quick()).into_factory();

        factory().await.unwrap();
        factory().await.unwrap();
        assert_eq!(mock.opened(), 2);
    }
}
