//! # labcomm
//!
//! Resilient request/response transport for laboratory instrument drivers.
//!
//! Motion controllers, laser drivers and sensor heads reached through
//! terminal servers or serial adapters all have the same habits: they speak
//! terminator-delimited ASCII, they accept only a few simultaneous
//! connections, and they drop the line at inconvenient moments. This crate
//! gives device drivers one call that survives all of that:
//!
//! ```no_run
//! use labcomm::prelude::*;
//! use std::time::Duration;
//!
//! # async fn run() -> labcomm::Result<()> {
//! let dialer = Dialer::new(
//!     TcpConnect::new("192.168.1.40:8000", Duration::from_secs(2)),
//!     BackoffPolicy::default(),
//! );
//! let transport = ResilientTransport::framed(
//!     PoolConfig::default(),
//!     dialer.into_factory(),
//!     TransactionConfig::default(),
//! );
//!
//! let reply = transport.execute(b"PFBK X").await?;
//! println!("{}", String::from_utf8_lossy(&reply.into_bytes()));
//! # Ok(())
//! # }
//! ```
//!
//! ## Crate Structure
//!
//! - **`error`**: [`CommError`] and its [`ErrorKind`](error::ErrorKind) taxonomy.
//! - **`deadline`**: per-call read/write deadlines for any duplex stream.
//! - **`framed`**: single-byte terminator framing with reply reassembly.
//! - **`dialer`**: connection establishment with exponential backoff.
//! - **`retry`**: the generic "replace the connection and retry" combinator.
//! - **`transaction`**: [`ResilientTransport`], the write-then-read orchestrator.
//! - **`capabilities`**: `Transmit`, `Receive`, `Exchange` and `Query` traits.
//! - **`config`** / **`logging`**: Figment configuration and tracing setup.
//! - **`mock`**: scripted in-memory links for tests and dry runs.
//!
//! The bounded pool itself lives in the `labcomm-pool` crate and is
//! re-exported here as [`pool`].

pub mod capabilities;
pub mod config;
pub mod deadline;
pub mod dialer;
pub mod error;
pub mod framed;
pub mod logging;
pub mod mock;
pub mod retry;
pub mod transaction;

pub use error::{CommError, Result};
pub use labcomm_pool as pool;
pub use transaction::{Reply, ResilientTransport, TransactionConfig};

/// Everything a device driver usually needs.
pub mod prelude {
    pub use crate::capabilities::{Exchange, Query, Receive, Transmit};
    pub use crate::deadline::DeadlineStream;
    pub use crate::dialer::{BackoffPolicy, Connect, Dialer, TcpConnect};
    pub use crate::error::{CommError, ErrorKind, Phase, Result};
    pub use crate::framed::{FramedStream, Terminators};
    pub use crate::transaction::{Link, Reply, ResilientTransport, TransactionConfig};
    pub use labcomm_pool::{Pool, PoolConfig};
}
