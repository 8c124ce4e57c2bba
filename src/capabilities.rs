//! Capability traits for talking to instruments.
//!
//! Device drivers compose the capabilities they need instead of inheriting a
//! base transport and overriding pieces of it:
//!
//! - [`Transmit`]: send one framed message
//! - [`Receive`]: receive one framed message
//! - [`Exchange`]: send then receive on the same link (blanket for `Transmit + Receive`)
//! - [`Query`]: shared, resilient send-then-receive, as offered by
//!   [`ResilientTransport`](crate::transaction::ResilientTransport)
//!
//! A driver that only ever writes can ask for `Transmit`; a driver issuing
//! queries from many tasks holds an `Arc<dyn Query>`.
//!
//! # Example
//!
//! ```rust,ignore
//! use labcomm::capabilities::Query;
//!
//! struct TemperatureSensor<Q: Query> {
//!     link: Q,
//! }
//!
//! impl<Q: Query> TemperatureSensor<Q> {
//!     async fn read_celsius(&self) -> anyhow::Result<f64> {
//!         let reply = self.link.query(b"RD?").await?;
//!         Ok(std::str::from_utf8(&reply.into_bytes())?.trim().parse()?)
//!     }
//! }
//! ```

use crate::error::Result;
use crate::transaction::Reply;
use async_trait::async_trait;
use bytes::Bytes;

/// Can send one framed message.
#[async_trait]
pub trait Transmit: Send {
    /// Send `payload` as one frame.
    async fn transmit(&mut self, payload: &[u8]) -> Result<()>;
}

/// Can receive one framed message.
#[async_trait]
pub trait Receive: Send {
    /// Receive one frame with its terminator stripped.
    async fn receive(&mut self) -> Result<Bytes>;
}

/// Can send a message and receive the reply on the same link.
#[async_trait]
pub trait Exchange: Transmit + Receive {
    /// Send `payload`, then receive one frame.
    async fn exchange(&mut self, payload: &[u8]) -> Result<Bytes>;
}

#[async_trait]
impl<T: Transmit + Receive> Exchange for T {
    async fn exchange(&mut self, payload: &[u8]) -> Result<Bytes> {
        self.transmit(payload).await?;
        self.receive().await
    }
}

/// Shared send-then-receive, safe to call from many tasks at once.
#[async_trait]
pub trait Query: Send + Sync {
    /// Send `command` and return the instrument's reply.
    async fn query(&self, command: &[u8]) -> Result<Reply>;
}
