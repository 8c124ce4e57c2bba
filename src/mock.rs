//! Scripted in-memory instrument links.
//!
//! [`MockConnector`] stands in for a real endpoint. Every link it opens reads
//! its behavior from one shared [`MockScript`], so a script can span
//! reconnects: "reset the first write, then answer `OK` on whichever link
//! comes next". Steps are consumed in order; once the write queue is empty
//! writes are accepted, and once the read queue is empty reads stay silent.
//!
//! In echo mode every accepted write is played back as the reply, which is
//! what the `--mock` CLI target uses.
//!
//! ```
//! use labcomm::mock::{MockConnector, ReadAction, WriteAction};
//! use std::io::ErrorKind;
//!
//! let mock = MockConnector::new();
//! mock.script().push_write(WriteAction::Fail(ErrorKind::ConnectionReset));
//! mock.script().push_read(ReadAction::chunked(&[b"12.", b"5\r"]));
//! ```

use crate::dialer::Connect;
use crate::error::{CommError, Result};
use async_trait::async_trait;
use bytes::{Buf, Bytes};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// What the next write does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteAction {
    /// Accept and record the bytes.
    Accept,
    /// Fail with an I/O error of this kind.
    Fail(io::ErrorKind),
    /// Never complete.
    Stall,
}

/// What the next reply looks like.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadAction {
    /// Deliver these chunks, one per read call.
    Reply(Vec<Bytes>),
    /// Deliver these chunks, then report end of input.
    ReplyThenClose(Vec<Bytes>),
    /// Fail with an I/O error of this kind.
    Fail(io::ErrorKind),
    /// Close gracefully without sending anything.
    Close,
    /// Never answer.
    Silent,
}

impl ReadAction {
    /// A reply delivered in one read.
    #[must_use]
    pub fn reply(bytes: &'static [u8]) -> Self {
        ReadAction::Reply(vec![Bytes::from_static(bytes)])
    }

    /// A reply split across several reads.
    #[must_use]
    pub fn chunked(chunks: &[&'static [u8]]) -> Self {
        ReadAction::Reply(chunks.iter().map(|c| Bytes::from_static(c)).collect())
    }
}

#[derive(Debug, Default)]
struct ScriptState {
    writes: VecDeque<WriteAction>,
    reads: VecDeque<ReadAction>,
    written: Vec<Bytes>,
    echo: bool,
}

/// Queued behavior shared by every link from one [`MockConnector`].
#[derive(Debug, Default)]
pub struct MockScript {
    state: Mutex<ScriptState>,
}

impl MockScript {
    /// Queue a write step.
    pub fn push_write(&self, action: WriteAction) {
        self.state.lock().writes.push_back(action);
    }

    /// Queue a read step.
    pub fn push_read(&self, action: ReadAction) {
        self.state.lock().reads.push_back(action);
    }

    /// Every accepted write so far, across all links.
    #[must_use]
    pub fn written(&self) -> Vec<Bytes> {
        self.state.lock().written.clone()
    }

    /// Play accepted writes back as replies.
    pub fn set_echo(&self, echo: bool) {
        self.state.lock().echo = echo;
    }

    fn next_write(&self) -> WriteAction {
        self.state
            .lock()
            .writes
            .pop_front()
            .unwrap_or(WriteAction::Accept)
    }

    fn next_read(&self) -> ReadAction {
        self.state
            .lock()
            .reads
            .pop_front()
            .unwrap_or(ReadAction::Silent)
    }

    /// Record an accepted write; returns true in echo mode.
    fn record(&self, bytes: Bytes) -> bool {
        let mut state = self.state.lock();
        state.written.push(bytes);
        state.echo
    }
}

/// One scripted connection.
#[derive(Debug)]
pub struct MockLink {
    script: Arc<MockScript>,
    pending: VecDeque<Bytes>,
    eof_after_pending: bool,
    silent: bool,
    stalled: bool,
}

impl MockLink {
    /// A link driven by `script`.
    pub fn new(script: Arc<MockScript>) -> Self {
        Self {
            script,
            pending: VecDeque::new(),
            eof_after_pending: false,
            silent: false,
            stalled: false,
        }
    }
}

impl AsyncRead for MockLink {
    fn poll_read(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if let Some(chunk) = this.pending.front_mut() {
                let n = chunk.len().min(buf.remaining());
                buf.put_slice(&chunk[..n]);
                chunk.advance(n);
                if chunk.is_empty() {
                    this.pending.pop_front();
                }
                return Poll::Ready(Ok(()));
            }
            if this.eof_after_pending {
                return Poll::Ready(Ok(()));
            }
            if this.silent {
                return Poll::Pending;
            }

            match this.script.next_read() {
                ReadAction::Reply(chunks) => this.pending.extend(chunks),
                ReadAction::ReplyThenClose(chunks) => {
                    this.pending.extend(chunks);
                    this.eof_after_pending = true;
                }
                ReadAction::Fail(kind) => return Poll::Ready(Err(kind.into())),
                ReadAction::Close => this.eof_after_pending = true,
                ReadAction::Silent => this.silent = true,
            }
        }
    }
}

impl AsyncWrite for MockLink {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.stalled {
            return Poll::Pending;
        }
        match this.script.next_write() {
            WriteAction::Accept => {
                let bytes = Bytes::copy_from_slice(buf);
                if this.script.record(bytes.clone()) {
                    this.pending.push_back(bytes);
                }
                Poll::Ready(Ok(buf.len()))
            }
            WriteAction::Fail(kind) => Poll::Ready(Err(kind.into())),
            WriteAction::Stall => {
                this.stalled = true;
                Poll::Pending
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

/// Opens [`MockLink`]s and counts how often it was asked to.
#[derive(Debug, Clone, Default)]
pub struct MockConnector {
    script: Arc<MockScript>,
    connect_failures: Arc<Mutex<VecDeque<io::ErrorKind>>>,
    attempts: Arc<AtomicUsize>,
    opened: Arc<AtomicUsize>,
}

impl MockConnector {
    /// A connector with an empty script.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A connector whose links echo every write.
    #[must_use]
    pub fn echo() -> Self {
        let mock = Self::default();
        mock.script.set_echo(true);
        mock
    }

    /// The shared script.
    #[must_use]
    pub fn script(&self) -> &Arc<MockScript> {
        &self.script
    }

    /// Make the next connection attempt fail with `kind`.
    pub fn fail_connect(&self, kind: io::ErrorKind) {
        self.connect_failures.lock().push_back(kind);
    }

    /// Connection attempts made, failed or not.
    #[must_use]
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Links successfully opened.
    #[must_use]
    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    /// A pool factory that opens links without backoff.
    pub fn factory(&self) -> impl Fn() -> BoxFuture<'static, Result<MockLink>> + Send + Sync + 'static {
        let mock = self.clone();
        move || {
            let mock = mock.clone();
            Box::pin(async move { mock.connect().await.map_err(CommError::from) })
        }
    }
}

#[async_trait]
impl Connect for MockConnector {
    type Conn = MockLink;

    async fn connect(&self) -> io::Result<MockLink> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if let Some(kind) = self.connect_failures.lock().pop_front() {
            return Err(kind.into());
        }
        self.opened.fetch_add(1, Ordering::SeqCst);
        Ok(MockLink::new(Arc::clone(&self.script)))
    }

    fn describe(&self) -> String {
        "mock".to_string()
    }
}
