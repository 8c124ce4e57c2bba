//! End-to-end tests for the resilient transport.
//!
//! The scripted mock link drives the retry paths; a real TCP loopback
//! listener covers the dialer, deadline and framing layers together.

use bytes::Bytes;
use labcomm::error::{CommError, ErrorKind, Phase};
use labcomm::mock::{MockConnector, ReadAction, WriteAction};
use labcomm::prelude::*;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;

fn pool(max_size: usize) -> PoolConfig {
    PoolConfig {
        max_size,
        idle_timeout: Duration::from_secs(60),
    }
}

fn mock_transport(
    mock: &MockConnector,
    config: TransactionConfig,
) -> ResilientTransport<Link<labcomm::mock::MockLink>> {
    ResilientTransport::framed(pool(1), mock.factory(), config)
}

#[tokio::test]
async fn test_retry_exactness() {
    for k in 0..3u32 {
        let mock = MockConnector::new();
        for _ in 0..k {
            mock.script()
                .push_write(WriteAction::Fail(io::ErrorKind::ConnectionReset));
        }
        mock.script().push_read(ReadAction::reply(b"OK\r"));
        let transport = mock_transport(&mock, TransactionConfig::default());

        let reply = transport.execute(b"MOVE X 1").await.unwrap();

        assert_eq!(reply.into_bytes(), Bytes::from_static(b"OK"));
        assert_eq!(mock.attempts(), k as usize + 1, "k = {k}");
        assert_eq!(mock.opened(), k as usize + 1, "k = {k}");
    }
}

#[tokio::test]
async fn test_retry_exhaustion_surfaces_last_error() {
    let mock = MockConnector::new();
    let script = mock.script();
    script.push_write(WriteAction::Fail(io::ErrorKind::ConnectionReset));
    script.push_write(WriteAction::Fail(io::ErrorKind::ConnectionAborted));
    script.push_write(WriteAction::Fail(io::ErrorKind::BrokenPipe));
    let transport = mock_transport(&mock, TransactionConfig::default());
    let before = transport.pool().active();

    let err = transport.execute(b"X").await.unwrap_err();

    match &err {
        CommError::RetriesExhausted {
            phase,
            attempts,
            source,
        } => {
            assert_eq!(*phase, Phase::Write);
            assert_eq!(*attempts, 3);
            match source.as_ref() {
                CommError::Io(e) => assert_eq!(e.kind(), io::ErrorKind::BrokenPipe),
                other => panic!("unexpected source {other:?}"),
            }
        }
        other => panic!("expected RetriesExhausted, got {other:?}"),
    }
    assert_eq!(err.kind(), ErrorKind::Transient);
    assert_eq!(transport.pool().active(), before);

    // The pool still serves after exhaustion.
    mock.script().push_read(ReadAction::reply(b"back\r"));
    let reply = transport.execute(b"Y").await.unwrap();
    assert_eq!(reply.into_bytes(), Bytes::from_static(b"back"));
}

#[tokio::test]
async fn test_read_phase_has_own_budget() {
    let mock = MockConnector::new();
    let script = mock.script();
    // Two write resets and two read resets: each phase stays within 3 tries.
    script.push_write(WriteAction::Fail(io::ErrorKind::ConnectionReset));
    script.push_write(WriteAction::Fail(io::ErrorKind::ConnectionReset));
    script.push_read(ReadAction::Fail(io::ErrorKind::ConnectionReset));
    script.push_read(ReadAction::Fail(io::ErrorKind::ConnectionReset));
    script.push_read(ReadAction::reply(b"42\r"));
    let transport = mock_transport(&mock, TransactionConfig::default());

    let reply = transport.execute(b"RD?").await.unwrap();

    assert_eq!(reply.into_bytes(), Bytes::from_static(b"42"));
    assert_eq!(mock.opened(), 5);
    assert_eq!(mock.script().written().len(), 1);
}

#[tokio::test]
async fn test_multi_read_reassembly_through_transport() {
    let mock = MockConnector::new();
    mock.script()
        .push_read(ReadAction::chunked(&[b"X: ", b"12.", b"3456", b", Y: 0.0", b"\r"]));
    let transport = mock_transport(&mock, TransactionConfig::default());

    let reply = transport.execute(b"PFBKPROG").await.unwrap();
    assert_eq!(reply.into_bytes(), Bytes::from_static(b"X: 12.3456, Y: 0.0"));
}

#[tokio::test(start_paused = true)]
async fn test_deadline_enforced_on_silent_peer() {
    let mock = MockConnector::new();
    mock.script().push_read(ReadAction::Silent);
    let transport = mock_transport(
        &mock,
        TransactionConfig {
            deadline: Duration::from_millis(50),
            ..Default::default()
        },
    );

    let start = tokio::time::Instant::now();
    let err = transport.execute(b"RD?").await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Timeout);
    assert_eq!(start.elapsed(), Duration::from_millis(50));
    assert_eq!(transport.pool().active(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_stalled_write_times_out() {
    let mock = MockConnector::new();
    mock.script().push_write(WriteAction::Stall);
    let transport = mock_transport(
        &mock,
        TransactionConfig {
            deadline: Duration::from_millis(50),
            ..Default::default()
        },
    );

    let err = transport.execute(b"X").await.unwrap_err();

    assert!(matches!(
        err,
        CommError::Fatal {
            phase: Phase::Write,
            ..
        }
    ));
    assert!(matches!(err.root(), CommError::Timeout { op: "write", .. }));
}

#[tokio::test]
async fn test_no_body_reply() {
    let mock = MockConnector::new();
    mock.script().push_read(ReadAction::Close);
    mock.script().push_read(ReadAction::reply(b"1\r"));
    let transport = mock_transport(
        &mock,
        TransactionConfig {
            accept_empty_reply: true,
            ..Default::default()
        },
    );

    assert_eq!(transport.execute(b"ENABLE X").await.unwrap(), Reply::NoBody);
    // The next transaction dials a fresh connection.
    assert_eq!(
        transport.execute(b"ENABLED?").await.unwrap().into_bytes(),
        Bytes::from_static(b"1")
    );
    assert_eq!(mock.opened(), 2);
}

#[tokio::test]
async fn test_concurrent_queries_share_bounded_pool() {
    let mock = MockConnector::echo();
    let transport = Arc::new(ResilientTransport::framed(
        pool(3),
        mock.factory(),
        TransactionConfig::default(),
    ));

    let mut handles = Vec::new();
    for i in 0..24 {
        let transport = Arc::clone(&transport);
        handles.push(tokio::spawn(async move {
            let command = format!("CMD {i}");
            let reply = transport.execute(command.as_bytes()).await.unwrap();
            assert_eq!(reply.into_bytes(), Bytes::from(command));
            assert!(transport.pool().size() <= 3);
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    assert!(mock.opened() <= 3);
    assert_eq!(transport.pool().active(), 0);
}

/// Line-echo instrument on a loopback port.
async fn spawn_echo_instrument() -> std::net::SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let (socket, _) = listener.accept().await.unwrap();
            tokio::spawn(async move {
                let (rx, mut tx) = socket.into_split();
                let mut lines = BufReader::new(rx);
                let mut line = Vec::new();
                while lines.read_until(b'\r', &mut line).await.unwrap_or(0) > 0 {
                    let mut reply = b"ECHO ".to_vec();
                    reply.extend_from_slice(&line);
                    if tx.write_all(&reply).await.is_err() {
                        break;
                    }
                    line.clear();
                }
            });
        }
    });
    addr
}

#[tokio::test]
async fn test_tcp_loopback_round_trip() {
    let addr = spawn_echo_instrument().await;
    let dialer = Dialer::new(
        TcpConnect::new(addr.to_string(), Duration::from_secs(1)),
        BackoffPolicy::connect_defaults(),
    );
    let transport = ResilientTransport::framed(
        pool(2),
        dialer.into_factory(),
        TransactionConfig {
            deadline: Duration::from_secs(1),
            ..Default::default()
        },
    );

    for cmd in ["*IDN?", "PFBK X", "STATUS"] {
        let reply = transport.execute(cmd.as_bytes()).await.unwrap();
        assert_eq!(reply.into_bytes(), Bytes::from(format!("ECHO {cmd}")));
    }
    assert_eq!(transport.pool().size(), 1);

    transport.close();
    assert!(matches!(
        transport.execute(b"late").await,
        Err(CommError::PoolClosed)
    ));
}

#[tokio::test]
async fn test_tcp_peer_reset_recovered() {
    // First connection is closed right after the command arrives, with
    // SO_LINGER 0 so the client sees a reset; later connections echo.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (socket, _) = listener.accept().await.unwrap();
        let mut first = BufReader::new(socket);
        let mut line = Vec::new();
        first.read_until(b'\r', &mut line).await.unwrap();
        first.get_ref().set_linger(Some(Duration::ZERO)).unwrap();
        drop(first);

        // The command is not re-sent, so answer without waiting for one.
        let (mut second, _) = listener.accept().await.unwrap();
        second.write_all(b"ACK\r").await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
    });

    let transport = ResilientTransport::framed(
        pool(1),
        Dialer::new(
            TcpConnect::new(addr.to_string(), Duration::from_secs(1)),
            BackoffPolicy::connect_defaults(),
        )
        .into_factory(),
        TransactionConfig {
            deadline: Duration::from_secs(2),
            ..Default::default()
        },
    );

    let reply = transport.execute(b"HOME").await.unwrap();
    assert_eq!(reply.into_bytes(), Bytes::from_static(b"ACK"));
}

#[tokio::test]
async fn test_refused_target_fails_fast() {
    let addr = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    };
    let transport = ResilientTransport::framed(
        pool(1),
        Dialer::new(
            TcpConnect::new(addr.to_string(), Duration::from_secs(1)),
            BackoffPolicy::default(),
        )
        .into_factory(),
        TransactionConfig::default(),
    );

    let err = transport.execute(b"X").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Connect);
    assert_eq!(transport.pool().size(), 0);
}
