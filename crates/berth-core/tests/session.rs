// ABOUTME: Integration tests for worker sessions opened on spawned workers.
// ABOUTME: Frame ordering, half-close, descriptor ownership, close callbacks, and TCP addressing.

mod common;

use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use berth_core::{HeaderBlock, ListenAddress, SessionError, SpawnOptions, SpawnedWorker};
use common::harness;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

fn counter() -> (Arc<AtomicUsize>, impl FnOnce() + Send + 'static) {
    let count = Arc::new(AtomicUsize::new(0));
    let inner = count.clone();
    (count, move || {
        inner.fetch_add(1, Ordering::SeqCst);
    })
}

fn dangling_owner() -> std::os::fd::OwnedFd {
    let (a, _b) = std::os::unix::net::UnixStream::pair().unwrap();
    a.into()
}

/// True when `fd` still refers to an open descriptor.
fn fd_is_open(fd: i32) -> bool {
    nix::fcntl::fcntl(fd, nix::fcntl::FcntlArg::F_GETFD).is_ok()
}

#[tokio::test]
async fn test_full_request_cycle_preserves_frame_order() {
    let h = harness(vec![]).await;
    let cancel = CancellationToken::new();
    let worker = h
        .supervisor
        .spawn(&SpawnOptions::new("/app"), &cancel)
        .await
        .unwrap();
    let (closed, on_close) = counter();

    let mut session = worker.connect(on_close, &cancel).await.unwrap();
    assert_eq!(session.pid(), worker.pid());

    let headers = HeaderBlock::new()
        .with("REQUEST_METHOD", "POST")
        .unwrap()
        .with("PATH_INFO", "/users")
        .unwrap();
    session.send_headers(headers.as_bytes()).await.unwrap();
    session.send_body_block(b"name=ada").await.unwrap();
    session.send_body_block(b"&role=admin").await.unwrap();
    session.shutdown_writer().unwrap();

    let response = session.read_to_end().await.unwrap();
    assert_eq!(
        String::from_utf8(response).unwrap(),
        "headers=2\nREQUEST_METHOD=POST\nPATH_INFO=/users\nbody=name=ada&role=admin"
    );

    session.close_stream().unwrap();
    assert_eq!(closed.load(Ordering::SeqCst), 0);
    drop(session);
    assert_eq!(closed.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_write_after_writer_shutdown_is_rejected() {
    let h = harness(vec![]).await;
    let cancel = CancellationToken::new();
    let worker = h
        .supervisor
        .spawn(&SpawnOptions::new("/app"), &cancel)
        .await
        .unwrap();
    let mut session = worker.connect(|| {}, &cancel).await.unwrap();

    session.send_headers(b"PATH_INFO\0/\0").await.unwrap();
    session.shutdown_writer().unwrap();
    let err = session.send_body_block(b"late").await.unwrap_err();
    assert!(matches!(err, SessionError::WriterClosed));

    // The response is still readable after the half-close.
    let response = session.read_to_end().await.unwrap();
    assert!(response.starts_with(b"headers=1\n"));
}

#[tokio::test]
async fn test_discarded_stream_is_left_open() {
    let h = harness(vec![]).await;
    let cancel = CancellationToken::new();
    let worker = h
        .supervisor
        .spawn(&SpawnOptions::new("/app"), &cancel)
        .await
        .unwrap();
    let (closed, on_close) = counter();

    let mut session = worker.connect(on_close, &cancel).await.unwrap();
    let fd = session.discard_stream().unwrap();
    let raw = fd.as_raw_fd();
    drop(session);

    assert_eq!(closed.load(Ordering::SeqCst), 1);
    assert!(fd_is_open(raw));

    // The new owner can still finish the exchange.
    let std_stream = std::os::unix::net::UnixStream::from(fd);
    let mut stream = tokio::net::UnixStream::from_std(std_stream).unwrap();
    berth_core::channel::write_scalar(&mut stream, b"A\0b\0")
        .await
        .unwrap();
    stream.shutdown().await.unwrap();
    let mut response = Vec::new();
    stream.read_to_end(&mut response).await.unwrap();
    assert_eq!(response, b"headers=1\nA=b\nbody=");
}

#[tokio::test]
async fn test_dropped_session_closes_stream_once() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("worker.sock");
    let listener = tokio::net::UnixListener::bind(&path).unwrap();
    let worker = SpawnedWorker::new("/app", 7, ListenAddress::Unix(path), dangling_owner());
    let (closed, on_close) = counter();

    let session = worker
        .connect(on_close, &CancellationToken::new())
        .await
        .unwrap();
    let (mut peer, _) = listener.accept().await.unwrap();
    drop(session);

    assert_eq!(closed.load(Ordering::SeqCst), 1);
    let mut buf = Vec::new();
    assert_eq!(peer.read_to_end(&mut buf).await.unwrap(), 0);
}

#[tokio::test]
async fn test_tcp_worker_session() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let headers = berth_core::channel::read_scalar(&mut stream)
            .await
            .unwrap()
            .unwrap();
        let mut body = Vec::new();
        stream.read_to_end(&mut body).await.unwrap();
        stream.write_all(&headers).await.unwrap();
        stream.write_all(&body).await.unwrap();
    });

    let worker = SpawnedWorker::new(
        "/app",
        9000,
        ListenAddress::Tcp(format!("127.0.0.1:{port}")),
        dangling_owner(),
    );
    let mut session = worker
        .connect(|| {}, &CancellationToken::new())
        .await
        .unwrap();
    session.send_headers(b"X\0y\0").await.unwrap();
    session.send_body_block(b"body").await.unwrap();
    session.shutdown_writer().unwrap();
    assert_eq!(session.read_to_end().await.unwrap(), b"X\0y\0body");
    server.await.unwrap();
}

#[tokio::test]
async fn test_malformed_tcp_addresses_fail_before_connecting() {
    for address in ["127.0.0.1", "127.0.0.1:0"] {
        let worker = SpawnedWorker::new(
            "/app",
            1,
            ListenAddress::Tcp(address.to_string()),
            dangling_owner(),
        );
        let (closed, on_close) = counter();
        let err = worker
            .connect(on_close, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Configuration(_)), "{address}");
        assert!(err.to_string().contains(address));
        assert_eq!(closed.load(Ordering::SeqCst), 0);
    }
}

#[tokio::test]
async fn test_writer_timeout_from_config_value() {
    // A peer that never reads lets the socket buffer fill up.
    let (ours, _theirs) = tokio::net::UnixStream::pair().unwrap();
    let mut session = berth_core::WorkerSession::new(
        1,
        berth_core::WorkerStream::Unix(ours),
        || {},
        CancellationToken::new(),
    );
    session.set_writer_timeout(50);

    let block = vec![0u8; 64 * 1024];
    let mut result = Ok(());
    for _ in 0..256 {
        result = session.send_body_block(&block).await;
        if result.is_err() {
            break;
        }
    }
    assert!(matches!(result, Err(SessionError::TimedOut)));
}
