use bytes::Bytes;
use crosstalk::{connect, listen, Handlers, Limits, Sock};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

fn echo_handlers() -> Arc<Handlers> {
    let handlers = Handlers::new();
    handlers.handle("echo", |_sock, _op, payload| async move {
        Ok::<_, anyhow::Error>(payload)
    });
    handlers
}

async fn spawn_server(mut configure: impl FnMut(&mut crosstalk::Server)) -> String {
    let mut server = listen("127.0.0.1:0", echo_handlers()).await.expect("listen");
    configure(&mut server);
    let addr = server.local_addr().expect("local addr");
    tokio::spawn(async move {
        let _ = server.accept().await;
    });
    addr
}

#[tokio::test]
async fn tcp_echo() {
    let addr = spawn_server(|_| {}).await;
    let sock = connect(&*addr, Handlers::new()).await.expect("connect");
    let reply = sock.buffer_request("echo", b"Hello").await.expect("echo");
    assert_eq!(reply, Bytes::from_static(b"Hello"));
    sock.close().await;
}

#[tokio::test]
async fn accept_hook_runs_before_messages() {
    let hits = Arc::new(AtomicU32::new(0));
    let hook_hits = Arc::clone(&hits);
    let addr = spawn_server(move |server| {
        let hits = Arc::clone(&hook_hits);
        server.set_accept_handler(move |_sock| {
            hits.fetch_add(1, Ordering::SeqCst);
        });
    })
    .await;

    let sock = connect(&*addr, Handlers::new()).await.expect("connect");
    sock.buffer_request("echo", b"x").await.expect("echo");
    assert_eq!(hits.load(Ordering::SeqCst), 1);
    sock.close().await;
}

#[tokio::test]
async fn retry_under_pressure() {
    let addr = {
        let handlers = Handlers::new();
        handlers.handle("slow-echo", |_sock, _op, payload| async move {
            tokio::time::sleep(Duration::from_millis(150)).await;
            Ok::<_, anyhow::Error>(payload)
        });
        let mut server = listen("127.0.0.1:0", handlers).await.expect("listen");
        let limits = Limits::new(1, 0);
        limits.set_buffer_wait(Duration::from_millis(10), Duration::from_millis(30));
        server.set_limits(limits);
        let addr = server.local_addr().expect("local addr");
        tokio::spawn(async move {
            let _ = server.accept().await;
        });
        addr
    };

    let sock = connect(&*addr, Handlers::new()).await.expect("connect");
    let start = Instant::now();
    let first = {
        let sock = Arc::clone(&sock);
        tokio::spawn(async move { sock.buffer_request("slow-echo", b"one").await })
    };
    let second = {
        let sock = Arc::clone(&sock);
        tokio::spawn(async move { sock.buffer_request("slow-echo", b"two").await })
    };
    assert_eq!(first.await.expect("task").expect("first reply"), Bytes::from_static(b"one"));
    assert_eq!(second.await.expect("task").expect("second reply"), Bytes::from_static(b"two"));
    // The admission ceiling of one serializes the two handlers; the loser
    // must have been told to retry at least once.
    assert!(start.elapsed() >= Duration::from_millis(250));
    sock.close().await;
}

#[tokio::test]
async fn version_mismatch_is_rejected() {
    let addr = spawn_server(|server| {
        server.set_heartbeat_interval(Duration::ZERO);
    })
    .await;

    let mut stream = TcpStream::connect(&*addr).await.expect("tcp connect");
    stream.write_all(b"00").await.expect("send version");
    let mut buf = Vec::new();
    timeout(Duration::from_secs(5), stream.read_to_end(&mut buf))
        .await
        .expect("server closes")
        .expect("read");
    assert_eq!(&buf[..2], b"01");
    assert_eq!(&buf[2..], b"f00000001");
}

#[tokio::test]
async fn read_timeout_closes_connection() {
    let addr = spawn_server(|server| {
        server.set_heartbeat_interval(Duration::ZERO);
        let limits = Limits::default();
        limits.set_read_timeout(Duration::from_millis(200));
        server.set_limits(limits);
    })
    .await;

    let mut stream = TcpStream::connect(&*addr).await.expect("tcp connect");
    stream.write_all(b"01").await.expect("send version");
    let start = Instant::now();
    let mut buf = Vec::new();
    timeout(Duration::from_secs(5), stream.read_to_end(&mut buf))
        .await
        .expect("server closes")
        .expect("read");
    assert_eq!(&buf[..2], b"01");
    assert_eq!(&buf[2..], b"f00000003");
    assert!(start.elapsed() >= Duration::from_millis(150));
}

#[tokio::test]
async fn silent_requestor_sees_timeout() {
    let addr = spawn_server(|server| {
        server.set_heartbeat_interval(Duration::ZERO);
        let limits = Limits::default();
        limits.set_read_timeout(Duration::from_millis(200));
        server.set_limits(limits);
    })
    .await;

    // The library client heartbeats every 20s by default; its first beat
    // right after connecting is long gone before the server's deadline.
    let sock = connect(&*addr, Handlers::new()).await.expect("connect");
    tokio::time::sleep(Duration::from_millis(600)).await;
    let err = sock.buffer_request("echo", b"late").await.expect_err("timed out");
    assert_eq!(err.to_string(), "timeout");
}

#[tokio::test]
async fn heartbeats_prevent_read_timeout() {
    let beats = Arc::new(AtomicU32::new(0));
    let addr = {
        let beats = Arc::clone(&beats);
        spawn_server(move |server| {
            let limits = Limits::default();
            limits.set_read_timeout(Duration::from_millis(300));
            server.set_limits(limits);
            let beats = Arc::clone(&beats);
            server.set_heartbeat_handler(move |_load, _time| {
                beats.fetch_add(1, Ordering::SeqCst);
            });
        })
        .await
    };

    // Manual dial so the heartbeat interval is set before the read loop
    // starts sending.
    let stream = TcpStream::connect(&*addr).await.expect("tcp connect");
    let sock = Sock::new(Handlers::new());
    sock.set_heartbeat_interval(Duration::from_millis(100));
    sock.adopt(stream, None).await;
    sock.handshake().await.expect("handshake");
    {
        let sock = Arc::clone(&sock);
        tokio::spawn(async move {
            let _ = sock.read_loop(Limits::default()).await;
        });
    }

    // Idle well past the server's read deadline.
    tokio::time::sleep(Duration::from_millis(900)).await;
    let reply = sock.buffer_request("echo", b"still here").await.expect("echo");
    assert_eq!(reply, Bytes::from_static(b"still here"));
    assert!(beats.load(Ordering::SeqCst) >= 2);
    sock.close().await;
}

#[tokio::test]
async fn shutdown_forces_close_after_grace() {
    let addr = spawn_server(|_| {}).await;
    let sock = connect(&*addr, Handlers::new()).await.expect("connect");
    sock.shutdown(Duration::from_millis(50));
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(sock.is_closed());
    let err = sock.buffer_request("echo", b"x").await.expect_err("closed");
    assert_eq!(err.to_string(), "socket closed");
}
