use bytes::Bytes;
use crosstalk::{pipe, Handlers, SockError};
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;

fn echo_handlers() -> Arc<Handlers> {
    let handlers = Handlers::new();
    handlers.handle("echo", |_sock, _op, payload| async move {
        Ok::<_, anyhow::Error>(payload)
    });
    handlers
}

#[tokio::test]
async fn echo() {
    let (responder, requestor) = pipe(echo_handlers(), Handlers::new()).await;
    let reply = requestor
        .buffer_request("echo", b"Hello")
        .await
        .expect("echo reply");
    assert_eq!(reply, Bytes::from_static(b"Hello"));
    drop(responder);
}

#[tokio::test]
async fn both_sides_can_request() {
    let (a, b) = pipe(echo_handlers(), echo_handlers()).await;
    let r1 = a.buffer_request("echo", b"from a").await.expect("a -> b");
    let r2 = b.buffer_request("echo", b"from b").await.expect("b -> a");
    assert_eq!(r1, Bytes::from_static(b"from a"));
    assert_eq!(r2, Bytes::from_static(b"from b"));
}

#[tokio::test]
async fn unknown_operation() {
    let (_responder, requestor) = pipe(echo_handlers(), Handlers::new()).await;
    let err = requestor
        .buffer_request("foo", b"")
        .await
        .expect_err("unknown op");
    assert_eq!(err.to_string(), "unknown operation \"foo\"");
}

#[tokio::test]
async fn fallback_handler() {
    let handlers = Handlers::new();
    handlers.handle("", |_sock, op, _payload| async move {
        Ok::<_, anyhow::Error>(Bytes::from(format!("fell back for {}", op)))
    });
    let (_responder, requestor) = pipe(handlers, Handlers::new()).await;
    let reply = requestor
        .buffer_request("anything", b"")
        .await
        .expect("fallback reply");
    assert_eq!(reply, Bytes::from_static(b"fell back for anything"));
}

#[tokio::test]
async fn handler_error_becomes_remote_error() {
    let handlers = Handlers::new();
    handlers.handle("fail", |_sock, _op, _payload| async move {
        Err::<Bytes, _>(anyhow::anyhow!("boom"))
    });
    let (_responder, requestor) = pipe(handlers, Handlers::new()).await;
    let err = requestor.buffer_request("fail", b"").await.expect_err("boom");
    assert!(matches!(err, SockError::Remote(_)));
    assert_eq!(err.to_string(), "boom");
}

#[tokio::test]
async fn handler_panic_is_contained() {
    let handlers = Handlers::new();
    handlers.handle("panic", |_sock, _op, payload| async move {
        if payload.len() < 1024 {
            panic!("handler went sideways");
        }
        Ok::<Bytes, anyhow::Error>(Bytes::new())
    });
    handlers.handle("echo", |_sock, _op, payload| async move {
        Ok::<_, anyhow::Error>(payload)
    });
    let (_responder, requestor) = pipe(handlers, Handlers::new()).await;

    let err = requestor
        .buffer_request("panic", b"")
        .await
        .expect_err("panic surfaces as error response");
    assert_eq!(err.to_string(), "internal error in request handler");

    // The connection survives a panicking handler.
    let reply = requestor.buffer_request("echo", b"still alive").await.expect("echo");
    assert_eq!(reply, Bytes::from_static(b"still alive"));
}

#[tokio::test]
async fn notification_dispatch() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let handlers = Handlers::new();
    handlers.handle_notification("chat", move |_sock, name, payload| {
        let tx = tx.clone();
        async move {
            let _ = tx.send((name, payload));
        }
    });
    let (_receiver, sender) = pipe(handlers, Handlers::new()).await;
    sender.notify("chat", b"hi there").await.expect("notify");

    let (name, payload) = timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("notification within deadline")
        .expect("notification delivered");
    assert_eq!(name, "chat");
    assert_eq!(payload, Bytes::from_static(b"hi there"));
}

#[tokio::test]
async fn unhandled_notification_is_ignored() {
    let (_responder, requestor) = pipe(echo_handlers(), Handlers::new()).await;
    requestor.notify("nobody-listens", b"payload").await.expect("notify");
    // The connection keeps working afterwards.
    let reply = requestor.buffer_request("echo", b"ok").await.expect("echo");
    assert_eq!(reply, Bytes::from_static(b"ok"));
}

#[tokio::test]
async fn concurrent_requests_correlate() {
    let handlers = Handlers::new();
    handlers.handle("double", |_sock, _op, payload| async move {
        // Stagger completion so responses interleave across requests.
        let n: u64 = String::from_utf8_lossy(&payload).parse().unwrap_or(0);
        tokio::time::sleep(Duration::from_millis(50 - (n % 5) * 10)).await;
        Ok::<_, anyhow::Error>(Bytes::from(format!("{}", n * 2)))
    });
    let (_responder, requestor) = pipe(handlers, Handlers::new()).await;

    let mut tasks = Vec::new();
    for n in 0u64..10 {
        let sock = Arc::clone(&requestor);
        tasks.push(tokio::spawn(async move {
            let reply = sock
                .buffer_request("double", format!("{}", n).as_bytes())
                .await
                .expect("double reply");
            (n, reply)
        }));
    }
    for task in tasks {
        let (n, reply) = task.await.expect("task");
        assert_eq!(reply, Bytes::from(format!("{}", n * 2)));
    }
}

#[tokio::test]
async fn close_delivers_to_all_pending() {
    let handlers = Handlers::new();
    handlers.handle("stall", |_sock, _op, _payload| async move {
        tokio::time::sleep(Duration::from_secs(600)).await;
        Ok::<_, anyhow::Error>(Bytes::new())
    });
    let (_responder, requestor) = pipe(handlers, Handlers::new()).await;

    let mut tasks = Vec::new();
    for _ in 0..3 {
        let sock = Arc::clone(&requestor);
        tasks.push(tokio::spawn(async move {
            sock.buffer_request("stall", b"").await
        }));
    }
    tokio::time::sleep(Duration::from_millis(100)).await;
    requestor.close().await;

    for task in tasks {
        let err = timeout(Duration::from_secs(5), task)
            .await
            .expect("terminal outcome within deadline")
            .expect("task")
            .expect_err("closed");
        assert_eq!(err.to_string(), "socket closed");
    }
}

#[tokio::test]
async fn close_handler_runs_once() {
    let (_responder, requestor) = pipe(echo_handlers(), Handlers::new()).await;
    let calls = Arc::new(AtomicU32::new(0));
    let code = Arc::new(AtomicI64::new(i64::MIN));
    {
        let calls = Arc::clone(&calls);
        let code = Arc::clone(&code);
        requestor.set_close_handler(move |c| {
            calls.fetch_add(1, Ordering::SeqCst);
            code.store(c, Ordering::SeqCst);
        });
    }
    requestor.close().await;
    requestor.close().await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(code.load(Ordering::SeqCst), -1);
}

#[tokio::test]
async fn request_after_close_fails() {
    let (_responder, requestor) = pipe(echo_handlers(), Handlers::new()).await;
    requestor.close().await;
    let err = requestor.buffer_request("echo", b"x").await.expect_err("closed");
    assert!(matches!(err, SockError::Closed));
}
