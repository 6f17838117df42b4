use crate::handlers::Handlers;
use crate::limits::Limits;
use crate::protocol;
use crate::types::{MsgType, ProtoErr, RequestId, Response, SockError};
use bytes::Bytes;
use dashmap::DashMap;
use log::{debug, error, trace, warn};
use num_traits::FromPrimitive;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::io::{self, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpStream, ToSocketAddrs, UnixStream};
use tokio::sync::{mpsc, Mutex as AsyncMutex, Notify};
use tokio::time;

/// Heartbeat cadence for dialed and accepted sockets unless reconfigured.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(20);

// Short delay before the first heartbeat so the socket's owner can adjust
// the interval right after adoption.
const HEARTBEAT_STARTUP_DELAY: Duration = Duration::from_millis(10);

// Inbound stream chunks buffered per request before the read loop blocks.
const STREAM_CHUNK_BUFFER: usize = 8;

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// One end of a connection. Both peers are symmetric: either side may send
/// requests and notifications while serving the other's.
///
/// A `Sock` is driven by [`read_loop`](Sock::read_loop), which decodes
/// inbound messages and dispatches them to the registered [`Handlers`].
/// [`connect`], [`pipe`] and [`Server`](crate::Server) spawn the loop for
/// you; the lower-level `new` / `adopt` / `handshake` / `read_loop` sequence
/// is available for custom transports.
pub struct Sock {
    handlers: Arc<Handlers>,
    reader: Mutex<Option<BoxedReader>>,
    // Guards all writes; header and payload go out under one acquisition.
    writer: AsyncMutex<Option<BoxedWriter>>,
    peer_addr: Mutex<Option<String>>,
    next_id: AtomicU32,
    pending_res: DashMap<RequestId, mpsc::UnboundedSender<Response>>,
    pending_req: DashMap<RequestId, mpsc::Sender<Option<Bytes>>>,
    // Only the task observing the 0 -> 1 transition performs cleanup.
    closes: AtomicU32,
    close_code: AtomicI64,
    closed_notify: Notify,
    heartbeat_ms: AtomicU64,
    load: AtomicU32,
    has_deadlines: AtomicBool,
    on_heartbeat: Mutex<Option<Arc<dyn Fn(u16, u32) + Send + Sync>>>,
    on_close: Mutex<Option<Box<dyn FnOnce(i64) + Send>>>,
}

impl Sock {
    #[must_use]
    pub fn new(handlers: Arc<Handlers>) -> Arc<Self> {
        Arc::new(Self {
            handlers,
            reader: Mutex::new(None),
            writer: AsyncMutex::new(None),
            peer_addr: Mutex::new(None),
            next_id: AtomicU32::new(0),
            pending_res: DashMap::new(),
            pending_req: DashMap::new(),
            closes: AtomicU32::new(0),
            close_code: AtomicI64::new(-1),
            closed_notify: Notify::new(),
            heartbeat_ms: AtomicU64::new(0),
            load: AtomicU32::new(0),
            has_deadlines: AtomicBool::new(true),
            on_heartbeat: Mutex::new(None),
            on_close: Mutex::new(None),
        })
    }

    #[must_use]
    pub fn handlers(&self) -> &Arc<Handlers> {
        &self.handlers
    }

    /// Peer address, when the transport has one.
    #[must_use]
    pub fn addr(&self) -> Option<String> {
        self.peer_addr.lock().expect("peer addr lock").clone()
    }

    /// Install an already-connected byte stream, resetting close state.
    /// Call [`handshake`](Sock::handshake) and then
    /// [`read_loop`](Sock::read_loop) afterwards.
    pub async fn adopt<S>(&self, stream: S, peer_addr: Option<String>)
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (r, w) = io::split(stream);
        *self.reader.lock().expect("reader lock") = Some(Box::new(r));
        *self.writer.lock().await = Some(Box::new(w));
        *self.peer_addr.lock().expect("peer addr lock") = peer_addr;
        self.closes.store(0, Ordering::SeqCst);
        self.close_code.store(-1, Ordering::SeqCst);
        self.has_deadlines.store(true, Ordering::SeqCst);
    }

    async fn adopt_pipe<S>(&self, stream: S)
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        self.adopt(stream, None).await;
        // In-process pipes have no I/O deadlines: no read timeout, and no
        // heartbeats to keep one from firing.
        self.has_deadlines.store(false, Ordering::SeqCst);
    }

    /// Exchange protocol versions with the peer. Must complete before
    /// [`read_loop`](Sock::read_loop); a mismatch signals `unsupported` to
    /// the peer and closes the connection.
    pub async fn handshake(&self) -> Result<(), SockError> {
        let write_res = {
            let mut guard = self.writer.lock().await;
            match guard.as_mut() {
                Some(w) => protocol::write_version(w).await,
                None => Err(SockError::NotConnected),
            }
        };
        if let Err(err) = write_res {
            self.close().await;
            return Err(err);
        }

        let mut reader = self
            .reader
            .lock()
            .expect("reader lock")
            .take()
            .ok_or(SockError::NotConnected)?;
        match protocol::read_version(&mut reader).await {
            Ok(_) => {
                *self.reader.lock().expect("reader lock") = Some(reader);
                Ok(())
            }
            Err(err) => {
                if matches!(err, SockError::UnsupportedProtocol(_)) {
                    self.close_error(ProtoErr::Unsupported).await;
                } else {
                    self.close().await;
                }
                Err(err)
            }
        }
    }

    // ------------------------------------------------------------------
    // Outbound operations

    /// Send a request and return its id and response channel. The pending
    /// entry is registered before the write, so a response can never beat
    /// the registration; on write failure the entry is removed and the
    /// error surfaces here.
    pub async fn send_request(
        self: &Arc<Self>,
        t: MsgType,
        op: &str,
        payload: &[u8],
    ) -> Result<(RequestId, mpsc::UnboundedReceiver<Response>), SockError> {
        debug_assert!(matches!(t, MsgType::SingleReq | MsgType::StreamReq));
        let (id, rx) = self.alloc_res_chan();
        if let Err(err) = self.write_msg(t, Some(&id), op, 0, payload).await {
            self.dealloc_res_chan(&id);
            return Err(err);
        }
        Ok((id, rx))
    }

    /// Send a single-buffer request and await the reply. Retry responses
    /// are honored transparently: the call sleeps the indicated wait and
    /// resubmits with a fresh id.
    pub async fn buffer_request(self: &Arc<Self>, op: &str, payload: &[u8]) -> Result<Bytes, SockError> {
        loop {
            let (id, mut rx) = self.send_request(MsgType::SingleReq, op, payload).await?;
            let res = rx.recv().await;
            self.dealloc_res_chan(&id);
            let res = res.ok_or(SockError::Closed)?;
            match res.msg_type {
                MsgType::SingleRes => return Ok(res.data),
                MsgType::ErrorRes => return Err(SockError::Remote(res.error_text())),
                MsgType::RetryRes => {
                    trace!("{:?}: retry in {}ms", op, res.wait);
                    if res.wait > 0 {
                        time::sleep(Duration::from_millis(u64::from(res.wait))).await;
                    }
                }
                MsgType::StreamRes => return Err(SockError::UnexpectedStreamingResponse),
                _ => return Err(SockError::InvalidMessage),
            }
        }
    }

    /// Open a streaming request. The writer's first
    /// [`write`](StreamRequest::write) starts the stream; the returned
    /// channel yields response chunks terminated by an empty one, or a
    /// single error or retry response.
    #[must_use]
    pub fn stream_request(
        self: &Arc<Self>,
        op: &str,
    ) -> (StreamRequest, mpsc::UnboundedReceiver<Response>) {
        let (id, rx) = self.alloc_res_chan();
        (
            StreamRequest {
                sock: Arc::clone(self),
                op: op.to_owned(),
                id,
                started: false,
            },
            rx,
        )
    }

    /// Send a one-way notification.
    pub async fn notify(&self, name: &str, payload: &[u8]) -> Result<(), SockError> {
        self.write_msg(MsgType::Notification, None, name, 0, payload).await
    }

    // ------------------------------------------------------------------
    // Configuration

    /// Heartbeat cadence; zero disables heartbeats. Takes effect when the
    /// read loop starts, or within a few milliseconds after it.
    pub fn set_heartbeat_interval(&self, d: Duration) {
        self.heartbeat_ms.store(d.as_millis() as u64, Ordering::Relaxed);
    }

    #[must_use]
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_ms.load(Ordering::Relaxed))
    }

    /// Load metric advertised in outgoing heartbeats (0 when never set).
    pub fn set_load(&self, load: u16) {
        self.load.store(u32::from(load), Ordering::Relaxed);
    }

    /// Observe heartbeats decoded from the peer; receives the peer's load
    /// and unix-seconds timestamp.
    pub fn set_heartbeat_handler(&self, f: impl Fn(u16, u32) + Send + Sync + 'static) {
        *self.on_heartbeat.lock().expect("heartbeat handler lock") = Some(Arc::new(f));
    }

    /// Invoked exactly once when the socket closes, with the recorded
    /// protocol-error code or -1 when there is none.
    pub fn set_close_handler(&self, f: impl FnOnce(i64) + Send + 'static) {
        *self.on_close.lock().expect("close handler lock") = Some(Box::new(f));
    }

    // ------------------------------------------------------------------
    // Read loop

    /// Decode and dispatch inbound messages until the connection ends.
    /// Returns `Ok` after a local close, and the terminal cause otherwise.
    /// Must not be called before [`handshake`](Sock::handshake) on
    /// transports that use one.
    pub async fn read_loop(self: &Arc<Self>, limits: Limits) -> Result<(), SockError> {
        let mut reader = self
            .reader
            .lock()
            .expect("reader lock")
            .take()
            .ok_or(SockError::NotConnected)?;
        if !self.heartbeat_interval().is_zero() && self.has_deadlines() {
            self.start_heartbeats();
        }
        let res = self.dispatch(&mut reader, &limits).await;
        if let Err(err) = &res {
            debug!("read loop terminated: {}", err);
        }
        self.close().await;
        res
    }

    async fn dispatch(self: &Arc<Self>, r: &mut BoxedReader, limits: &Limits) -> Result<(), SockError> {
        let mut scratch = vec![0u8; protocol::SCRATCH_LEN];
        loop {
            if self.is_closed() {
                return Ok(());
            }

            let timeout = limits.read_timeout();
            let decoded = if !timeout.is_zero() && self.has_deadlines() {
                tokio::select! {
                    res = time::timeout(timeout, protocol::read_msg(r, &mut scratch)) => match res {
                        Ok(inner) => inner,
                        Err(_) => {
                            debug!("read timed out after {:?}", timeout);
                            self.close_error(ProtoErr::Timeout).await;
                            return Err(SockError::Timeout);
                        }
                    },
                    _ = self.closed_notify.notified() => return Ok(()),
                }
            } else {
                tokio::select! {
                    res = protocol::read_msg(r, &mut scratch) => res,
                    _ = self.closed_notify.notified() => return Ok(()),
                }
            };

            let msg = match decoded {
                Ok(msg) => msg,
                Err(SockError::InvalidMessage) => {
                    self.close_error(ProtoErr::InvalidMsg).await;
                    return Err(SockError::InvalidMessage);
                }
                Err(err) => return Err(err),
            };
            trace!("recv {:?} id={:?} name={:?} size={}", msg.t, msg.id, msg.name, msg.size);

            match msg.t {
                MsgType::SingleReq => {
                    self.read_single_req(r, msg.id, msg.name, msg.size as usize, limits)
                        .await?;
                }
                MsgType::StreamReq => {
                    self.read_stream_req(r, msg.id, msg.name, msg.size as usize, limits)
                        .await?;
                }
                MsgType::StreamReqPart => self.read_stream_part(r, msg.id, msg.size as usize).await?,
                MsgType::SingleRes | MsgType::StreamRes | MsgType::ErrorRes | MsgType::RetryRes => {
                    self.read_res(r, &msg).await?;
                }
                MsgType::Notification => {
                    self.read_notification(r, msg.name, msg.size as usize).await?;
                }
                MsgType::Heartbeat => {
                    let cb = self.on_heartbeat.lock().expect("heartbeat handler lock").clone();
                    if let Some(cb) = cb {
                        cb(msg.wait as u16, msg.size);
                    }
                }
                MsgType::ProtocolError => {
                    let code = ProtoErr::from_u32(msg.size).unwrap_or(ProtoErr::Abnormal);
                    debug!("peer signaled protocol error: {}", code);
                    let _ = self.close_code.compare_exchange(
                        -1,
                        i64::from(code as u32),
                        Ordering::SeqCst,
                        Ordering::SeqCst,
                    );
                    self.close().await;
                    return Err(SockError::Protocol(code));
                }
            }
        }
    }

    async fn read_single_req(
        self: &Arc<Self>,
        r: &mut BoxedReader,
        id: RequestId,
        op: String,
        size: usize,
        limits: &Limits,
    ) -> Result<(), SockError> {
        let Some(handler) = self.handlers.find_buffer(&op) else {
            self.read_discard(r, size).await?;
            return self.respond_err(id, &format!("unknown operation {:?}", op)).await;
        };
        if !limits.inc_buffer_req() {
            self.read_discard(r, size).await?;
            return self
                .respond_retry(id, limits.buffer_retry_wait(), "request limit reached")
                .await;
        }
        let payload = match self.read_payload(r, size).await {
            Ok(payload) => payload,
            Err(err) => {
                limits.dec_buffer_req();
                return Err(err);
            }
        };

        let sock = Arc::clone(self);
        let limits = limits.clone();
        let fut = handler(Arc::clone(self), op, payload);
        tokio::spawn(async move {
            // An inner spawn contains handler panics; the connection
            // survives and the peer gets an error response.
            let outcome = match tokio::spawn(fut).await {
                Ok(Ok(out)) => sock.respond_ok(id, &out).await,
                Ok(Err(err)) => sock.respond_err(id, &err.to_string()).await,
                Err(err) => {
                    error!("request handler panicked: {}", err);
                    sock.respond_err(id, "internal error in request handler").await
                }
            };
            limits.dec_buffer_req();
            if let Err(err) = outcome {
                debug!("failed to write response: {}", err);
                sock.close().await;
            }
        });
        Ok(())
    }

    async fn read_stream_req(
        self: &Arc<Self>,
        r: &mut BoxedReader,
        id: RequestId,
        op: String,
        size: usize,
        limits: &Limits,
    ) -> Result<(), SockError> {
        if !limits.stream_reqs_enabled() {
            self.read_discard(r, size).await?;
            return self.respond_err(id, "stream requests not supported").await;
        }
        let Some(handler) = self.handlers.find_stream(&op) else {
            self.read_discard(r, size).await?;
            return self.respond_err(id, &format!("unknown operation {:?}", op)).await;
        };
        if !limits.inc_stream_req() {
            self.read_discard(r, size).await?;
            return self
                .respond_retry(id, limits.stream_retry_wait(), "stream request limit reached")
                .await;
        }
        let first = match self.read_payload(r, size).await {
            Ok(payload) => payload,
            Err(err) => {
                limits.dec_stream_req();
                return Err(err);
            }
        };

        let (tx, rx) = mpsc::channel(STREAM_CHUNK_BUFFER);
        self.pending_req.insert(id, tx.clone());
        // The channel is fresh; the first chunk always fits.
        let _ = tx.try_send(Some(first));

        let writer = StreamWriter {
            sock: Arc::clone(self),
            id,
            ended: Arc::new(AtomicBool::new(false)),
        };
        let auto_end = writer.clone();
        let sock = Arc::clone(self);
        let limits = limits.clone();
        let fut = handler(Arc::clone(self), op, rx, writer);
        tokio::spawn(async move {
            let result = tokio::spawn(fut).await;
            sock.pending_req.remove(&id);
            let outcome = match result {
                // The terminal empty chunk, unless the handler already
                // wrote it.
                Ok(Ok(())) => auto_end.end().await,
                Ok(Err(err)) => sock.respond_err(id, &err.to_string()).await,
                Err(err) => {
                    error!("stream handler panicked: {}", err);
                    sock.respond_err(id, "internal error in stream handler").await
                }
            };
            limits.dec_stream_req();
            if let Err(err) = outcome {
                debug!("failed to finish stream response: {}", err);
                sock.close().await;
            }
        });
        Ok(())
    }

    async fn read_stream_part(
        self: &Arc<Self>,
        r: &mut BoxedReader,
        id: RequestId,
        size: usize,
    ) -> Result<(), SockError> {
        let tx = self.pending_req.get(&id).map(|entry| entry.value().clone());
        let Some(tx) = tx else {
            // A part without a preceding stream request.
            self.close_error(ProtoErr::InvalidMsg).await;
            return Err(SockError::InvalidMessage);
        };
        let chunk = if size == 0 {
            None
        } else {
            Some(self.read_payload(r, size).await?)
        };
        if chunk.is_none() {
            self.pending_req.remove(&id);
        }
        // Blocks while the handler is behind; backpressure is fine here
        // since this loop serves only this connection.
        if tx.send(chunk).await.is_err() {
            trace!("stream handler for {:?} is gone; dropping chunk", id);
        }
        Ok(())
    }

    async fn read_res(&self, r: &mut BoxedReader, msg: &protocol::Msg) -> Result<(), SockError> {
        let size = msg.size as usize;
        // Everything but a non-empty stream chunk is terminal. Delete
        // before delivering so the id cannot be reused while a consumer
        // still owns it.
        let terminal = !(msg.t == MsgType::StreamRes && size != 0);
        let tx = if terminal {
            self.pending_res.remove(&msg.id).map(|(_, tx)| tx)
        } else {
            self.pending_res.get(&msg.id).map(|entry| entry.value().clone())
        };
        let Some(tx) = tx else {
            trace!("response for unknown id {:?}; discarding", msg.id);
            return self.read_discard(r, size).await;
        };
        let data = self.read_payload(r, size).await?;
        let _ = tx.send(Response {
            msg_type: msg.t,
            data,
            wait: msg.wait,
        });
        Ok(())
    }

    async fn read_notification(
        self: &Arc<Self>,
        r: &mut BoxedReader,
        name: String,
        size: usize,
    ) -> Result<(), SockError> {
        let Some(handler) = self.handlers.find_notification(&name) else {
            return self.read_discard(r, size).await;
        };
        let payload = self.read_payload(r, size).await?;
        // Runs in the read loop; ordering across notifications is
        // unspecified either way.
        handler(Arc::clone(self), name, payload).await;
        Ok(())
    }

    async fn read_payload(&self, r: &mut BoxedReader, size: usize) -> Result<Bytes, SockError> {
        if size == 0 {
            return Ok(Bytes::new());
        }
        let mut buf = vec![0u8; size];
        r.read_exact(&mut buf).await?;
        Ok(Bytes::from(buf))
    }

    async fn read_discard(&self, r: &mut BoxedReader, size: usize) -> Result<(), SockError> {
        let mut remaining = size;
        let mut buf = [0u8; 4096];
        while remaining > 0 {
            let n = remaining.min(buf.len());
            r.read_exact(&mut buf[..n]).await?;
            remaining -= n;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Write path

    async fn write_msg(
        &self,
        t: MsgType,
        id: Option<&RequestId>,
        name: &str,
        wait: u32,
        payload: &[u8],
    ) -> Result<(), SockError> {
        let header = protocol::encode_msg(t, id, name, wait, payload.len() as u32);
        let mut guard = self.writer.lock().await;
        let w = guard.as_mut().ok_or_else(|| self.closed_cause())?;
        w.write_all(&header).await?;
        if !payload.is_empty() {
            w.write_all(payload).await?;
        }
        w.flush().await?;
        Ok(())
    }

    async fn respond_ok(&self, id: RequestId, payload: &[u8]) -> Result<(), SockError> {
        self.write_msg(MsgType::SingleRes, Some(&id), "", 0, payload).await
    }

    async fn respond_err(&self, id: RequestId, text: &str) -> Result<(), SockError> {
        self.write_msg(MsgType::ErrorRes, Some(&id), "", 0, text.as_bytes()).await
    }

    async fn respond_retry(&self, id: RequestId, wait_ms: u32, text: &str) -> Result<(), SockError> {
        self.write_msg(MsgType::RetryRes, Some(&id), "", wait_ms, text.as_bytes())
            .await
    }

    // ------------------------------------------------------------------
    // Heartbeats

    fn start_heartbeats(self: &Arc<Self>) {
        let sock = Arc::clone(self);
        tokio::spawn(async move {
            time::sleep(HEARTBEAT_STARTUP_DELAY).await;
            loop {
                if sock.is_closed() {
                    return;
                }
                let interval = sock.heartbeat_interval();
                if interval.is_zero() {
                    return;
                }
                if let Err(err) = sock.write_heartbeat().await {
                    trace!("stopping heartbeats: {}", err);
                    return;
                }
                time::sleep(interval).await;
            }
        });
    }

    async fn write_heartbeat(&self) -> Result<(), SockError> {
        let load = self.load.load(Ordering::Relaxed) as u16;
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as u32)
            .unwrap_or(0);
        let header = protocol::encode_heartbeat(load, now);
        let mut guard = self.writer.lock().await;
        let w = guard.as_mut().ok_or_else(|| self.closed_cause())?;
        w.write_all(&header).await?;
        w.flush().await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Close

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closes.load(Ordering::SeqCst) != 0
    }

    /// Close the connection. Idempotent and safe to call concurrently:
    /// exactly one caller performs cleanup. Every pending outbound request
    /// receives a single terminal error response (the recorded close cause,
    /// or "socket closed") before this returns.
    pub async fn close(&self) {
        if self.closes.fetch_add(1, Ordering::SeqCst) != 0 {
            return;
        }
        self.closed_notify.notify_one();

        if let Some(mut w) = self.writer.lock().await.take() {
            if let Err(err) = w.shutdown().await {
                trace!("transport shutdown: {}", err);
            }
        }
        *self.reader.lock().expect("reader lock") = None;

        let code = self.close_code.load(Ordering::SeqCst);
        let cause = ProtoErr::from_i64(code)
            .map_or_else(|| Bytes::from_static(b"socket closed"), |c| Bytes::from(c.to_string()));
        let wait = if code >= 0 { code as u32 } else { 0 };

        let mut pending = Vec::new();
        self.pending_res.retain(|_, tx| {
            pending.push(tx.clone());
            false
        });
        for tx in pending {
            let _ = tx.send(Response {
                msg_type: MsgType::ErrorRes,
                data: cause.clone(),
                wait,
            });
        }
        // Dropping the chunk senders wakes any in-flight stream handlers.
        self.pending_req.clear();

        if let Some(cb) = self.on_close.lock().expect("close handler lock").take() {
            cb(code);
        }
    }

    /// Signal `code` to the peer, then close.
    pub async fn close_error(&self, code: ProtoErr) {
        let _ = self.close_code.compare_exchange(
            -1,
            i64::from(code as u32),
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
        {
            let mut guard = self.writer.lock().await;
            if let Some(w) = guard.as_mut() {
                let header = protocol::encode_msg(MsgType::ProtocolError, None, "", 0, code as u32);
                if w.write_all(&header).await.is_ok() {
                    let _ = w.flush().await;
                }
            }
        }
        self.close().await;
    }

    /// Give in-flight work `timeout` to finish, then force the connection
    /// closed. Returns immediately.
    pub fn shutdown(self: &Arc<Self>, timeout: Duration) {
        let sock = Arc::clone(self);
        tokio::spawn(async move {
            time::sleep(timeout).await;
            sock.close().await;
        });
    }

    // ------------------------------------------------------------------
    // Pending-table plumbing

    fn alloc_res_chan(&self) -> (RequestId, mpsc::UnboundedReceiver<Response>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed).to_le_bytes();
        self.pending_res.insert(id, tx);
        (id, rx)
    }

    fn dealloc_res_chan(&self, id: &RequestId) {
        self.pending_res.remove(id);
    }

    fn has_deadlines(&self) -> bool {
        self.has_deadlines.load(Ordering::SeqCst)
    }

    fn closed_cause(&self) -> SockError {
        ProtoErr::from_i64(self.close_code.load(Ordering::SeqCst))
            .map_or(SockError::Closed, SockError::Protocol)
    }
}

#[cfg(feature = "json")]
impl Sock {
    /// Send a request whose input and output values are JSON-encoded.
    pub async fn request<P, R>(self: &Arc<Self>, op: &str, params: &P) -> Result<R, SockError>
    where
        P: serde::Serialize,
        R: serde::de::DeserializeOwned,
    {
        let payload = serde_json::to_vec(params)?;
        let out = self.buffer_request(op, &payload).await?;
        Ok(serde_json::from_slice(&out)?)
    }

    /// Send a notification whose value is JSON-encoded.
    pub async fn notify_json<V>(&self, name: &str, value: &V) -> Result<(), SockError>
    where
        V: serde::Serialize,
    {
        let payload = serde_json::to_vec(value)?;
        self.notify(name, &payload).await
    }
}

/// An in-progress outbound streaming request. The first
/// [`write`](StreamRequest::write) opens the stream; [`end`](StreamRequest::end)
/// marks end-of-stream. Responses arrive on the channel returned by
/// [`Sock::stream_request`].
pub struct StreamRequest {
    sock: Arc<Sock>,
    op: String,
    id: RequestId,
    started: bool,
}

impl StreamRequest {
    #[must_use]
    pub fn id(&self) -> RequestId {
        self.id
    }

    pub async fn write(&mut self, chunk: &[u8]) -> Result<(), SockError> {
        let res = if self.started {
            self.sock
                .write_msg(MsgType::StreamReqPart, Some(&self.id), "", 0, chunk)
                .await
        } else {
            self.started = true;
            self.sock
                .write_msg(MsgType::StreamReq, Some(&self.id), &self.op, 0, chunk)
                .await
        };
        if res.is_err() {
            self.sock.dealloc_res_chan(&self.id);
        }
        res
    }

    pub async fn end(&mut self) -> Result<(), SockError> {
        let res = self
            .sock
            .write_msg(MsgType::StreamReqPart, Some(&self.id), "", 0, &[])
            .await;
        if res.is_err() {
            self.sock.dealloc_res_chan(&self.id);
        }
        res
    }
}

/// Writes response chunks for an inbound streaming request. Cloneable;
/// the terminal empty chunk is emitted at most once no matter how many
/// clones call [`end`](StreamWriter::end).
#[derive(Clone)]
pub struct StreamWriter {
    sock: Arc<Sock>,
    id: RequestId,
    ended: Arc<AtomicBool>,
}

impl StreamWriter {
    /// Write one response chunk. An empty chunk ends the stream.
    pub async fn write(&self, chunk: &[u8]) -> Result<(), SockError> {
        if chunk.is_empty() {
            return self.end().await;
        }
        self.sock
            .write_msg(MsgType::StreamRes, Some(&self.id), "", 0, chunk)
            .await
    }

    /// End the response stream. Idempotent.
    pub async fn end(&self) -> Result<(), SockError> {
        if self.ended.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.sock
            .write_msg(MsgType::StreamRes, Some(&self.id), "", 0, &[])
            .await
    }
}

// ----------------------------------------------------------------------
// Constructors

/// Two connected in-memory sockets, for tests and in-process plumbing.
/// No handshake is performed and heartbeats are disabled; both read loops
/// run with unlimited admission.
pub async fn pipe(a: Arc<Handlers>, b: Arc<Handlers>) -> (Arc<Sock>, Arc<Sock>) {
    pipe_with_limits(a, Limits::unlimited(), b, Limits::unlimited()).await
}

/// [`pipe`] with explicit per-side limits.
pub async fn pipe_with_limits(
    a: Arc<Handlers>,
    a_limits: Limits,
    b: Arc<Handlers>,
    b_limits: Limits,
) -> (Arc<Sock>, Arc<Sock>) {
    let (sa, sb) = io::duplex(64 * 1024);
    let s1 = Sock::new(a);
    let s2 = Sock::new(b);
    s1.adopt_pipe(sa).await;
    s2.adopt_pipe(sb).await;
    spawn_read(&s1, a_limits);
    spawn_read(&s2, b_limits);
    (s1, s2)
}

/// Connect to a TCP peer. The returned socket has completed its handshake
/// and is reading on a background task.
pub async fn connect<A>(addr: A, handlers: Arc<Handlers>) -> Result<Arc<Sock>, SockError>
where
    A: ToSocketAddrs,
{
    let stream = TcpStream::connect(addr).await?;
    if let Err(err) = crate::server::set_tcp_keepalive(&stream) {
        warn!("failed to enable tcp keepalive: {}", err);
    }
    let peer = stream.peer_addr().ok().map(|a| a.to_string());
    let sock = Sock::new(handlers);
    sock.set_heartbeat_interval(DEFAULT_HEARTBEAT_INTERVAL);
    sock.adopt(stream, peer).await;
    sock.handshake().await?;
    spawn_read(&sock, Limits::default());
    Ok(sock)
}

/// Connect to a Unix-domain peer.
pub async fn connect_unix(path: impl AsRef<Path>, handlers: Arc<Handlers>) -> Result<Arc<Sock>, SockError> {
    let stream = UnixStream::connect(path).await?;
    let sock = Sock::new(handlers);
    sock.set_heartbeat_interval(DEFAULT_HEARTBEAT_INTERVAL);
    sock.adopt(stream, None).await;
    sock.handshake().await?;
    spawn_read(&sock, Limits::default());
    Ok(sock)
}

pub(crate) fn spawn_read(sock: &Arc<Sock>, limits: Limits) {
    let sock = Arc::clone(sock);
    tokio::spawn(async move {
        if let Err(err) = sock.read_loop(limits).await {
            debug!("connection closed: {}", err);
        }
    });
}
