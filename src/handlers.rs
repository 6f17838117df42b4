use crate::sock::{Sock, StreamWriter};
use bytes::Bytes;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc;

type BoxFut<T> = Pin<Box<dyn Future<Output = T> + Send + 'static>>;

/// Chunk source handed to a streaming-request handler. `recv()` yields
/// `Some(Some(chunk))` per inbound part, `Some(None)` exactly once at
/// end-of-stream, and `None` if the connection closes underneath the stream.
pub type StreamReader = mpsc::Receiver<Option<Bytes>>;

/// Handles a single-buffer request: `Ok` payload becomes the response,
/// `Err` is reported to the peer as an error response.
pub type BufferHandler = Arc<dyn Fn(Arc<Sock>, String, Bytes) -> BoxFut<anyhow::Result<Bytes>> + Send + Sync>;

/// Handles a streaming request: reads chunks from the [`StreamReader`] until
/// end-of-stream and writes response chunks through the [`StreamWriter`].
pub type StreamHandler =
    Arc<dyn Fn(Arc<Sock>, String, StreamReader, StreamWriter) -> BoxFut<anyhow::Result<()>> + Send + Sync>;

/// Handles a one-way notification.
pub type NotificationHandler = Arc<dyn Fn(Arc<Sock>, String, Bytes) -> BoxFut<()> + Send + Sync>;

struct Registry<H> {
    map: HashMap<String, H>,
    fallback: Option<H>,
}

impl<H: Clone> Registry<H> {
    fn set(&mut self, name: &str, handler: H) {
        if name.is_empty() {
            self.fallback = Some(handler);
        } else {
            self.map.insert(name.to_owned(), handler);
        }
    }

    fn find(&self, name: &str) -> Option<H> {
        self.map.get(name).cloned().or_else(|| self.fallback.clone())
    }
}

impl<H> Default for Registry<H> {
    fn default() -> Self {
        Self {
            map: HashMap::new(),
            fallback: None,
        }
    }
}

/// Maps operation and notification names to handlers. Sockets hold a shared
/// reference, so handlers may be registered before or after connections
/// exist; lookup is the hot path and takes a read lock only.
///
/// Registering under the empty name installs a fallback used when no
/// specific name matches.
#[derive(Default)]
pub struct Handlers {
    buffer: RwLock<Registry<BufferHandler>>,
    stream: RwLock<Registry<StreamHandler>>,
    note: RwLock<Registry<NotificationHandler>>,
}

impl Handlers {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a single-buffer request handler for `op` (empty = fallback).
    pub fn handle<F, Fut>(&self, op: &str, f: F)
    where
        F: Fn(Arc<Sock>, String, Bytes) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Bytes>> + Send + 'static,
    {
        let handler: BufferHandler = Arc::new(move |sock, op, payload| Box::pin(f(sock, op, payload)));
        self.buffer.write().expect("handler registry lock").set(op, handler);
    }

    /// Register a streaming request handler for `op` (empty = fallback).
    pub fn handle_stream<F, Fut>(&self, op: &str, f: F)
    where
        F: Fn(Arc<Sock>, String, StreamReader, StreamWriter) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let handler: StreamHandler =
            Arc::new(move |sock, op, chunks, writer| Box::pin(f(sock, op, chunks, writer)));
        self.stream.write().expect("handler registry lock").set(op, handler);
    }

    /// Register a notification handler for `name` (empty = fallback).
    pub fn handle_notification<F, Fut>(&self, name: &str, f: F)
    where
        F: Fn(Arc<Sock>, String, Bytes) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handler: NotificationHandler =
            Arc::new(move |sock, name, payload| Box::pin(f(sock, name, payload)));
        self.note.write().expect("handler registry lock").set(name, handler);
    }

    pub(crate) fn find_buffer(&self, op: &str) -> Option<BufferHandler> {
        self.buffer.read().expect("handler registry lock").find(op)
    }

    pub(crate) fn find_stream(&self, op: &str) -> Option<StreamHandler> {
        self.stream.read().expect("handler registry lock").find(op)
    }

    pub(crate) fn find_notification(&self, name: &str) -> Option<NotificationHandler> {
        self.note.read().expect("handler registry lock").find(name)
    }
}

#[cfg(feature = "json")]
impl Handlers {
    /// Register a request handler with JSON-encoded input and output values.
    /// The wrapper decodes the payload into `P` before calling `f` and
    /// encodes its `R` result; the protocol engine itself stays unaware of
    /// the encoding.
    pub fn handle_json<P, R, F, Fut>(&self, op: &str, f: F)
    where
        P: serde::de::DeserializeOwned + Send + 'static,
        R: serde::Serialize + Send + 'static,
        F: Fn(Arc<Sock>, P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
    {
        self.handle(op, move |sock, _op, payload: Bytes| {
            let fut = serde_json::from_slice::<P>(&payload)
                .map_err(anyhow::Error::from)
                .map(|params| f(sock, params));
            async move {
                let out = fut?.await?;
                Ok(Bytes::from(serde_json::to_vec(&out)?))
            }
        });
    }

    /// Register a notification handler with a JSON-encoded value. Payloads
    /// that fail to decode are dropped.
    pub fn handle_notification_json<P, F, Fut>(&self, name: &str, f: F)
    where
        P: serde::de::DeserializeOwned + Send + 'static,
        F: Fn(Arc<Sock>, String, P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.handle_notification(name, move |sock, name, payload: Bytes| {
            let fut = serde_json::from_slice::<P>(&payload)
                .ok()
                .map(|value| f(sock, name, value));
            async move {
                if let Some(fut) = fut {
                    fut.await;
                }
            }
        });
    }
}
