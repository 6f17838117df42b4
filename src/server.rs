use crate::handlers::Handlers;
use crate::limits::Limits;
use crate::sock::{Sock, DEFAULT_HEARTBEAT_INTERVAL};
use crate::types::SockError;
use log::{debug, warn};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs, UnixListener};

const KEEPALIVE_PERIOD: Duration = Duration::from_secs(30);
const ACCEPT_BACKOFF_START: Duration = Duration::from_millis(10);
const ACCEPT_BACKOFF_CAP: Duration = Duration::from_secs(1);

pub(crate) fn set_tcp_keepalive(stream: &TcpStream) -> io::Result<()> {
    let keepalive = socket2::TcpKeepalive::new().with_time(KEEPALIVE_PERIOD);
    socket2::SockRef::from(stream).set_tcp_keepalive(&keepalive)
}

enum Listener {
    Tcp(TcpListener),
    Unix(UnixListener),
}

/// Accepts connections and runs a [`Sock`] per accepted stream. Accepted
/// sockets inherit the server's handlers, limits and heartbeat policy.
pub struct Server {
    handlers: Arc<Handlers>,
    limits: Limits,
    heartbeat_interval: Duration,
    on_accept: Option<Arc<dyn Fn(Arc<Sock>) + Send + Sync>>,
    on_heartbeat: Option<Arc<dyn Fn(u16, u32) + Send + Sync>>,
    listener: Listener,
}

/// Bind a TCP listener. Call [`Server::accept`] to start serving.
pub async fn listen<A>(addr: A, handlers: Arc<Handlers>) -> Result<Server, SockError>
where
    A: ToSocketAddrs,
{
    let listener = TcpListener::bind(addr).await?;
    Ok(Server::new(Listener::Tcp(listener), handlers))
}

/// Bind a Unix-domain listener. The socket path is unlinked again when the
/// process is interrupted or terminated.
pub async fn listen_unix(path: impl AsRef<Path>, handlers: Arc<Handlers>) -> Result<Server, SockError> {
    let path = path.as_ref().to_path_buf();
    let listener = UnixListener::bind(&path)?;
    spawn_unlink_on_signal(path);
    Ok(Server::new(Listener::Unix(listener), handlers))
}

fn spawn_unlink_on_signal(path: PathBuf) {
    tokio::spawn(async move {
        use tokio::signal::unix::{signal, SignalKind};
        let (Ok(mut int), Ok(mut term)) =
            (signal(SignalKind::interrupt()), signal(SignalKind::terminate()))
        else {
            warn!("failed to install signal handlers for {:?}", path);
            return;
        };
        tokio::select! {
            _ = int.recv() => {}
            _ = term.recv() => {}
        }
        if let Err(err) = std::fs::remove_file(&path) {
            warn!("failed to unlink {:?}: {}", path, err);
        }
        std::process::exit(0);
    });
}

impl Server {
    fn new(listener: Listener, handlers: Arc<Handlers>) -> Self {
        Self {
            handlers,
            limits: Limits::default(),
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            on_accept: None,
            on_heartbeat: None,
            listener,
        }
    }

    /// Admission budget shared by every accepted socket.
    pub fn set_limits(&mut self, limits: Limits) {
        self.limits = limits;
    }

    #[must_use]
    pub fn limits(&self) -> &Limits {
        &self.limits
    }

    pub fn set_heartbeat_interval(&mut self, d: Duration) {
        self.heartbeat_interval = d;
    }

    /// Invoked right after a socket completes its handshake, before its
    /// read loop starts; no messages are dispatched until it returns.
    pub fn set_accept_handler(&mut self, f: impl Fn(Arc<Sock>) + Send + Sync + 'static) {
        self.on_accept = Some(Arc::new(f));
    }

    /// Observe heartbeats on every accepted socket.
    pub fn set_heartbeat_handler(&mut self, f: impl Fn(u16, u32) + Send + Sync + 'static) {
        self.on_heartbeat = Some(Arc::new(f));
    }

    /// Address the server is listening at.
    #[must_use]
    pub fn local_addr(&self) -> Option<String> {
        match &self.listener {
            Listener::Tcp(l) => l.local_addr().ok().map(|a| a.to_string()),
            Listener::Unix(l) => l
                .local_addr()
                .ok()
                .and_then(|a| a.as_pathname().map(|p| p.display().to_string())),
        }
    }

    /// Accept connections until a fatal listener error. Transient accept
    /// failures back off exponentially, capped at one second.
    pub async fn accept(&self) -> Result<(), SockError> {
        let mut backoff = ACCEPT_BACKOFF_START;
        loop {
            let err = match &self.listener {
                Listener::Tcp(l) => match l.accept().await {
                    Ok((stream, addr)) => {
                        if let Err(err) = set_tcp_keepalive(&stream) {
                            warn!("failed to enable tcp keepalive: {}", err);
                        }
                        self.spawn_sock(stream, Some(addr.to_string()));
                        backoff = ACCEPT_BACKOFF_START;
                        continue;
                    }
                    Err(err) => err,
                },
                Listener::Unix(l) => match l.accept().await {
                    Ok((stream, _)) => {
                        self.spawn_sock(stream, None);
                        backoff = ACCEPT_BACKOFF_START;
                        continue;
                    }
                    Err(err) => err,
                },
            };
            if !is_transient(&err) {
                return Err(err.into());
            }
            warn!("accept failed: {}; retrying in {:?}", err, backoff);
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(ACCEPT_BACKOFF_CAP);
        }
    }

    fn spawn_sock<S>(&self, stream: S, peer: Option<String>)
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let sock = Sock::new(Arc::clone(&self.handlers));
        sock.set_heartbeat_interval(self.heartbeat_interval);
        if let Some(cb) = &self.on_heartbeat {
            let cb = Arc::clone(cb);
            sock.set_heartbeat_handler(move |load, time| cb(load, time));
        }
        let limits = self.limits.clone();
        let on_accept = self.on_accept.clone();
        tokio::spawn(async move {
            sock.adopt(stream, peer).await;
            if let Err(err) = sock.handshake().await {
                debug!("handshake failed: {}", err);
                return;
            }
            if let Some(hook) = on_accept {
                hook(Arc::clone(&sock));
            }
            if let Err(err) = sock.read_loop(limits).await {
                debug!("connection closed: {}", err);
            }
        });
    }
}

fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
    )
}
