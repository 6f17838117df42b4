use bytes::Bytes;
use num_derive::{FromPrimitive, ToPrimitive};

/// Version of the wire protocol this crate implements.
pub const PROTOCOL_VERSION: u8 = 1;

/// A request id: the little-endian encoding of a per-connection counter.
/// Unique among the sender's currently-pending outbound requests and echoed
/// back unchanged by the peer.
pub type RequestId = [u8; 4];

/// Wire message types. Each variant is the printable ASCII tag byte that
/// leads its message on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, FromPrimitive, ToPrimitive)]
#[repr(u8)]
pub enum MsgType {
    SingleReq = b'r',
    StreamReq = b's',
    StreamReqPart = b'p',
    SingleRes = b'R',
    StreamRes = b'S',
    ErrorRes = b'E',
    RetryRes = b'e',
    Notification = b'n',
    Heartbeat = b'h',
    ProtocolError = b'f',
}

/// Protocol-error codes carried by a `ProtocolError` message. Receiving one
/// of these is terminal for the connection.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    FromPrimitive,
    ToPrimitive,
    derive_more::Display,
)]
#[repr(u32)]
pub enum ProtoErr {
    #[display(fmt = "abnormal condition")]
    Abnormal = 0,
    #[display(fmt = "unsupported protocol")]
    Unsupported = 1,
    #[display(fmt = "invalid protocol message")]
    InvalidMsg = 2,
    #[display(fmt = "timeout")]
    Timeout = 3,
}

#[derive(thiserror::Error, Debug)]
pub enum SockError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("unsupported protocol version {0:?}")]
    UnsupportedProtocol(String),
    #[error("invalid protocol message")]
    InvalidMessage,
    #[error("timeout")]
    Timeout,
    #[error("socket closed")]
    Closed,
    #[error("socket not connected")]
    NotConnected,
    #[error("unexpected streaming response")]
    UnexpectedStreamingResponse,
    /// Error reported by the peer in an `ErrorRes` payload.
    #[error("{0}")]
    Remote(String),
    /// Connection was terminated by a protocol error, locally or by the peer.
    #[error("{0}")]
    Protocol(ProtoErr),
    #[cfg(feature = "json")]
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// A correlated response delivered to the requestor. `wait` is the suggested
/// retry interval in milliseconds when `is_retry()`, and carries the
/// protocol-error code on terminal errors delivered by a closing connection.
#[derive(Debug, Clone)]
pub struct Response {
    pub msg_type: MsgType,
    pub data: Bytes,
    pub wait: u32,
}

impl Response {
    #[must_use]
    pub fn is_error(&self) -> bool {
        self.msg_type == MsgType::ErrorRes
    }

    #[must_use]
    pub fn is_retry(&self) -> bool {
        self.msg_type == MsgType::RetryRes
    }

    #[must_use]
    pub fn is_streaming(&self) -> bool {
        self.msg_type == MsgType::StreamRes
    }

    /// Describes the error when `is_error()`.
    #[must_use]
    pub fn error_text(&self) -> String {
        String::from_utf8_lossy(&self.data).into_owned()
    }
}
