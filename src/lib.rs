#![warn(future_incompatible, nonstandard_style, rust_2018_idioms, unused)]
#![warn(clippy::pedantic)]
#![allow(
    clippy::doc_markdown,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::similar_names,
    clippy::cast_possible_truncation
)]

//! A symmetric, bidirectional, message-multiplexed request/response protocol
//! over any reliable byte stream. Either peer may issue requests,
//! notifications and streaming requests while serving the other's; many
//! concurrent operations share one connection, correlated by small
//! per-connection request ids.

mod handlers;
mod limits;
pub mod protocol;
mod server;
mod sock;
mod types;

pub use bytes::Bytes;
pub use crate::{
    handlers::{BufferHandler, Handlers, NotificationHandler, StreamHandler, StreamReader},
    limits::Limits,
    server::{listen, listen_unix, Server},
    sock::{
        connect, connect_unix, pipe, pipe_with_limits, Sock, StreamRequest, StreamWriter,
        DEFAULT_HEARTBEAT_INTERVAL,
    },
    types::{MsgType, ProtoErr, RequestId, Response, SockError, PROTOCOL_VERSION},
};
