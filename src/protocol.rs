use crate::types::{MsgType, RequestId, SockError, PROTOCOL_VERSION};
use num_traits::FromPrimitive;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Operation and notification names are length-prefixed with three hex digits.
pub const MAX_NAME_LEN: usize = 0xfff;

/// Scratch space large enough for any header `read_msg` can decode.
pub const SCRATCH_LEN: usize = 20 + MAX_NAME_LEN;

const HEX: &[u8; 16] = b"0123456789abcdef";

fn push_hex(b: &mut Vec<u8>, v: u32, digits: usize) {
    for i in (0..digits).rev() {
        b.push(HEX[((v >> (i * 4)) & 0xf) as usize]);
    }
}

fn parse_hex(b: &[u8]) -> Result<u32, SockError> {
    let s = std::str::from_utf8(b).map_err(|_| SockError::InvalidMessage)?;
    u32::from_str_radix(s, 16).map_err(|_| SockError::InvalidMessage)
}

/// Write the protocol version this side implements, as two hex digits.
pub async fn write_version<W>(w: &mut W) -> Result<(), SockError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut b = Vec::with_capacity(2);
    push_hex(&mut b, u32::from(PROTOCOL_VERSION), 2);
    w.write_all(&b).await?;
    w.flush().await?;
    Ok(())
}

/// Read the version the peer implements. Fails with
/// [`SockError::UnsupportedProtocol`] when the versions are incompatible.
pub async fn read_version<R>(r: &mut R) -> Result<u8, SockError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut b = [0u8; 2];
    r.read_exact(&mut b).await?;
    let n = parse_hex(&b)?;
    if n != u32::from(PROTOCOL_VERSION) {
        return Err(SockError::UnsupportedProtocol(
            String::from_utf8_lossy(&b).into_owned(),
        ));
    }
    Ok(n as u8)
}

/// Encode a message header. The payload is not copied here; the caller
/// writes exactly `size` payload bytes right after the returned header.
///
/// `wait` is only emitted for [`MsgType::RetryRes`]. For
/// [`MsgType::ProtocolError`], `size` carries the error code.
#[must_use]
pub fn encode_msg(t: MsgType, id: Option<&RequestId>, name: &str, wait: u32, size: u32) -> Vec<u8> {
    debug_assert!(name.len() <= MAX_NAME_LEN, "operation name too long");
    let mut b = Vec::with_capacity(1 + 4 + 3 + name.len() + 8 + 8);
    b.push(t as u8);
    if let Some(id) = id {
        b.extend_from_slice(id);
    }
    if !name.is_empty() {
        push_hex(&mut b, name.len() as u32, 3);
        b.extend_from_slice(name.as_bytes());
    }
    if t == MsgType::RetryRes {
        push_hex(&mut b, wait, 8);
    }
    push_hex(&mut b, size, 8);
    b
}

/// Encode a heartbeat message carrying a load metric and a unix timestamp
/// in seconds. Heartbeats have no payload.
#[must_use]
pub fn encode_heartbeat(load: u16, unix_secs: u32) -> Vec<u8> {
    let mut b = Vec::with_capacity(13);
    b.push(MsgType::Heartbeat as u8);
    push_hex(&mut b, u32::from(load), 4);
    push_hex(&mut b, unix_secs, 8);
    b
}

/// A decoded message header. The payload, when `size != 0`, follows on the
/// stream and is read by the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Msg {
    pub t: MsgType,
    /// Zeroed for messages that carry no id.
    pub id: RequestId,
    /// Empty for messages that carry no name.
    pub name: String,
    /// Retry wait in milliseconds; the load metric for `Heartbeat`.
    pub wait: u32,
    /// Payload size; the timestamp for `Heartbeat`; the error code for
    /// `ProtocolError`.
    pub size: u32,
}

/// Read one message header from `r`, consuming exactly the bytes the
/// detected type requires. `scratch` must be at least [`SCRATCH_LEN`] bytes
/// and is reused across calls to avoid per-message allocation.
pub async fn read_msg<R>(r: &mut R, scratch: &mut [u8]) -> Result<Msg, SockError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut tb = [0u8; 1];
    r.read_exact(&mut tb).await?;
    let t = MsgType::from_u8(tb[0]).ok_or(SockError::InvalidMessage)?;

    let mut id: RequestId = [0; 4];
    let mut name = String::new();
    let mut wait = 0;
    let size;

    match t {
        MsgType::Heartbeat => {
            let b = &mut scratch[..12];
            r.read_exact(b).await?;
            wait = parse_hex(&b[..4])?;
            size = parse_hex(&b[4..12])?;
        }
        MsgType::ProtocolError => {
            // The shortest message on the wire; EOF right after it is fine.
            let b = &mut scratch[..8];
            r.read_exact(b).await?;
            size = parse_hex(b)?;
        }
        MsgType::SingleReq | MsgType::StreamReq => {
            let b = &mut scratch[..7];
            r.read_exact(b).await?;
            id.copy_from_slice(&b[..4]);
            let namez = parse_hex(&b[4..7])? as usize;
            name = read_name(r, scratch, namez).await?;
            let b = &mut scratch[..8];
            r.read_exact(b).await?;
            size = parse_hex(b)?;
        }
        MsgType::Notification => {
            let b = &mut scratch[..3];
            r.read_exact(b).await?;
            let namez = parse_hex(b)? as usize;
            name = read_name(r, scratch, namez).await?;
            let b = &mut scratch[..8];
            r.read_exact(b).await?;
            size = parse_hex(b)?;
        }
        MsgType::RetryRes => {
            let b = &mut scratch[..20];
            r.read_exact(b).await?;
            id.copy_from_slice(&b[..4]);
            wait = parse_hex(&b[4..12])?;
            size = parse_hex(&b[12..20])?;
        }
        MsgType::StreamReqPart | MsgType::SingleRes | MsgType::StreamRes | MsgType::ErrorRes => {
            let b = &mut scratch[..12];
            r.read_exact(b).await?;
            id.copy_from_slice(&b[..4]);
            size = parse_hex(&b[4..12])?;
        }
    }

    Ok(Msg {
        t,
        id,
        name,
        wait,
        size,
    })
}

async fn read_name<R>(r: &mut R, scratch: &mut [u8], namez: usize) -> Result<String, SockError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    if namez == 0 {
        return Ok(String::new());
    }
    let b = &mut scratch[..namez];
    r.read_exact(b).await?;
    Ok(std::str::from_utf8(b)
        .map_err(|_| SockError::InvalidMessage)?
        .to_owned())
}
