//! Length-prefixed framing used on the scoring connection.
//!
//! Every message, in both directions:
//!
//!   [0..8]    payload_len  (u64 big-endian, must be 1..=max)
//!   [8..8+N]  payload      (N = payload_len bytes)
//!
//! Requests carry the opaque frame bytes. Responses carry a JSON
//! [`ScoreResponse`](crate::frame::ScoreResponse). There is no pipelining:
//! the client writes one request and reads exactly one response.

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

pub const LENGTH_PREFIX_SIZE: usize = 8;

/// Upper bound on a single payload unless configured otherwise (16 MiB).
pub const DEFAULT_MAX_MESSAGE_BYTES: u64 = 16 * 1024 * 1024;

#[derive(Debug, Clone, thiserror::Error)]
pub enum WireError {
    #[error("connection lost: {0}")]
    ConnectionLost(String),
    #[error("protocol error: {0}")]
    Protocol(String),
}

fn check_length(len: u64, max: u64) -> Result<usize, WireError> {
    if len == 0 {
        return Err(WireError::Protocol("zero-length message".into()));
    }
    if len > max {
        return Err(WireError::Protocol(format!(
            "message length {len} exceeds limit of {max} bytes"
        )));
    }
    usize::try_from(len)
        .map_err(|_| WireError::Protocol(format!("message length {len} does not fit in memory")))
}

/// Build the length prefix for a payload of `len` bytes.
pub fn encode_length(len: usize, max: u64) -> Result<[u8; LENGTH_PREFIX_SIZE], WireError> {
    check_length(len as u64, max)?;
    Ok((len as u64).to_be_bytes())
}

/// Validate a received length prefix and return the payload size it announces.
pub fn decode_length(prefix: [u8; LENGTH_PREFIX_SIZE], max: u64) -> Result<usize, WireError> {
    check_length(u64::from_be_bytes(prefix), max)
}

/// Encode a full message (prefix + payload) into one buffer.
pub fn encode_message(payload: &[u8], max: u64) -> Result<Vec<u8>, WireError> {
    let prefix = encode_length(payload.len(), max)?;
    let mut buf = Vec::with_capacity(LENGTH_PREFIX_SIZE + payload.len());
    buf.extend_from_slice(&prefix);
    buf.extend_from_slice(payload);
    Ok(buf)
}

/// Write one message and flush it.
pub async fn write_message<W>(writer: &mut W, payload: &[u8], max: u64) -> Result<(), WireError>
where
    W: AsyncWrite + Unpin,
{
    let prefix = encode_length(payload.len(), max)?;
    writer.write_all(&prefix).await.map_err(lost)?;
    writer.write_all(payload).await.map_err(lost)?;
    writer.flush().await.map_err(lost)?;
    trace!(len = payload.len(), "wrote message");
    Ok(())
}

/// Read one message and return its payload.
///
/// A single `read` may return fewer bytes than asked for, so both the prefix
/// and the payload are accumulated until complete. EOF at any point, even
/// before the first prefix byte, is reported as `ConnectionLost`.
pub async fn read_message<R>(reader: &mut R, max: u64) -> Result<Bytes, WireError>
where
    R: AsyncRead + Unpin,
{
    let mut prefix = [0u8; LENGTH_PREFIX_SIZE];
    fill(reader, &mut prefix, "length prefix").await?;
    let len = decode_length(prefix, max)?;
    trace!(len, "reading message payload");

    let mut payload = BytesMut::zeroed(len);
    fill(reader, &mut payload, "payload").await?;
    Ok(payload.freeze())
}

async fn fill<R>(reader: &mut R, buf: &mut [u8], what: &str) -> Result<(), WireError>
where
    R: AsyncRead + Unpin,
{
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await.map_err(lost)?;
        if n == 0 {
            return Err(WireError::ConnectionLost(format!(
                "stream closed after {filled} of {} {what} bytes",
                buf.len()
            )));
        }
        filled += n;
    }
    Ok(())
}

fn lost(e: std::io::Error) -> WireError {
    WireError::ConnectionLost(e.to_string())
}
