//! Byte-exact PostgreSQL message framing.
//!
//! Every message is a 1-byte type tag (absent for the startup message),
//! a 4-byte big-endian length that counts itself, and a payload. Writers
//! build the complete frame in memory before a single `write_all`, so a
//! frame is never left half-written on the stream.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{PgError, Result};

/// Protocol version 3.0 (`0x0003_0000`).
pub const PROTOCOL_VERSION: i32 = 196608;

/// A decoded frame: tag plus payload, length field already validated
/// and stripped.
#[derive(Debug, Clone)]
pub struct RawMessage {
    pub tag: u8,
    pub payload: Bytes,
}

/// Read one tagged backend frame.
///
/// Blocks until the full frame is available; EOF mid-frame surfaces as an
/// [`PgError::Io`]. A declared length below 4 is rejected with
/// [`PgError::Framing`] before any payload is read.
pub async fn read_message<R: AsyncRead + Unpin>(rd: &mut R) -> Result<RawMessage> {
    let mut hdr = [0u8; 5];
    rd.read_exact(&mut hdr).await?;
    let tag = hdr[0];
    let len = i32::from_be_bytes([hdr[1], hdr[2], hdr[3], hdr[4]]);
    if len < 4 {
        return Err(PgError::Framing(format!(
            "invalid backend message length: {len}"
        )));
    }
    let mut buf = vec![0u8; (len - 4) as usize];
    rd.read_exact(&mut buf).await?;
    Ok(RawMessage {
        tag,
        payload: Bytes::from(buf),
    })
}

/// Write the untagged startup message:
/// `int32 len | int32 version | (key\0value\0)* | \0`.
pub async fn write_startup_message<W: AsyncWrite + Unpin>(
    wr: &mut W,
    protocol_version: i32,
    params: &[(&str, &str)],
) -> Result<()> {
    let mut buf = BytesMut::with_capacity(256);
    buf.put_i32(0); // length placeholder
    buf.put_i32(protocol_version);

    for (k, v) in params {
        put_cstring(&mut buf, k);
        put_cstring(&mut buf, v);
    }
    buf.put_u8(0); // terminator

    let len = buf.len() as i32;
    buf[0..4].copy_from_slice(&len.to_be_bytes());

    wr.write_all(&buf).await?;
    wr.flush().await?;
    Ok(())
}

/// Write a simple-query frame: `'Q' | int32 len | sql | \0`.
pub async fn write_query<W: AsyncWrite + Unpin>(wr: &mut W, sql: &str) -> Result<()> {
    let mut buf = BytesMut::with_capacity(sql.len() + 16);
    buf.put_u8(b'Q');
    buf.put_i32(0);
    put_cstring(&mut buf, sql);

    let len = (buf.len() - 1) as i32;
    buf[1..5].copy_from_slice(&len.to_be_bytes());

    wr.write_all(&buf).await?;
    wr.flush().await?;
    Ok(())
}

/// Write a password-message frame: `'p' | int32 len | payload`.
///
/// Carries both SASLInitialResponse and SASLResponse; the payload layout
/// is up to the authentication exchange.
pub async fn write_password_message<W: AsyncWrite + Unpin>(
    wr: &mut W,
    payload: &[u8],
) -> Result<()> {
    let mut buf = BytesMut::with_capacity(payload.len() + 16);
    buf.put_u8(b'p');
    buf.put_i32(0);
    buf.extend_from_slice(payload);

    let len = (buf.len() - 1) as i32;
    buf[1..5].copy_from_slice(&len.to_be_bytes());

    wr.write_all(&buf).await?;
    wr.flush().await?;
    Ok(())
}

/// Append a null-terminated string.
pub fn put_cstring(buf: &mut BytesMut, s: &str) {
    buf.extend_from_slice(s.as_bytes());
    buf.put_u8(0);
}

/// Consume a null-terminated string from a payload buffer.
///
/// A missing terminator means the frame is truncated.
pub fn get_cstring(buf: &mut Bytes) -> Result<String> {
    let pos = buf
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| PgError::Framing("unterminated cstring in payload".into()))?;
    let s = String::from_utf8_lossy(&buf[..pos]).to_string();
    buf.advance(pos + 1);
    Ok(s)
}
