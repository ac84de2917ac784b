//! EOF-framed wire codec.
//!
//! The bridge contract delimits a request by the client half-closing its
//! write side: the daemon reads until end-of-input, decodes one JSON
//! document, writes one JSON response, and closes. There is no length
//! prefix and no second exchange on a connection.

use bytes::BytesMut;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::protocol::{Request, Response};

/// Default cap on a single request payload (10 MiB)
pub const DEFAULT_MAX_REQUEST_SIZE: usize = 10 * 1024 * 1024;

const READ_CHUNK_HINT: usize = 8 * 1024;

/// Errors that can occur while reading or writing wire payloads
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("empty request payload")]
    Empty,

    #[error("request too large: {size} bytes (max: {max})")]
    TooLarge { size: usize, max: usize },
}

/// Read a complete payload until the peer half-closes, enforcing `max_size`.
///
/// # Errors
///
/// Returns `WireError::TooLarge` once the accumulated payload exceeds the
/// cap, `WireError::Empty` for a connection that closed without sending
/// anything, or `WireError::Io` for transport failures.
pub async fn read_payload<R>(reader: &mut R, max_size: usize) -> Result<BytesMut, WireError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(READ_CHUNK_HINT);
    loop {
        let n = reader.read_buf(&mut buf).await?;
        if n == 0 {
            break;
        }
        if buf.len() > max_size {
            return Err(WireError::TooLarge {
                size: buf.len(),
                max: max_size,
            });
        }
    }

    if buf.is_empty() {
        return Err(WireError::Empty);
    }
    Ok(buf)
}

/// Read and decode one request.
///
/// # Errors
///
/// Propagates `read_payload` errors and returns `WireError::Json` for
/// malformed payloads.
pub async fn read_request<R>(reader: &mut R, max_size: usize) -> Result<Request, WireError>
where
    R: AsyncRead + Unpin,
{
    let payload = read_payload(reader, max_size).await?;
    let request: Request = serde_json::from_slice(&payload)?;
    Ok(request)
}

/// Read and decode one response (client side).
///
/// # Errors
///
/// Propagates `read_payload` errors and returns `WireError::Json` for
/// malformed payloads.
pub async fn read_response<R>(reader: &mut R, max_size: usize) -> Result<Response, WireError>
where
    R: AsyncRead + Unpin,
{
    let payload = read_payload(reader, max_size).await?;
    let response: Response = serde_json::from_slice(&payload)?;
    Ok(response)
}

/// Serialize `value` and write it, flushing the stream.
///
/// # Errors
///
/// Returns `WireError::Json` if serialization fails or `WireError::Io` if the
/// write does.
pub async fn write_json<W, T>(writer: &mut W, value: &T) -> Result<(), WireError>
where
    W: AsyncWrite + Unpin,
    T: Serialize + ?Sized,
{
    let payload = serde_json::to_vec(value)?;
    writer.write_all(&payload).await?;
    writer.flush().await?;
    Ok(())
}
