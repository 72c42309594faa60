// codec.rs - Length-Prefixed Framing
//
//! Framing for byte-stream media (Unix and TCP sockets).
//!
//! Every frame is a 4-byte big-endian length followed by that many bytes of
//! body. A body that fails to decode is a [`FramingError`]; the stream stays
//! usable because the length prefix already told us where the next frame
//! starts. Only an oversized or truncated frame forces the connection closed.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use thiserror::Error;

/// Length prefix size in bytes
pub const HEADER_LEN: usize = 4;

/// Default upper bound for a single frame body (1 MB)
pub const DEFAULT_MAX_FRAME: u32 = 1024 * 1024;

/// Errors raised while framing or decoding inbound data
#[derive(Debug, Error)]
pub enum FramingError {
    #[error("Frame too large: {size} bytes (max {max})")]
    TooLarge { size: u32, max: u32 },

    #[error("Truncated frame: expected {expected} bytes, got {got}")]
    Truncated { expected: usize, got: usize },

    #[error("Decode failed: {0}")]
    Decode(String),

    #[error("Encode failed: {0}")]
    Encode(String),

    #[error("Malformed header: {0}")]
    Header(String),
}

impl FramingError {
    /// Whether the byte stream can continue after this error
    pub fn is_recoverable(&self) -> bool {
        matches!(self, FramingError::Decode(_) | FramingError::Header(_))
    }
}

/// Prefix a body with its 4-byte big-endian length
pub fn encode_frame(body: &[u8]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(HEADER_LEN + body.len());
    bytes.extend_from_slice(&(body.len() as u32).to_be_bytes());
    bytes.extend_from_slice(body);
    bytes
}

/// Decode the length prefix from a 4-byte header
pub fn decode_length(header: &[u8; HEADER_LEN]) -> u32 {
    u32::from_be_bytes(*header)
}

/// Result of reading one frame off a stream
#[derive(Debug)]
pub enum ReadFrame {
    /// A complete frame body
    Frame(Vec<u8>),
    /// The peer closed the stream cleanly between frames
    Closed,
}

/// Write one frame and flush it
pub async fn write_frame<W>(writer: &mut W, body: &[u8]) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&encode_frame(body)).await?;
    writer.flush().await
}

/// Read one frame.
///
/// Returns `Ok(Err(_))` for framing violations so callers can tell them
/// apart from I/O failures on the underlying stream.
pub async fn read_frame<R>(
    reader: &mut R,
    max_frame: u32,
) -> std::io::Result<Result<ReadFrame, FramingError>>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_LEN];
    let mut filled = 0;
    while filled < HEADER_LEN {
        let n = reader.read(&mut header[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(Ok(ReadFrame::Closed));
            }
            return Ok(Err(FramingError::Truncated {
                expected: HEADER_LEN,
                got: filled,
            }));
        }
        filled += n;
    }

    let len = decode_length(&header);
    if len > max_frame {
        return Ok(Err(FramingError::TooLarge {
            size: len,
            max: max_frame,
        }));
    }

    let mut body = vec![0u8; len as usize];
    let mut got = 0;
    while got < body.len() {
        let n = reader.read(&mut body[got..]).await?;
        if n == 0 {
            return Ok(Err(FramingError::Truncated {
                expected: body.len(),
                got,
            }));
        }
        got += n;
    }

    Ok(Ok(ReadFrame::Frame(body)))
}
