//! Length-prefixed message framing.
//!
//! Wire format:
//!
//! ```text
//! ┌──────────────────┬──────────────────────────┐
//! │ Length (4B, BE)  │ Payload (Length bytes)    │
//! │ unsigned 32-bit  │ UTF-8 text                │
//! └──────────────────┴──────────────────────────┘
//! ```
//!
//! Both blocking (`std::io`) and async (`tokio::io`) variants are provided so
//! the thread and task runtimes speak exactly the same protocol.
//!
//! A read timeout that elapses before the first header byte arrives is
//! reported as [`FrameError::Timeout`]; callers may keep waiting. Once any
//! byte of a frame has been read, a timeout is an I/O error and the
//! connection must be dropped.

use bytes::{BufMut, BytesMut};
use std::io::{self, ErrorKind, Read, Write};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Frame header: big-endian payload length.
pub const HEADER_SIZE: usize = 4;

/// Reply sent while the server keeps accepting messages.
pub const REPLY_OK: &str = "OK";

/// Reply telling the client the server is shutting down.
pub const REPLY_STOP: &str = "STOP";

/// Errors that can occur during frame encoding/decoding.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The caller tried to send a payload larger than the limit.
    #[error("payload too large ({size} bytes, max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    /// The peer declared a payload length above the limit.
    #[error("invalid frame length ({len} bytes, max {max})")]
    InvalidLength { len: u64, max: usize },

    /// The connection was closed before a complete frame was received.
    #[error("connection closed (incomplete frame)")]
    ConnectionClosed,

    /// The payload is not valid UTF-8.
    #[error("frame payload is not valid UTF-8")]
    InvalidUtf8,

    /// No data arrived within the read timeout and no frame is in progress.
    #[error("timed out waiting for a frame")]
    Timeout,

    /// An I/O error occurred while reading or writing frames.
    #[error("frame I/O error: {0}")]
    Io(#[from] io::Error),
}

impl FrameError {
    /// True for errors caused by the peer violating the protocol or hanging up.
    pub fn is_protocol(&self) -> bool {
        matches!(
            self,
            FrameError::InvalidLength { .. } | FrameError::ConnectionClosed | FrameError::InvalidUtf8
        )
    }
}

pub type Result<T> = std::result::Result<T, FrameError>;

/// Encode a payload into header + body.
pub fn encode(payload: &str, max_payload: usize) -> Result<BytesMut> {
    let header = header_for(payload, max_payload)?;
    let mut dst = BytesMut::with_capacity(HEADER_SIZE + payload.len());
    dst.put_slice(&header);
    dst.put_slice(payload.as_bytes());
    Ok(dst)
}

fn header_for(payload: &str, max_payload: usize) -> Result<[u8; HEADER_SIZE]> {
    let size = payload.len();
    if size > max_payload || size > u32::MAX as usize {
        return Err(FrameError::PayloadTooLarge {
            size,
            max: max_payload,
        });
    }
    Ok((size as u32).to_be_bytes())
}

fn check_length(header: [u8; HEADER_SIZE], max_payload: usize) -> Result<usize> {
    let len = u32::from_be_bytes(header);
    if len as u64 > max_payload as u64 {
        return Err(FrameError::InvalidLength {
            len: len as u64,
            max: max_payload,
        });
    }
    Ok(len as usize)
}

fn into_text(payload: Vec<u8>) -> Result<String> {
    String::from_utf8(payload).map_err(|_| FrameError::InvalidUtf8)
}

/// Socket timeouts surface as `WouldBlock` on Unix and `TimedOut` on Windows.
fn is_timeout(err: &io::Error) -> bool {
    matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut)
}

/// Write one frame as a single buffer, then flush.
pub fn write_frame<W: Write>(writer: &mut W, payload: &str, max_payload: usize) -> Result<()> {
    let frame = encode(payload, max_payload)?;
    writer.write_all(&frame)?;
    writer.flush()?;
    Ok(())
}

/// Read one frame (blocking).
///
/// The declared length is validated before any payload buffer is allocated.
pub fn read_frame<R: Read>(reader: &mut R, max_payload: usize) -> Result<String> {
    let mut header = [0u8; HEADER_SIZE];
    fill(reader, &mut header, true)?;
    let len = check_length(header, max_payload)?;

    let mut payload = vec![0u8; len];
    fill(reader, &mut payload, false)?;
    into_text(payload)
}

fn fill<R: Read>(reader: &mut R, buf: &mut [u8], frame_start: bool) -> Result<()> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => return Err(FrameError::ConnectionClosed),
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) if is_timeout(&e) && frame_start && filled == 0 => {
                return Err(FrameError::Timeout)
            }
            Err(e) => return Err(FrameError::Io(e)),
        }
    }
    Ok(())
}

/// Write one frame as a single buffer, then flush.
pub async fn write_frame_async<W: AsyncWrite + Unpin>(
    writer: &mut W,
    payload: &str,
    max_payload: usize,
) -> Result<()> {
    let frame = encode(payload, max_payload)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame, bounding every wait for bytes by `idle` when given.
pub async fn read_frame_async<R: AsyncRead + Unpin>(
    reader: &mut R,
    max_payload: usize,
    idle: Option<Duration>,
) -> Result<String> {
    let mut header = [0u8; HEADER_SIZE];
    fill_async(reader, &mut header, true, idle).await?;
    let len = check_length(header, max_payload)?;

    let mut payload = vec![0u8; len];
    fill_async(reader, &mut payload, false, idle).await?;
    into_text(payload)
}

async fn fill_async<R: AsyncRead + Unpin>(
    reader: &mut R,
    buf: &mut [u8],
    frame_start: bool,
    idle: Option<Duration>,
) -> Result<()> {
    let mut filled = 0;
    while filled < buf.len() {
        // `read` is cancel safe, so dropping it on timeout loses nothing.
        let read = match idle {
            Some(idle) => match tokio::time::timeout(idle, reader.read(&mut buf[filled..])).await {
                Ok(read) => read,
                Err(_) if frame_start && filled == 0 => return Err(FrameError::Timeout),
                Err(_) => {
                    return Err(FrameError::Io(io::Error::new(
                        ErrorKind::TimedOut,
                        "timed out in the middle of a frame",
                    )))
                }
            },
            None => reader.read(&mut buf[filled..]).await,
        };
        match read {
            Ok(0) => return Err(FrameError::ConnectionClosed),
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(FrameError::Io(e)),
        }
    }
    Ok(())
}
