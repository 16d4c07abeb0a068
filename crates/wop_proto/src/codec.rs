//! Line framing for the wire protocol.
//!
//! Messages are `\n`-terminated JSON, UTF-8. Oversized lines are rejected
//! before any JSON parsing: the payload cap is 1 MiB plus 4 KiB of envelope
//! overhead, and the reader stops buffering as soon as that bound is crossed.

use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::envelope::Envelope;

/// Cap on the encrypted payload carried by a single message.
pub const MAX_PAYLOAD_BYTES: usize = 1024 * 1024;
/// Envelope fields, base64 expansion headroom, framing.
pub const MAX_FRAME_OVERHEAD: usize = 4 * 1024;
pub const MAX_FRAME_BYTES: usize = MAX_PAYLOAD_BYTES + MAX_FRAME_OVERHEAD;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Frame exceeds {MAX_FRAME_BYTES} bytes")]
    FrameTooLarge,

    #[error("Stream closed mid-frame")]
    Truncated,

    #[error("Frame is not valid UTF-8")]
    NotUtf8,

    #[error("Frame is not a valid envelope: {0}")]
    BadEnvelope(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Read one frame. Returns `Ok(None)` on a clean end-of-stream. The size
/// bound is enforced while buffering, so a hostile peer cannot make us hold
/// more than `MAX_FRAME_BYTES` + 1 bytes.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<String>, CodecError>
where
    R: AsyncBufRead + Unpin,
{
    let mut buf: Vec<u8> = Vec::new();
    let mut limited = reader.take(MAX_FRAME_BYTES as u64 + 1);
    let n = limited.read_until(b'\n', &mut buf).await?;
    if n == 0 {
        return Ok(None);
    }
    if buf.last() != Some(&b'\n') {
        if buf.len() > MAX_FRAME_BYTES {
            return Err(CodecError::FrameTooLarge);
        }
        return Err(CodecError::Truncated);
    }
    buf.pop();
    String::from_utf8(buf).map(Some).map_err(|_| CodecError::NotUtf8)
}

/// Parse a frame into an envelope. Kept separate from `read_frame` so the
/// size check always runs first.
pub fn parse_frame(line: &str) -> Result<Envelope, CodecError> {
    Ok(serde_json::from_str(line)?)
}

/// Serialise and write one envelope, newline-terminated, flushed.
pub async fn write_frame<W>(writer: &mut W, envelope: &Envelope) -> Result<(), CodecError>
where
    W: AsyncWrite + Unpin,
{
    let json = serde_json::to_string(envelope)?;
    writer.write_all(json.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await?;
    Ok(())
}
