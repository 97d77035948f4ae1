//! Length-prefixed log frame codec
//!
//! Each record travels as a 4-byte big-endian unsigned length followed by
//! that many bytes of a single JSON object `{level, message, category, ts}`.
//! A frame of length 0 terminates the stream.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};

use super::LogRecord;

/// Write one record as a framed JSON line.
///
/// # Errors
///
/// Serialization or socket write failure.
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, record: &LogRecord) -> Result<()> {
    let body = serde_json::to_vec(record)?;
    let len = u32::try_from(body.len())
        .map_err(|_| Error::Transport("log record exceeds frame size".into()))?;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

/// Write the zero-length termination frame.
///
/// # Errors
///
/// Socket write failure.
pub async fn write_end_frame<W: AsyncWrite + Unpin>(writer: &mut W) -> Result<()> {
    writer.write_all(&0u32.to_be_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame's payload bytes.
///
/// Returns `None` on the zero-length termination frame, and also on a clean
/// EOF before a length prefix (the peer vanished without saying goodbye,
/// which ends the stream all the same).
///
/// # Errors
///
/// Socket read failure, or EOF in the middle of a frame.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err.into()),
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    if len == 0 {
        return Ok(None);
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(Some(body))
}

/// Copy one already-read payload back out with its length prefix.
///
/// Used by the forwarder, which relays frames without reparsing them.
///
/// # Errors
///
/// Socket write failure.
pub async fn write_raw_frame<W: AsyncWrite + Unpin>(writer: &mut W, body: &[u8]) -> Result<()> {
    let len = u32::try_from(body.len())
        .map_err(|_| Error::Transport("log record exceeds frame size".into()))?;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(body).await?;
    writer.flush().await?;
    Ok(())
}
