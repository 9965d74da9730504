//! Length-delimited framing for the local socket.
//!
//! ```text
//! [ 4 bytes: body length, big-endian u32 ][ body: UTF-8 JSON ]
//! ```
//!
//! Bodies larger than [`MAX_FRAME_LENGTH`] are refused before any of the
//! body is read, so a hostile length prefix cannot make us allocate.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use thiserror::Error;

use crate::config::MAX_FRAME_LENGTH;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("peer closed the connection")]
    Closed,

    #[error("frame of {0} bytes exceeds the {max} byte limit", max = MAX_FRAME_LENGTH)]
    FrameTooLarge(usize),

    #[error("timed out")]
    Timeout,
}

/// Read one frame body.
pub async fn read_frame<R>(reader: &mut R) -> Result<Vec<u8>, TransportError>
where
    R: AsyncRead + Unpin,
{
    let mut prefix = [0u8; 4];
    match reader.read_exact(&mut prefix).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Err(TransportError::Closed),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_be_bytes(prefix) as usize;
    if len > MAX_FRAME_LENGTH {
        return Err(TransportError::FrameTooLarge(len));
    }

    let mut body = vec![0u8; len];
    match reader.read_exact(&mut body).await {
        Ok(_) => Ok(body),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Err(TransportError::Closed),
        Err(e) => Err(e.into()),
    }
}

/// Write one frame and flush it.
pub async fn write_frame<W>(writer: &mut W, body: &[u8]) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin,
{
    if body.len() > MAX_FRAME_LENGTH {
        return Err(TransportError::FrameTooLarge(body.len()));
    }
    writer.write_all(&(body.len() as u32).to_be_bytes()).await?;
    writer.write_all(body).await?;
    writer.flush().await?;
    Ok(())
}
