//! Protocol selection preamble.
//!
//! Before any transfer bytes, the dialer proposes a protocol line and the
//! listener echoes it back to accept:
//!
//!   dialer   → "/cairn/transfer/1.0.0\n"
//!   listener → "/cairn/transfer/1.0.0\n"   (accept)
//!            | "na\n" and close          (reject)
//!
//! Lines are read one byte at a time so nothing past the newline is consumed;
//! the transfer header that follows belongs to the session.

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const TRANSFER_PROTOCOL: &str = "/cairn/transfer/1.0.0";

const REJECT: &str = "na";

/// Longest protocol line accepted, excluding the newline.
const MAX_PROTOCOL_LINE: usize = 128;

#[derive(Debug, Error)]
pub enum NegotiateError {
    #[error("peer rejected /cairn/transfer/1.0.0")]
    Rejected,

    #[error("peer proposed unsupported protocol {0:?}")]
    Unsupported(String),

    #[error("protocol line too long or not UTF-8")]
    BadLine,

    #[error("negotiation I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

async fn write_line<W>(w: &mut W, line: &str) -> Result<(), NegotiateError>
where
    W: AsyncWrite + Unpin,
{
    w.write_all(line.as_bytes()).await?;
    w.write_all(b"\n").await?;
    w.flush().await?;
    Ok(())
}

async fn read_line<R>(r: &mut R) -> Result<String, NegotiateError>
where
    R: AsyncRead + Unpin,
{
    let mut line = Vec::new();
    loop {
        let b = r.read_u8().await?;
        if b == b'\n' {
            break;
        }
        if line.len() == MAX_PROTOCOL_LINE {
            return Err(NegotiateError::BadLine);
        }
        line.push(b);
    }
    String::from_utf8(line).map_err(|_| NegotiateError::BadLine)
}

/// Dialer side: propose the transfer protocol and wait for the echo.
pub async fn propose<S>(stream: &mut S) -> Result<(), NegotiateError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    write_line(stream, TRANSFER_PROTOCOL).await?;
    let reply = read_line(stream).await?;
    if reply == TRANSFER_PROTOCOL {
        Ok(())
    } else {
        Err(NegotiateError::Rejected)
    }
}

/// Listener side: read the proposal, echo it if supported.
pub async fn answer<S>(stream: &mut S) -> Result<(), NegotiateError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let proposal = read_line(stream).await?;
    if proposal == TRANSFER_PROTOCOL {
        write_line(stream, TRANSFER_PROTOCOL).await
    } else {
        // Best effort; the connection is dropped either way.
        let _ = write_line(stream, REJECT).await;
        Err(NegotiateError::Unsupported(proposal))
    }
}
