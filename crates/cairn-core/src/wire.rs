//! Length-prefixed framing over an ordered byte stream.
//!
//! The stream has no message boundaries of its own, so every frame carries an
//! explicit size:
//!
//!   [u32 big-endian length L] [L payload bytes]
//!
//! Reads are accumulated until the declared number of bytes has arrived. The
//! length prefix is the only source of frame size; nothing in the payload is
//! interpreted or stripped.

use std::io;

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Size of the length prefix in bytes.
pub const LENGTH_PREFIX_LEN: usize = 4;

/// Largest payload a single frame can describe.
pub const MAX_FRAME_PAYLOAD: usize = u32::MAX as usize;

/// Payload buffer growth per read step. A hostile length prefix costs at most
/// this much memory before the peer has to actually deliver bytes.
const READ_STEP: usize = 64 * 1024;

// ── Frame ─────────────────────────────────────────────────────────────────────

/// One decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    payload: Bytes,
}

impl Frame {
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn into_payload(self) -> Bytes {
        self.payload
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

// ── Encode ────────────────────────────────────────────────────────────────────

fn prefix_for(len: usize) -> Result<[u8; LENGTH_PREFIX_LEN], FrameError> {
    let len = u32::try_from(len).map_err(|_| FrameError::TooLarge(len))?;
    Ok(len.to_be_bytes())
}

/// Encode `payload` as a complete frame.
pub fn encode_frame(payload: &[u8]) -> Result<Bytes, FrameError> {
    let mut buf = BytesMut::with_capacity(LENGTH_PREFIX_LEN + payload.len());
    encode_frame_into(payload, &mut buf)?;
    Ok(buf.freeze())
}

/// Append an encoded frame to `buf`. `buf` is untouched on error.
pub fn encode_frame_into(payload: &[u8], buf: &mut BytesMut) -> Result<(), FrameError> {
    let prefix = prefix_for(payload.len())?;
    buf.reserve(LENGTH_PREFIX_LEN + payload.len());
    buf.put_slice(&prefix);
    buf.put_slice(payload);
    Ok(())
}

// ── Stream I/O ────────────────────────────────────────────────────────────────

/// Write one frame. Partial writes are retried until the whole frame is out.
///
/// Does not flush; callers flush at their own message boundaries.
pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let prefix = prefix_for(payload.len())?;
    writer.write_all(&prefix).await?;
    writer.write_all(payload).await?;
    Ok(())
}

/// Read exactly one frame.
///
/// * fewer than 4 bytes before end of stream → `ShortRead { got }`
///   (`got == 0` means the stream ended cleanly on a frame boundary)
/// * fewer than `L` payload bytes before end of stream → `TruncatedFrame`
pub async fn read_frame<R>(reader: &mut R) -> Result<Frame, FrameError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut prefix = [0u8; LENGTH_PREFIX_LEN];
    let got = read_up_to(reader, &mut prefix).await?;
    if got < LENGTH_PREFIX_LEN {
        return Err(FrameError::ShortRead { got });
    }

    let expected = u32::from_be_bytes(prefix);
    let total = expected as usize;
    let mut payload = BytesMut::with_capacity(total.min(READ_STEP));

    while payload.len() < total {
        let start = payload.len();
        let step = (total - start).min(READ_STEP);
        payload.resize(start + step, 0);

        let n = read_up_to(reader, &mut payload[start..]).await?;
        if n < step {
            return Err(FrameError::TruncatedFrame {
                expected,
                got: start + n,
            });
        }
    }

    Ok(Frame {
        payload: payload.freeze(),
    })
}

/// Fill `buf` from `reader`, stopping early only at end of stream.
/// Returns the number of bytes placed in `buf`.
async fn read_up_to<R>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]).await {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("stream ended after {got} of 4 length-prefix bytes")]
    ShortRead { got: usize },

    #[error("stream ended after {got} of {expected} frame payload bytes")]
    TruncatedFrame { expected: u32, got: usize },

    #[error("payload of {0} bytes does not fit a frame")]
    TooLarge(usize),

    #[error("stream I/O failed: {0}")]
    Io(#[from] io::Error),
}

impl FrameError {
    /// True if the stream closed exactly between two frames.
    pub fn is_clean_eof(&self) -> bool {
        matches!(self, FrameError::ShortRead { got: 0 })
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
