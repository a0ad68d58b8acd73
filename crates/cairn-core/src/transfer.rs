//! Named-object transfer over a framed byte stream.
//!
//! One session moves one object in one direction:
//!
//!   sender                               receiver
//!   ──────                               ────────
//!   "name\n"                      →
//!   "<decimal total_size>\n"      →      accept(): parse + sanitize
//!   frame, frame, ... (no trailer) →     receive_object(): append until
//!                                        received == total_size
//!
//! Completion is decided by byte count alone. The sender never writes a
//! terminator and the receiver never reads past the declared size.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::wire::{read_frame, write_frame, FrameError};

/// Default bytes read from the source per frame.
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Longest accepted header line, excluding the newline.
pub const MAX_HEADER_LINE: usize = 4096;

/// Longest sanitized object name in bytes.
pub const MAX_NAME_LEN: usize = 255;

/// Name used when sanitizing leaves nothing.
pub const FALLBACK_NAME: &str = "unnamed";

/// Numbered variants tried before giving up on a taken name.
const MAX_NAME_ATTEMPTS: u32 = 1000;

// ── Header ────────────────────────────────────────────────────────────────────

/// What the receiver learns before any payload arrives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferHeader {
    pub name: String,
    pub total_size: u64,
}

impl TransferHeader {
    /// `name\n` followed by `total_size` in decimal and `\n`.
    pub fn encode(&self) -> Result<Vec<u8>, TransferError> {
        validate_outgoing_name(&self.name)?;
        let size = self.total_size.to_string();
        let mut out = Vec::with_capacity(self.name.len() + size.len() + 2);
        out.extend_from_slice(self.name.as_bytes());
        out.push(b'\n');
        out.extend_from_slice(size.as_bytes());
        out.push(b'\n');
        Ok(out)
    }
}

fn validate_outgoing_name(name: &str) -> Result<(), TransferError> {
    if name.contains(['\n', '\0']) {
        return Err(TransferError::InvalidName(
            "name contains a newline or NUL".into(),
        ));
    }
    if name.len() > MAX_HEADER_LINE {
        return Err(TransferError::InvalidName(format!(
            "name is {} bytes, limit is {MAX_HEADER_LINE}",
            name.len()
        )));
    }
    Ok(())
}

/// Reduce a peer-supplied name to a single safe path component.
///
/// Control characters are removed, the name is split on `/` and `\`, and the
/// last segment that is not empty, `.` or `..` is kept, truncated to
/// `MAX_NAME_LEN` bytes on a character boundary. Falls back to
/// `FALLBACK_NAME`.
pub fn sanitize_name(raw: &str) -> String {
    let cleaned: String = raw.chars().filter(|c| !c.is_control()).collect();
    cleaned
        .split(['/', '\\'])
        .filter(|seg| !seg.is_empty() && *seg != "." && *seg != "..")
        .last()
        .map(|seg| truncate_on_boundary(seg, MAX_NAME_LEN).to_string())
        .unwrap_or_else(|| FALLBACK_NAME.to_string())
}

fn truncate_on_boundary(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// `name (n).ext` for the `n`th alternative to a taken `name`, kept within
/// `MAX_NAME_LEN` by shortening the stem.
fn numbered_name(name: &str, n: u32) -> String {
    let (stem, ext) = match name.rfind('.') {
        Some(i) if i > 0 => name.split_at(i),
        _ => (name, ""),
    };
    let suffix = format!(" ({n}){ext}");
    let keep = MAX_NAME_LEN.saturating_sub(suffix.len());
    format!("{}{suffix}", truncate_on_boundary(stem, keep))
}

/// Create a file in `dir` that no other session holds, starting from `name`
/// and falling back to numbered variants. Existing files are never opened.
async fn create_unique(dir: &Path, name: &str) -> io::Result<(PathBuf, File)> {
    for attempt in 0..MAX_NAME_ATTEMPTS {
        let candidate = match attempt {
            0 => name.to_string(),
            n => numbered_name(name, n),
        };
        let path = dir.join(&candidate);
        match OpenOptions::new().write(true).create_new(true).open(&path).await {
            Ok(file) => return Ok((path, file)),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(e),
        }
    }
    Err(io::Error::new(
        io::ErrorKind::AlreadyExists,
        format!("{name:?} and its numbered variants are all taken"),
    ))
}

/// Read one `\n`-terminated line of at most `MAX_HEADER_LINE` bytes.
///
/// Reads a byte at a time so nothing past the newline leaves the channel.
async fn read_header_line<R>(reader: &mut R, field: &str) -> Result<Vec<u8>, TransferError>
where
    R: AsyncRead + Unpin,
{
    let mut line = Vec::new();
    loop {
        let b = match reader.read_u8().await {
            Ok(b) => b,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                return Err(TransferError::MalformedHeader(format!(
                    "stream ended before {field} line was complete"
                )))
            }
            Err(e) => {
                return Err(TransferError::Failed {
                    transferred: 0,
                    source: FailureCause::Channel(e),
                })
            }
        };
        if b == b'\n' {
            return Ok(line);
        }
        if line.len() == MAX_HEADER_LINE {
            return Err(TransferError::MalformedHeader(format!(
                "{field} line exceeds {MAX_HEADER_LINE} bytes"
            )));
        }
        line.push(b);
    }
}

fn parse_size(line: &[u8]) -> Result<u64, TransferError> {
    if line.is_empty() || !line.iter().all(u8::is_ascii_digit) {
        return Err(TransferError::MalformedHeader(format!(
            "size {:?} is not a decimal number",
            String::from_utf8_lossy(line)
        )));
    }
    // All ASCII digits, so the only possible failure is overflow.
    std::str::from_utf8(line)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| TransferError::MalformedHeader("size does not fit in 64 bits".into()))
}

// ── States ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SenderState {
    Idle,
    HeaderSent,
    Transferring,
    Complete,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiverState {
    Idle,
    HeaderReceived,
    Transferring,
    Complete,
    Failed,
}

impl SenderState {
    pub fn as_str(self) -> &'static str {
        match self {
            SenderState::Idle => "idle",
            SenderState::HeaderSent => "header-sent",
            SenderState::Transferring => "transferring",
            SenderState::Complete => "complete",
            SenderState::Failed => "failed",
        }
    }
}

impl ReceiverState {
    pub fn as_str(self) -> &'static str {
        match self {
            ReceiverState::Idle => "idle",
            ReceiverState::HeaderReceived => "header-received",
            ReceiverState::Transferring => "transferring",
            ReceiverState::Complete => "complete",
            ReceiverState::Failed => "failed",
        }
    }
}

impl fmt::Display for SenderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for ReceiverState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Sender ────────────────────────────────────────────────────────────────────

/// Sending half of a transfer. Owns its channel until `into_inner`.
pub struct SenderSession<W> {
    channel: W,
    state: SenderState,
    header: Option<TransferHeader>,
    transferred: u64,
}

impl<W: AsyncWrite + Unpin> SenderSession<W> {
    pub fn new(channel: W) -> Self {
        Self {
            channel,
            state: SenderState::Idle,
            header: None,
            transferred: 0,
        }
    }

    pub fn state(&self) -> SenderState {
        self.state
    }

    pub fn transferred(&self) -> u64 {
        self.transferred
    }

    pub fn header(&self) -> Option<&TransferHeader> {
        self.header.as_ref()
    }

    pub fn into_inner(self) -> W {
        self.channel
    }

    /// Write and flush the header.
    pub async fn open(&mut self, name: &str, total_size: u64) -> Result<(), TransferError> {
        if self.state != SenderState::Idle {
            return Err(TransferError::InvalidState {
                op: "open",
                state: self.state.as_str(),
            });
        }

        let header = TransferHeader {
            name: name.to_string(),
            total_size,
        };
        let bytes = header.encode()?;

        let written = match self.channel.write_all(&bytes).await {
            Ok(()) => self.channel.flush().await,
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            return Err(self.fail(FailureCause::Channel(e)));
        }

        tracing::info!(name = %header.name, total_size, "transfer header sent");
        self.header = Some(header);
        self.state = SenderState::HeaderSent;
        Ok(())
    }

    /// Stream `source` as frames of at most `chunk_size` bytes.
    ///
    /// The source must produce exactly the size declared in `open`. Returns
    /// the number of payload bytes sent.
    pub async fn send_object<R>(
        &mut self,
        source: &mut R,
        chunk_size: usize,
    ) -> Result<u64, TransferError>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        if self.state != SenderState::HeaderSent {
            return Err(TransferError::InvalidState {
                op: "send",
                state: self.state.as_str(),
            });
        }
        if chunk_size == 0 {
            return Err(TransferError::InvalidChunkSize);
        }
        let total = self.header.as_ref().map_or(0, |h| h.total_size);
        self.state = SenderState::Transferring;

        let mut buf = vec![0u8; chunk_size];
        loop {
            let n = match source.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(self.fail(FailureCause::Source(e))),
            };

            let after = self.transferred + n as u64;
            if after > total {
                return Err(self.fail(FailureCause::SizeMismatch {
                    declared: total,
                    actual: after,
                }));
            }

            if let Err(e) = write_frame(&mut self.channel, &buf[..n]).await {
                return Err(self.fail(FailureCause::Frame(e)));
            }
            self.transferred = after;
            tracing::trace!(len = n, sent = self.transferred, total, "frame sent");
        }

        if self.transferred != total {
            return Err(self.fail(FailureCause::SizeMismatch {
                declared: total,
                actual: self.transferred,
            }));
        }
        if let Err(e) = self.channel.flush().await {
            return Err(self.fail(FailureCause::Channel(e)));
        }

        self.state = SenderState::Complete;
        tracing::info!(bytes = self.transferred, "transfer sent");
        Ok(self.transferred)
    }

    fn fail(&mut self, cause: FailureCause) -> TransferError {
        self.state = SenderState::Failed;
        tracing::warn!(sent = self.transferred, error = %cause, "send failed");
        TransferError::Failed {
            transferred: self.transferred,
            source: cause,
        }
    }
}

// ── Receiver ──────────────────────────────────────────────────────────────────

/// Receiving half of a transfer. Owns its channel until `into_inner`.
pub struct ReceiverSession<R> {
    channel: R,
    state: ReceiverState,
    header: Option<TransferHeader>,
    received: u64,
}

impl<R: AsyncRead + Unpin> ReceiverSession<R> {
    pub fn new(channel: R) -> Self {
        Self {
            channel,
            state: ReceiverState::Idle,
            header: None,
            received: 0,
        }
    }

    pub fn state(&self) -> ReceiverState {
        self.state
    }

    pub fn received(&self) -> u64 {
        self.received
    }

    /// Header as parsed, with the name already sanitized.
    pub fn header(&self) -> Option<&TransferHeader> {
        self.header.as_ref()
    }

    /// Returns the channel, positioned just past the last byte consumed.
    pub fn into_inner(self) -> R {
        self.channel
    }

    /// Read and validate the header.
    pub async fn accept(&mut self) -> Result<TransferHeader, TransferError> {
        if self.state != ReceiverState::Idle {
            return Err(TransferError::InvalidState {
                op: "accept",
                state: self.state.as_str(),
            });
        }

        match self.read_header().await {
            Ok(header) => {
                tracing::info!(name = %header.name, total_size = header.total_size, "transfer header received");
                self.header = Some(header.clone());
                self.state = ReceiverState::HeaderReceived;
                Ok(header)
            }
            Err(e) => {
                self.state = ReceiverState::Failed;
                tracing::warn!(error = %e, "rejecting transfer header");
                Err(e)
            }
        }
    }

    async fn read_header(&mut self) -> Result<TransferHeader, TransferError> {
        let name = read_header_line(&mut self.channel, "name").await?;
        let size = read_header_line(&mut self.channel, "size").await?;

        let name = String::from_utf8(name)
            .map_err(|_| TransferError::MalformedHeader("name is not valid UTF-8".into()))?;
        let total_size = parse_size(&size)?;

        let sanitized = sanitize_name(&name);
        if sanitized != name {
            tracing::debug!(raw = ?name, name = %sanitized, "sanitized incoming name");
        }
        Ok(TransferHeader {
            name: sanitized,
            total_size,
        })
    }

    /// Append frames to `sink` until the declared size has arrived.
    ///
    /// On failure the sink keeps whatever was written before the error.
    pub async fn receive_object<W>(&mut self, sink: &mut W) -> Result<u64, TransferError>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        if self.state != ReceiverState::HeaderReceived {
            return Err(TransferError::InvalidState {
                op: "receive",
                state: self.state.as_str(),
            });
        }
        let total = self.header.as_ref().map_or(0, |h| h.total_size);
        self.state = ReceiverState::Transferring;

        while self.received < total {
            let frame = match read_frame(&mut self.channel).await {
                Ok(frame) => frame,
                Err(e) if e.is_clean_eof() => return Err(self.truncated(total)),
                Err(e) => return Err(self.fail(FailureCause::Frame(e))),
            };
            if frame.is_empty() {
                return Err(self.truncated(total));
            }

            let remaining = total - self.received;
            let take = remaining.min(frame.len() as u64) as usize;
            if let Err(e) = sink.write_all(&frame.payload()[..take]).await {
                return Err(self.fail(FailureCause::Sink(e)));
            }
            self.received += take as u64;
            tracing::trace!(len = frame.len(), received = self.received, total, "frame received");

            if frame.len() > take {
                return Err(self.fail(FailureCause::Overrun {
                    excess: (frame.len() - take) as u64,
                }));
            }
        }

        if let Err(e) = sink.flush().await {
            return Err(self.fail(FailureCause::Sink(e)));
        }

        self.state = ReceiverState::Complete;
        tracing::info!(bytes = self.received, "transfer received");
        Ok(self.received)
    }

    /// Receive into `dir/<sanitized name>`, creating `dir` if needed.
    ///
    /// A name already present in `dir` is never overwritten; the object is
    /// stored as `name (1).ext`, `name (2).ext` and so on. Returns the path
    /// written.
    pub async fn receive_into_dir(&mut self, dir: &Path) -> Result<PathBuf, TransferError> {
        let name = match &self.header {
            Some(h) if self.state == ReceiverState::HeaderReceived => h.name.clone(),
            _ => {
                return Err(TransferError::InvalidState {
                    op: "receive",
                    state: self.state.as_str(),
                })
            }
        };

        let path = dir.join(&name);
        if path.parent() != Some(dir) || path.file_name().is_none() {
            self.state = ReceiverState::Failed;
            tracing::warn!(name = %name, dir = %dir.display(), "refusing object name");
            return Err(TransferError::InvalidName(format!(
                "{name:?} would leave {}",
                dir.display()
            )));
        }

        if let Err(e) = tokio::fs::create_dir_all(dir).await {
            return Err(self.fail(FailureCause::Sink(e)));
        }
        let (path, file) = match create_unique(dir, &name).await {
            Ok(created) => created,
            Err(e) => return Err(self.fail(FailureCause::Sink(e))),
        };
        if path.file_name() != Some(std::ffi::OsStr::new(&name)) {
            tracing::info!(name = %name, path = %path.display(), "name taken, storing under a new one");
        }

        let mut sink = tokio::io::BufWriter::new(file);
        match self.receive_object(&mut sink).await {
            Ok(_) => {
                tracing::info!(path = %path.display(), "object stored");
                Ok(path)
            }
            Err(e) => {
                // Keep the partial file consistent with what was received.
                if let Err(flush) = sink.flush().await {
                    tracing::debug!(path = %path.display(), error = %flush, "flushing partial object failed");
                }
                Err(e)
            }
        }
    }

    fn truncated(&mut self, expected: u64) -> TransferError {
        self.state = ReceiverState::Failed;
        tracing::warn!(received = self.received, expected, "stream ended early");
        TransferError::TruncatedTransfer {
            received: self.received,
            expected,
        }
    }

    fn fail(&mut self, cause: FailureCause) -> TransferError {
        self.state = ReceiverState::Failed;
        tracing::warn!(received = self.received, error = %cause, "receive failed");
        TransferError::Failed {
            transferred: self.received,
            source: cause,
        }
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("invalid object name: {0}")]
    InvalidName(String),

    #[error("malformed transfer header: {0}")]
    MalformedHeader(String),

    #[error("stream ended after {received} of {expected} bytes")]
    TruncatedTransfer { received: u64, expected: u64 },

    #[error("transfer failed after {transferred} bytes: {source}")]
    Failed {
        transferred: u64,
        #[source]
        source: FailureCause,
    },

    #[error("chunk size must be at least one byte")]
    InvalidChunkSize,

    #[error("cannot {op} in state {state}")]
    InvalidState { op: &'static str, state: &'static str },
}

/// Why a session moved to `Failed`.
#[derive(Debug, Error)]
pub enum FailureCause {
    #[error(transparent)]
    Frame(FrameError),

    #[error("channel I/O failed: {0}")]
    Channel(io::Error),

    #[error("reading source failed: {0}")]
    Source(io::Error),

    #[error("writing sink failed: {0}")]
    Sink(io::Error),

    #[error("declared {declared} bytes but source produced {actual}")]
    SizeMismatch { declared: u64, actual: u64 },

    #[error("frame runs {excess} bytes past the declared size")]
    Overrun { excess: u64 },
}

// ── Tests ─────────────────────────────────────────────────────────────────────
