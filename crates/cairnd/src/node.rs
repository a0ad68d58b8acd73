//! TCP plumbing around transfer sessions.
//!
//! One connection carries one object. The listener negotiates, receives into
//! the output directory and closes; the dialer negotiates, sends and shuts
//! down its write half.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::broadcast;

use cairn_core::transfer::{ReceiverSession, SenderSession};

use crate::negotiate;

/// Accept connections until `shutdown` fires. Each connection runs on its
/// own task; a failed transfer never stops the listener.
pub async fn serve(
    listener: TcpListener,
    output_dir: PathBuf,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<()> {
    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                tracing::info!("listener shutting down");
                return Ok(());
            }

            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        tracing::warn!(error = %e, "accept failed");
                        continue;
                    }
                };
                let dir = output_dir.clone();
                tokio::spawn(async move {
                    match receive_one(stream, &dir).await {
                        Ok(path) => tracing::info!(%peer, path = %path.display(), "transfer complete"),
                        Err(e) => tracing::warn!(%peer, error = ?e, "transfer failed"),
                    }
                });
            }
        }
    }
}

/// Listener side of one connection.
pub async fn receive_one<S>(mut stream: S, output_dir: &Path) -> Result<PathBuf>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    negotiate::answer(&mut stream)
        .await
        .context("protocol negotiation failed")?;

    let mut session = ReceiverSession::new(&mut stream);
    let header = session.accept().await?;
    tracing::info!(name = %header.name, size = header.total_size, "receiving");
    let path = session.receive_into_dir(output_dir).await?;
    Ok(path)
}

/// Dial `addr` and send the file at `path`. Returns bytes sent.
pub async fn send_file<A: ToSocketAddrs>(addr: A, path: &Path, chunk_size: usize) -> Result<u64> {
    let file = tokio::fs::File::open(path)
        .await
        .with_context(|| format!("failed to open {}", path.display()))?;
    let size = file.metadata().await?.len();
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .with_context(|| format!("{} has no usable file name", path.display()))?;

    let stream = TcpStream::connect(addr).await.context("failed to connect")?;
    let peer: SocketAddr = stream.peer_addr()?;
    tracing::info!(%peer, name, size, "sending");

    send_one(stream, name, size, BufReader::new(file), chunk_size).await
}

/// Dialer side of one connection.
pub async fn send_one<S, R>(
    mut stream: S,
    name: &str,
    size: u64,
    mut source: R,
    chunk_size: usize,
) -> Result<u64>
where
    S: AsyncRead + AsyncWrite + Unpin,
    R: AsyncRead + Unpin,
{
    negotiate::propose(&mut stream)
        .await
        .context("protocol negotiation failed")?;

    let mut session = SenderSession::new(&mut stream);
    session.open(name, size).await?;
    let sent = session.send_object(&mut source, chunk_size).await?;

    stream.shutdown().await.context("failed to close stream")?;
    Ok(sent)
}
