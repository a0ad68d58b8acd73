//! cairnd — cairn peer node.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use rand::rngs::OsRng;
use tokio::net::TcpListener;

use cairn_core::config::CairnConfig;
use cairn_core::crypto::{Key, KeyRegistry, PrivateKey};
use cairn_core::identity::{IdEncoding, IdentityCodec, PeerId};

mod keystore;
mod negotiate;
mod node;

// ── Commands ──────────────────────────────────────────────────────────────────

fn local_identity(
    config: &CairnConfig,
    codec: &IdentityCodec,
) -> Result<(Box<dyn PrivateKey>, PeerId)> {
    let private = keystore::load_or_generate(
        &config.identity.keypair_path,
        codec.registry(),
        &mut OsRng,
    )?;
    let peer_id = codec.derive(private.public().as_ref())?;
    Ok((private, peer_id))
}

fn cmd_id(config: &CairnConfig, codec: &IdentityCodec) -> Result<()> {
    let (private, peer_id) = local_identity(config, codec)?;
    println!("{peer_id}");
    println!("  key type: {}", private.key_type());
    println!("  keypair:  {}", config.identity.keypair_path.display());
    Ok(())
}

fn cmd_inspect(text: &str, codec: &IdentityCodec) -> Result<()> {
    let peer_id: PeerId = text.parse().context("not a peer id")?;
    println!("{peer_id}");
    println!("  encoding: {}", peer_id.encoding());
    match peer_id.encoding() {
        IdEncoding::Inline => {
            let key = codec.extract_public_key(&peer_id)?;
            println!("  key type: {}", key.key_type());
            println!("  key:      {}", hex::encode(key.raw()?));
        }
        IdEncoding::Digest => {
            println!("  digest:   {}", hex::encode(peer_id.payload()));
        }
    }
    Ok(())
}

async fn cmd_receive(
    config: &CairnConfig,
    codec: &IdentityCodec,
    port: Option<u16>,
    out: Option<PathBuf>,
) -> Result<()> {
    let (_, peer_id) = local_identity(config, codec)?;
    let port = port.unwrap_or(config.network.port);
    let output_dir = out.unwrap_or_else(|| config.transfer.output_dir.clone());

    let listener = TcpListener::bind((config.network.listen_addr.as_str(), port))
        .await
        .with_context(|| format!("failed to bind {}:{port}", config.network.listen_addr))?;
    tracing::info!(
        peer_id = %peer_id,
        addr = %listener.local_addr()?,
        output_dir = %output_dir.display(),
        "cairnd receiving"
    );

    let (shutdown_tx, shutdown_rx) = tokio::sync::broadcast::channel::<()>(1);
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        tracing::info!("shutdown signal received");
        let _ = shutdown_tx.send(());
    });

    node::serve(listener, output_dir, shutdown_rx).await
}

async fn cmd_send(
    config: &CairnConfig,
    codec: &IdentityCodec,
    addr: &str,
    path: &str,
    chunk_size: Option<usize>,
) -> Result<()> {
    let (_, peer_id) = local_identity(config, codec)?;
    let chunk_size = chunk_size.unwrap_or(config.transfer.chunk_size);
    tracing::info!(peer_id = %peer_id, addr, path, chunk_size, "cairnd sending");

    let sent = node::send_file(addr, &PathBuf::from(path), chunk_size).await?;
    println!("sent {sent} bytes to {addr}");
    Ok(())
}

fn print_usage() {
    println!("Usage: cairnd <command> [options]");
    println!();
    println!("Commands:");
    println!("  id                          Show this node's peer id");
    println!("  inspect <peer-id>           Decode a peer id");
    println!("  receive                     Listen for incoming transfers");
    println!("  send <host:port> <path>     Send one file");
    println!();
    println!("Options:");
    println!("  --port <port>         Listen port for receive");
    println!("  --out <dir>           Output directory for receive");
    println!("  --chunk-size <bytes>  Frame payload size for send");
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    if let Err(e) = CairnConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let config = CairnConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        CairnConfig::default()
    });

    let args: Vec<String> = std::env::args().skip(1).collect();

    let mut port: Option<u16> = None;
    let mut out: Option<PathBuf> = None;
    let mut chunk_size: Option<usize> = None;
    let mut remaining: Vec<&str> = Vec::new();
    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--port" => {
                i += 1;
                port = Some(
                    args.get(i)
                        .context("--port requires a value")?
                        .parse()
                        .context("--port must be a number")?,
                );
            }
            "--out" => {
                i += 1;
                out = Some(PathBuf::from(args.get(i).context("--out requires a value")?));
            }
            "--chunk-size" => {
                i += 1;
                let n: usize = args
                    .get(i)
                    .context("--chunk-size requires a value")?
                    .parse()
                    .context("--chunk-size must be a number")?;
                anyhow::ensure!(n > 0, "--chunk-size must be at least 1");
                chunk_size = Some(n);
            }
            other => remaining.push(other),
        }
        i += 1;
    }

    let codec = IdentityCodec::new(Arc::new(KeyRegistry::standard()));

    match remaining.as_slice() {
        ["id"]                         => cmd_id(&config, &codec),
        ["inspect", id]                => cmd_inspect(id, &codec),
        ["receive"]                    => cmd_receive(&config, &codec, port, out).await,
        ["send", addr, path]           => cmd_send(&config, &codec, addr, path, chunk_size).await,
        ["help"] | ["--help"] | ["-h"] | [] => { print_usage(); Ok(()) }
        other => {
            eprintln!("Unknown command: {}", other.join(" "));
            eprintln!();
            print_usage();
            std::process::exit(1);
        }
    }
}
