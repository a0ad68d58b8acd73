use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use cairn_core::transfer::{ReceiverSession, ReceiverState, SenderSession, SenderState};
use tokio::io::AsyncWriteExt;

use crate::*;

/// Send `payload` as `name` through chopped in-memory pipes and return what
/// the receiver saw.
async fn transfer_chopped(name: &str, payload: Vec<u8>, chunk_size: usize, seed: u64) -> (String, Vec<u8>) {
    let (a, b) = tokio::io::duplex(4096);
    let name = name.to_string();
    let expected_len = payload.len() as u64;

    let sender = tokio::spawn(async move {
        let mut tx = SenderSession::new(Choppy::new(a, seed, 1500));
        tx.open(&name, payload.len() as u64).await.unwrap();
        let mut source = Choppy::new(&payload[..], seed + 1, chunk_size);
        let sent = tx.send_object(&mut source, chunk_size).await.unwrap();
        assert_eq!(tx.state(), SenderState::Complete);
        tx.into_inner().shutdown().await.unwrap();
        sent
    });

    let mut rx = ReceiverSession::new(Choppy::new(b, seed + 2, 1100));
    let header = rx.accept().await.unwrap();
    assert_eq!(header.total_size, expected_len);
    let mut sink = Vec::new();
    let received = rx.receive_object(&mut sink).await.unwrap();
    assert_eq!(rx.state(), ReceiverState::Complete);

    assert_eq!(sender.await.unwrap(), received);
    (header.name, sink)
}

#[tokio::test]
async fn test_empty_object() {
    let (name, data) = transfer_chopped("empty.txt", Vec::new(), 1024, 10).await;
    assert_eq!(name, "empty.txt");
    assert!(data.is_empty());
}

#[tokio::test]
async fn test_small_object() {
    let (name, data) = transfer_chopped("seven.bin", b"1234567".to_vec(), 3, 20).await;
    assert_eq!(name, "seven.bin");
    assert_eq!(data, b"1234567");
}

#[tokio::test]
async fn test_ten_megabyte_object() {
    let payload = random_bytes(10 * 1024 * 1024, 30);
    let (name, data) = transfer_chopped("big.dat", payload.clone(), 64 * 1024, 30).await;
    assert_eq!(name, "big.dat");
    assert_eq!(data.len(), payload.len());
    assert!(data == payload, "10 MB payload corrupted in transit");
}

#[tokio::test]
async fn test_hostile_name_is_sanitized_end_to_end() {
    let (name, data) = transfer_chopped("../../etc/passwd", b"root:x".to_vec(), 2, 40).await;
    assert_eq!(name, "passwd");
    assert_eq!(data, b"root:x");
}

#[tokio::test]
async fn test_tcp_transfer_into_directory() {
    let out = scratch_dir("tcp-dir");
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let receive_dir = out.clone();
    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut rx = ReceiverSession::new(stream);
        rx.accept().await.unwrap();
        rx.receive_into_dir(&receive_dir).await.unwrap()
    });

    let payload = random_bytes(1_234_567, 50);
    let stream = tokio::net::TcpStream::connect(addr).await.unwrap();
    let mut tx = SenderSession::new(stream);
    tx.open("../escape/../../report.pdf", payload.len() as u64)
        .await
        .unwrap();
    let mut source = &payload[..];
    tx.send_object(&mut source, 8192).await.unwrap();
    tx.into_inner().shutdown().await.unwrap();

    let path = server.await.unwrap();
    assert_eq!(path, out.join("report.pdf"));
    assert_eq!(std::fs::read(&path).unwrap(), payload);

    // Nothing was written outside the output directory.
    let entries: Vec<_> = std::fs::read_dir(&out).unwrap().collect();
    assert_eq!(entries.len(), 1);

    let _ = std::fs::remove_dir_all(&out);
}

#[tokio::test]
async fn test_sequential_sessions_share_nothing() {
    let mut results = Vec::new();
    for (i, len) in [0usize, 1, 999, 65_536].into_iter().enumerate() {
        let payload = random_bytes(len, 60 + i as u64);
        let (_, data) = transfer_chopped("x", payload.clone(), 100, 60 + i as u64).await;
        results.push(data == payload);
    }
    assert!(results.into_iter().all(|ok| ok));
}

/// Receive one object from `stream` into `dir` and hand the stream back.
async fn receive_into<S>(stream: S, dir: &Path) -> Result<(PathBuf, S)>
where
    S: tokio::io::AsyncRead + Unpin,
{
    let mut rx = ReceiverSession::new(stream);
    rx.accept().await.context("header rejected")?;
    let path = rx.receive_into_dir(dir).await.context("receive failed")?;
    Ok((path, rx.into_inner()))
}

/// Send `payload` as `name` over `stream` and hand the stream back.
async fn send_over<S>(stream: S, name: &str, payload: &[u8]) -> Result<S>
where
    S: tokio::io::AsyncWrite + Unpin,
{
    let mut tx = SenderSession::new(stream);
    tx.open(name, payload.len() as u64).await?;
    let mut source = payload;
    tx.send_object(&mut source, 1000).await?;
    Ok(tx.into_inner())
}

#[tokio::test]
async fn test_back_to_back_objects_on_one_stream() -> Result<()> {
    let out = scratch_dir("back-to-back");
    let first = random_bytes(5000, 70);
    let second = random_bytes(3333, 71);

    let (a, b) = tokio::io::duplex(512);
    let (to_send_a, to_send_b) = (first.clone(), second.clone());
    let sender = tokio::spawn(async move {
        let stream = send_over(Choppy::new(a, 72, 700), "one.bin", &to_send_a).await?;
        let mut stream = send_over(stream, "two.bin", &to_send_b).await?;
        stream.shutdown().await?;
        anyhow::Ok(())
    });

    // Each session stops at its declared size, so the next header is intact.
    let (path_one, stream) = receive_into(Choppy::new(b, 73, 300), &out).await?;
    let (path_two, _) = receive_into(stream, &out).await?;
    sender.await??;

    assert_eq!(std::fs::read(&path_one)?, first);
    assert_eq!(std::fs::read(&path_two)?, second);

    let _ = std::fs::remove_dir_all(&out);
    Ok(())
}

#[tokio::test]
async fn test_concurrent_same_name_transfers_keep_both() -> Result<()> {
    let out = scratch_dir("same-name");
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;

    let receive_dir = out.clone();
    let server = tokio::spawn(async move {
        let mut tasks = Vec::new();
        for _ in 0..4 {
            let (stream, _) = listener.accept().await?;
            let dir = receive_dir.clone();
            tasks.push(tokio::spawn(async move { receive_into(stream, &dir).await }));
        }
        let mut paths = Vec::new();
        for task in tasks {
            paths.push(task.await??.0);
        }
        anyhow::Ok(paths)
    });

    let payloads: Vec<Vec<u8>> = (0..4).map(|i| random_bytes(20_000 + i, 80 + i as u64)).collect();
    let mut senders = Vec::new();
    for payload in payloads.clone() {
        senders.push(tokio::spawn(async move {
            let stream = tokio::net::TcpStream::connect(addr).await?;
            let mut stream = send_over(stream, "report.txt", &payload).await?;
            stream.shutdown().await?;
            anyhow::Ok(())
        }));
    }
    for sender in senders {
        sender.await??;
    }

    let paths = server.await??;
    let unique: std::collections::HashSet<_> = paths.iter().collect();
    assert_eq!(unique.len(), 4, "sessions shared a destination: {paths:?}");

    // Every payload landed intact in exactly one file.
    let mut stored: Vec<Vec<u8>> = paths.iter().map(std::fs::read).collect::<Result<_, _>>()?;
    let mut expected = payloads;
    stored.sort();
    expected.sort();
    assert_eq!(stored, expected);

    let _ = std::fs::remove_dir_all(&out);
    Ok(())
}
