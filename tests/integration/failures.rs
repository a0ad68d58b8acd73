use cairn_core::transfer::{
    FailureCause, ReceiverSession, ReceiverState, SenderSession, SenderState, TransferError,
};
use cairn_core::wire::{encode_frame, write_frame};
use tokio::io::AsyncWriteExt;

use crate::*;

/// Receive from a stream that carries the header for `declared` bytes and
/// then exactly `wire_tail`, followed by end of stream.
async fn receive_from(declared: u64, wire_tail: &[u8], seed: u64) -> (Result<u64, TransferError>, Vec<u8>) {
    let mut wire = format!("obj\n{declared}\n").into_bytes();
    wire.extend_from_slice(wire_tail);

    let mut rx = ReceiverSession::new(Choppy::new(&wire[..], seed, 5));
    rx.accept().await.unwrap();
    let mut sink = Vec::new();
    let result = rx.receive_object(&mut sink).await;
    if result.is_err() {
        assert_eq!(rx.state(), ReceiverState::Failed);
    }
    (result, sink)
}

#[tokio::test]
async fn test_early_close_never_succeeds() {
    let payload = random_bytes(1000, 1);
    let mut tail = Vec::new();
    for chunk in payload.chunks(100) {
        tail.extend_from_slice(&encode_frame(chunk).unwrap());
    }

    // Cut the stream at every byte offset short of the end.
    for cut in 0..tail.len() {
        let (result, sink) = receive_from(1000, &tail[..cut], cut as u64).await;
        match result {
            Err(TransferError::TruncatedTransfer { received, expected }) => {
                assert_eq!(expected, 1000);
                assert_eq!(received as usize, sink.len());
            }
            Err(TransferError::Failed { transferred, source: FailureCause::Frame(_) }) => {
                assert_eq!(transferred as usize, sink.len());
            }
            other => panic!("cut at {cut}: expected failure, got {other:?}"),
        }
        assert_eq!(&sink[..], &payload[..sink.len()], "sink corrupted at cut {cut}");
    }

    let (result, sink) = receive_from(1000, &tail, 0).await;
    assert_eq!(result.unwrap(), 1000);
    assert_eq!(sink, payload);
}

#[tokio::test]
async fn test_sender_drop_mid_transfer_over_tcp() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut rx = ReceiverSession::new(stream);
        rx.accept().await.unwrap();
        let mut sink = Vec::new();
        let result = rx.receive_object(&mut sink).await;
        (result, sink.len(), rx.state())
    });

    let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
    stream.write_all(b"partial.bin\n100000\n").await.unwrap();
    write_frame(&mut stream, &random_bytes(4000, 2)).await.unwrap();
    drop(stream);

    let (result, got, state) = server.await.unwrap();
    assert!(matches!(
        result,
        Err(TransferError::TruncatedTransfer {
            received: 4000,
            expected: 100_000
        })
    ));
    assert_eq!(got, 4000);
    assert_eq!(state, ReceiverState::Failed);
}

#[tokio::test]
async fn test_receiver_gone_fails_sender() {
    let (a, b) = tokio::io::duplex(256);
    drop(b);

    let mut tx = SenderSession::new(a);
    let err = tx.open("x", 10).await.unwrap_err();
    assert!(matches!(
        err,
        TransferError::Failed {
            transferred: 0,
            source: FailureCause::Channel(_)
        }
    ));
    assert_eq!(tx.state(), SenderState::Failed);
}

#[tokio::test]
async fn test_receiver_vanishes_after_header() {
    let (a, b) = tokio::io::duplex(64);

    let reader = tokio::spawn(async move {
        let mut rx = ReceiverSession::new(b);
        rx.accept().await.unwrap();
        // Hang up without reading the body.
    });

    let mut tx = SenderSession::new(a);
    tx.open("big", 1_000_000).await.unwrap();
    reader.await.unwrap();

    let payload = random_bytes(1_000_000, 3);
    let mut source = &payload[..];
    let err = tx.send_object(&mut source, 4096).await.unwrap_err();
    assert!(matches!(
        err,
        TransferError::Failed {
            source: FailureCause::Frame(_),
            ..
        }
    ));
    assert_eq!(tx.state(), SenderState::Failed);
}

#[tokio::test]
async fn test_malformed_headers_are_rejected() {
    let cases: &[&[u8]] = &[
        b"name-without-size\n",
        b"name\nten\n",
        b"name\n-5\n",
        b"name\n\n",
        b"no newline at all",
        b"",
    ];
    for (i, wire) in cases.iter().enumerate() {
        let mut rx = ReceiverSession::new(Choppy::new(*wire, i as u64, 3));
        assert!(
            matches!(rx.accept().await, Err(TransferError::MalformedHeader(_))),
            "accepted {:?}",
            String::from_utf8_lossy(wire)
        );
        assert_eq!(rx.state(), ReceiverState::Failed);
    }
}
