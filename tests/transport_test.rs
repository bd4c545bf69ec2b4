//! Integration tests for the TCP control transport.
//!
//! Two real transports on loopback: framed messages, file streaming, and the
//! failure paths a flaky LAN produces.

use peerlink::protocol::MAX_FIELD_BYTES;
use peerlink::transport::{ControlTransport, Inbound, TransportError};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::time::timeout;

fn loopback(port: u16) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], port))
}

/// Test that a text payload arrives with the sender name intact.
#[tokio::test]
async fn test_text_delivery() {
    let dir_a = tempfile::tempdir().unwrap();
    let dir_b = tempfile::tempdir().unwrap();
    let (alice, _rx_a) = ControlTransport::bind("alice", dir_a.path()).await.unwrap();
    let (bob, mut rx_b) = ControlTransport::bind("bob", dir_b.path()).await.unwrap();

    alice
        .send_text(loopback(bob.local_port()), "hello bob")
        .await
        .unwrap();

    let inbound = timeout(Duration::from_secs(5), rx_b.recv())
        .await
        .expect("timed out")
        .expect("channel closed");
    match inbound {
        Inbound::Message { sender, content } => {
            assert_eq!(sender, "alice");
            assert_eq!(content, "hello bob");
        }
        other => panic!("unexpected inbound: {:?}", other),
    }

    alice.stop();
    bob.stop();
}

/// Test that a file streams across and lands in the download directory with
/// its contents intact and a timestamped name.
#[tokio::test]
async fn test_file_delivery() {
    let dir_a = tempfile::tempdir().unwrap();
    let dir_b = tempfile::tempdir().unwrap();
    let (alice, _rx_a) = ControlTransport::bind("alice", dir_a.path()).await.unwrap();
    let (bob, mut rx_b) = ControlTransport::bind("bob", dir_b.path()).await.unwrap();

    let payload = vec![0x5A_u8; 64 * 1024];
    let source = dir_a.path().join("notes.txt");
    tokio::fs::write(&source, &payload).await.unwrap();

    let sent = alice
        .send_file(loopback(bob.local_port()), &source)
        .await
        .unwrap();
    assert_eq!(sent, payload.len() as u64);

    let inbound = timeout(Duration::from_secs(5), rx_b.recv())
        .await
        .expect("timed out")
        .expect("channel closed");
    match inbound {
        Inbound::File {
            sender,
            filename,
            path,
            size,
        } => {
            assert_eq!(sender, "alice");
            assert_eq!(filename, "notes.txt");
            assert_eq!(size, payload.len() as u64);

            let stored_name = path.file_name().unwrap().to_str().unwrap();
            assert!(stored_name.starts_with("received_"));
            assert!(stored_name.ends_with("notes.txt"));
            assert_eq!(tokio::fs::read(&path).await.unwrap(), payload);
        }
        other => panic!("unexpected inbound: {:?}", other),
    }

    alice.stop();
    bob.stop();
}

/// Test that an over-long message fails at the sender instead of vanishing
/// between two instances, and that a message at the limit still arrives.
#[tokio::test]
async fn test_oversized_message_fails_at_sender() {
    let dir_a = tempfile::tempdir().unwrap();
    let dir_b = tempfile::tempdir().unwrap();
    let (alice, _rx_a) = ControlTransport::bind("alice", dir_a.path()).await.unwrap();
    let (bob, mut rx_b) = ControlTransport::bind("bob", dir_b.path()).await.unwrap();
    let bob_addr = loopback(bob.local_port());

    let too_long = "x".repeat(MAX_FIELD_BYTES + 2 * 1024);
    let result = alice.send_text(bob_addr, &too_long).await;
    assert!(matches!(result, Err(TransportError::SendFailed(_))));

    let at_limit = "x".repeat(MAX_FIELD_BYTES);
    alice.send_text(bob_addr, &at_limit).await.unwrap();

    let inbound = timeout(Duration::from_secs(5), rx_b.recv())
        .await
        .expect("timed out")
        .expect("channel closed");
    match inbound {
        Inbound::Message { content, .. } => assert_eq!(content, at_limit),
        other => panic!("unexpected inbound: {:?}", other),
    }

    alice.stop();
    bob.stop();
}

/// Test that sending to a dead endpoint reports a connect failure instead of
/// hanging or panicking.
#[tokio::test]
async fn test_send_to_unreachable_peer() {
    let dir = tempfile::tempdir().unwrap();
    let (alice, _rx) = ControlTransport::bind("alice", dir.path()).await.unwrap();

    let result = alice.send_text(loopback(1), "anyone there").await;
    assert!(matches!(result, Err(TransportError::ConnectFailed(_, _))));

    alice.stop();
}

/// Test that a missing source file fails before any connection is opened.
#[tokio::test]
async fn test_send_missing_file() {
    let dir = tempfile::tempdir().unwrap();
    let (alice, _rx) = ControlTransport::bind("alice", dir.path()).await.unwrap();

    let result = alice
        .send_file(loopback(alice.local_port()), dir.path().join("ghost.bin").as_path())
        .await;
    assert!(matches!(result, Err(TransportError::FileNotFound(_))));

    alice.stop();
}

/// Test that stop is idempotent.
#[tokio::test]
async fn test_stop_twice() {
    let dir = tempfile::tempdir().unwrap();
    let (alice, _rx) = ControlTransport::bind("alice", dir.path()).await.unwrap();
    alice.stop();
    alice.stop();
}
