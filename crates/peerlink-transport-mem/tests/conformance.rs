//! Shared transport conformance scenarios over the in-memory transport.

use peerlink_testkit::{ConnectionFactory, TestError};
use peerlink_transport_mem::MemConnection;

struct MemFactory;

impl ConnectionFactory for MemFactory {
    type Conn = MemConnection;

    async fn pair() -> Result<(MemConnection, MemConnection), TestError> {
        Ok(MemConnection::pair())
    }
}

#[tokio::test]
async fn mem_ping_pong() {
    peerlink_testkit::run_ping_pong::<MemFactory>().await;
}

#[tokio::test]
async fn mem_echo_roundtrip() {
    peerlink_testkit::run_echo_roundtrip::<MemFactory>().await;
}

#[tokio::test]
async fn mem_unknown_method() {
    peerlink_testkit::run_unknown_method::<MemFactory>().await;
}

#[tokio::test]
async fn mem_notification_silent() {
    peerlink_testkit::run_notification_silent::<MemFactory>().await;
}

#[tokio::test]
async fn mem_concurrent_calls() {
    peerlink_testkit::run_concurrent_calls::<MemFactory>().await;
}

#[tokio::test]
async fn mem_bidirectional_calls() {
    peerlink_testkit::run_bidirectional_calls::<MemFactory>().await;
}
