//! Conformance scenarios over a real TCP WebSocket pair, plus
//! provider-level behavior.

use std::sync::Arc;
use std::time::Duration;

use peerlink::{Peer, PeerConfig, Provider, typed_handler};
use peerlink_testkit::{ConnectionFactory, TestError};
use peerlink_transport_websocket::{WsProvider, WsStreamConnection, accept_connection};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

struct WsFactory;

impl ConnectionFactory for WsFactory {
    type Conn = WsStreamConnection;

    async fn pair() -> Result<(WsStreamConnection, WsStreamConnection), TestError> {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .map_err(|e| TestError::Setup(format!("bind: {e}")))?;
        let addr = listener
            .local_addr()
            .map_err(|e| TestError::Setup(format!("local_addr: {e}")))?;

        let accept = tokio::spawn(async move {
            let (stream, _) = listener.accept().await?;
            accept_connection(stream)
                .await
                .map_err(|e| std::io::Error::other(e.to_string()))
        });

        let provider = WsProvider::new();
        let client = provider
            .dial(&format!("ws://{addr}/ws"))
            .await
            .map_err(TestError::Transport)?;
        let server = accept
            .await
            .map_err(|e| TestError::Setup(format!("accept task: {e}")))?
            .map_err(|e| TestError::Setup(format!("handshake: {e}")))?;

        Ok((client, server))
    }
}

#[tokio::test]
async fn ws_ping_pong() {
    peerlink_testkit::run_ping_pong::<WsFactory>().await;
}

#[tokio::test]
async fn ws_echo_roundtrip() {
    peerlink_testkit::run_echo_roundtrip::<WsFactory>().await;
}

#[tokio::test]
async fn ws_unknown_method() {
    peerlink_testkit::run_unknown_method::<WsFactory>().await;
}

#[tokio::test]
async fn ws_notification_silent() {
    peerlink_testkit::run_notification_silent::<WsFactory>().await;
}

#[tokio::test]
async fn ws_concurrent_calls() {
    peerlink_testkit::run_concurrent_calls::<WsFactory>().await;
}

#[tokio::test]
async fn ws_bidirectional_calls() {
    peerlink_testkit::run_bidirectional_calls::<WsFactory>().await;
}

#[tokio::test]
async fn provider_accepts_only_the_ws_path() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let token = CancellationToken::new();
    let (sink, mut accepted) = mpsc::channel(4);
    let provider = WsProvider::new();
    tokio::spawn({
        let provider = provider.clone();
        let token = token.clone();
        async move { provider.listen_on(token, listener, sink).await }
    });

    // Wrong path: the upgrade is refused.
    let refused = tokio_tungstenite::connect_async(format!("ws://{addr}/other")).await;
    assert!(refused.is_err());

    // Right path: the connection lands on the sink and carries traffic.
    let conn = provider.dial(&format!("ws://{addr}/ws")).await.unwrap();
    let server_side = tokio::time::timeout(Duration::from_secs(2), accepted.recv())
        .await
        .expect("accept timed out")
        .expect("sink closed");

    let server = Arc::new(Peer::attached(server_side, PeerConfig::default()));
    server.register("ping", typed_handler(|_ctx, (): ()| async { Ok("pong") }));
    let client = Arc::new(Peer::attached(conn, PeerConfig::default()));

    let lt = CancellationToken::new();
    tokio::spawn(server.clone().listen(lt.clone()));
    tokio::spawn(client.clone().listen(lt.clone()));

    let result = client.call("ping", &()).await.unwrap();
    assert_eq!(result.get(), r#""pong""#);

    token.cancel();
    lt.cancel();
}
