//! End-to-end hub behavior over real WebSocket connections.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use peerlink::{Peer, PeerConfig, PeerError, Provider, code};
use peerlink_server::{Hub, HubStats, ServerConfig, TokenAuthenticator, serve};
use peerlink_transport_websocket::WsProvider;
use serde_json::json;
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_util::sync::CancellationToken;

async fn start_hub(config: ServerConfig) -> (Arc<Hub>, SocketAddr, CancellationToken) {
    let auth = Arc::new(
        TokenAuthenticator::new()
            .with_user("alice", "wonderland")
            .with_user("bob", "builder"),
    );
    let hub = Hub::new(auth, config);
    tokio::spawn(hub.clone().run());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let token = CancellationToken::new();
    tokio::spawn(serve(listener, hub.clone(), token.clone()));

    (hub, addr, token)
}

async fn connect_peer(addr: SocketAddr) -> Arc<Peer> {
    let provider = WsProvider::new();
    let conn = provider.dial(&format!("ws://{addr}/ws")).await.unwrap();
    let peer = Arc::new(Peer::attached(conn, PeerConfig::default()));
    tokio::spawn(peer.clone().listen(CancellationToken::new()));
    peer
}

async fn wait_for_stats(hub: &Hub, what: &str, check: impl Fn(&HubStats) -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let stats = hub.stats().await.unwrap();
        if check(&stats) {
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("timed out waiting for {what} (last stats: {stats:?})");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn broadcast_reaches_only_authenticated_sessions() {
    let (hub, addr, _token) = start_hub(ServerConfig::default()).await;

    let alice = connect_peer(addr).await;
    let bob = connect_peer(addr).await;
    let lurker = connect_peer(addr).await;

    let mut inboxes = Vec::new();
    for peer in [&alice, &bob, &lurker] {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        peer.on_notification(move |method, params| {
            let _ = tx.send((
                method.to_string(),
                params.map(|p| p.get().to_string()),
            ));
        });
        inboxes.push(rx);
    }

    alice
        .call("auth.login", &json!({"username": "alice", "secret": "wonderland"}))
        .await
        .unwrap();
    bob.call("auth.login", &json!({"username": "bob", "secret": "builder"}))
        .await
        .unwrap();

    wait_for_stats(&hub, "two authenticated sessions", |stats| {
        stats.sessions == 3 && stats.authenticated == 2
    })
    .await;

    hub.broadcast_authenticated("system.alert", &"shutdown")
        .unwrap();

    for rx in inboxes.iter_mut().take(2) {
        let (method, params) = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("authenticated session missed the broadcast")
            .unwrap();
        assert_eq!(method, "system.alert");
        assert_eq!(params.as_deref(), Some(r#""shutdown""#));
    }

    let silence =
        tokio::time::timeout(Duration::from_millis(200), inboxes[2].recv()).await;
    assert!(silence.is_err(), "unauthenticated session got the broadcast");
}

#[tokio::test]
async fn login_with_wrong_secret_is_unauthorized() {
    let (_hub, addr, _token) = start_hub(ServerConfig::default()).await;
    let peer = connect_peer(addr).await;

    let err = peer
        .call("auth.login", &json!({"username": "alice", "secret": "nope"}))
        .await
        .unwrap_err();
    match err {
        PeerError::Rpc(e) => assert_eq!(e.code, code::UNAUTHORIZED),
        other => panic!("expected 401, got {other:?}"),
    }
}

#[tokio::test]
async fn resume_token_authenticates_a_second_session() {
    let (hub, addr, _token) = start_hub(ServerConfig::default()).await;

    let first = connect_peer(addr).await;
    let login = first
        .call("auth.login", &json!({"username": "alice", "secret": "wonderland"}))
        .await
        .unwrap();
    let login: serde_json::Value = serde_json::from_str(login.get()).unwrap();
    let resume_token = login["token"].as_str().expect("login issues a token");

    let second = connect_peer(addr).await;
    second
        .call("auth.resume", &json!({"token": resume_token}))
        .await
        .unwrap();

    wait_for_stats(&hub, "both sessions authenticated under one identity", |stats| {
        stats.authenticated == 2 && stats.identities.get("alice") == Some(&2)
    })
    .await;

    let delivered = hub
        .send_to_identity("alice", "account.note", &"hi")
        .await
        .unwrap();
    assert_eq!(delivered, 2);
}

#[tokio::test]
async fn oversized_frame_terminates_the_session() {
    let config = ServerConfig {
        max_message_size: 256,
        ..ServerConfig::default()
    };
    let (hub, addr, _token) = start_hub(config).await;

    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws"))
        .await
        .unwrap();

    // A valid notification padded to exactly the cap passes.
    let prefix = r#"{"jsonrpc":"2.0","method":"log","params":""#;
    let suffix = r#""}"#;
    let padding = 256 - prefix.len() - suffix.len();
    let exact = format!("{prefix}{}{suffix}", "x".repeat(padding));
    assert_eq!(exact.len(), 256);
    ws.send(Message::Text(exact.into())).await.unwrap();

    // Session is still alive: an unknown method with an id answers -32601.
    ws.send(Message::Text(
        r#"{"jsonrpc":"2.0","method":"nop","id":"1"}"#.into(),
    ))
    .await
    .unwrap();
    let reply = loop {
        match ws.next().await.unwrap().unwrap() {
            Message::Text(text) => break text,
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected frame {other:?}"),
        }
    };
    let reply: serde_json::Value = serde_json::from_str(reply.as_str()).unwrap();
    assert_eq!(reply["error"]["code"], code::METHOD_NOT_FOUND);

    // One byte over the cap: the session is torn down.
    let over = format!("{prefix}{}{suffix}", "x".repeat(padding + 1));
    ws.send(Message::Text(over.into())).await.unwrap();

    wait_for_stats(&hub, "session torn down", |stats| stats.sessions == 0).await;
}

#[tokio::test]
async fn withheld_pong_terminates_the_session() {
    let config = ServerConfig {
        pong_wait: Duration::from_millis(200),
        ping_period: Duration::from_millis(180),
        ..ServerConfig::default()
    };
    let (hub, addr, _token) = start_hub(config).await;

    // Connect but never read: pings pile up unanswered.
    let (ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws"))
        .await
        .unwrap();

    wait_for_stats(&hub, "one session registered", |stats| stats.sessions == 1).await;
    wait_for_stats(&hub, "silent session torn down", |stats| stats.sessions == 0).await;

    drop(ws);
}
