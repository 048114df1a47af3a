//! Demo client: logs in, calls `ping` and `echo`, fires a notification.
//!
//! Run `echo-server` first, then `RUST_LOG=info cargo run -p echo-client`.

use std::sync::Arc;
use std::time::Duration;

use peerlink::{Client, ClientConfig};
use peerlink_transport_websocket::WsProvider;
use serde_json::json;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let url = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "ws://127.0.0.1:8080/ws".to_string());

    let client = Client::new(WsProvider::new(), ClientConfig::new(url))
        .with_auth(&json!({"username": "admin", "secret": "change-me"}))?;
    client.on_status_change(|connected| tracing::info!(connected, "status changed"));
    client.on_notification(|method, params| {
        let params = params.map(|p| p.get().to_string());
        tracing::info!(method, ?params, "notification");
    });

    let client = Arc::new(client);
    let token = CancellationToken::new();
    tokio::spawn({
        let client = client.clone();
        let token = token.clone();
        async move {
            if let Err(e) = client.run(token).await {
                tracing::error!(error = %e, "client stopped");
            }
        }
    });

    while !client.is_connected() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    let pong: String = client.call("ping", &()).await?;
    println!("ping -> {pong}");

    let echoed: serde_json::Value = client
        .call("echo", &json!({"hello": "world", "n": 7}))
        .await?;
    println!("echo -> {echoed}");

    client.notify("log", &"demo finished").await?;

    token.cancel();
    Ok(())
}
