//! Demo hub: serves `ping` and `echo` on `GET /ws`, with `auth.login`
//! wired to a static user.
//!
//! Run with `RUST_LOG=info cargo run -p echo-server`, then point
//! `echo-client` at it.

use std::sync::Arc;

use peerlink::{RpcError, code};
use peerlink_server::{Hub, ServerConfig, TokenAuthenticator, serve};
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let auth = Arc::new(TokenAuthenticator::new().with_user("admin", "change-me"));
    let hub = Hub::new(auth, ServerConfig::default());
    tokio::spawn(hub.clone().run());

    hub.register("ping", |_ctx, _session, _params| async move {
        serde_json::value::to_raw_value(&"pong").map_err(|_| RpcError::new(code::SERIALIZE_ERROR))
    });
    hub.register("echo", |_ctx, _session, params| async move {
        match params {
            Some(raw) => Ok(raw),
            None => Err(RpcError::invalid_params("echo requires params")),
        }
    });

    let addr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:8080".to_string());
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(%addr, "listening");

    let token = CancellationToken::new();
    tokio::spawn({
        let hub = hub.clone();
        let token = token.clone();
        async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutting down");
            hub.shutdown();
            token.cancel();
        }
    });

    serve(listener, hub, token).await?;
    Ok(())
}
