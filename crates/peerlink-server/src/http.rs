//! The hub's HTTP surface: exactly one endpoint, `GET /ws`, upgrading to
//! WebSocket.
//!
//! Origin checking is deliberately permissive; deployments that need a
//! policy put a reverse proxy or middleware in front.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::extract::ws::WebSocket;
use axum::extract::{ConnectInfo, State, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use futures_util::StreamExt;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::session::{read_pump, write_pump};
use crate::{Hub, Session};

/// Build the hub's router: `GET /ws` and nothing else.
pub fn router(hub: Arc<Hub>) -> Router {
    Router::new().route("/ws", get(ws_handler)).with_state(hub)
}

/// Serve the hub on an already-bound listener until `token` cancels.
pub async fn serve(
    listener: TcpListener,
    hub: Arc<Hub>,
    token: CancellationToken,
) -> std::io::Result<()> {
    let app = router(hub).into_make_service_with_connect_info::<SocketAddr>();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { token.cancelled().await })
        .await
}

async fn ws_handler(
    State(hub): State<Arc<Hub>>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let config = hub.config();
    ws.max_message_size(config.max_message_size)
        .write_buffer_size(config.write_buffer_size)
        .on_upgrade(move |socket| handle_socket(hub, socket, remote))
}

async fn handle_socket(hub: Arc<Hub>, socket: WebSocket, remote: SocketAddr) {
    let config = hub.config();
    let (sink, stream) = socket.split();

    let (outbound_tx, outbound_rx) = mpsc::channel(config.send_queue_capacity);
    let session = Arc::new(Session::new(
        hub.next_session_id(),
        remote.to_string(),
        outbound_tx,
    ));
    tracing::debug!(sid = session.id(), %remote, "connection upgraded");

    if hub.send_register(session.clone()).is_err() {
        tracing::warn!(%remote, "hub is shut down, refusing session");
        return;
    }

    let writer = tokio::spawn(write_pump(
        sink,
        outbound_rx,
        session.token().clone(),
        config,
    ));
    read_pump(stream, hub, session).await;
    let _ = writer.await;
}
