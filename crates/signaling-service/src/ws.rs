//! WebSocket endpoint.
//!
//! Upgrades `GET /ws`, registers the new connection and hands the split
//! socket to the session tasks as a `Sink<String>` / `Stream` pair.

use crate::context::AppContext;
use crate::observability::metrics;
use crate::session::{spawn_session, TransportError};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use futures_util::{future, SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, warn};

pub fn ws_router(ctx: Arc<AppContext>) -> Router {
    Router::new().route("/ws", get(ws_upgrade)).with_state(ctx)
}

async fn ws_upgrade(
    ws: WebSocketUpgrade,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    State(ctx): State<Arc<AppContext>>,
) -> Response {
    ws.on_upgrade(move |socket| serve_socket(ctx, socket, peer))
}

async fn serve_socket(ctx: Arc<AppContext>, socket: WebSocket, peer: SocketAddr) {
    let (conn, outbound_rx) = ctx.open_connection(peer.to_string());
    debug!(target: "sig.ws", connection_id = conn.id(), client_addr = %peer, "WebSocket accepted");

    if let Err(e) = ctx.registry.register(Arc::clone(&conn)).await {
        warn!(target: "sig.ws", client_addr = %peer, error = %e, "Registry unavailable, dropping socket");
        metrics::record_connection_closed();
        return;
    }

    let (sink, stream) = socket.split();
    let sink = sink.with(|text: String| future::ready(Ok::<_, axum::Error>(Message::Text(text))));
    let stream = stream.filter_map(|item| {
        future::ready(match item {
            Ok(Message::Text(text)) => Some(Ok(text)),
            Ok(Message::Binary(bytes)) => Some(
                String::from_utf8(bytes).map_err(|e| TransportError::Io(format!("non-utf8 frame: {e}"))),
            ),
            Ok(Message::Close(_)) => Some(Err(TransportError::ClosedByPeer)),
            Ok(Message::Ping(_) | Message::Pong(_)) => None,
            Err(e) => Some(Err(TransportError::Io(e.to_string()))),
        })
    });

    spawn_session(ctx, conn, outbound_rx, Box::pin(sink), Box::pin(stream));
}
