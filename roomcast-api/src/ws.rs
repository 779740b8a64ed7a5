//! WebSocket endpoint: one read loop and one write pump per connection,
//! joined through the session hub's bounded channel.

use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket},
        ConnectInfo, State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use tracing::{debug, info, warn};

use roomcast_core::models::ConnectionId;

use crate::http::AppState;
use crate::proto::ClientEvent;

/// GET /ws: upgrade to the event protocol.
pub async fn websocket_handler(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, addr, state))
}

async fn handle_socket(socket: WebSocket, addr: SocketAddr, state: AppState) {
    let conn_id = ConnectionId::new();
    let mut outbound = state.dispatcher.hub.register(conn_id.clone(), addr.ip());
    state.dispatcher.handle_connect(&conn_id).await;

    info!(connection = %conn_id, remote = %addr, "WebSocket connected");

    let (mut sender, mut receiver) = socket.split();

    // Write pump: hub events out to the socket. Ends when the hub drops the
    // connection's channel (eviction or unregister).
    let writer_conn = conn_id.clone();
    let writer = tokio::spawn(async move {
        while let Some(event) = outbound.recv().await {
            let payload = match serde_json::to_string(&event) {
                Ok(json) => json,
                Err(e) => {
                    warn!(connection = %writer_conn, error = %e, "Failed to encode event");
                    continue;
                }
            };
            if sender.send(WsMessage::Text(payload.into())).await.is_err() {
                break;
            }
        }
        let _ = sender.close().await;
    });

    // Read loop: decode and dispatch. Bad payloads are dropped with a
    // warning, never a disconnect.
    while let Some(message) = receiver.next().await {
        match message {
            Ok(WsMessage::Text(raw)) => {
                match serde_json::from_str::<ClientEvent>(&raw) {
                    Ok(event) => {
                        debug!(connection = %conn_id, event = event.name(), "Inbound event");
                        state.dispatcher.dispatch(&conn_id, event).await;
                    }
                    Err(e) => {
                        warn!(connection = %conn_id, error = %e, "Dropping malformed event");
                    }
                }
            }
            Ok(WsMessage::Close(_)) => {
                debug!(connection = %conn_id, "WebSocket closed by client");
                break;
            }
            Ok(WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Binary(_)) => {}
            Err(e) => {
                warn!(connection = %conn_id, error = %e, "WebSocket error");
                break;
            }
        }
    }

    state.dispatcher.handle_disconnect(&conn_id).await;
    writer.abort();
    info!(connection = %conn_id, "WebSocket disconnected");
}
