//! WebSocket transport: one binary frame per prost envelope.

use axum::Router;
use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use futures_util::{SinkExt, StreamExt};
use prost::Message as _;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use vigil_wire::{ServerEnvelope, decode_client};

use crate::actor::CoordinatorHandle;

pub fn router(handle: CoordinatorHandle) -> Router {
    Router::new()
        .route("/ws", get(upgrade))
        .route("/healthz", get(|| async { "ok" }))
        .with_state(handle)
}

async fn upgrade(ws: WebSocketUpgrade, State(handle): State<CoordinatorHandle>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| serve_socket(socket, handle))
}

async fn serve_socket(socket: WebSocket, handle: CoordinatorHandle) {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerEnvelope>();
    let Some(conn) = handle.connect(tx).await else {
        return;
    };
    debug!(conn, "websocket connected");

    let writer = tokio::spawn(async move {
        while let Some(envelope) = rx.recv().await {
            if sink
                .send(Message::Binary(envelope.encode_to_vec()))
                .await
                .is_err()
            {
                break;
            }
        }
    });

    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Binary(bytes)) => match decode_client(&bytes) {
                Ok(envelope) => handle.inbound(conn, envelope).await,
                Err(e) => warn!(conn, error = %e, "undecodable frame dropped"),
            },
            Ok(Message::Text(_)) => warn!(conn, "text frame dropped"),
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!(conn, error = %e, "websocket read failed");
                break;
            }
        }
    }

    handle.disconnect(conn).await;
    writer.abort();
    debug!(conn, "websocket closed");
}
