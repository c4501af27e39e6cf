use crate::registry::Registry;
use crate::state::SharedState;
use axum::{
    extract::{
        ws::{Message, WebSocket},
        ConnectInfo, Query, State, WebSocketUpgrade,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use std::net::SocketAddr;
use tokio::sync::broadcast::error::RecvError;
use tracing::warn;

#[derive(Debug, Deserialize)]
pub struct RelayParams {
    #[serde(default)]
    pub key: String,
}

/// WebSocket relay endpoint: /relay?key=<source key>
pub async fn relay_handler(
    State(state): State<SharedState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Query(params): Query<RelayParams>,
    ws: WebSocketUpgrade,
) -> Response {
    let key = params.key.trim().to_string();

    // 1. Reject unknown or missing keys before the upgrade happens
    if key.is_empty() {
        return (StatusCode::BAD_REQUEST, "key required").into_response();
    }
    {
        let sources = state.sources.lock().unwrap();
        if !sources.contains_key(&key) {
            return (StatusCode::NOT_FOUND, "unknown key").into_response();
        }
    }

    // jsmpeg clients negotiate the "null" subprotocol
    ws.protocols(["null"])
        .on_upgrade(move |socket| relay_session(state, key, addr.to_string(), socket))
}

/// One task per viewer: forward feed chunks out, read inbound only for liveness
async fn relay_session(state: SharedState, key: String, viewer_key: String, mut socket: WebSocket) {
    // 2. Register the viewer; a lazy source is demand-started here
    let mut rx = match Registry::viewer_connected(&state, &key, &viewer_key) {
        Ok(rx) => rx,
        Err(e) => {
            // The source vanished between the upgrade check and registration
            warn!("viewer [{}] rejected: {}", viewer_key, e);
            return;
        }
    };

    // 3. Pump until the viewer leaves, stalls past its buffer, or the source is deleted
    loop {
        tokio::select! {
            chunk = rx.recv() => match chunk {
                Ok(chunk) => {
                    if socket.send(Message::Binary(chunk.to_vec())).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    // A stalled consumer is dropped instead of being fed a corrupted stream
                    warn!(
                        "viewer [{}] lagged {} chunks behind on [{}], dropping",
                        viewer_key, skipped, key
                    );
                    break;
                }
                Err(RecvError::Closed) => break,
            },
            inbound = socket.recv() => match inbound {
                // Inbound payloads are ignored, reads only prove liveness
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }

    // 4. Always unwind through the registry so the lazy stop policy runs
    Registry::viewer_disconnected(&state, &key, &viewer_key).await;
}
