use axum::{
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
};
use skyfuse_core::processors::broadcast_bridge::snapshot_frame;
use tokio::sync::broadcast::error::RecvError;

use crate::state::AppState;

/// `GET /live`: WebSocket live stream.
///
/// Upgrades the HTTP connection and pushes `LiveServerMessage` JSON
/// frames: one snapshot, then every incremental frame the broadcast
/// bridge emits.
pub(super) async fn live_ws(State(state): State<AppState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_live_ws(socket, state))
}

/// Background task that drives a single viewer connection.
///
/// 1. Subscribes to the viewer hub.
/// 2. Sends the current cache as a snapshot frame.
/// 3. Relays incremental frames until the client disconnects.
async fn handle_live_ws(mut socket: WebSocket, state: AppState) {
    // Subscribe before reading the cache so that an update racing with the
    // snapshot still reaches this viewer.
    let mut frames = state.hub.subscribe();
    tracing::debug!(viewers = state.hub.viewer_count(), "Live viewer connected");

    let snapshot = match snapshot_frame(&state.live) {
        Ok(frame) => frame,
        Err(e) => {
            tracing::error!(error = %e, "WS: failed to serialize snapshot");
            let _ = socket.send(Message::Close(None)).await;
            return;
        }
    };
    if socket.send(Message::Text(snapshot.into())).await.is_err() {
        return;
    }

    loop {
        tokio::select! {
            result = frames.recv() => {
                match result {
                    Ok(frame) => {
                        if socket.send(Message::Text(frame.to_string().into())).await.is_err() {
                            break;
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "WS: live viewer lagged, continuing with next frame");
                    }
                    Err(RecvError::Closed) => {
                        let _ = socket.send(Message::Close(None)).await;
                        break;
                    }
                }
            }

            msg = socket.recv() => {
                match msg {
                    Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    tracing::debug!("Live viewer disconnected");
}
