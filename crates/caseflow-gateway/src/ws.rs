//! WebSocket relay for live agent output.
//!
//! Protocol:
//! → Client connects: /ws/{agent_id}
//! ← Server replays the retained log history, oldest first, then the
//!   last retained screen frame
//! ← Server sends every live frame as it arrives:
//!   {"type":"log","data":"..."} / {"type":"screen","data":"<base64>"}
//!
//! Log and screen frames share the socket; the `type` field tells them
//! apart. A subscriber that falls behind the broadcast buffer is
//! dropped a few frames, not disconnected.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::IntoResponse;
use tokio::sync::broadcast::error::RecvError;

use super::server::AppState;

/// WebSocket upgrade handler.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(agent_id): Path<String>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| relay(socket, state, agent_id))
}

async fn relay(mut socket: WebSocket, state: Arc<AppState>, agent_id: String) {
    tracing::info!("relay client attached to {agent_id}");
    let (log_history, mut log_rx) = state.bus.subscribe(&format!("{agent_id}:log"));
    let (screen_history, mut screen_rx) = state.bus.subscribe(&format!("{agent_id}:screen"));

    for event in log_history {
        if send_event(&mut socket, &event).await.is_err() {
            return;
        }
    }
    // only the freshest frame is worth replaying
    if let Some(frame) = screen_history.last() {
        if send_event(&mut socket, frame).await.is_err() {
            return;
        }
    }

    loop {
        tokio::select! {
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(Message::Ping(data))) => {
                        if socket.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(_)) => {} // relay is one-way, client text is ignored
                    Some(Err(e)) => {
                        tracing::debug!("relay client on {agent_id} errored: {e}");
                        break;
                    }
                }
            }
            event = log_rx.recv() => {
                if forward(&mut socket, &agent_id, event).await.is_err() {
                    break;
                }
            }
            event = screen_rx.recv() => {
                if forward(&mut socket, &agent_id, event).await.is_err() {
                    break;
                }
            }
        }
    }
    tracing::info!("relay client left {agent_id}");
}

/// Pushes one received frame out, swallowing lag. `Err` means the
/// session is over.
async fn forward(
    socket: &mut WebSocket,
    agent_id: &str,
    event: Result<caseflow_bus::Event, RecvError>,
) -> Result<(), ()> {
    match event {
        Ok(event) => send_event(socket, &event).await.map_err(|_| ()),
        Err(RecvError::Lagged(missed)) => {
            tracing::warn!("relay client on {agent_id} lagged, {missed} frames dropped");
            Ok(())
        }
        Err(RecvError::Closed) => Err(()),
    }
}

async fn send_event(socket: &mut WebSocket, event: &caseflow_bus::Event) -> Result<(), axum::Error> {
    let text = serde_json::to_string(event).unwrap_or_else(|_| "{}".into());
    socket.send(Message::Text(text.into())).await
}
