use axum::{
    body::Bytes,
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt, stream::SplitSink, stream::SplitStream};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;

use leadboard_common::{Lead, Stage, TaskState};

use super::api::SharedState;
use super::auth::AuthSession;

/// How often to send WebSocket Ping frames.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// How long to wait for a Pong response before considering the connection dead.
const PONG_TIMEOUT: Duration = Duration::from_secs(60);

// ── Board events ─────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum BoardEvent {
    LeadCreated {
        lead: Lead,
    },
    LeadUpdated {
        lead: Lead,
    },
    LeadMoved {
        lead_id: i64,
        from_status: Stage,
        to_status: Stage,
        card_order: i64,
    },
    LeadDeleted {
        lead_id: i64,
    },
    TaskFinished {
        task_id: String,
        state: TaskState,
    },
}

/// A board event addressed to the user who owns the affected data.
#[derive(Debug, Clone)]
pub struct UserEvent {
    pub user_id: i64,
    pub event: BoardEvent,
}

/// Broadcast an event to the owner's connected sockets.
/// Returns silently even if no clients are connected.
pub fn publish(tx: &broadcast::Sender<UserEvent>, user_id: i64, event: BoardEvent) {
    let _ = tx.send(UserEvent { user_id, event });
}

// ── WebSocket handler ────────────────────────────────────────────────

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    auth: AuthSession,
    State(state): State<SharedState>,
) -> impl IntoResponse {
    let rx = state.events.subscribe();
    let user_id = auth.user_id;
    tracing::debug!(user_id, "WebSocket connected");
    ws.on_upgrade(move |socket| handle_socket(socket, user_id, rx))
}

async fn handle_socket(socket: WebSocket, user_id: i64, rx: broadcast::Receiver<UserEvent>) {
    let (sender, receiver) = socket.split();
    run_socket_loop(sender, receiver, rx, user_id).await;
    tracing::debug!(user_id, "WebSocket closed");
}

/// Core WebSocket loop with ping/pong keepalive.
///
/// Forwards the user's board events, watches client frames, and pings
/// periodically. If no Pong arrives within [`PONG_TIMEOUT`] after a Ping,
/// the connection is considered dead and the loop exits.
async fn run_socket_loop(
    mut sender: SplitSink<WebSocket, Message>,
    mut receiver: SplitStream<WebSocket>,
    mut rx: broadcast::Receiver<UserEvent>,
    user_id: i64,
) {
    let mut ping_interval = tokio::time::interval(PING_INTERVAL);
    // The first tick completes immediately.
    ping_interval.tick().await;

    let mut last_pong = Instant::now();
    let mut awaiting_pong = false;

    loop {
        tokio::select! {
            _ = ping_interval.tick() => {
                if awaiting_pong && last_pong.elapsed() > PONG_TIMEOUT {
                    break;
                }
                if sender.send(Message::Ping(Bytes::new())).await.is_err() {
                    break;
                }
                awaiting_pong = true;
            }

            result = rx.recv() => {
                match result {
                    Ok(envelope) => {
                        let Some(json) = event_json_for(&envelope, user_id) else {
                            continue;
                        };
                        if sender.send(Message::Text(json.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(user_id, skipped, "WebSocket client lagged behind board events");
                        continue;
                    }
                }
            }

            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Pong(_))) => {
                        last_pong = Instant::now();
                        awaiting_pong = false;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
        }
    }

    let _ = sender.send(Message::Close(None)).await;
}

/// Serialized event if it belongs to `user_id`.
fn event_json_for(envelope: &UserEvent, user_id: i64) -> Option<String> {
    if envelope.user_id != user_id {
        return None;
    }
    match serde_json::to_string(&envelope.event) {
        Ok(json) => Some(json),
        Err(e) => {
            tracing::error!(error = %e, "Failed to serialize board event");
            None
        }
    }
}
