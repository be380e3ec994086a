//! WebSocket endpoints: per-session chat streaming and the monitor feed.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Path, State, WebSocketUpgrade};
use axum::response::Response;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use uuid::Uuid;

use strands_types::ws::{ClientFrame, ServerFrame};
use strands_types::StrandError;

use crate::buffer::TokenBuffer;
use crate::connections::ConnectionRegistry;
use crate::http::ChatServiceState;
use crate::session::ConversationManager;

const MONITOR_PUSH_INTERVAL: Duration = Duration::from_secs(5);
const CONNECTION_REAP_INTERVAL: Duration = Duration::from_secs(60);

pub async fn ws_session(
    ws: WebSocketUpgrade,
    Path(session_id): Path<Uuid>,
    State(state): State<ChatServiceState>,
) -> Response {
    ws.on_upgrade(move |socket| handle_session_socket(state, socket, session_id))
}

pub async fn ws_monitor(ws: WebSocketUpgrade, State(state): State<ChatServiceState>) -> Response {
    ws.on_upgrade(move |socket| handle_monitor_socket(state, socket))
}

/// Periodically drop connections that stopped heartbeating.
pub fn spawn_connection_reaper(
    registry: Arc<ConnectionRegistry>,
    stale_timeout: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(CONNECTION_REAP_INTERVAL).await;
            registry.reap_stale(stale_timeout);
        }
    })
}

fn frame_message(frame: &ServerFrame) -> Option<Message> {
    serde_json::to_string(frame).ok().map(|s| Message::Text(s.into()))
}

async fn handle_session_socket(state: ChatServiceState, socket: WebSocket, session_id: Uuid) {
    let connection_id = format!("conn_{}", Uuid::new_v4());
    let user_id = state
        .manager
        .session_user(session_id)
        .await
        .unwrap_or_else(|| "anonymous".to_string());

    let (mut socket_tx, mut socket_rx) = socket.split();
    let (frames_tx, mut frames_rx) = mpsc::channel::<ServerFrame>(64);
    state.registry.add(&connection_id, &user_id, frames_tx.clone());
    tracing::info!(connection_id, %session_id, "websocket connected");

    // Writer task: everything outbound funnels through one channel.
    let writer = tokio::spawn(async move {
        while let Some(frame) = frames_rx.recv().await {
            let Some(message) = frame_message(&frame) else {
                continue;
            };
            if socket_tx.send(message).await.is_err() {
                break;
            }
        }
        let _ = socket_tx.close().await;
    });

    // Heartbeats keep idle connections open.
    let heartbeat = {
        let frames_tx = frames_tx.clone();
        let interval = state.heartbeat_interval;
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                if frames_tx.send(ServerFrame::Heartbeat).await.is_err() {
                    break;
                }
            }
        })
    };

    let _ = frames_tx
        .send(ServerFrame::ConnectionEstablished {
            connection_id: connection_id.clone(),
            user_id: user_id.clone(),
        })
        .await;

    while let Some(message) = socket_rx.next().await {
        let message = match message {
            Ok(message) => message,
            Err(_) => break,
        };
        state.registry.touch_heartbeat(&connection_id);
        match message {
            Message::Text(text) => {
                let frame: ClientFrame = match serde_json::from_str(&text) {
                    Ok(frame) => frame,
                    Err(_) => {
                        let _ = frames_tx
                            .send(ServerFrame::Error {
                                message: "invalid message format".to_string(),
                            })
                            .await;
                        continue;
                    }
                };
                match frame {
                    ClientFrame::Ping => {
                        let _ = frames_tx.send(ServerFrame::Pong).await;
                    }
                    ClientFrame::SubscribeNpc { npc_id } => {
                        if state.registry.subscribe_npc(&connection_id, npc_id) {
                            let _ = frames_tx
                                .send(ServerFrame::SubscriptionConfirmed { npc_id })
                                .await;
                        }
                    }
                    ClientFrame::Message { message } => {
                        stream_response(&state.manager, session_id, message, &frames_tx).await;
                    }
                }
            }
            Message::Close(_) => break,
            Message::Ping(_) | Message::Pong(_) | Message::Binary(_) => {}
        }
    }

    state.registry.remove(&connection_id);
    heartbeat.abort();
    writer.abort();
    tracing::info!(connection_id, %session_id, "websocket closed");
}

/// Run one user turn: submit, buffer tokens into word-boundary chunks,
/// finish with a flush and `response_complete`. A send failure means the
/// client is gone; dropping the token receiver cancels the stream upstream.
async fn stream_response(
    manager: &Arc<ConversationManager>,
    session_id: Uuid,
    text: String,
    frames_tx: &mpsc::Sender<ServerFrame>,
) {
    let mut tokens = match manager.process_message(session_id, text).await {
        Ok(tokens) => tokens,
        Err(e) => {
            let _ = frames_tx
                .send(ServerFrame::Error {
                    message: user_facing_message(&e),
                })
                .await;
            return;
        }
    };

    let mut buffer = TokenBuffer::default();
    while let Some(item) = tokens.recv().await {
        match item {
            Ok(token) => {
                if let Some(chunk) = buffer.push(token) {
                    if frames_tx
                        .send(ServerFrame::ResponseChunk { chunk })
                        .await
                        .is_err()
                    {
                        return;
                    }
                }
            }
            Err(e) => {
                let _ = frames_tx
                    .send(ServerFrame::Error {
                        message: user_facing_message(&e),
                    })
                    .await;
                return;
            }
        }
    }
    if let Some(chunk) = buffer.flush() {
        let _ = frames_tx.send(ServerFrame::ResponseChunk { chunk }).await;
    }
    let _ = frames_tx.send(ServerFrame::ResponseComplete).await;
}

fn user_facing_message(error: &StrandError) -> String {
    match error {
        StrandError::NotFound => "character not found; the session has been closed".to_string(),
        StrandError::ServiceUnavailable(_) => {
            "the model is temporarily unavailable, please retry shortly".to_string()
        }
        StrandError::Timeout => "the response timed out".to_string(),
        other => format!("something went wrong: {}", other.kind()),
    }
}

async fn handle_monitor_socket(state: ChatServiceState, socket: WebSocket) {
    let (mut socket_tx, mut socket_rx) = socket.split();
    loop {
        tokio::select! {
            () = tokio::time::sleep(MONITOR_PUSH_INTERVAL) => {
                let sessions = state.manager.active_sessions().await;
                let frame = ServerFrame::SessionUpdate {
                    active_sessions: sessions.len(),
                    sessions,
                };
                let Some(message) = frame_message(&frame) else { continue };
                if socket_tx.send(message).await.is_err() {
                    break;
                }
            }
            incoming = socket_rx.next() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                    Some(Ok(Message::Text(text))) => {
                        if let Ok(ClientFrame::Ping) = serde_json::from_str::<ClientFrame>(&text) {
                            if let Some(message) = frame_message(&ServerFrame::Pong) {
                                let _ = socket_tx.send(message).await;
                            }
                        }
                    }
                    Some(Ok(_)) => {}
                }
            }
        }
    }
}
