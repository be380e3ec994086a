//! HTTP surface of the chat service.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use strands_types::StrandError;

use crate::connections::ConnectionRegistry;
use crate::session::ConversationManager;
use crate::ws;

#[derive(Clone)]
pub struct ChatServiceState {
    pub manager: Arc<ConversationManager>,
    pub registry: Arc<ConnectionRegistry>,
    pub heartbeat_interval: Duration,
}

impl std::fmt::Debug for ChatServiceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatServiceState").finish_non_exhaustive()
    }
}

pub fn router(state: ChatServiceState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/conversation/start", post(start_conversation))
        .route("/conversation/send", post(send_message))
        .route("/conversation/{session_id}/end", post(end_conversation))
        .route("/conversation/{session_id}/history", get(history))
        .route("/conversations/active", get(active_conversations))
        .route("/metrics", get(metrics))
        .route("/ws/{session_id}", get(ws::ws_session))
        .route("/ws/monitor", get(ws::ws_monitor))
        .with_state(state)
}

fn error_response(err: &StrandError) -> Response {
    let status =
        StatusCode::from_u16(err.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (
        status,
        Json(json!({"error": err.kind(), "message": err.to_string()})),
    )
        .into_response()
}

async fn health(State(state): State<ChatServiceState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "service": "strands-chat",
        "active_sessions": state.manager.active_count(),
        "connected_websockets": state.registry.connection_count(),
    }))
}

#[derive(Debug, Deserialize)]
struct StartRequest {
    npc_id: Uuid,
    #[serde(default = "default_user")]
    user_id: String,
}

fn default_user() -> String {
    "anonymous".to_string()
}

async fn start_conversation(
    State(state): State<ChatServiceState>,
    Json(request): Json<StartRequest>,
) -> Response {
    match state
        .manager
        .start_conversation(request.npc_id, &request.user_id)
        .await
    {
        Ok(session_id) => Json(json!({"session_id": session_id})).into_response(),
        Err(e) => error_response(&e),
    }
}

#[derive(Debug, Deserialize)]
struct SendRequest {
    session_id: Uuid,
    message: String,
}

/// Non-WebSocket send: waits for the full response. The WebSocket path is
/// the streaming one.
async fn send_message(
    State(state): State<ChatServiceState>,
    Json(request): Json<SendRequest>,
) -> Response {
    let mut tokens = match state
        .manager
        .process_message(request.session_id, request.message)
        .await
    {
        Ok(tokens) => tokens,
        Err(e) => return error_response(&e),
    };
    let mut response = String::new();
    while let Some(item) = tokens.recv().await {
        match item {
            Ok(token) => response.push_str(&token),
            Err(e) => return error_response(&e),
        }
    }
    Json(json!({"session_id": request.session_id, "response": response})).into_response()
}

async fn end_conversation(
    State(state): State<ChatServiceState>,
    Path(session_id): Path<Uuid>,
) -> Response {
    match state.manager.end_conversation(session_id).await {
        Ok(()) => Json(json!({"status": "ended", "session_id": session_id})).into_response(),
        Err(e) => error_response(&e),
    }
}

async fn history(
    State(state): State<ChatServiceState>,
    Path(session_id): Path<Uuid>,
) -> Response {
    match state.manager.history(session_id).await {
        Ok(messages) => Json(json!({"session_id": session_id, "messages": messages})).into_response(),
        Err(e) => error_response(&e),
    }
}

async fn active_conversations(State(state): State<ChatServiceState>) -> impl IntoResponse {
    let sessions = state.manager.active_sessions().await;
    Json(json!({"active_sessions": sessions.len(), "sessions": sessions}))
}

async fn metrics(State(state): State<ChatServiceState>) -> impl IntoResponse {
    let stream_stats: serde_json::Value = state
        .manager
        .stream_stats()
        .into_iter()
        .map(|(session_id, stats)| (session_id.to_string(), serde_json::to_value(stats).unwrap_or_default()))
        .collect::<serde_json::Map<_, _>>()
        .into();
    Json(json!({
        "sessions": state.manager.active_count(),
        "connections": state.registry.stats(),
        "streams": stream_stats,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use strands_db::{MemoryQueue, MemorySessionStore, WorkQueue};
    use strands_types::{LifeStrand, SummaryJob};
    use tokio::sync::mpsc;
    use tower::ServiceExt as _;

    use crate::client::{GenerationClient, NpcDirectory, TokenReceiver};
    use crate::context::ContextBuilder;

    struct EchoModel;

    #[async_trait]
    impl GenerationClient for EchoModel {
        async fn stream_chat(&self, _prompt: String) -> Result<TokenReceiver, StrandError> {
            let (tx, rx) = mpsc::channel(8);
            tokio::spawn(async move {
                for token in ["Good", " day", "."] {
                    if tx.send(Ok(token.to_string())).await.is_err() {
                        return;
                    }
                }
            });
            Ok(rx)
        }
    }

    struct AnyNpc;

    #[async_trait]
    impl NpcDirectory for AnyNpc {
        async fn get_for_prompt(&self, _npc_id: Uuid) -> Result<Option<LifeStrand>, StrandError> {
            Ok(Some(LifeStrand::new("Alice")))
        }

        async fn exists(&self, _npc_id: Uuid) -> Result<bool, StrandError> {
            Ok(true)
        }
    }

    fn test_state() -> (ChatServiceState, Arc<MemoryQueue>) {
        let queue = Arc::new(MemoryQueue::new());
        let manager = ConversationManager::new(
            Arc::new(MemorySessionStore::new()),
            queue.clone(),
            Arc::new(EchoModel),
            Arc::new(AnyNpc),
            Arc::new(ContextBuilder::default()),
            Duration::from_secs(1800),
            Duration::from_secs(300),
        );
        let state = ChatServiceState {
            manager,
            registry: Arc::new(ConnectionRegistry::new()),
            heartbeat_interval: Duration::from_secs(30),
        };
        (state, queue)
    }

    async fn post_json(app: Router, path: &str, body: serde_json::Value) -> (StatusCode, serde_json::Value) {
        let response = app
            .oneshot(
                Request::post(path)
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, value)
    }

    #[tokio::test]
    async fn start_send_history_round_trip() {
        let (state, _queue) = test_state();
        let app = router(state.clone());
        let npc_id = Uuid::new_v4();

        let (status, started) = post_json(
            app.clone(),
            "/conversation/start",
            json!({"npc_id": npc_id, "user_id": "user-1"}),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let session_id = started["session_id"].as_str().unwrap().to_string();

        let (status, sent) = post_json(
            app.clone(),
            "/conversation/send",
            json!({"session_id": session_id, "message": "Hello"}),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(sent["response"], "Good day.");

        let response = app
            .oneshot(
                Request::get(format!("/conversation/{session_id}/history"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["messages"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn missing_session_is_404() {
        let (state, _queue) = test_state();
        let app = router(state);
        let (status, body) = post_json(
            app,
            "/conversation/send",
            json!({"session_id": Uuid::new_v4(), "message": "hi"}),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "not_found");
    }

    #[tokio::test]
    async fn end_over_http_enqueues_the_summary_job() {
        let (state, queue) = test_state();
        let app = router(state);
        let npc_id = Uuid::new_v4();

        let (_, started) = post_json(
            app.clone(),
            "/conversation/start",
            json!({"npc_id": npc_id, "user_id": "user-9"}),
        )
        .await;
        let session_id = started["session_id"].as_str().unwrap().to_string();

        let (status, sent) = post_json(
            app.clone(),
            "/conversation/send",
            json!({"session_id": session_id, "message": "bye"}),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(sent["response"], "Good day.");

        let response = app
            .oneshot(
                Request::post(format!("/conversation/{session_id}/end"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let payload = queue
            .pop(Duration::from_secs(1))
            .await
            .unwrap()
            .expect("summary job enqueued");
        let job: SummaryJob = serde_json::from_str(&payload).unwrap();
        assert_eq!(job.session_id.to_string(), session_id);
        assert_eq!(job.user_id, "user-9");
        assert_eq!(job.messages.len(), 2);
        assert_eq!(job.retry_count, 0);
    }
}
