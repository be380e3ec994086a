//! HTTP surface of the summary service.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use strands_types::{ChatMessage, StrandError};

use crate::consumer::QueueConsumer;
use crate::generator::SummaryGenerator;

#[derive(Clone)]
pub struct SummaryServiceState {
    pub consumer: Arc<QueueConsumer>,
    pub generator: Arc<SummaryGenerator>,
}

impl std::fmt::Debug for SummaryServiceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SummaryServiceState").finish_non_exhaustive()
    }
}

pub fn router(state: SummaryServiceState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/summary/generate", post(generate_summary))
        .route("/summary/{session_id}", get(get_summary))
        .route("/queue/status", get(queue_status))
        .route("/stats", get(stats))
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

async fn health(State(state): State<SummaryServiceState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "service": "strands-summary",
        "processed": state.consumer.processed_count(),
    }))
}

#[derive(Debug, Deserialize)]
struct GenerateSummaryRequest {
    messages: Vec<ChatMessage>,
}

/// On-demand summary of an arbitrary transcript (outside the queue path).
async fn generate_summary(
    State(state): State<SummaryServiceState>,
    Json(request): Json<GenerateSummaryRequest>,
) -> Response {
    match state.generator.generate_summary(&request.messages).await {
        Ok(summary) => Json(json!({"summary": summary})).into_response(),
        Err(e) => error_response(&e),
    }
}

async fn get_summary(
    State(state): State<SummaryServiceState>,
    Path(session_id): Path<Uuid>,
) -> Response {
    match state.consumer.summary_for(session_id).await {
        Ok(Some(summary)) => Json(summary).into_response(),
        Ok(None) => error_response(&StrandError::NotFound),
        Err(e) => error_response(&e),
    }
}

async fn queue_status(State(state): State<SummaryServiceState>) -> impl IntoResponse {
    Json(state.consumer.queue_status().await)
}

async fn stats(State(state): State<SummaryServiceState>) -> impl IntoResponse {
    Json(json!({
        "processed": state.consumer.processed_count(),
        "failed": state.consumer.failed_count(),
    }))
}
