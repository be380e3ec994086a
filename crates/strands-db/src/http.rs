//! HTTP surface of the NPC service.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use strands_types::{LifeStrand, LifeStrandUpdate, Memory, RecordStatus, StrandError};

use crate::embedding::EmbeddingBackend;
use crate::repository::{CharacterStore, NpcQuery};

#[derive(Clone)]
pub struct NpcServiceState {
    pub store: Arc<dyn CharacterStore>,
    pub embeddings: Arc<EmbeddingBackend>,
}

impl std::fmt::Debug for NpcServiceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NpcServiceState").finish_non_exhaustive()
    }
}

pub fn router(state: NpcServiceState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/npc", post(create_npc))
        .route("/npc/{npc_id}", get(get_npc))
        .route("/npc/{npc_id}", put(update_npc))
        .route("/npc/{npc_id}", delete(archive_npc))
        .route("/npc/{npc_id}/restore", post(restore_npc))
        .route("/npc/{npc_id}/prompt", get(get_npc_for_prompt))
        .route("/npc/{npc_id}/memories", post(add_memory))
        .route("/npcs", get(list_npcs))
        .route("/npcs/search", post(search_npcs))
        .route("/npcs/query", post(query_npcs))
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

async fn health(State(state): State<NpcServiceState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "service": "strands-npc",
        "embeddings_enabled": state.embeddings.is_enabled(),
    }))
}

async fn create_npc(
    State(state): State<NpcServiceState>,
    Json(strand): Json<LifeStrand>,
) -> Response {
    let embedding_text = strand.embedding_text();
    let npc_id = match state.store.create(strand).await {
        Ok(npc_id) => npc_id,
        Err(e) => return error_response(&e),
    };
    if state.embeddings.is_enabled() {
        match state.embeddings.embed_one(&embedding_text).await {
            Ok(vector) => {
                if let Err(e) = state.store.upsert_embedding(npc_id, &vector).await {
                    tracing::warn!(%npc_id, error = %e, "failed to store embedding");
                }
            }
            Err(e) => tracing::warn!(%npc_id, error = %e, "embedding generation failed"),
        }
    }
    (StatusCode::CREATED, Json(json!({"id": npc_id}))).into_response()
}

async fn get_npc(State(state): State<NpcServiceState>, Path(npc_id): Path<Uuid>) -> Response {
    match state.store.get(npc_id).await {
        Ok(Some(strand)) => Json(strand).into_response(),
        Ok(None) => error_response(&StrandError::NotFound),
        Err(e) => error_response(&e),
    }
}

async fn get_npc_for_prompt(
    State(state): State<NpcServiceState>,
    Path(npc_id): Path<Uuid>,
) -> Response {
    match state.store.get_for_prompt(npc_id).await {
        Ok(Some(strand)) => Json(strand).into_response(),
        Ok(None) => error_response(&StrandError::NotFound),
        Err(e) => error_response(&e),
    }
}

async fn update_npc(
    State(state): State<NpcServiceState>,
    Path(npc_id): Path<Uuid>,
    Json(update): Json<LifeStrandUpdate>,
) -> Response {
    match state.store.update(npc_id, &update).await {
        Ok(true) => {
            if state.embeddings.is_enabled() {
                refresh_embedding(&state, npc_id).await;
            }
            Json(json!({"status": "updated", "id": npc_id})).into_response()
        }
        Ok(false) => error_response(&StrandError::NotFound),
        Err(e) => error_response(&e),
    }
}

async fn refresh_embedding(state: &NpcServiceState, npc_id: Uuid) {
    let Ok(Some(strand)) = state.store.get(npc_id).await else {
        return;
    };
    match state.embeddings.embed_one(&strand.embedding_text()).await {
        Ok(vector) => {
            if let Err(e) = state.store.upsert_embedding(npc_id, &vector).await {
                tracing::warn!(%npc_id, error = %e, "failed to refresh embedding");
            }
        }
        Err(e) => tracing::warn!(%npc_id, error = %e, "embedding refresh failed"),
    }
}

async fn archive_npc(State(state): State<NpcServiceState>, Path(npc_id): Path<Uuid>) -> Response {
    match state.store.archive(npc_id).await {
        Ok(true) => Json(json!({"status": "archived", "id": npc_id})).into_response(),
        Ok(false) => error_response(&StrandError::NotFound),
        Err(e) => error_response(&e),
    }
}

async fn restore_npc(State(state): State<NpcServiceState>, Path(npc_id): Path<Uuid>) -> Response {
    match state.store.restore(npc_id).await {
        Ok(()) => Json(json!({"status": "active", "id": npc_id})).into_response(),
        Err(e) => match state.store.record_status(npc_id).await {
            // Restoring an already-active record is a conflict, not a 404.
            Ok(Some(status)) if status != RecordStatus::Archived => error_response(
                &StrandError::ValidationFailed("record is not archived".into()),
            ),
            _ => error_response(&e),
        },
    }
}

#[derive(Debug, Deserialize)]
struct AddMemoryRequest {
    #[serde(flatten)]
    memory: Memory,
}

async fn add_memory(
    State(state): State<NpcServiceState>,
    Path(npc_id): Path<Uuid>,
    Json(request): Json<AddMemoryRequest>,
) -> Response {
    match state.store.add_memory(npc_id, request.memory).await {
        Ok(true) => Json(json!({"status": "added", "id": npc_id})).into_response(),
        Ok(false) => error_response(&StrandError::NotFound),
        Err(e) => error_response(&e),
    }
}

#[derive(Debug, Deserialize)]
struct ListParams {
    #[serde(default = "default_limit")]
    limit: i64,
    #[serde(default)]
    offset: i64,
}

fn default_limit() -> i64 {
    50
}

async fn list_npcs(
    State(state): State<NpcServiceState>,
    Query(params): Query<ListParams>,
) -> Response {
    match state.store.list(params.limit.clamp(1, 200), params.offset).await {
        Ok(npcs) => Json(json!({"npcs": npcs})).into_response(),
        Err(e) => error_response(&e),
    }
}

#[derive(Debug, Deserialize)]
struct SearchRequest {
    query: String,
    #[serde(default = "default_search_limit")]
    limit: i64,
}

fn default_search_limit() -> i64 {
    10
}

/// Nearest-neighbour search over the embedding column. With embeddings
/// disabled every record shares the zero vector, so this is a no-op and
/// returns nothing.
async fn search_npcs(
    State(state): State<NpcServiceState>,
    Json(request): Json<SearchRequest>,
) -> Response {
    if !state.embeddings.is_enabled() {
        return Json(json!({"results": [], "embeddings_enabled": false})).into_response();
    }
    let vector = match state.embeddings.embed_one(&request.query).await {
        Ok(vector) => vector,
        Err(e) => return error_response(&e),
    };
    match state
        .store
        .search_by_embedding(&vector, request.limit.clamp(1, 50))
        .await
    {
        Ok(results) => Json(json!({"results": results})).into_response(),
        Err(e) => error_response(&e),
    }
}

async fn query_npcs(
    State(state): State<NpcServiceState>,
    Json(filters): Json<QueryRequest>,
) -> Response {
    let query = NpcQuery {
        location: filters.location,
        faction: filters.faction,
        status: filters.status,
        name_search: filters.name_search,
        age_min: filters.age_min,
        age_max: filters.age_max,
        limit: filters.limit.unwrap_or(50).clamp(1, 200),
    };
    match state.store.query(&query).await {
        Ok(npcs) => Json(json!({"npcs": npcs})).into_response(),
        Err(e) => error_response(&e),
    }
}

#[derive(Debug, Deserialize)]
struct QueryRequest {
    location: Option<String>,
    faction: Option<String>,
    status: Option<String>,
    name_search: Option<String>,
    age_min: Option<i32>,
    age_max: Option<i32>,
    limit: Option<i64>,
}

async fn stats(State(state): State<NpcServiceState>) -> Response {
    match state.store.stats().await {
        Ok(stats) => Json(stats).into_response(),
        Err(e) => error_response(&e),
    }
}
