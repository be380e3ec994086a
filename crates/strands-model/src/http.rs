//! HTTP surface of the model service.
//!
//! Generation streams back as newline-delimited JSON token frames; the rest
//! of the surface is plain JSON over axum.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use tokio_stream::wrappers::ReceiverStream;

use strands_types::{
    EmbeddingsRequest, EmbeddingsResponse, GenerateRequest, ModelType, SamplingParams,
    ServiceClass, StrandError, TokenFrame,
};

use crate::pipeline::RequestPipeline;
use crate::runtime::{EmbeddingPool, GenerationPool};

#[derive(Clone)]
pub struct ModelServiceState {
    pub pipeline: Arc<RequestPipeline>,
    pub generation_pool: Arc<GenerationPool>,
    pub embedding_pool: Arc<EmbeddingPool>,
}

impl std::fmt::Debug for ModelServiceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelServiceState").finish_non_exhaustive()
    }
}

pub fn router(state: ModelServiceState) -> Router {
    Router::new()
        .route("/ping", get(ping))
        .route("/health", get(health))
        .route("/generate", post(generate))
        .route("/embeddings", post(embeddings))
        .route("/status", get(status))
        .route("/vram", get(vram))
        .route("/metrics", get(metrics))
        .route("/switch/{model_type}", post(switch_model))
        .route("/load-model", post(load_model))
        .route("/unload-model", post(unload_model))
        .route("/emergency-shutdown", post(emergency_shutdown))
        .with_state(state)
}

/// Structured error body; never leaks internals beyond the error message.
fn error_response(err: &StrandError, retry_after: Option<u64>) -> Response {
    let status =
        StatusCode::from_u16(err.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let body = Json(json!({"error": err.kind(), "message": err.to_string()}));
    match retry_after {
        Some(secs) => (status, [(header::RETRY_AFTER, secs.to_string())], body).into_response(),
        None => (status, body).into_response(),
    }
}

async fn ping() -> impl IntoResponse {
    Json(json!({"status": "ok", "service": "strands-model"}))
}

async fn health(State(state): State<ModelServiceState>) -> impl IntoResponse {
    let health = state.pipeline.health();
    let status = if health.healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(health))
}

async fn status(State(state): State<ModelServiceState>) -> impl IntoResponse {
    Json(json!({
        "generation_pool": state.generation_pool.status(),
        "embedding_pool": state.embedding_pool.status(),
        "pipeline": state.pipeline.stats(),
    }))
}

async fn vram(State(state): State<ModelServiceState>) -> impl IntoResponse {
    Json(state.generation_pool.vram_snapshot())
}

async fn metrics(State(state): State<ModelServiceState>) -> impl IntoResponse {
    Json(json!({
        "pipeline": state.pipeline.stats(),
        "pool": state.generation_pool.metrics(),
    }))
}

async fn generate(
    State(state): State<ModelServiceState>,
    Json(request): Json<GenerateRequest>,
) -> Response {
    let class = request.service_class.unwrap_or(ServiceClass::Chat);
    let params = request.params.unwrap_or_else(SamplingParams::default);
    let timeout = request.timeout_secs.map(Duration::from_secs);

    let stream = match state
        .pipeline
        .submit_generation(class, request.prompt, params, request.priority, timeout)
        .await
    {
        Ok(stream) => stream,
        Err(e) => {
            let retry_after = matches!(e, StrandError::ServiceUnavailable(_))
                .then(|| state.pipeline.breaker_retry_after(class));
            return error_response(&e, retry_after);
        }
    };

    if !request.stream {
        return match stream.collect_text().await {
            Ok(text) => Json(json!({"text": text})).into_response(),
            Err(e) => error_response(&e, None),
        };
    }

    // NDJSON token frames; the consumer dropping the connection cancels the
    // producer through the stream's cancel flag.
    let (tx, rx) = tokio::sync::mpsc::channel::<Result<Vec<u8>, std::io::Error>>(64);
    tokio::spawn(async move {
        let mut stream = stream;
        while let Some(item) = stream.next_token().await {
            let frame = match item {
                Ok(token) => TokenFrame::Token { token },
                Err(e) => {
                    let frame = TokenFrame::Error {
                        message: e.to_string(),
                    };
                    let _ = tx.send(Ok(frame_line(&frame))).await;
                    return;
                }
            };
            if tx.send(Ok(frame_line(&frame))).await.is_err() {
                stream.cancel();
                return;
            }
        }
        let _ = tx.send(Ok(frame_line(&TokenFrame::Done))).await;
    });

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/x-ndjson")
        .header(header::CACHE_CONTROL, "no-cache")
        .body(Body::from_stream(ReceiverStream::new(rx)))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

fn frame_line(frame: &TokenFrame) -> Vec<u8> {
    let mut line = serde_json::to_vec(frame).unwrap_or_default();
    line.push(b'\n');
    line
}

async fn embeddings(
    State(state): State<ModelServiceState>,
    Json(request): Json<EmbeddingsRequest>,
) -> Response {
    if request.texts.is_empty() {
        return error_response(
            &StrandError::ValidationFailed("texts must not be empty".into()),
            None,
        );
    }
    let timeout = request.timeout_secs.map(Duration::from_secs);
    match state
        .pipeline
        .submit_embedding(request.texts, request.priority, timeout)
        .await
    {
        Ok(embeddings) => Json(EmbeddingsResponse { embeddings }).into_response(),
        Err(e) => {
            let retry_after = matches!(e, StrandError::ServiceUnavailable(_))
                .then(|| state.pipeline.breaker_retry_after(ServiceClass::Npc));
            error_response(&e, retry_after)
        }
    }
}

async fn switch_model(
    State(state): State<ModelServiceState>,
    Path(model_type): Path<String>,
) -> Response {
    let Ok(model_type) = model_type.parse::<ModelType>() else {
        return error_response(
            &StrandError::ValidationFailed(format!("unknown model type: {model_type}")),
            None,
        );
    };
    match state.generation_pool.ensure_loaded(model_type).await {
        Ok(()) => Json(json!({
            "status": "loaded",
            "model_type": model_type.as_str(),
        }))
        .into_response(),
        Err(e) => error_response(&e, None),
    }
}

#[derive(Debug, serde::Deserialize)]
struct LoadModelRequest {
    model_type: ModelType,
}

async fn load_model(
    State(state): State<ModelServiceState>,
    Json(request): Json<LoadModelRequest>,
) -> Response {
    match state.generation_pool.ensure_loaded(request.model_type).await {
        Ok(()) => Json(json!({
            "status": "loaded",
            "model_type": request.model_type.as_str(),
        }))
        .into_response(),
        Err(e) => error_response(&e, None),
    }
}

async fn unload_model(State(state): State<ModelServiceState>) -> Response {
    match state.generation_pool.unload_current().await {
        Ok(()) => Json(json!({"status": "unloaded"})).into_response(),
        Err(e) => error_response(&e, None),
    }
}

async fn emergency_shutdown(State(state): State<ModelServiceState>) -> impl IntoResponse {
    state.generation_pool.emergency_shutdown().await;
    Json(json!({"status": "shutdown_complete"}))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{InferenceBackend, MockBackend, ModelConfig};
    use crate::pipeline::PipelineConfig;
    use crate::vram::VramAccountant;
    use axum::body::to_bytes;
    use axum::http::Request;
    use tower::ServiceExt as _;

    async fn test_state() -> ModelServiceState {
        test_state_with(Arc::new(MockBackend::new())).await
    }

    async fn test_state_with(backend: Arc<MockBackend>) -> ModelServiceState {
        let backend: Arc<dyn InferenceBackend> = backend;
        let generation_pool = GenerationPool::new(
            Arc::clone(&backend),
            vec![
                ModelConfig::defaults_for(ModelType::Chat, 384),
                ModelConfig::defaults_for(ModelType::Summary, 384),
            ],
            VramAccountant::new(24_576, 1024),
        );
        let embedding_pool = EmbeddingPool::initialize(
            &backend,
            ModelConfig::defaults_for(ModelType::Embedding, 384),
        )
        .await
        .unwrap();
        let pipeline = RequestPipeline::new(
            Arc::clone(&generation_pool),
            Arc::clone(&embedding_pool),
            PipelineConfig::default(),
        );
        pipeline.start();
        ModelServiceState {
            pipeline,
            generation_pool,
            embedding_pool,
        }
    }

    #[tokio::test]
    async fn ping_responds_ok() {
        let app = router(test_state().await);
        let response = app
            .oneshot(Request::get("/ping").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn generate_streams_ndjson_frames() {
        let app = router(test_state().await);
        let body = serde_json::to_string(&serde_json::json!({
            "prompt": "say something nice",
            "service_class": "chat",
            "stream": true,
        }))
        .unwrap();
        let response = app
            .oneshot(
                Request::post("/generate")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        let frames: Vec<TokenFrame> = text
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert!(frames.len() > 1);
        assert!(matches!(frames.last(), Some(TokenFrame::Done)));
        assert!(frames
            .iter()
            .any(|f| matches!(f, TokenFrame::Token { token } if !token.is_empty())));
    }

    #[tokio::test]
    async fn embeddings_endpoint_returns_vectors() {
        let app = router(test_state().await);
        let body = serde_json::to_string(&serde_json::json!({"texts": ["a", "b"]})).unwrap();
        let response = app
            .oneshot(
                Request::post("/embeddings")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let parsed: EmbeddingsResponse = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(parsed.embeddings.len(), 2);
        assert_eq!(parsed.embeddings[0].len(), 384);
    }

    #[tokio::test]
    async fn switch_endpoint_loads_requested_model() {
        let app = router(test_state().await);
        let response = app
            .oneshot(
                Request::post("/switch/summary")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn breaker_trip_surfaces_503_with_retry_after() {
        let backend = Arc::new(MockBackend::new());
        backend.fail_next_loads(5);
        let app = router(test_state_with(backend).await);
        let request_body = serde_json::json!({
            "prompt": "x",
            "service_class": "chat",
            "stream": false,
            "timeout_secs": 10,
        })
        .to_string();

        for _ in 0..5 {
            let response = app
                .clone()
                .oneshot(
                    Request::post("/generate")
                        .header(header::CONTENT_TYPE, "application/json")
                        .body(Body::from(request_body.clone()))
                        .unwrap(),
                )
                .await
                .unwrap();
            assert!(response.status().is_server_error());
        }

        // Sixth request: the breaker is open, 503 with Retry-After near 60.
        let response = app
            .oneshot(
                Request::post("/generate")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(request_body))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let retry_after: u64 = response
            .headers()
            .get(header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
            .expect("retry-after header");
        assert!(retry_after > 0 && retry_after <= 60);
    }

    #[tokio::test]
    async fn unknown_model_type_is_a_validation_error() {
        let app = router(test_state().await);
        let response = app
            .oneshot(
                Request::post("/switch/frobnicator")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
