//! The gateway's HTTP surface: auth endpoints plus the proxy fallback, all
//! behind the auth-and-rate-limit gate.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use serde::Deserialize;
use serde_json::json;

use strands_types::StrandError;

use crate::auth::{AuthContext, AuthManager};
use crate::proxy::ProxyRouter;
use crate::rate_limit::RateLimiter;

/// Header carrying an API key, distinct from `Authorization`.
pub const API_KEY_HEADER: &str = "x-api-key";

const MAX_BODY_BYTES: usize = 4 * 1024 * 1024;

#[derive(Clone)]
pub struct GatewayState {
    pub auth: Arc<AuthManager>,
    pub limiter: Arc<RateLimiter>,
    pub proxy: Arc<ProxyRouter>,
}

impl std::fmt::Debug for GatewayState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayState").finish_non_exhaustive()
    }
}

pub fn router(state: GatewayState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/auth/login", post(login))
        .route("/auth/register", post(register))
        .route("/auth/me", get(me))
        .route("/services/status", get(services_status))
        .fallback(proxy_handler)
        .layer(middleware::from_fn_with_state(state.clone(), gate))
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

fn is_public(path: &str) -> bool {
    matches!(path, "/health" | "/auth/login" | "/auth/register")
}

/// Authentication and rate limiting in front of everything else. Rate
/// limits key on the user id when authenticated, the remote address
/// otherwise; excess returns 429 with `Retry-After: 60`.
async fn gate(State(state): State<GatewayState>, mut request: Request, next: Next) -> Response {
    let path = request.uri().path().to_string();

    let bearer = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(ToString::to_string);
    let api_key = request
        .headers()
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(ToString::to_string);

    let context = match state
        .auth
        .authenticate(bearer.as_deref(), api_key.as_deref())
    {
        Ok(context) => Some(context),
        Err(_) if is_public(&path) => None,
        Err(e) => return error_response(&e),
    };

    let client_id = context
        .as_ref()
        .map(|c| c.user_id.clone())
        .or_else(|| {
            request
                .extensions()
                .get::<ConnectInfo<SocketAddr>>()
                .map(|info| info.0.ip().to_string())
        })
        .unwrap_or_else(|| "unknown".to_string());

    if !state.limiter.is_allowed(&client_id) {
        tracing::warn!(client_id, "rate limit exceeded");
        return (
            StatusCode::TOO_MANY_REQUESTS,
            [(
                header::RETRY_AFTER,
                state.limiter.retry_after_secs().to_string(),
            )],
            Json(json!({
                "error": "rate_limited",
                "message": "rate limit exceeded, please try again later",
            })),
        )
            .into_response();
    }

    if let Some(context) = context {
        request.extensions_mut().insert(context);
    }
    next.run(request).await
}

async fn health(State(state): State<GatewayState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "service": "strands-gateway",
        "breakers": state.proxy.breaker_status(),
    }))
}

#[derive(Debug, Deserialize)]
struct LoginRequest {
    username: String,
    password: String,
}

async fn login(State(state): State<GatewayState>, Json(request): Json<LoginRequest>) -> Response {
    match state.auth.login(&request.username, &request.password).await {
        Ok(access_token) => Json(json!({
            "access_token": access_token,
            "token_type": "bearer",
        }))
        .into_response(),
        Err(e) => error_response(&e),
    }
}

async fn register(
    State(state): State<GatewayState>,
    Json(request): Json<LoginRequest>,
) -> Response {
    match state
        .auth
        .register(&request.username, &request.password)
        .await
    {
        Ok(context) => Json(json!({
            "message": "user registered successfully",
            "user_id": context.user_id,
        }))
        .into_response(),
        Err(e) => error_response(&e),
    }
}

async fn me(context: Option<Extension<AuthContext>>) -> Response {
    match context {
        Some(Extension(context)) => Json(json!({
            "user_id": context.user_id,
            "username": context.username,
            "role": context.role,
        }))
        .into_response(),
        None => error_response(&StrandError::Unauthenticated),
    }
}

async fn services_status(State(state): State<GatewayState>) -> impl IntoResponse {
    Json(json!({"breakers": state.proxy.breaker_status()}))
}

/// Everything else is forwarded by prefix to the internal services.
async fn proxy_handler(State(state): State<GatewayState>, request: Request) -> Response {
    let method = request.method().as_str().to_string();
    let path = request.uri().path().to_string();
    let query = request.uri().query().map(ToString::to_string);

    let mut headers = Vec::new();
    for name in [header::CONTENT_TYPE.as_str(), header::ACCEPT.as_str()] {
        if let Some(value) = request.headers().get(name).and_then(|v| v.to_str().ok()) {
            headers.push((name.to_string(), value.to_string()));
        }
    }
    if let Some(context) = request.extensions().get::<AuthContext>() {
        headers.push(("x-user-id".to_string(), context.user_id.clone()));
    }

    let body = match axum::body::to_bytes(request.into_body(), MAX_BODY_BYTES).await {
        Ok(bytes) => bytes.to_vec(),
        Err(_) => {
            return error_response(&StrandError::ValidationFailed("body too large".into()))
        }
    };

    let forwarded = state
        .proxy
        .forward(&method, &path, query.as_deref(), &headers, body)
        .await;

    let mut builder = Response::builder()
        .status(StatusCode::from_u16(forwarded.status).unwrap_or(StatusCode::BAD_GATEWAY));
    if let Some(content_type) = &forwarded.content_type {
        builder = builder.header(header::CONTENT_TYPE, content_type);
    }
    if let Some(retry_after) = forwarded.retry_after {
        builder = builder.header(header::RETRY_AFTER, retry_after.to_string());
    }
    builder
        .body(Body::from(forwarded.body))
        .unwrap_or_else(|_| StatusCode::BAD_GATEWAY.into_response())
}
