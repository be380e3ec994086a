//! Gateway entrypoint: auth, rate limiting, and proxy routing in front of
//! the internal services.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use strands_config::GatewayConfig;
use strands_gateway::auth::{AuthManager, InMemoryCredentials, UserRole};
use strands_gateway::http::{router, GatewayState};
use strands_gateway::proxy::{ProxyRouter, RouteRule};
use strands_gateway::RateLimiter;

fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();
}

fn routing_table(config: &GatewayConfig) -> Vec<RouteRule> {
    vec![
        // Order matters: the first matching prefix wins.
        RouteRule::new(
            "/summary/queue/",
            &config.summary_service_url,
            Some("/summary"),
            "summary-service",
        ),
        RouteRule::new("/summary/", &config.summary_service_url, None, "summary-service"),
        RouteRule::new("/chat/", &config.chat_service_url, Some("/chat"), "chat-service"),
        RouteRule::new("/model/", &config.model_service_url, Some("/model"), "model-service"),
        RouteRule::new("/npc", &config.npc_service_url, None, "npc-service"),
    ]
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let config = GatewayConfig::from_env();

    // Dev credentials; production replaces the store behind the trait.
    let credentials = InMemoryCredentials::new()
        .with_user("admin", "admin-dev-password", UserRole::Admin);
    let auth = Arc::new(AuthManager::new(
        config.jwt_secret.clone(),
        config.jwt_issuer.clone(),
        config.jwt_expiration,
        Box::new(credentials),
    ));

    let proxy = Arc::new(
        ProxyRouter::new(
            routing_table(&config),
            config.retry_attempts,
            config.request_timeout,
            config.breaker_failure_threshold,
            config.breaker_recovery_timeout,
        )
        .context("proxy router")?,
    );

    let state = GatewayState {
        auth,
        limiter: Arc::new(RateLimiter::new(config.requests_per_minute)),
        proxy,
    };
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("bind {}", config.bind_addr))?;
    tracing::info!(addr = %config.bind_addr, "gateway listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async {
        let _ = tokio::signal::ctrl_c().await;
    })
    .await?;
    Ok(())
}
