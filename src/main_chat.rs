//! Chat service entrypoint: session orchestration and WebSocket streaming.

use std::sync::Arc;

use anyhow::Context;
use strands_chat::client::{HttpModelClient, HttpNpcClient};
use strands_chat::context::{ContextBudgets, ContextBuilder};
use strands_chat::http::{router, ChatServiceState};
use strands_chat::session::ConversationManager;
use strands_chat::ws::spawn_connection_reaper;
use strands_chat::ConnectionRegistry;
use strands_config::ChatServiceConfig;
use strands_db::{connect_redis, RedisQueue, RedisSessionStore};

fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let config = ChatServiceConfig::from_env();

    let redis = connect_redis(&config.redis_url)
        .await
        .context("redis connection")?;
    let store = Arc::new(RedisSessionStore::new(redis.clone()));
    let queue = Arc::new(RedisQueue::summary_queue(redis));

    let model = Arc::new(HttpModelClient::new(&config.model_service_url).context("model client")?);
    let npcs = Arc::new(HttpNpcClient::new(&config.npc_service_url).context("npc client")?);

    let budgets = ContextBudgets {
        max_context_tokens: config.max_context_tokens,
        system_prompt_tokens: config.system_prompt_tokens,
        history_tokens: config.history_tokens,
        knowledge_tokens: config.knowledge_tokens,
    };
    let manager = ConversationManager::new(
        store,
        queue,
        model,
        npcs,
        Arc::new(ContextBuilder::new(budgets)),
        config.idle_timeout,
        config.cleanup_interval,
    );
    manager.start();

    let registry = Arc::new(ConnectionRegistry::new());
    let reaper = spawn_connection_reaper(Arc::clone(&registry), config.stale_connection_timeout);

    let state = ChatServiceState {
        manager: Arc::clone(&manager),
        registry,
        heartbeat_interval: config.heartbeat_interval,
    };
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("bind {}", config.bind_addr))?;
    tracing::info!(addr = %config.bind_addr, "chat service listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    reaper.abort();
    manager.shutdown().await;
    Ok(())
}
