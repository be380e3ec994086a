//! NPC service entrypoint: the character store.

use std::sync::Arc;

use anyhow::Context;
use strands_config::NpcServiceConfig;
use strands_db::http::{router, NpcServiceState};
use strands_db::{EmbeddingBackend, NpcRepository};

fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let config = NpcServiceConfig::from_env();

    let repo = NpcRepository::connect(&config.database_url, config.embedding_dimensions)
        .await
        .context("database connection")?;

    let embeddings = if config.embeddings_enabled {
        EmbeddingBackend::real(&config.model_service_url, config.embedding_dimensions)
            .context("embedding backend")?
    } else {
        tracing::info!("embeddings disabled; vector search is a no-op");
        EmbeddingBackend::disabled(config.embedding_dimensions)
    };

    let app = router(NpcServiceState {
        store: Arc::new(repo),
        embeddings: Arc::new(embeddings),
    });

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("bind {}", config.bind_addr))?;
    tracing::info!(addr = %config.bind_addr, "npc service listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;
    Ok(())
}
