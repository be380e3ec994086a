//! Model service entrypoint: builds the runtime pools and the request
//! pipeline, then serves the generation API.

use std::sync::Arc;

use anyhow::Context;
use strands_config::ModelServiceConfig;
use strands_model::backend::{InferenceBackend, LlamaServerBackend, MockBackend, ModelConfig};
use strands_model::http::{router, ModelServiceState};
use strands_model::pipeline::{PipelineConfig, RequestPipeline};
use strands_model::runtime::{EmbeddingPool, GenerationPool};
use strands_model::vram::VramAccountant;
use strands_types::ModelType;

fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let config = ModelServiceConfig::from_env();

    let backend: Arc<dyn InferenceBackend> = match &config.backend_url {
        Some(url) => {
            tracing::info!(url, "using llama server backend");
            Arc::new(LlamaServerBackend::new(url.clone()).context("backend client")?)
        }
        None => {
            tracing::warn!("LLAMA_SERVER_URL not set, using deterministic mock backend");
            Arc::new(MockBackend::new())
        }
    };

    let mut chat = ModelConfig::defaults_for(ModelType::Chat, config.embedding_dimensions);
    chat.context_size = config.chat_context_size;
    let mut summary = ModelConfig::defaults_for(ModelType::Summary, config.embedding_dimensions);
    summary.context_size = config.summary_context_size;
    let embedding = ModelConfig::defaults_for(ModelType::Embedding, config.embedding_dimensions);

    let generation_pool = GenerationPool::new(
        Arc::clone(&backend),
        vec![chat, summary],
        VramAccountant::new(config.total_vram_mb, config.vram_safety_margin_mb),
    );
    let embedding_pool = EmbeddingPool::initialize(&backend, embedding)
        .await
        .context("embedding pool")?;

    let pipeline = RequestPipeline::new(
        Arc::clone(&generation_pool),
        Arc::clone(&embedding_pool),
        PipelineConfig::from(&config),
    );
    pipeline.start();

    let state = ModelServiceState {
        pipeline: Arc::clone(&pipeline),
        generation_pool: Arc::clone(&generation_pool),
        embedding_pool,
    };
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("bind {}", config.bind_addr))?;
    tracing::info!(addr = %config.bind_addr, "model service listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    // Stop accepting, then free the GPU.
    pipeline.shutdown().await;
    generation_pool.emergency_shutdown().await;
    Ok(())
}
