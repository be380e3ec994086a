//! Summary service entrypoint: the post-conversation worker pool.

use std::sync::Arc;

use anyhow::Context;
use strands_config::SummaryServiceConfig;
use strands_db::{connect_redis, RedisQueue, RedisSummaryStore};
use strands_summary::client::{CompletionClient, HttpCompletionClient, HttpNpcStore};
use strands_summary::http::{router, SummaryServiceState};
use strands_summary::{ChangeApplier, ChangeExtractor, QueueConsumer, SummaryGenerator};

fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let config = SummaryServiceConfig::from_env();

    let redis = connect_redis(&config.redis_url)
        .await
        .context("redis connection")?;
    let queue = Arc::new(RedisQueue::summary_queue(redis.clone()));
    let store = Arc::new(RedisSummaryStore::new(redis));

    let model: Arc<dyn CompletionClient> = Arc::new(
        HttpCompletionClient::new(&config.model_service_url).context("model client")?,
    );
    let npcs = Arc::new(HttpNpcStore::new(&config.npc_service_url).context("npc client")?);

    let consumer = QueueConsumer::new(
        queue,
        store,
        npcs,
        SummaryGenerator::new(Arc::clone(&model)),
        ChangeExtractor::new(Arc::clone(&model)),
        ChangeApplier::new(config.auto_approval_threshold),
        config.worker_count,
        config.max_retries,
    );
    consumer.start();

    let state = SummaryServiceState {
        consumer: Arc::clone(&consumer),
        generator: Arc::new(SummaryGenerator::new(model)),
    };
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("bind {}", config.bind_addr))?;
    tracing::info!(addr = %config.bind_addr, "summary service listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    // Drain in-flight jobs before exiting.
    consumer.shutdown().await;
    Ok(())
}
