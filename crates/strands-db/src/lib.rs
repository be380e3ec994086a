//! Persistence for the Life Strands services.
//!
//! The Postgres repository owns the character table (with its pgvector
//! column); Redis carries the transient state: session cache, summary
//! cache, the summary work queue with its poison list, and the pub/sub
//! notification channels. Everything the other services substitute in
//! tests is behind a trait with an in-memory implementation.

pub mod cache;
pub mod embedding;
pub mod http;
pub mod queue;
pub mod repository;

pub use cache::{MemorySessionStore, MemorySummaryStore, RedisSessionStore, RedisSummaryStore,
    SessionStore, SummaryStore};
pub use embedding::EmbeddingBackend;
pub use queue::{MemoryQueue, RedisQueue, WorkQueue};
pub use repository::{
    CharacterStore, MemoryCharacterStore, NpcQuery, NpcRepository, NpcSummary, VectorHit,
};

/// Redis key for the summary work queue.
pub const SUMMARY_QUEUE_KEY: &str = "summary_queue";
/// Redis key for undecodable jobs.
pub const POISON_QUEUE_KEY: &str = "poison_messages";
/// Pub/sub channel for summary completion events.
pub const SUMMARY_NOTIFICATIONS_CHANNEL: &str = "summary_notifications";
/// Pub/sub channel for model-service-facing session events.
pub const MODEL_NOTIFICATIONS_CHANNEL: &str = "model_service_notifications";

/// Open a Redis connection manager from a URL.
pub async fn connect_redis(
    url: &str,
) -> Result<redis::aio::ConnectionManager, strands_types::StrandError> {
    let client = redis::Client::open(url)
        .map_err(|e| strands_types::StrandError::StorageError(e.to_string()))?;
    redis::aio::ConnectionManager::new(client)
        .await
        .map_err(|e| strands_types::StrandError::StorageError(e.to_string()))
}
