//! Session and summary caches with pub/sub notification.
//!
//! Redis implementations carry the documented key layout; the in-memory
//! implementations back the orchestrator and worker test suites.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde_json::Value;
use uuid::Uuid;

use strands_types::{ConversationSession, StrandError};

pub const SESSION_TTL: Duration = Duration::from_secs(24 * 3600);
pub const SUMMARY_TTL: Duration = Duration::from_secs(7 * 24 * 3600);
pub const SUMMARY_ERROR_TTL: Duration = Duration::from_secs(3 * 24 * 3600);
pub const COMPLETION_FLAG_TTL: Duration = Duration::from_secs(24 * 3600);

fn redis_err(e: redis::RedisError) -> StrandError {
    StrandError::StorageError(e.to_string())
}

/// Mirror of the orchestrator's sessions: `conversation:{session_id}` with a
/// 24 h TTL. Reads may be slightly stale; the in-memory copy is
/// authoritative when present.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn store(&self, session: &ConversationSession) -> Result<(), StrandError>;
    async fn load(&self, session_id: Uuid) -> Result<Option<ConversationSession>, StrandError>;
    /// Pub/sub side channel for session lifecycle events.
    async fn publish(&self, channel: &str, payload: &Value) -> Result<(), StrandError>;
}

#[derive(Clone)]
pub struct RedisSessionStore {
    conn: ConnectionManager,
}

impl std::fmt::Debug for RedisSessionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisSessionStore").finish_non_exhaustive()
    }
}

impl RedisSessionStore {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }

    fn key(session_id: Uuid) -> String {
        format!("conversation:{session_id}")
    }
}

#[async_trait]
impl SessionStore for RedisSessionStore {
    async fn store(&self, session: &ConversationSession) -> Result<(), StrandError> {
        let payload = serde_json::to_string(session)?;
        let mut conn = self.conn.clone();
        let _: () = conn
            .set_ex(Self::key(session.session_id), payload, SESSION_TTL.as_secs())
            .await
            .map_err(redis_err)?;
        Ok(())
    }

    async fn load(&self, session_id: Uuid) -> Result<Option<ConversationSession>, StrandError> {
        let mut conn = self.conn.clone();
        let payload: Option<String> = conn.get(Self::key(session_id)).await.map_err(redis_err)?;
        match payload {
            Some(payload) => Ok(Some(serde_json::from_str(&payload)?)),
            None => Ok(None),
        }
    }

    async fn publish(&self, channel: &str, payload: &Value) -> Result<(), StrandError> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .publish(channel, payload.to_string())
            .await
            .map_err(redis_err)?;
        Ok(())
    }
}

/// In-memory stand-in for tests; published messages are kept for asserts.
#[derive(Debug, Default)]
pub struct MemorySessionStore {
    sessions: Mutex<HashMap<Uuid, ConversationSession>>,
    published: Mutex<Vec<(String, Value)>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn published(&self) -> Vec<(String, Value)> {
        self.published.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn store(&self, session: &ConversationSession) -> Result<(), StrandError> {
        self.sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(session.session_id, session.clone());
        Ok(())
    }

    async fn load(&self, session_id: Uuid) -> Result<Option<ConversationSession>, StrandError> {
        Ok(self
            .sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&session_id)
            .cloned())
    }

    async fn publish(&self, channel: &str, payload: &Value) -> Result<(), StrandError> {
        self.published
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((channel.to_string(), payload.clone()));
        Ok(())
    }
}

/// Summary results and processing errors: `summary:{session_id}` (7 days),
/// `summary_error:{session_id}` (3 days), a completion flag, and the
/// completion notification channel.
#[async_trait]
pub trait SummaryStore: Send + Sync {
    async fn store_summary(&self, session_id: Uuid, payload: &Value) -> Result<(), StrandError>;
    async fn load_summary(&self, session_id: Uuid) -> Result<Option<Value>, StrandError>;
    async fn store_error(&self, session_id: Uuid, payload: &Value) -> Result<(), StrandError>;
    async fn load_error(&self, session_id: Uuid) -> Result<Option<Value>, StrandError>;
    async fn mark_completed(&self, session_id: Uuid) -> Result<(), StrandError>;
    async fn publish(&self, channel: &str, payload: &Value) -> Result<(), StrandError>;
}

#[derive(Clone)]
pub struct RedisSummaryStore {
    conn: ConnectionManager,
}

impl std::fmt::Debug for RedisSummaryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisSummaryStore").finish_non_exhaustive()
    }
}

impl RedisSummaryStore {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl SummaryStore for RedisSummaryStore {
    async fn store_summary(&self, session_id: Uuid, payload: &Value) -> Result<(), StrandError> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .set_ex(
                format!("summary:{session_id}"),
                payload.to_string(),
                SUMMARY_TTL.as_secs(),
            )
            .await
            .map_err(redis_err)?;
        Ok(())
    }

    async fn load_summary(&self, session_id: Uuid) -> Result<Option<Value>, StrandError> {
        let mut conn = self.conn.clone();
        let payload: Option<String> = conn
            .get(format!("summary:{session_id}"))
            .await
            .map_err(redis_err)?;
        match payload {
            Some(payload) => Ok(Some(serde_json::from_str(&payload)?)),
            None => Ok(None),
        }
    }

    async fn store_error(&self, session_id: Uuid, payload: &Value) -> Result<(), StrandError> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .set_ex(
                format!("summary_error:{session_id}"),
                payload.to_string(),
                SUMMARY_ERROR_TTL.as_secs(),
            )
            .await
            .map_err(redis_err)?;
        Ok(())
    }

    async fn load_error(&self, session_id: Uuid) -> Result<Option<Value>, StrandError> {
        let mut conn = self.conn.clone();
        let payload: Option<String> = conn
            .get(format!("summary_error:{session_id}"))
            .await
            .map_err(redis_err)?;
        match payload {
            Some(payload) => Ok(Some(serde_json::from_str(&payload)?)),
            None => Ok(None),
        }
    }

    async fn mark_completed(&self, session_id: Uuid) -> Result<(), StrandError> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .set_ex(
                format!("summary_completed:{session_id}"),
                "true",
                COMPLETION_FLAG_TTL.as_secs(),
            )
            .await
            .map_err(redis_err)?;
        Ok(())
    }

    async fn publish(&self, channel: &str, payload: &Value) -> Result<(), StrandError> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .publish(channel, payload.to_string())
            .await
            .map_err(redis_err)?;
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MemorySummaryStore {
    summaries: Mutex<HashMap<Uuid, Value>>,
    errors: Mutex<HashMap<Uuid, Value>>,
    completed: Mutex<Vec<Uuid>>,
    published: Mutex<Vec<(String, Value)>>,
}

impl MemorySummaryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn completed(&self) -> Vec<Uuid> {
        self.completed.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn published(&self) -> Vec<(String, Value)> {
        self.published.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl SummaryStore for MemorySummaryStore {
    async fn store_summary(&self, session_id: Uuid, payload: &Value) -> Result<(), StrandError> {
        self.summaries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(session_id, payload.clone());
        Ok(())
    }

    async fn load_summary(&self, session_id: Uuid) -> Result<Option<Value>, StrandError> {
        Ok(self
            .summaries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&session_id)
            .cloned())
    }

    async fn store_error(&self, session_id: Uuid, payload: &Value) -> Result<(), StrandError> {
        self.errors
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(session_id, payload.clone());
        Ok(())
    }

    async fn load_error(&self, session_id: Uuid) -> Result<Option<Value>, StrandError> {
        Ok(self
            .errors
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&session_id)
            .cloned())
    }

    async fn mark_completed(&self, session_id: Uuid) -> Result<(), StrandError> {
        self.completed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(session_id);
        Ok(())
    }

    async fn publish(&self, channel: &str, payload: &Value) -> Result<(), StrandError> {
        self.published
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((channel.to_string(), payload.clone()));
        Ok(())
    }
}
