//! The distributed work queue and its poison list.
//!
//! Producers LPUSH, consumers BRPOP, so the list behaves as a FIFO. Jobs
//! that cannot even be decoded go to the poison list verbatim.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tokio::sync::Notify;

use strands_types::StrandError;

use crate::{POISON_QUEUE_KEY, SUMMARY_QUEUE_KEY};

fn redis_err(e: redis::RedisError) -> StrandError {
    StrandError::StorageError(e.to_string())
}

#[async_trait]
pub trait WorkQueue: Send + Sync {
    /// Enqueue a job payload at the producer end.
    async fn push(&self, payload: String) -> Result<(), StrandError>;

    /// Blocking pop with a timeout; `None` on timeout.
    async fn pop(&self, timeout: Duration) -> Result<Option<String>, StrandError>;

    async fn len(&self) -> Result<usize, StrandError>;

    /// Quarantine an undecodable message verbatim.
    async fn quarantine(&self, payload: String) -> Result<(), StrandError>;

    async fn poison_len(&self) -> Result<usize, StrandError>;
}

#[derive(Clone)]
pub struct RedisQueue {
    conn: ConnectionManager,
    queue_key: String,
    poison_key: String,
}

impl std::fmt::Debug for RedisQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisQueue")
            .field("queue_key", &self.queue_key)
            .finish_non_exhaustive()
    }
}

impl RedisQueue {
    pub fn summary_queue(conn: ConnectionManager) -> Self {
        Self {
            conn,
            queue_key: SUMMARY_QUEUE_KEY.to_string(),
            poison_key: POISON_QUEUE_KEY.to_string(),
        }
    }
}

#[async_trait]
impl WorkQueue for RedisQueue {
    async fn push(&self, payload: String) -> Result<(), StrandError> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .lpush(&self.queue_key, payload)
            .await
            .map_err(redis_err)?;
        Ok(())
    }

    async fn pop(&self, timeout: Duration) -> Result<Option<String>, StrandError> {
        let mut conn = self.conn.clone();
        let result: Option<(String, String)> = conn
            .brpop(&self.queue_key, timeout.as_secs_f64())
            .await
            .map_err(redis_err)?;
        Ok(result.map(|(_, payload)| payload))
    }

    async fn len(&self) -> Result<usize, StrandError> {
        let mut conn = self.conn.clone();
        let len: usize = conn.llen(&self.queue_key).await.map_err(redis_err)?;
        Ok(len)
    }

    async fn quarantine(&self, payload: String) -> Result<(), StrandError> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .lpush(&self.poison_key, payload)
            .await
            .map_err(redis_err)?;
        Ok(())
    }

    async fn poison_len(&self) -> Result<usize, StrandError> {
        let mut conn = self.conn.clone();
        let len: usize = conn.llen(&self.poison_key).await.map_err(redis_err)?;
        Ok(len)
    }
}

/// In-memory FIFO with the same contract, for worker tests.
#[derive(Debug, Default)]
pub struct MemoryQueue {
    items: Mutex<VecDeque<String>>,
    poison: Mutex<Vec<String>>,
    ready: Notify,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn poison_items(&self) -> Vec<String> {
        self.poison.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl WorkQueue for MemoryQueue {
    async fn push(&self, payload: String) -> Result<(), StrandError> {
        self.items
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_front(payload);
        self.ready.notify_one();
        Ok(())
    }

    async fn pop(&self, timeout: Duration) -> Result<Option<String>, StrandError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(item) = self
                .items
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .pop_back()
            {
                return Ok(Some(item));
            }
            if tokio::time::timeout_at(deadline, self.ready.notified())
                .await
                .is_err()
            {
                return Ok(None);
            }
        }
    }

    async fn len(&self) -> Result<usize, StrandError> {
        Ok(self.items.lock().unwrap_or_else(|e| e.into_inner()).len())
    }

    async fn quarantine(&self, payload: String) -> Result<(), StrandError> {
        self.poison
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(payload);
        Ok(())
    }

    async fn poison_len(&self) -> Result<usize, StrandError> {
        Ok(self.poison.lock().unwrap_or_else(|e| e.into_inner()).len())
    }
}
