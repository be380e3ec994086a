//! Session lifecycle and message orchestration.
//!
//! The manager owns per-session state in memory, mirrors it to the session
//! cache, serializes message processing per session, and enqueues a summary
//! job when a conversation ends. An idle reaper terminates sessions whose
//! last activity is older than the idle timeout.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use strands_db::{SessionStore, WorkQueue, MODEL_NOTIFICATIONS_CHANNEL};
use strands_types::{ChatMessage, ConversationSession, MessageRole, StrandError, SummaryJob};

use crate::buffer::StreamMetrics;
use crate::client::{GenerationClient, NpcDirectory, TokenReceiver};
use crate::context::ContextBuilder;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug)]
struct SessionSlot {
    data: tokio::sync::Mutex<ConversationSession>,
}

pub struct ConversationManager {
    sessions: Mutex<HashMap<Uuid, Arc<SessionSlot>>>,
    store: Arc<dyn SessionStore>,
    queue: Arc<dyn WorkQueue>,
    model: Arc<dyn GenerationClient>,
    npcs: Arc<dyn NpcDirectory>,
    context: Arc<ContextBuilder>,
    idle_timeout: Duration,
    cleanup_interval: Duration,
    stream_stats: Mutex<HashMap<Uuid, crate::buffer::StreamStats>>,
    reaper: Mutex<Option<tokio::task::JoinHandle<()>>>,
    shutdown: watch::Sender<bool>,
}

impl std::fmt::Debug for ConversationManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConversationManager")
            .field("idle_timeout", &self.idle_timeout)
            .finish_non_exhaustive()
    }
}

impl ConversationManager {
    pub fn new(
        store: Arc<dyn SessionStore>,
        queue: Arc<dyn WorkQueue>,
        model: Arc<dyn GenerationClient>,
        npcs: Arc<dyn NpcDirectory>,
        context: Arc<ContextBuilder>,
        idle_timeout: Duration,
        cleanup_interval: Duration,
    ) -> Arc<Self> {
        let (shutdown, _) = watch::channel(false);
        Arc::new(Self {
            sessions: Mutex::new(HashMap::new()),
            store,
            queue,
            model,
            npcs,
            context,
            idle_timeout,
            cleanup_interval,
            stream_stats: Mutex::new(HashMap::new()),
            reaper: Mutex::new(None),
            shutdown,
        })
    }

    /// Spawn the idle reaper. Idempotent.
    pub fn start(self: &Arc<Self>) {
        let mut reaper = lock(&self.reaper);
        if reaper.is_some() {
            return;
        }
        let manager = Arc::clone(self);
        let mut stop = self.shutdown.subscribe();
        *reaper = Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = tokio::time::sleep(manager.cleanup_interval) => {}
                    _ = stop.changed() => break,
                }
                manager.reap_expired().await;
            }
        }));
    }

    /// Create a session after validating the character exists.
    pub async fn start_conversation(
        &self,
        npc_id: Uuid,
        user_id: &str,
    ) -> Result<Uuid, StrandError> {
        if !self.npcs.exists(npc_id).await? {
            return Err(StrandError::NotFound);
        }
        let now = Utc::now();
        let mut session = ConversationSession::new(npc_id, user_id, now);
        session.idle_timeout_secs = self.idle_timeout.as_secs();
        let session_id = session.session_id;

        self.store.store(&session).await?;
        lock(&self.sessions).insert(
            session_id,
            Arc::new(SessionSlot {
                data: tokio::sync::Mutex::new(session),
            }),
        );

        let _ = self
            .store
            .publish(
                MODEL_NOTIFICATIONS_CHANNEL,
                &json!({
                    "event": "session_started",
                    "session_id": session_id,
                    "npc_id": npc_id,
                    "user_id": user_id,
                    "timestamp": now,
                }),
            )
            .await;

        tracing::info!(%session_id, %npc_id, user_id, "conversation started");
        Ok(session_id)
    }

    async fn slot(&self, session_id: Uuid) -> Result<Arc<SessionSlot>, StrandError> {
        if let Some(slot) = lock(&self.sessions).get(&session_id) {
            return Ok(Arc::clone(slot));
        }
        // Fall back to the cache; the in-memory copy becomes authoritative.
        let Some(session) = self.store.load(session_id).await? else {
            return Err(StrandError::NotFound);
        };
        if !session.active {
            return Err(StrandError::NotFound);
        }
        let slot = Arc::new(SessionSlot {
            data: tokio::sync::Mutex::new(session),
        });
        lock(&self.sessions).insert(session_id, Arc::clone(&slot));
        Ok(slot)
    }

    /// Process one user message, streaming the assistant reply. Messages on
    /// one session are strictly sequential: a new message waits until the
    /// previous stream completed or was cancelled. If the caller drops the
    /// receiver mid-stream, the partial assistant turn is discarded.
    pub async fn process_message(
        self: &Arc<Self>,
        session_id: Uuid,
        text: String,
    ) -> Result<TokenReceiver, StrandError> {
        let slot = self.slot(session_id).await?;
        {
            let session = slot.data.lock().await;
            if !session.active {
                return Err(StrandError::NotFound);
            }
        }

        let (tx, rx) = mpsc::channel::<Result<String, StrandError>>(64);
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            // Holding the session lock for the whole turn is what makes
            // per-session processing sequential.
            let mut session = slot.data.lock().await;
            manager
                .run_turn(&mut session, session_id, text, tx)
                .await;
        });
        Ok(rx)
    }

    async fn run_turn(
        &self,
        session: &mut ConversationSession,
        session_id: Uuid,
        text: String,
        tx: mpsc::Sender<Result<String, StrandError>>,
    ) {
        let npc = match self.npcs.get_for_prompt(session.npc_id).await {
            Ok(Some(npc)) => npc,
            Ok(None) => {
                let _ = tx.send(Err(StrandError::NotFound)).await;
                session.active = false;
                let _ = self.store.store(session).await;
                return;
            }
            Err(e) => {
                let _ = tx.send(Err(e)).await;
                return;
            }
        };

        let prompt = self
            .context
            .build_prompt(&npc, &session.messages, &text);
        session.add_message(MessageRole::User, text, Utc::now());
        if let Err(e) = self.store.store(session).await {
            tracing::warn!(%session_id, error = %e, "failed to mirror session");
        }

        let mut upstream = match self.model.stream_chat(prompt).await {
            Ok(upstream) => upstream,
            Err(e) => {
                // One failed stream leaves the session reusable.
                tracing::error!(%session_id, error = %e, "generation submit failed");
                let _ = tx.send(Err(e)).await;
                return;
            }
        };

        let mut metrics = StreamMetrics::start();
        let mut full_response = String::new();
        let mut failed = false;
        while let Some(item) = upstream.recv().await {
            match item {
                Ok(token) => {
                    metrics.record_token(&token);
                    full_response.push_str(&token);
                    if tx.send(Ok(token)).await.is_err() {
                        // Client went away: cancel upstream, discard the
                        // partial assistant turn.
                        tracing::info!(%session_id, "stream cancelled by client");
                        return;
                    }
                }
                Err(e) => {
                    tracing::error!(%session_id, error = %e, "stream failed");
                    let _ = tx.send(Err(e)).await;
                    failed = true;
                    break;
                }
            }
        }

        if !failed && !full_response.is_empty() {
            session.add_message(MessageRole::Assistant, full_response, Utc::now());
            if let Err(e) = self.store.store(session).await {
                tracing::warn!(%session_id, error = %e, "failed to persist session");
            }
            lock(&self.stream_stats).insert(session_id, metrics.snapshot());
        }
    }

    /// Mark inactive, persist, enqueue the post-conversation job, and drop
    /// from active memory.
    pub async fn end_conversation(&self, session_id: Uuid) -> Result<(), StrandError> {
        let slot = self.slot(session_id).await?;
        let job = {
            let mut session = slot.data.lock().await;
            session.active = false;
            let ended_at = Utc::now();
            let job = SummaryJob::from_session(&session, ended_at);
            self.store.store(&session).await?;
            job
        };
        self.queue.push(serde_json::to_string(&job)?).await?;
        lock(&self.sessions).remove(&session_id);
        lock(&self.stream_stats).remove(&session_id);
        tracing::info!(%session_id, "conversation ended");
        Ok(())
    }

    pub async fn session_user(&self, session_id: Uuid) -> Option<String> {
        let slot = lock(&self.sessions).get(&session_id).cloned()?;
        let session = slot.data.lock().await;
        Some(session.user_id.clone())
    }

    pub async fn history(&self, session_id: Uuid) -> Result<Vec<ChatMessage>, StrandError> {
        let maybe_slot = lock(&self.sessions).get(&session_id).cloned();
        if let Some(slot) = maybe_slot {
            return Ok(slot.data.lock().await.messages.clone());
        }
        match self.store.load(session_id).await? {
            Some(session) => Ok(session.messages),
            None => Err(StrandError::NotFound),
        }
    }

    /// Summaries of the in-memory active sessions, for the monitor channel.
    pub async fn active_sessions(&self) -> Vec<serde_json::Value> {
        let slots: Vec<(Uuid, Arc<SessionSlot>)> = lock(&self.sessions)
            .iter()
            .map(|(id, slot)| (*id, Arc::clone(slot)))
            .collect();
        let mut out = Vec::new();
        for (session_id, slot) in slots {
            // Skip sessions mid-turn rather than waiting on them.
            if let Ok(session) = slot.data.try_lock() {
                if session.active {
                    out.push(json!({
                        "session_id": session_id,
                        "npc_id": session.npc_id,
                        "user_id": session.user_id,
                        "message_count": session.messages.len(),
                        "last_activity": session.last_activity,
                    }));
                }
            }
        }
        out
    }

    pub fn active_count(&self) -> usize {
        lock(&self.sessions).len()
    }

    pub fn stream_stats(&self) -> HashMap<Uuid, crate::buffer::StreamStats> {
        lock(&self.stream_stats).clone()
    }

    /// Terminate exactly the sessions whose inactivity exceeds their idle
    /// timeout.
    pub async fn reap_expired(&self) {
        let now = Utc::now();
        let candidates: Vec<(Uuid, Arc<SessionSlot>)> = lock(&self.sessions)
            .iter()
            .map(|(id, slot)| (*id, Arc::clone(slot)))
            .collect();

        let mut expired = Vec::new();
        for (session_id, slot) in candidates {
            if let Ok(session) = slot.data.try_lock() {
                if session.active && session.is_expired(now) {
                    expired.push(session_id);
                }
            }
        }
        for session_id in expired {
            tracing::info!(%session_id, "session idle timeout");
            if let Err(e) = self.end_conversation(session_id).await {
                tracing::error!(%session_id, error = %e, "failed to end expired session");
            }
        }
    }

    /// End every active session and stop the reaper.
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        if let Some(reaper) = lock(&self.reaper).take() {
            reaper.abort();
        }
        let ids: Vec<Uuid> = lock(&self.sessions).keys().copied().collect();
        for session_id in ids {
            if let Err(e) = self.end_conversation(session_id).await {
                tracing::warn!(%session_id, error = %e, "failed to end session at shutdown");
            }
        }
    }
}
