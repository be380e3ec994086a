//! Conversation sessions and the post-conversation work item.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 1800;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: MessageRole,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub metadata: serde_json::Map<String, Value>,
}

impl ChatMessage {
    pub fn new(role: MessageRole, content: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            role,
            content: content.into(),
            timestamp,
            metadata: serde_json::Map::new(),
        }
    }
}

/// Transient per-dialogue state, owned by the orchestrator and mirrored to
/// the session cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationSession {
    pub session_id: Uuid,
    pub npc_id: Uuid,
    pub user_id: String,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
    pub active: bool,
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
}

fn default_idle_timeout() -> u64 {
    DEFAULT_IDLE_TIMEOUT_SECS
}

impl ConversationSession {
    pub fn new(npc_id: Uuid, user_id: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            session_id: Uuid::new_v4(),
            npc_id,
            user_id: user_id.into(),
            created_at: now,
            last_activity: now,
            messages: Vec::new(),
            active: true,
            idle_timeout_secs: DEFAULT_IDLE_TIMEOUT_SECS,
        }
    }

    pub fn add_message(&mut self, role: MessageRole, content: impl Into<String>, now: DateTime<Utc>) {
        self.messages.push(ChatMessage::new(role, content, now));
        self.last_activity = now;
    }

    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.last_activity = now;
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now - self.last_activity > Duration::seconds(self.idle_timeout_secs as i64)
    }
}

/// Work item pushed to the summary queue when a conversation ends.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SummaryJob {
    pub session_id: Uuid,
    pub npc_id: Uuid,
    pub user_id: String,
    pub messages: Vec<ChatMessage>,
    pub created_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_at: Option<DateTime<Utc>>,
}

impl SummaryJob {
    pub fn from_session(session: &ConversationSession, ended_at: DateTime<Utc>) -> Self {
        Self {
            session_id: session.session_id,
            npc_id: session.npc_id,
            user_id: session.user_id.clone(),
            messages: session.messages.clone(),
            created_at: session.created_at,
            ended_at,
            retry_count: 0,
            last_error: None,
            retry_at: None,
        }
    }
}
