//! Conversation orchestration: context assembly, session lifecycle,
//! WebSocket streaming with token buffering, and the idle reaper.

pub mod buffer;
pub mod client;
pub mod connections;
pub mod context;
pub mod http;
pub mod session;
pub mod ws;

pub use buffer::{StreamMetrics, TokenBuffer};
pub use client::{GenerationClient, HttpModelClient, HttpNpcClient, NpcDirectory};
pub use connections::ConnectionRegistry;
pub use context::{ContextBudgets, ContextBuilder};
pub use session::ConversationManager;
