//! Shared types for the Life Strands services.
//!
//! Everything that crosses a service boundary lives here: the Life Strand
//! character record with its validation and merge rules, conversation
//! sessions, typed change records, generation wire types, the WebSocket
//! protocol frames, and the common error enum.

pub mod change;
pub mod error;
pub mod generate;
pub mod life_strand;
pub mod session;
pub mod ws;

pub use change::{ChangeKind, ChangeRecord};
pub use error::StrandError;
pub use generate::{
    EmbeddingsRequest, EmbeddingsResponse, GenerateRequest, ModelType, SamplingParams,
    ServiceClass, TokenFrame,
};
pub use life_strand::{
    Background, CurrentStatus, EmotionalTone, Knowledge, LifeStrand, LifeStrandUpdate, Memory,
    Personality, RecordStatus, RelationKind, Relationship, RelationshipUpdate, RelationStatus,
};
pub use session::{ChatMessage, ConversationSession, MessageRole, SummaryJob};

/// A `Result` alias used across the workspace.
pub type Result<T> = std::result::Result<T, StrandError>;
