//! Post-conversation processing: a reliable queue consumer that turns
//! completed transcripts into summaries, typed change records, and merged
//! character updates.

pub mod applier;
pub mod client;
pub mod consumer;
pub mod extractor;
pub mod generator;
pub mod http;

pub use applier::ChangeApplier;
pub use client::{CompletionClient, HttpCompletionClient, HttpNpcStore, NpcStore};
pub use consumer::QueueConsumer;
pub use extractor::ChangeExtractor;
pub use generator::SummaryGenerator;
