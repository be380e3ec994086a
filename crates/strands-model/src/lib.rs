//! Model runtime and request pipeline.
//!
//! The runtime ([`runtime::GenerationPool`], [`runtime::EmbeddingPool`])
//! owns GPU memory and the model lifecycle state machine. The pipeline
//! ([`pipeline::RequestPipeline`]) sits in front of it: circuit breakers per
//! service class, a priority queue feeding worker loops, opportunistic
//! embedding batching, and a demand predictor that keeps the preload slot
//! warm.

pub mod backend;
pub mod breaker;
pub mod http;
pub mod pipeline;
pub mod predictor;
pub mod queue;
pub mod runtime;
pub mod state_machine;
pub mod stream;
pub mod vram;

pub use backend::{InferenceBackend, LlamaServerBackend, LoadedModel, MockBackend, ModelConfig};
pub use breaker::{BreakerState, CircuitBreaker};
pub use pipeline::RequestPipeline;
pub use runtime::{EmbeddingPool, GenerationPool};
pub use state_machine::{ModelState, ModelStateMachine};
pub use stream::{CancelFlag, TokenStream};
