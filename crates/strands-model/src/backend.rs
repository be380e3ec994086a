//! Inference backends.
//!
//! The LLM library itself is outside this system; the runtime talks to it
//! through these traits. `LlamaServerBackend` drives an OpenAI-compatible
//! llama server over HTTP. `MockBackend` is deterministic and used by the
//! test suites and by deployments without a GPU host.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use serde_json::json;

use strands_types::{ModelType, SamplingParams, StrandError};

use crate::stream::TokenSink;
use crate::vram::MB;

/// Everything needed to load one model. Pools read these by value; nothing
/// here calls back into the runtime.
#[derive(Debug, Clone)]
pub struct ModelConfig {
    pub model_type: ModelType,
    pub model_id: String,
    pub context_size: u32,
    /// Footprint assumed until the first observation refines the estimate.
    pub vram_hint_bytes: u64,
    pub embedding_dimensions: usize,
}

impl ModelConfig {
    pub fn defaults_for(model_type: ModelType, embedding_dimensions: usize) -> Self {
        let (model_id, context_size, vram_hint_mb) = match model_type {
            ModelType::Chat => ("chat-main", 8192, 8000),
            ModelType::Summary => ("summary-small", 4096, 4000),
            ModelType::Embedding => ("embedding-minilm", 512, 512),
        };
        Self {
            model_type,
            model_id: model_id.to_string(),
            context_size,
            vram_hint_bytes: vram_hint_mb * MB,
            embedding_dimensions,
        }
    }
}

#[async_trait]
pub trait InferenceBackend: Send + Sync + std::fmt::Debug {
    async fn load(&self, config: &ModelConfig) -> Result<Box<dyn LoadedModel>, StrandError>;
}

#[async_trait]
pub trait LoadedModel: Send + Sync + std::fmt::Debug {
    fn model_type(&self) -> ModelType;

    /// Observed resident footprint after load.
    fn vram_bytes(&self) -> u64;

    /// Drive one generation, pushing tokens into `sink` until done,
    /// cancelled, or failed. Cancellation must be observed within one token
    /// boundary.
    async fn generate(
        &self,
        prompt: &str,
        params: &SamplingParams,
        sink: TokenSink,
    ) -> Result<(), StrandError>;

    /// Batch embeddings, one unit vector per input text, in input order.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, StrandError>;

    /// Release backend resources. Idempotent.
    async fn unload(&self);
}

// ---------------------------------------------------------------------------
// HTTP backend (OpenAI-compatible llama server)
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct LlamaServerBackend {
    base_url: String,
    client: reqwest::Client,
}

impl LlamaServerBackend {
    pub fn new(base_url: impl Into<String>) -> Result<Self, StrandError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(300))
            .build()
            .map_err(|e| StrandError::Internal(e.to_string()))?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        })
    }
}

#[async_trait]
impl InferenceBackend for LlamaServerBackend {
    async fn load(&self, config: &ModelConfig) -> Result<Box<dyn LoadedModel>, StrandError> {
        // The server owns the weights; loading here is a reachability check.
        let url = format!("{}/v1/models", self.base_url);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| StrandError::LoadFailed(format!("backend unreachable: {e}")))?;
        if !response.status().is_success() {
            return Err(StrandError::LoadFailed(format!(
                "backend returned {}",
                response.status()
            )));
        }
        tracing::info!(model_id = %config.model_id, "llama server backend ready");
        Ok(Box::new(LlamaServerModel {
            base_url: self.base_url.clone(),
            client: self.client.clone(),
            config: config.clone(),
        }))
    }
}

#[derive(Debug)]
struct LlamaServerModel {
    base_url: String,
    client: reqwest::Client,
    config: ModelConfig,
}

#[async_trait]
impl LoadedModel for LlamaServerModel {
    fn model_type(&self) -> ModelType {
        self.config.model_type
    }

    fn vram_bytes(&self) -> u64 {
        self.config.vram_hint_bytes
    }

    async fn generate(
        &self,
        prompt: &str,
        params: &SamplingParams,
        sink: TokenSink,
    ) -> Result<(), StrandError> {
        let payload = json!({
            "model": self.config.model_id,
            "messages": [{"role": "user", "content": prompt}],
            "max_tokens": params.max_tokens,
            "temperature": params.temperature,
            "top_p": params.top_p,
            "stop": params.stop,
            "stream": true,
        });

        let url = format!("{}/v1/chat/completions", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| StrandError::GenerationFailed(e.to_string()))?;
        if !response.status().is_success() {
            return Err(StrandError::GenerationFailed(format!(
                "backend returned {}",
                response.status()
            )));
        }

        let mut body = response.bytes_stream();
        let mut pending = String::new();
        while let Some(chunk) = body.next().await {
            if sink.is_cancelled() {
                return Err(StrandError::Cancelled);
            }
            let chunk = chunk.map_err(|e| StrandError::GenerationFailed(e.to_string()))?;
            pending.push_str(&String::from_utf8_lossy(&chunk));

            // SSE framing: complete lines only, keep the remainder buffered.
            while let Some(newline) = pending.find('\n') {
                let line = pending[..newline].trim().to_string();
                pending.drain(..=newline);
                let Some(data) = line.strip_prefix("data: ") else {
                    continue;
                };
                if data == "[DONE]" {
                    return Ok(());
                }
                let Ok(value) = serde_json::from_str::<serde_json::Value>(data) else {
                    continue;
                };
                if let Some(content) = value["choices"][0]["delta"]["content"].as_str() {
                    if !content.is_empty() {
                        sink.send(content.to_string()).await?;
                    }
                }
            }
        }
        Ok(())
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, StrandError> {
        let url = format!("{}/v1/embeddings", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&json!({"model": self.config.model_id, "input": texts}))
            .send()
            .await
            .map_err(|e| StrandError::GenerationFailed(e.to_string()))?;
        if !response.status().is_success() {
            return Err(StrandError::GenerationFailed(format!(
                "embedding backend returned {}",
                response.status()
            )));
        }
        let value: serde_json::Value = response
            .json()
            .await
            .map_err(|e| StrandError::GenerationFailed(e.to_string()))?;
        let rows = value["data"]
            .as_array()
            .ok_or_else(|| StrandError::GenerationFailed("malformed embeddings payload".into()))?;
        let mut embeddings = Vec::with_capacity(rows.len());
        for row in rows {
            let vector: Vec<f32> = row["embedding"]
                .as_array()
                .ok_or_else(|| StrandError::GenerationFailed("missing embedding".into()))?
                .iter()
                .filter_map(serde_json::Value::as_f64)
                .map(|v| v as f32)
                .collect();
            embeddings.push(normalize(vector));
        }
        if embeddings.len() != texts.len() {
            return Err(StrandError::GenerationFailed(format!(
                "expected {} embeddings, got {}",
                texts.len(),
                embeddings.len()
            )));
        }
        Ok(embeddings)
    }

    async fn unload(&self) {
        // Remote weights stay resident; nothing to release locally.
    }
}

// ---------------------------------------------------------------------------
// Deterministic mock backend
// ---------------------------------------------------------------------------

/// Deterministic backend used in tests and GPU-less deployments. Responses
/// derive from the prompt, embeddings are hash-based unit vectors, and
/// failures can be injected per call.
#[derive(Debug, Default)]
pub struct MockBackend {
    fail_loads: AtomicU32,
    fail_generations: AtomicU32,
    load_delay: Option<Duration>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_load_delay(delay: Duration) -> Self {
        Self {
            load_delay: Some(delay),
            ..Self::default()
        }
    }

    /// Make the next `n` loads fail with `LoadFailed`.
    pub fn fail_next_loads(&self, n: u32) {
        self.fail_loads.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` generations fail with `GenerationFailed`.
    pub fn fail_next_generations(&self, n: u32) {
        self.fail_generations.store(n, Ordering::SeqCst);
    }

    fn take(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| v.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl InferenceBackend for MockBackend {
    async fn load(&self, config: &ModelConfig) -> Result<Box<dyn LoadedModel>, StrandError> {
        if let Some(delay) = self.load_delay {
            tokio::time::sleep(delay).await;
        }
        if Self::take(&self.fail_loads) {
            return Err(StrandError::LoadFailed("injected load failure".into()));
        }
        Ok(Box::new(MockModel {
            config: config.clone(),
            fail_generations: AtomicU32::new(self.fail_generations.swap(0, Ordering::SeqCst)),
        }))
    }
}

#[derive(Debug)]
pub struct MockModel {
    config: ModelConfig,
    fail_generations: AtomicU32,
}

#[async_trait]
impl LoadedModel for MockModel {
    fn model_type(&self) -> ModelType {
        self.config.model_type
    }

    fn vram_bytes(&self) -> u64 {
        self.config.vram_hint_bytes
    }

    async fn generate(
        &self,
        prompt: &str,
        params: &SamplingParams,
        sink: TokenSink,
    ) -> Result<(), StrandError> {
        if MockBackend::take(&self.fail_generations) {
            return Err(StrandError::GenerationFailed(
                "injected generation failure".into(),
            ));
        }
        let response = mock_response(self.config.model_type, prompt);
        let limit = params.max_tokens as usize;
        for (i, word) in response.split_whitespace().enumerate() {
            if i >= limit {
                break;
            }
            let token = if i == 0 {
                word.to_string()
            } else {
                format!(" {word}")
            };
            sink.send(token).await?;
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        Ok(())
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, StrandError> {
        Ok(texts
            .iter()
            .map(|t| hashed_embedding(t, self.config.embedding_dimensions))
            .collect())
    }

    async fn unload(&self) {}
}

fn mock_response(model_type: ModelType, prompt: &str) -> String {
    let tail: String = prompt
        .split_whitespace()
        .rev()
        .take(4)
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect::<Vec<_>>()
        .join(" ");
    match model_type {
        ModelType::Summary => format!(
            "The conversation touched on {tail}. The speakers exchanged thoughts and parted on \
             friendly terms."
        ),
        _ => format!(
            "That is an interesting point about {tail}. Let me think on it for a moment, \
             because there is more to say than first appears."
        ),
    }
}

/// Deterministic pseudo-embedding: hash each (text, index) pair into [-1, 1]
/// and normalize to a unit vector.
pub fn hashed_embedding(text: &str, dimensions: usize) -> Vec<f32> {
    let mut vector: Vec<f32> = (0..dimensions)
        .map(|i| {
            let mut hasher = DefaultHasher::new();
            text.hash(&mut hasher);
            i.hash(&mut hasher);
            let h = hasher.finish();
            (h % 2000) as f32 / 1000.0 - 1.0
        })
        .collect();
    vector = normalize(vector);
    vector
}

fn normalize(mut vector: Vec<f32>) -> Vec<f32> {
    let magnitude: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if magnitude > f32::EPSILON {
        for x in &mut vector {
            *x /= magnitude;
        }
    }
    vector
}
