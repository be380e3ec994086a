//! Clients for the worker's collaborators: the model service (summary-class
//! completions) and the NPC service (record fetch and merge-update).

use async_trait::async_trait;
use serde_json::json;
use uuid::Uuid;

use strands_types::{LifeStrand, LifeStrandUpdate, SamplingParams, StrandError};

#[async_trait]
pub trait CompletionClient: Send + Sync {
    /// One non-streamed completion on the summary model, low temperature.
    async fn complete(&self, prompt: &str, max_tokens: u32) -> Result<String, StrandError>;
}

#[async_trait]
pub trait NpcStore: Send + Sync {
    async fn get(&self, npc_id: Uuid) -> Result<Option<LifeStrand>, StrandError>;
    async fn apply_update(
        &self,
        npc_id: Uuid,
        update: &LifeStrandUpdate,
    ) -> Result<bool, StrandError>;
}

#[derive(Debug, Clone)]
pub struct HttpCompletionClient {
    client: reqwest::Client,
    base_url: String,
}

impl HttpCompletionClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self, StrandError> {
        let client = reqwest::Client::builder()
            .connect_timeout(std::time::Duration::from_secs(10))
            .timeout(std::time::Duration::from_secs(120))
            .build()
            .map_err(|e| StrandError::Internal(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl CompletionClient for HttpCompletionClient {
    async fn complete(&self, prompt: &str, max_tokens: u32) -> Result<String, StrandError> {
        let params = SamplingParams::analytic(max_tokens);
        let response = self
            .client
            .post(format!("{}/generate", self.base_url))
            .json(&json!({
                "prompt": prompt,
                "service_class": "summary",
                "params": params,
                "stream": false,
            }))
            .send()
            .await
            .map_err(|e| StrandError::ServiceUnavailable(format!("model service: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            return Err(match status.as_u16() {
                503 => StrandError::ServiceUnavailable("model service".into()),
                504 => StrandError::Timeout,
                _ => StrandError::GenerationFailed(format!("model service returned {status}")),
            });
        }
        let value: serde_json::Value = response
            .json()
            .await
            .map_err(|e| StrandError::Internal(e.to_string()))?;
        Ok(value["text"].as_str().unwrap_or_default().to_string())
    }
}

#[derive(Debug, Clone)]
pub struct HttpNpcStore {
    client: reqwest::Client,
    base_url: String,
}

impl HttpNpcStore {
    pub fn new(base_url: impl Into<String>) -> Result<Self, StrandError> {
        let client = reqwest::Client::builder()
            .connect_timeout(std::time::Duration::from_secs(5))
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .map_err(|e| StrandError::Internal(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl NpcStore for HttpNpcStore {
    async fn get(&self, npc_id: Uuid) -> Result<Option<LifeStrand>, StrandError> {
        let response = self
            .client
            .get(format!("{}/npc/{npc_id}", self.base_url))
            .send()
            .await
            .map_err(|e| StrandError::ServiceUnavailable(format!("npc service: {e}")))?;
        match response.status().as_u16() {
            200 => Ok(Some(response.json().await.map_err(|e| {
                StrandError::Internal(e.to_string())
            })?)),
            404 => Ok(None),
            status => Err(StrandError::ServiceUnavailable(format!(
                "npc service returned {status}"
            ))),
        }
    }

    async fn apply_update(
        &self,
        npc_id: Uuid,
        update: &LifeStrandUpdate,
    ) -> Result<bool, StrandError> {
        let response = self
            .client
            .put(format!("{}/npc/{npc_id}", self.base_url))
            .json(update)
            .send()
            .await
            .map_err(|e| StrandError::ServiceUnavailable(format!("npc service: {e}")))?;
        match response.status().as_u16() {
            200 | 204 => Ok(true),
            404 => Ok(false),
            status => Err(StrandError::ServiceUnavailable(format!(
                "npc service returned {status}"
            ))),
        }
    }
}
