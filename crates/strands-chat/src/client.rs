//! Clients for the orchestrator's collaborators: the model service (token
//! streaming) and the NPC service (character records).

use async_trait::async_trait;
use futures_util::StreamExt;
use serde_json::json;
use tokio::sync::mpsc;
use uuid::Uuid;

use strands_types::{LifeStrand, StrandError, TokenFrame};

/// One streamed assistant response.
pub type TokenReceiver = mpsc::Receiver<Result<String, StrandError>>;

#[async_trait]
pub trait GenerationClient: Send + Sync {
    /// Submit a chat prompt; tokens arrive on the returned channel. The
    /// receiver going away cancels the upstream generation.
    async fn stream_chat(&self, prompt: String) -> Result<TokenReceiver, StrandError>;
}

#[async_trait]
pub trait NpcDirectory: Send + Sync {
    /// Prompt-ready projection of a character record.
    async fn get_for_prompt(&self, npc_id: Uuid) -> Result<Option<LifeStrand>, StrandError>;

    /// Whether the record exists and is active.
    async fn exists(&self, npc_id: Uuid) -> Result<bool, StrandError>;
}

#[derive(Debug, Clone)]
pub struct HttpModelClient {
    client: reqwest::Client,
    base_url: String,
}

impl HttpModelClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self, StrandError> {
        let client = reqwest::Client::builder()
            .connect_timeout(std::time::Duration::from_secs(10))
            .build()
            .map_err(|e| StrandError::Internal(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl GenerationClient for HttpModelClient {
    async fn stream_chat(&self, prompt: String) -> Result<TokenReceiver, StrandError> {
        let response = self
            .client
            .post(format!("{}/generate", self.base_url))
            .json(&json!({
                "prompt": prompt,
                "service_class": "chat",
                "stream": true,
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

        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(async move {
            let mut body = response.bytes_stream();
            let mut pending = String::new();
            while let Some(chunk) = body.next().await {
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        let _ = tx
                            .send(Err(StrandError::GenerationFailed(e.to_string())))
                            .await;
                        return;
                    }
                };
                pending.push_str(&String::from_utf8_lossy(&chunk));
                while let Some(newline) = pending.find('\n') {
                    let line = pending[..newline].trim().to_string();
                    pending.drain(..=newline);
                    if line.is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<TokenFrame>(&line) {
                        Ok(TokenFrame::Token { token }) => {
                            if tx.send(Ok(token)).await.is_err() {
                                // Consumer gone: dropping the body cancels
                                // the upstream stream.
                                return;
                            }
                        }
                        Ok(TokenFrame::Done) => return,
                        Ok(TokenFrame::Error { message }) => {
                            let _ = tx.send(Err(StrandError::GenerationFailed(message))).await;
                            return;
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "unparseable token frame");
                        }
                    }
                }
            }
        });
        Ok(rx)
    }
}

#[derive(Debug, Clone)]
pub struct HttpNpcClient {
    client: reqwest::Client,
    base_url: String,
}

impl HttpNpcClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self, StrandError> {
        let client = reqwest::Client::builder()
            .connect_timeout(std::time::Duration::from_secs(5))
            .timeout(std::time::Duration::from_secs(15))
            .build()
            .map_err(|e| StrandError::Internal(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl NpcDirectory for HttpNpcClient {
    async fn get_for_prompt(&self, npc_id: Uuid) -> Result<Option<LifeStrand>, StrandError> {
        let response = self
            .client
            .get(format!("{}/npc/{npc_id}/prompt", self.base_url))
            .send()
            .await
            .map_err(|e| StrandError::ServiceUnavailable(format!("npc service: {e}")))?;
        match response.status().as_u16() {
            200 => {
                let strand = response
                    .json::<LifeStrand>()
                    .await
                    .map_err(|e| StrandError::Internal(e.to_string()))?;
                Ok(Some(strand))
            }
            404 => Ok(None),
            status => Err(StrandError::ServiceUnavailable(format!(
                "npc service returned {status}"
            ))),
        }
    }

    async fn exists(&self, npc_id: Uuid) -> Result<bool, StrandError> {
        Ok(self.get_for_prompt(npc_id).await?.is_some())
    }
}
