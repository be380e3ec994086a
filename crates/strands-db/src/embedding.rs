//! Embedding capability for the character store.
//!
//! An explicit two-variant backend instead of a silent zero-vector
//! fallback: `Real` calls the model service's batched embedding endpoint
//! with retries; `Disabled` returns all-zero vectors of the configured
//! dimension, which makes vector search a documented no-op (every record
//! shares the same embedding).

use std::time::Duration;

use serde_json::json;

use strands_types::StrandError;

const RETRY_ATTEMPTS: u32 = 3;
const RETRY_BASE_DELAY: Duration = Duration::from_millis(500);

#[derive(Debug)]
pub enum EmbeddingBackend {
    Real {
        client: reqwest::Client,
        base_url: String,
        dimensions: usize,
    },
    Disabled {
        dimensions: usize,
    },
}

impl EmbeddingBackend {
    pub fn real(base_url: impl Into<String>, dimensions: usize) -> Result<Self, StrandError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| StrandError::Internal(e.to_string()))?;
        Ok(Self::Real {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            dimensions,
        })
    }

    pub fn disabled(dimensions: usize) -> Self {
        Self::Disabled { dimensions }
    }

    pub fn is_enabled(&self) -> bool {
        matches!(self, Self::Real { .. })
    }

    pub fn dimensions(&self) -> usize {
        match self {
            Self::Real { dimensions, .. } | Self::Disabled { dimensions } => *dimensions,
        }
    }

    pub async fn embed_one(&self, text: &str) -> Result<Vec<f32>, StrandError> {
        let mut result = self.embed_batch(&[text.to_string()]).await?;
        result
            .pop()
            .ok_or_else(|| StrandError::Internal("empty embedding response".into()))
    }

    pub async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, StrandError> {
        match self {
            Self::Disabled { dimensions } => {
                Ok(texts.iter().map(|_| vec![0.0; *dimensions]).collect())
            }
            Self::Real {
                client,
                base_url,
                dimensions,
            } => {
                if texts.iter().any(|t| t.trim().is_empty()) {
                    return Err(StrandError::ValidationFailed(
                        "texts must be non-empty".into(),
                    ));
                }
                let embeddings = post_with_retries(client, base_url, texts).await?;
                if embeddings.len() != texts.len() {
                    return Err(StrandError::Internal(format!(
                        "expected {} embeddings, got {}",
                        texts.len(),
                        embeddings.len()
                    )));
                }
                for vector in &embeddings {
                    if vector.len() != *dimensions {
                        return Err(StrandError::ValidationFailed(format!(
                            "embedding dimension {} does not match configured {}",
                            vector.len(),
                            dimensions
                        )));
                    }
                }
                Ok(embeddings)
            }
        }
    }
}

async fn post_with_retries(
    client: &reqwest::Client,
    base_url: &str,
    texts: &[String],
) -> Result<Vec<Vec<f32>>, StrandError> {
    let url = format!("{base_url}/embeddings");
    let mut last_error = String::new();
    for attempt in 0..RETRY_ATTEMPTS {
        if attempt > 0 {
            tokio::time::sleep(RETRY_BASE_DELAY * 2u32.pow(attempt - 1)).await;
        }
        let result = client.post(&url).json(&json!({"texts": texts})).send().await;
        match result {
            Ok(response) if response.status().is_success() => {
                let value: serde_json::Value = response
                    .json()
                    .await
                    .map_err(|e| StrandError::Internal(e.to_string()))?;
                let rows = value["embeddings"].as_array().ok_or_else(|| {
                    StrandError::Internal("malformed embeddings payload".into())
                })?;
                return rows
                    .iter()
                    .map(|row| {
                        row.as_array()
                            .map(|v| {
                                v.iter()
                                    .filter_map(serde_json::Value::as_f64)
                                    .map(|x| x as f32)
                                    .collect()
                            })
                            .ok_or_else(|| StrandError::Internal("malformed embedding".into()))
                    })
                    .collect();
            }
            Ok(response) => {
                last_error = format!("HTTP {}", response.status());
                tracing::warn!(attempt, %last_error, "embedding request failed");
            }
            Err(e) => {
                last_error = e.to_string();
                tracing::warn!(attempt, %last_error, "embedding request failed");
            }
        }
    }
    Err(StrandError::ServiceUnavailable(format!(
        "embedding backend unavailable: {last_error}"
    )))
}
