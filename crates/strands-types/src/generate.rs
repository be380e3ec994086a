//! Wire types for the model service surface.

use serde::{Deserialize, Serialize};

/// Service classes admitted by the request pipeline. Each class has its own
/// circuit breaker and default priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceClass {
    Chat,
    Summary,
    Npc,
}

impl ServiceClass {
    pub const ALL: [ServiceClass; 3] = [Self::Chat, Self::Summary, Self::Npc];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Chat => "chat",
            Self::Summary => "summary",
            Self::Npc => "npc",
        }
    }

    /// Default queue priority; lower dispatches sooner.
    pub fn default_priority(self) -> u8 {
        match self {
            Self::Chat => 1,
            Self::Npc => 3,
            Self::Summary => 5,
        }
    }

    /// The model a generation request of this class runs on.
    pub fn model_type(self) -> ModelType {
        match self {
            Self::Chat => ModelType::Chat,
            Self::Summary => ModelType::Summary,
            Self::Npc => ModelType::Embedding,
        }
    }
}

/// Kinds of model instances the runtime can hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelType {
    Chat,
    Summary,
    Embedding,
}

impl ModelType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Chat => "chat",
            Self::Summary => "summary",
            Self::Embedding => "embedding",
        }
    }
}

impl std::str::FromStr for ModelType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "chat" => Ok(Self::Chat),
            "summary" => Ok(Self::Summary),
            "embedding" => Ok(Self::Embedding),
            other => Err(format!("unknown model type: {other}")),
        }
    }
}

/// Sampling parameters forwarded to the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplingParams {
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    #[serde(default = "default_top_p")]
    pub top_p: f64,
    #[serde(default)]
    pub stop: Vec<String>,
}

fn default_max_tokens() -> u32 {
    512
}

fn default_temperature() -> f64 {
    0.7
}

fn default_top_p() -> f64 {
    0.9
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            top_p: default_top_p(),
            stop: Vec::new(),
        }
    }
}

impl SamplingParams {
    /// Low-temperature profile used for summaries and extraction.
    pub fn analytic(max_tokens: u32) -> Self {
        Self {
            max_tokens,
            temperature: 0.3,
            top_p: 0.9,
            stop: vec!["User:".to_string(), "NPC:".to_string()],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerateRequest {
    pub prompt: String,
    #[serde(default)]
    pub service_class: Option<ServiceClass>,
    #[serde(default)]
    pub params: Option<SamplingParams>,
    #[serde(default)]
    pub priority: Option<u8>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default = "default_stream")]
    pub stream: bool,
}

fn default_stream() -> bool {
    true
}

/// One newline-delimited JSON frame on the streaming generate response.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TokenFrame {
    Token { token: String },
    Done,
    Error { message: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingsRequest {
    pub texts: Vec<String>,
    #[serde(default)]
    pub priority: Option<u8>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingsResponse {
    pub embeddings: Vec<Vec<f32>>,
}
