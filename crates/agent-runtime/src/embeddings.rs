//! OpenAI Embeddings Provider

use std::sync::Arc;
use std::time::Duration;

use agent_core::{
    error::{AgentError, Result},
    rag::EmbeddingsProvider,
};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use crate::transport::{HttpTransport, Transport};

/// Embeddings endpoint configuration
#[derive(Clone, Debug)]
pub struct EmbeddingsConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub model: String,
    pub timeout_secs: u64,
}

impl Default for EmbeddingsConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".into(),
            api_key: None,
            model: "text-embedding-3-small".into(),
            timeout_secs: 30,
        }
    }
}

impl EmbeddingsConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            base_url: std::env::var("EMBEDDINGS_BASE_URL").unwrap_or(defaults.base_url),
            api_key: std::env::var("LLM_API_KEY")
                .or_else(|_| std::env::var("OPENAI_API_KEY"))
                .ok(),
            model: std::env::var("EMBEDDINGS_MODEL").unwrap_or(defaults.model),
            timeout_secs: defaults.timeout_secs,
        }
    }
}

/// `/embeddings` client
pub struct OpenAiEmbeddings {
    config: EmbeddingsConfig,
    transport: Arc<dyn Transport>,
}

impl OpenAiEmbeddings {
    pub fn new(config: EmbeddingsConfig) -> Result<Self> {
        let transport = Arc::new(HttpTransport::new(Duration::from_secs(config.timeout_secs))?);
        Ok(Self::with_transport(config, transport))
    }

    pub fn with_transport(config: EmbeddingsConfig, transport: Arc<dyn Transport>) -> Self {
        Self { config, transport }
    }

    pub fn from_env() -> Result<Self> {
        Self::new(EmbeddingsConfig::from_env())
    }

    fn headers(&self) -> Vec<(String, String)> {
        self.config
            .api_key
            .iter()
            .map(|key| ("Authorization".to_string(), format!("Bearer {}", key)))
            .collect()
    }
}

#[derive(Debug, Deserialize)]
struct EmbeddingsResponse {
    #[serde(default)]
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}

#[async_trait]
impl EmbeddingsProvider for OpenAiEmbeddings {
    async fn embed_text(&self, text: &str) -> Result<Vec<f32>> {
        let url = format!("{}/embeddings", self.config.base_url.trim_end_matches('/'));
        let body = json!({
            "model": self.config.model,
            "input": text,
            "encoding_format": "float",
        });

        let value = self.transport.post_json(&url, &self.headers(), &body).await?;
        let response: EmbeddingsResponse = serde_json::from_value(value)
            .map_err(|e| AgentError::Embeddings(format!("unexpected embeddings response: {}", e)))?;

        response
            .data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .ok_or_else(|| AgentError::Embeddings("embeddings response has no data".into()))
    }
}
