//! Network-backed embedding providers and provider selection.
//!
//! Use [`create_embedder`] to turn a [`ModelConfig`] of kind `embedding`
//! into a shared [`EmbeddingProvider`]:
//!
//! | Provider | Implementation |
//! |----------|----------------|
//! | `local` | [`HashingEmbedder`] (deterministic, no network) |
//! | `openai` | [`OpenAIEmbedder`] (`POST /v1/embeddings`) |
//!
//! OpenAI requests are retried with exponential backoff (1s doubling, capped
//! at 32s) on network errors, 429 and 5xx responses. Other 4xx statuses fail
//! the call at once.

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;

use grox_core::embedding::{EmbeddingProvider, HashingEmbedder};

use crate::config::{ModelConfig, ModelKind, ModelProvider};

/// Dimensionality of the local embedder when the config does not set one.
pub const DEFAULT_LOCAL_DIMS: usize = 256;

const OPENAI_EMBEDDINGS_URL: &str = "https://api.openai.com/v1/embeddings";

/// Build the embedding provider described by `config`.
pub fn create_embedder(config: &ModelConfig) -> Result<Arc<dyn EmbeddingProvider>> {
    if config.kind != ModelKind::Embedding {
        bail!(
            "model '{}' is a {:?} model, not an embedding model",
            config.model,
            config.kind
        );
    }
    match config.provider {
        ModelProvider::Local => Ok(Arc::new(HashingEmbedder::new(
            config.model.clone(),
            config.dims.unwrap_or(DEFAULT_LOCAL_DIMS),
        ))),
        ModelProvider::Openai => Ok(Arc::new(OpenAIEmbedder::new(config)?)),
    }
}

// ============ OpenAI ============

/// `POST /v1/embeddings` client.
///
/// Reads the key from `OPENAI_API_KEY`. The model's `options` may set
/// `batch_size`, `max_retries` and `timeout_secs`.
pub struct OpenAIEmbedder {
    model: String,
    dims: usize,
    api_key: String,
    batch_size: usize,
    max_retries: u32,
    client: reqwest::Client,
}

impl OpenAIEmbedder {
    pub fn new(config: &ModelConfig) -> Result<Self> {
        let Some(dims) = config.dims else {
            bail!("openai embedding model '{}' must set dims", config.model);
        };
        let api_key =
            std::env::var("OPENAI_API_KEY").context("OPENAI_API_KEY is not set")?;
        let opt = |key: &str, default: u64| {
            config
                .options
                .get(key)
                .and_then(serde_json::Value::as_u64)
                .unwrap_or(default)
        };
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(opt("timeout_secs", 30)))
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            model: config.model.clone(),
            dims,
            api_key,
            batch_size: opt("batch_size", 64).max(1) as usize,
            max_retries: opt("max_retries", 5) as u32,
            client,
        })
    }

    /// One request; `Ok(Err(_))` marks a failure worth retrying.
    async fn try_batch(&self, texts: &[String]) -> Result<Result<Vec<Vec<f32>>, anyhow::Error>> {
        let sent = self
            .client
            .post(OPENAI_EMBEDDINGS_URL)
            .bearer_auth(&self.api_key)
            .json(&serde_json::json!({ "model": self.model, "input": texts }))
            .send()
            .await;
        let response = match sent {
            Ok(response) => response,
            Err(e) => return Ok(Err(e.into())),
        };

        let status = response.status();
        if status.is_success() {
            let json: serde_json::Value = response.json().await?;
            return parse_openai_response(&json).map(Ok);
        }
        let detail = response.text().await.unwrap_or_default();
        let err = anyhow!("openai embeddings returned {status}: {detail}");
        if is_retryable(status) {
            Ok(Err(err))
        } else {
            Err(err)
        }
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut attempt = 0;
        loop {
            match self.try_batch(texts).await? {
                Ok(vectors) => return Ok(vectors),
                Err(e) if attempt >= self.max_retries => return Err(e),
                Err(e) => {
                    let delay = Duration::from_secs(1 << attempt.min(5));
                    attempt += 1;
                    tracing::warn!(
                        model = %self.model,
                        attempt,
                        delay_secs = delay.as_secs(),
                        error = %e,
                        "embedding_retry"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

fn is_retryable(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

#[async_trait]
impl EmbeddingProvider for OpenAIEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed_documents(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut out = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.batch_size) {
            out.extend(self.embed_batch(batch).await?);
        }
        Ok(out)
    }
}

#[derive(Deserialize)]
struct EmbeddingsResponse {
    data: Vec<EmbeddingItem>,
}

#[derive(Deserialize)]
struct EmbeddingItem {
    #[serde(default)]
    index: Option<usize>,
    embedding: Vec<f32>,
}

/// Vectors from `data[].embedding`, reordered by each item's `index`.
fn parse_openai_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>> {
    let parsed = EmbeddingsResponse::deserialize(json)
        .context("unexpected openai embeddings response")?;
    let mut items: Vec<(usize, Vec<f32>)> = parsed
        .data
        .into_iter()
        .enumerate()
        .map(|(pos, item)| (item.index.unwrap_or(pos), item.embedding))
        .collect();
    items.sort_by_key(|(i, _)| *i);
    Ok(items.into_iter().map(|(_, v)| v).collect())
}
