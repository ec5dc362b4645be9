//! Embedding provider trait and implementations.
//!
//! Providers turn a batch of texts into one vector per text for a given model.
//! Retries, fallback and batching live in [`EmbeddingGenerator`].

pub mod generator;
pub mod hashing;
pub mod pooling;

use std::time::Duration;

use async_trait::async_trait;
use remcode_config::{EmbeddingSettings, ModelOutput, ModelSettings};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

pub use generator::{
    EmbedOutcome, EmbeddedChunk, EmbeddingConfig, EmbeddingGenerator, FailedChunk, ModelSelection,
};
pub use hashing::HashingEmbeddings;
pub use pooling::mean_pool;

/// Errors that can occur during embedding generation.
#[derive(Error, Debug, Clone)]
pub enum EmbeddingError {
    #[error("Transient failure: {0}")]
    Transient(String),

    #[error("Rate limited (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },

    #[error("API request failed: {0}")]
    Permanent(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Model {model} produced {actual} dimensions, expected {expected}")]
    DimensionMismatch {
        model: String,
        expected: usize,
        actual: usize,
    },
}

impl EmbeddingError {
    /// Whether the call may succeed if repeated.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::RateLimited { .. })
    }

    /// Server-provided delay before the next attempt.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

/// Declared output shape of a model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputShape {
    /// One vector per input
    Pooled,
    /// One vector per token, mean-pooled before use
    TokenLevel,
}

/// An embedding model and what it produces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSpec {
    pub id: String,
    pub dimension: usize,
    pub output: OutputShape,
}

impl ModelSpec {
    pub fn pooled(id: impl Into<String>, dimension: usize) -> Self {
        Self {
            id: id.into(),
            dimension,
            output: OutputShape::Pooled,
        }
    }
}

impl From<&ModelSettings> for ModelSpec {
    fn from(settings: &ModelSettings) -> Self {
        Self {
            id: settings.id.clone(),
            dimension: settings.dimension,
            output: match settings.output {
                ModelOutput::Pooled => OutputShape::Pooled,
                ModelOutput::Token => OutputShape::TokenLevel,
            },
        }
    }
}

/// Which configured model a call goes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelRole {
    Primary,
    Fallback,
}

/// Trait for embedding providers.
///
/// Implementations should be Send + Sync to allow use in async contexts.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Embed a batch of texts with `model`, one vector per text, in input order.
    async fn embed_batch(
        &self,
        model: &ModelSpec,
        texts: &[String],
    ) -> Result<Vec<Vec<f32>>, EmbeddingError>;

    /// Short provider name for logs
    fn name(&self) -> &str;
}

/// Request body for embedding API
#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

/// Individual embedding data in an OpenAI-style response
#[derive(Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
    index: usize,
}

/// The response shapes accepted from an embedding service.
#[derive(Deserialize)]
#[serde(untagged)]
enum EmbeddingPayload {
    OpenAi { data: Vec<EmbeddingData> },
    Vector(Vec<f32>),
    Matrix(Vec<Vec<f32>>),
    Tensor(Vec<Vec<Vec<f32>>>),
}

impl EmbeddingPayload {
    /// Resolve to one vector per input, pooling token-level output.
    fn into_vectors(self, model: &ModelSpec, inputs: usize) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let vectors = match self {
            Self::OpenAi { mut data } => {
                data.sort_by_key(|d| d.index);
                data.into_iter().map(|d| d.embedding).collect()
            }
            Self::Vector(vector) => vec![vector],
            Self::Matrix(rows) => {
                if inputs == 1 && model.output == OutputShape::TokenLevel {
                    vec![pool(rows)?]
                } else {
                    rows
                }
            }
            Self::Tensor(per_input) => per_input
                .into_iter()
                .map(pool)
                .collect::<Result<Vec<_>, _>>()?,
        };

        if vectors.len() != inputs {
            return Err(EmbeddingError::InvalidResponse(format!(
                "expected {} embeddings, got {}",
                inputs,
                vectors.len()
            )));
        }
        Ok(vectors)
    }
}

fn pool(tokens: Vec<Vec<f32>>) -> Result<Vec<f32>, EmbeddingError> {
    mean_pool(&tokens).ok_or_else(|| {
        EmbeddingError::InvalidResponse("token vectors are empty or of unequal length".to_string())
    })
}

/// Embedding service reached over HTTP with `{model, input}` requests.
pub struct HttpEmbeddingProvider {
    client: Client,
    endpoint: String,
    api_key: Option<String>,
}

impl HttpEmbeddingProvider {
    pub fn new(endpoint: String, api_key: Option<String>, timeout: Duration) -> Result<Self, EmbeddingError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| EmbeddingError::Permanent(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            endpoint,
            api_key,
        })
    }

    pub fn from_settings(settings: &EmbeddingSettings) -> Result<Self, EmbeddingError> {
        Self::new(
            settings.endpoint.clone(),
            settings.api_key.clone(),
            Duration::from_secs(settings.request_timeout_secs),
        )
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

fn classify_send_error(e: reqwest::Error) -> EmbeddingError {
    if e.is_builder() {
        EmbeddingError::Permanent(format!("Invalid request: {}", e))
    } else {
        EmbeddingError::Transient(format!("Network error: {}", e))
    }
}

#[async_trait]
impl EmbeddingProvider for HttpEmbeddingProvider {
    async fn embed_batch(
        &self,
        model: &ModelSpec,
        texts: &[String],
    ) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        if texts.is_empty() {
            return Ok(vec![]);
        }

        debug!(
            "Sending embedding request for {} texts to {} ({})",
            texts.len(),
            self.endpoint,
            model.id
        );

        let mut request = self
            .client
            .post(&self.endpoint)
            .json(&EmbeddingRequest {
                model: &model.id,
                input: texts,
            });
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(classify_send_error)?;
        let status = response.status();

        if status.is_success() {
            let payload: EmbeddingPayload = response
                .json()
                .await
                .map_err(|e| EmbeddingError::InvalidResponse(format!("Failed to parse response: {}", e)))?;
            return payload.into_vectors(model, texts.len());
        }

        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.trim().parse::<u64>().ok())
                .map(Duration::from_secs);
            return Err(EmbeddingError::RateLimited { retry_after });
        }

        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "Unknown error".to_string());
        let message = format!("{} ({}): {}", model.id, status.as_u16(), body);
        if status.is_server_error() || status == StatusCode::REQUEST_TIMEOUT {
            Err(EmbeddingError::Transient(message))
        } else {
            Err(EmbeddingError::Permanent(message))
        }
    }

    fn name(&self) -> &str {
        "http"
    }
}
