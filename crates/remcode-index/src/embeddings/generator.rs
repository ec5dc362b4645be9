//! Batched embedding with retries and model fallback.
//!
//! Each batch walks a small state machine:
//!
//! ```text
//! Attempting(first, n) --transient--> Retrying(delay) --> Attempting(first, n+1)
//!        |                                   (until the attempt cap)
//!        +--exhausted/permanent--> FallbackAttempting(then) --> Succeeded | Failed
//!        +--ok--> Succeeded
//! ```
//!
//! A failed batch marks its chunks as failed and never aborts the other
//! batches. A dimension mismatch is a configuration error and aborts the call.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use remcode_config::EmbeddingSettings;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use super::{EmbeddingError, EmbeddingProvider, ModelRole, ModelSpec};
use crate::chunker::CodeChunk;
use crate::retry::RetryConfig;

/// Batching and retry parameters.
#[derive(Debug, Clone)]
pub struct EmbeddingConfig {
    pub batch_size: usize,
    pub retry: RetryConfig,
    /// Simultaneous in-flight provider calls
    pub max_concurrent_requests: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self::from(&EmbeddingSettings::default())
    }
}

impl From<&EmbeddingSettings> for EmbeddingConfig {
    fn from(settings: &EmbeddingSettings) -> Self {
        Self {
            batch_size: settings.batch_size.max(1),
            retry: RetryConfig::new(
                settings.max_attempts,
                Duration::from_millis(settings.initial_backoff_ms),
                Duration::from_millis(settings.max_backoff_ms),
            ),
            max_concurrent_requests: settings.max_concurrent_requests.max(1),
        }
    }
}

/// A chunk together with its vector.
#[derive(Debug, Clone)]
pub struct EmbeddedChunk {
    pub chunk: CodeChunk,
    pub embedding: Vec<f32>,
    pub dimension: usize,
    pub model_id: String,
}

/// A chunk whose batch could not be embedded by any model.
#[derive(Debug, Clone)]
pub struct FailedChunk {
    pub chunk: CodeChunk,
    pub error: String,
}

/// Result of [`EmbeddingGenerator::embed`].
#[derive(Debug, Default)]
pub struct EmbedOutcome {
    pub embedded: Vec<EmbeddedChunk>,
    pub failed: Vec<FailedChunk>,
}

/// Which model to try first, and which one to fall back to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelSelection {
    pub first: ModelRole,
    pub then: Option<ModelRole>,
}

enum BatchState {
    Attempting { role: ModelRole, attempt: u32 },
    Retrying { role: ModelRole, attempt: u32, delay: Duration },
    FallbackAttempting { role: ModelRole },
    Succeeded { role: ModelRole, vectors: Vec<Vec<f32>> },
    Failed { error: EmbeddingError },
}

enum BatchResult {
    Succeeded { role: ModelRole, vectors: Vec<Vec<f32>> },
    Failed { error: EmbeddingError },
    Fatal(EmbeddingError),
}

/// Turns chunks into vectors through a provider.
pub struct EmbeddingGenerator {
    provider: Arc<dyn EmbeddingProvider>,
    primary: ModelSpec,
    fallback: Option<ModelSpec>,
    config: EmbeddingConfig,
    permits: Arc<Semaphore>,
}

impl EmbeddingGenerator {
    /// Create a generator. Primary and fallback must produce the same dimension.
    pub fn new(
        provider: Arc<dyn EmbeddingProvider>,
        primary: ModelSpec,
        fallback: Option<ModelSpec>,
        config: EmbeddingConfig,
    ) -> Result<Self, EmbeddingError> {
        if let Some(fallback) = &fallback {
            if fallback.dimension != primary.dimension {
                return Err(EmbeddingError::DimensionMismatch {
                    model: fallback.id.clone(),
                    expected: primary.dimension,
                    actual: fallback.dimension,
                });
            }
        }
        let permits = Arc::new(Semaphore::new(config.max_concurrent_requests.max(1)));
        Ok(Self {
            provider,
            primary,
            fallback,
            config,
            permits,
        })
    }

    pub fn dimension(&self) -> usize {
        self.primary.dimension
    }

    pub fn primary(&self) -> &ModelSpec {
        &self.primary
    }

    pub fn model(&self, role: ModelRole) -> Option<&ModelSpec> {
        match role {
            ModelRole::Primary => Some(&self.primary),
            ModelRole::Fallback => self.fallback.as_ref(),
        }
    }

    /// Fails when vectors from this generator cannot go into an index of `store_dimension`.
    pub fn check_dimension(&self, store_dimension: usize) -> Result<(), EmbeddingError> {
        if self.primary.dimension != store_dimension {
            return Err(EmbeddingError::DimensionMismatch {
                model: self.primary.id.clone(),
                expected: store_dimension,
                actual: self.primary.dimension,
            });
        }
        Ok(())
    }

    /// Primary first, fallback after it (if configured).
    pub fn default_selection(&self) -> ModelSelection {
        ModelSelection {
            first: ModelRole::Primary,
            then: self.fallback.as_ref().map(|_| ModelRole::Fallback),
        }
    }

    /// Issue a trivial embedding call against one model.
    pub async fn is_healthy(&self, role: ModelRole) -> bool {
        self.check_health(role).await.is_ok()
    }

    async fn check_health(&self, role: ModelRole) -> Result<(), EmbeddingError> {
        let model = self
            .model(role)
            .ok_or_else(|| EmbeddingError::Permanent(format!("No {:?} model configured", role)))?;
        self.call(model, &["health check".to_string()]).await.map(|_| ()).map_err(|e| {
            warn!("Embedding model {} is unhealthy: {}", model.id, e);
            e
        })
    }

    /// Check the models and decide which one a run should start with.
    ///
    /// An outage only changes the selection. A model answering with the wrong
    /// dimension is a configuration error and is returned.
    pub async fn select_models(&self) -> Result<ModelSelection, EmbeddingError> {
        let default = self.default_selection();
        match self.check_health(ModelRole::Primary).await {
            Ok(()) => return Ok(default),
            Err(e @ EmbeddingError::DimensionMismatch { .. }) => return Err(e),
            Err(_) => {}
        }
        if self.fallback.is_none() {
            return Ok(default);
        }
        match self.check_health(ModelRole::Fallback).await {
            Ok(()) => {
                info!("Primary model unavailable, starting with fallback");
                Ok(ModelSelection {
                    first: ModelRole::Fallback,
                    then: None,
                })
            }
            Err(e @ EmbeddingError::DimensionMismatch { .. }) => Err(e),
            Err(_) => Ok(default),
        }
    }

    /// Embed chunks in batches.
    ///
    /// Only a dimension mismatch is returned as an error; every other failure
    /// is reported per chunk in [`EmbedOutcome::failed`].
    pub async fn embed(
        &self,
        chunks: Vec<CodeChunk>,
        selection: ModelSelection,
    ) -> Result<EmbedOutcome, EmbeddingError> {
        if chunks.is_empty() {
            return Ok(EmbedOutcome::default());
        }

        let mut batches: Vec<Vec<CodeChunk>> = Vec::new();
        let mut remaining = chunks.into_iter().peekable();
        while remaining.peek().is_some() {
            batches.push(remaining.by_ref().take(self.config.batch_size).collect());
        }
        debug!("Embedding {} batches", batches.len());

        // Provider calls are bounded by the semaphore in `call`; a batch
        // sleeping between attempts holds no permit.
        let results: Vec<(Vec<CodeChunk>, BatchResult)> =
            join_all(batches.into_iter().enumerate().map(|(index, batch)| async move {
                let texts: Vec<String> = batch.iter().map(|c| c.content.clone()).collect();
                let result = self.run_batch(index, &texts, selection).await;
                (batch, result)
            }))
            .await;

        let mut outcome = EmbedOutcome::default();
        for (batch, result) in results {
            match result {
                BatchResult::Succeeded { role, vectors } => {
                    let model_id = self.model(role).map(|m| m.id.clone()).unwrap_or_default();
                    for (chunk, embedding) in batch.into_iter().zip(vectors) {
                        outcome.embedded.push(EmbeddedChunk {
                            chunk,
                            dimension: embedding.len(),
                            embedding,
                            model_id: model_id.clone(),
                        });
                    }
                }
                BatchResult::Failed { error } => {
                    let message = error.to_string();
                    outcome
                        .failed
                        .extend(batch.into_iter().map(|chunk| FailedChunk {
                            chunk,
                            error: message.clone(),
                        }));
                }
                BatchResult::Fatal(error) => return Err(error),
            }
        }
        Ok(outcome)
    }

    /// Embed a single text, with the same retry and fallback policy.
    pub async fn embed_text(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let texts = [text.to_string()];
        match self.run_batch(0, &texts, self.default_selection()).await {
            BatchResult::Succeeded { vectors, .. } => vectors
                .into_iter()
                .next()
                .ok_or_else(|| EmbeddingError::InvalidResponse("No embedding returned".to_string())),
            BatchResult::Failed { error } | BatchResult::Fatal(error) => Err(error),
        }
    }

    async fn run_batch(&self, index: usize, texts: &[String], selection: ModelSelection) -> BatchResult {
        let max_attempts = self.config.retry.max_attempts;
        let mut state = BatchState::Attempting {
            role: selection.first,
            attempt: 1,
        };

        loop {
            state = match state {
                BatchState::Attempting { role, attempt } => {
                    let Some(model) = self.model(role) else {
                        return BatchResult::Failed {
                            error: EmbeddingError::Permanent(format!("No {:?} model configured", role)),
                        };
                    };
                    match self.call(model, texts).await {
                        Ok(vectors) => BatchState::Succeeded { role, vectors },
                        Err(e @ EmbeddingError::DimensionMismatch { .. }) => return BatchResult::Fatal(e),
                        Err(e) if e.is_transient() && attempt < max_attempts => {
                            let delay = e
                                .retry_after()
                                .map(|d| d.min(self.config.retry.max_delay))
                                .unwrap_or_else(|| self.config.retry.delay_for(attempt));
                            warn!(
                                batch = index,
                                "Embedding attempt {}/{} with {} failed: {}",
                                attempt,
                                max_attempts,
                                model.id,
                                e
                            );
                            BatchState::Retrying { role, attempt, delay }
                        }
                        Err(e) => match selection.then {
                            Some(next) => {
                                warn!(
                                    batch = index,
                                    "Giving up on {} after {} attempt(s): {}", model.id, attempt, e
                                );
                                BatchState::FallbackAttempting { role: next }
                            }
                            None => BatchState::Failed { error: e },
                        },
                    }
                }
                BatchState::Retrying { role, attempt, delay } => {
                    tokio::time::sleep(delay).await;
                    BatchState::Attempting {
                        role,
                        attempt: attempt + 1,
                    }
                }
                BatchState::FallbackAttempting { role } => {
                    let Some(model) = self.model(role) else {
                        return BatchResult::Failed {
                            error: EmbeddingError::Permanent(format!("No {:?} model configured", role)),
                        };
                    };
                    match self.call(model, texts).await {
                        Ok(vectors) => {
                            info!(batch = index, "Batch embedded with fallback model {}", model.id);
                            BatchState::Succeeded { role, vectors }
                        }
                        Err(e @ EmbeddingError::DimensionMismatch { .. }) => return BatchResult::Fatal(e),
                        Err(e) => BatchState::Failed { error: e },
                    }
                }
                BatchState::Succeeded { role, vectors } => {
                    return BatchResult::Succeeded { role, vectors };
                }
                BatchState::Failed { error } => {
                    warn!(batch = index, "Batch of {} texts failed: {}", texts.len(), error);
                    return BatchResult::Failed { error };
                }
            };
        }
    }

    /// One provider call, bounded by the request semaphore and checked for shape.
    async fn call(&self, model: &ModelSpec, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| EmbeddingError::Permanent("Embedding generator shut down".to_string()))?;

        let vectors = self.provider.embed_batch(model, texts).await?;
        if vectors.len() != texts.len() {
            return Err(EmbeddingError::InvalidResponse(format!(
                "expected {} embeddings, got {}",
                texts.len(),
                vectors.len()
            )));
        }
        if let Some(bad) = vectors.iter().find(|v| v.len() != model.dimension) {
            return Err(EmbeddingError::DimensionMismatch {
                model: model.id.clone(),
                expected: model.dimension,
                actual: bad.len(),
            });
        }
        Ok(vectors)
    }
}
