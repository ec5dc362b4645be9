//! Vector store abstraction.
//!
//! A store holds `(id, vector, payload)` points partitioned by namespace. Upserts
//! are keyed by chunk id, so writing the same chunk twice never duplicates it.

pub mod memory;
pub mod qdrant;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::chunker::{ChunkStrategy, ChunkType};
use crate::embeddings::EmbeddedChunk;

/// Errors returned by vector stores.
#[derive(Error, Debug, Clone)]
pub enum StoreError {
    #[error("Vector store unavailable: {0}")]
    Transient(String),

    #[error("Vector store error: {0}")]
    Permanent(String),

    #[error("Index {index} has {actual} dimensions, expected {expected}")]
    DimensionMismatch {
        index: String,
        expected: usize,
        actual: usize,
    },
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Metadata stored with each vector point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkPayload {
    pub chunk_id: String,

    /// Repository-relative path of the source file
    pub file_path: String,

    pub chunk_type: ChunkType,

    pub language: String,

    /// Name of the function/class/etc.
    pub symbol_name: Option<String>,

    /// Starting line number (1-indexed)
    pub start_line: usize,

    /// Ending line number (1-indexed)
    pub end_line: usize,

    pub strategy: ChunkStrategy,

    /// Model that produced the vector
    pub model_id: String,

    /// The actual source code of this chunk
    pub content: String,
}

impl ChunkPayload {
    pub fn from_embedded(embedded: &EmbeddedChunk) -> Self {
        let chunk = &embedded.chunk;
        Self {
            chunk_id: chunk.id.clone(),
            file_path: chunk.file_path.clone(),
            chunk_type: chunk.chunk_type,
            language: chunk.language.clone(),
            symbol_name: chunk.symbol_name.clone(),
            start_line: chunk.start_line,
            end_line: chunk.end_line,
            strategy: chunk.strategy,
            model_id: embedded.model_id.clone(),
            content: chunk.content.clone(),
        }
    }

    pub fn line_count(&self) -> usize {
        (self.end_line + 1).saturating_sub(self.start_line)
    }
}

/// A stored chunk with its similarity to a query vector.
#[derive(Debug, Clone)]
pub struct ScoredChunk {
    pub score: f32,
    pub payload: ChunkPayload,
}

/// Namespace statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreStats {
    pub vector_count: usize,
    pub dimension: usize,
}

/// Metadata equality filter for queries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchFilter {
    /// File path or directory prefix (at `/` boundaries)
    pub path_prefix: Option<String>,

    /// Filter by chunk types
    pub chunk_types: Option<Vec<ChunkType>>,

    /// Filter by programming language
    pub language: Option<String>,
}

impl SearchFilter {
    /// Create a new empty filter.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_path_prefix(mut self, prefix: impl Into<String>) -> Self {
        let prefix = prefix.into().trim_end_matches('/').to_string();
        self.path_prefix = if prefix.is_empty() { None } else { Some(prefix) };
        self
    }

    pub fn with_chunk_types(mut self, types: Vec<ChunkType>) -> Self {
        self.chunk_types = if types.is_empty() { None } else { Some(types) };
        self
    }

    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = Some(language.into().to_lowercase());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.path_prefix.is_none() && self.chunk_types.is_none() && self.language.is_none()
    }

    /// Client-side evaluation, same semantics as the store-side filter.
    pub fn matches(&self, payload: &ChunkPayload) -> bool {
        if let Some(prefix) = &self.path_prefix {
            if !path_has_prefix(&payload.file_path, prefix) {
                return false;
            }
        }
        if let Some(types) = &self.chunk_types {
            if !types.contains(&payload.chunk_type) {
                return false;
            }
        }
        if let Some(language) = &self.language {
            if payload.language != *language {
                return false;
            }
        }
        true
    }
}

/// Whether `path` is `prefix` itself or lies under the directory `prefix`.
pub fn path_has_prefix(path: &str, prefix: &str) -> bool {
    path == prefix
        || (path.starts_with(prefix) && path.as_bytes().get(prefix.len()) == Some(&b'/'))
}

/// Every `/`-bounded prefix of a path, the path itself included.
pub fn path_prefixes(path: &str) -> Vec<String> {
    let mut prefixes: Vec<String> = path
        .match_indices('/')
        .map(|(i, _)| path[..i].to_string())
        .filter(|p| !p.is_empty())
        .collect();
    prefixes.push(path.to_string());
    prefixes
}

/// Trait for vector stores.
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Vector dimension of the index
    fn dimension(&self) -> usize;

    /// Create the index (and anything the namespace needs) if missing, and
    /// verify its dimension.
    async fn ensure_namespace(&self, namespace: &str) -> Result<(), StoreError>;

    /// Insert or overwrite chunks by id.
    async fn upsert(&self, namespace: &str, chunks: &[EmbeddedChunk]) -> Result<(), StoreError>;

    /// Top-K nearest chunks by cosine similarity.
    async fn query(
        &self,
        namespace: &str,
        vector: &[f32],
        top_k: usize,
        filter: Option<&SearchFilter>,
    ) -> Result<Vec<ScoredChunk>, StoreError>;

    /// Chunks whose content contains `text` literally.
    async fn find_text(
        &self,
        namespace: &str,
        text: &str,
        filter: Option<&SearchFilter>,
        limit: usize,
    ) -> Result<Vec<ChunkPayload>, StoreError>;

    /// Stored chunks matching `filter`, up to `limit`.
    async fn scan(
        &self,
        namespace: &str,
        filter: Option<&SearchFilter>,
        limit: usize,
    ) -> Result<Vec<ChunkPayload>, StoreError>;

    async fn delete_ids(&self, namespace: &str, ids: &[String]) -> Result<(), StoreError>;

    /// Remove every chunk of one file.
    async fn delete_file(&self, namespace: &str, file_path: &str) -> Result<(), StoreError>;

    async fn describe_stats(&self, namespace: &str) -> Result<StoreStats, StoreError>;
}
