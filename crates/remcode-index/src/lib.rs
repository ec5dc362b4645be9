//! Incremental code indexing and semantic search for remcode.
//!
//! This crate provides:
//! - Change detection against persisted per-file state
//! - Structure-aware chunking using tree-sitter, with a sliding-window fallback
//! - Embedding generation with primary/fallback models, retries and pooling
//! - Vector storage in Qdrant (or in memory)
//! - Query classification, semantic/exact/pattern search and similarity analysis
//! - A processing pipeline tying the above together behind [`IndexService`]

pub mod chunker;
pub mod embeddings;
pub mod error;
pub mod lock;
pub mod pipeline;
pub mod query;
pub mod retry;
pub mod scanner;
pub mod search;
pub mod service;
pub mod similarity;
pub mod state;
pub mod store;
pub mod text;

// Re-exports
pub use chunker::{ChunkStrategy, ChunkType, ChunkerConfig, CodeChunk, CodeChunker, FileMeta};
pub use embeddings::{
    EmbedOutcome, EmbeddedChunk, EmbeddingError, EmbeddingGenerator, EmbeddingProvider,
    FailedChunk, ModelRole, ModelSpec, OutputShape,
};
pub use error::PipelineError;
pub use lock::{LockError, RunLock};
pub use pipeline::{ProcessingPipeline, ProcessingStats, RunState, RunStatus};
pub use query::{
    IntentClassifier, KeywordIntentClassifier, ProcessedQuery, QueryIntent, QueryProcessor,
    QueryType,
};
pub use scanner::{RepositoryScanner, ScanResult, ScannedFile};
pub use search::{SearchError, SearchResult, SemanticSearchEngine};
pub use service::IndexService;
pub use similarity::{PatternCategory, SimilarityAnalyzer, SimilarityReport};
pub use state::{FileDelta, FileState, FileStateTracker, StateError, StateRecord};
pub use store::{
    memory::InMemoryVectorStore, qdrant::QdrantVectorStore, ChunkPayload, ScoredChunk,
    SearchFilter, StoreError, StoreStats, VectorStore,
};

/// Default vector-store namespace
pub const DEFAULT_NAMESPACE: &str = "main";

/// Name of the persisted state record inside the state directory
pub const STATE_FILE: &str = "state.json";

/// Name of the run lockfile inside the state directory
pub const LOCK_FILE: &str = "run.lock";
