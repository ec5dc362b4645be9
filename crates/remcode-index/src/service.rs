//! The operations offered to callers, wired from one [`RemcodeConfig`].

use std::sync::Arc;

use remcode_config::{EmbeddingProviderKind, RemcodeConfig, VectorStoreKind};
use tracing::info;

use crate::chunker::{ChunkerConfig, CodeChunker};
use crate::embeddings::{
    EmbeddingConfig, EmbeddingError, EmbeddingGenerator, EmbeddingProvider, HashingEmbeddings,
    HttpEmbeddingProvider, ModelSpec,
};
use crate::error::PipelineError;
use crate::pipeline::{PipelineConfig, ProcessingPipeline, ProcessingStats};
use crate::query::QueryProcessor;
use crate::scanner::{RepositoryScanner, ScannerConfig};
use crate::search::{SearchError, SearchResult, SemanticSearchEngine};
use crate::similarity::{SimilarityAnalyzer, SimilarityReport};
use crate::store::memory::InMemoryVectorStore;
use crate::store::qdrant::QdrantVectorStore;
use crate::store::VectorStore;

/// Pipeline, search engine and similarity analyzer over one repository and namespace.
pub struct IndexService {
    pipeline: ProcessingPipeline,
    search: SemanticSearchEngine,
    similarity: SimilarityAnalyzer,
    generator: Arc<EmbeddingGenerator>,
}

impl IndexService {
    /// Build every component from configuration. No network calls are made.
    pub fn from_config(config: &RemcodeConfig) -> Result<Self, PipelineError> {
        let provider: Arc<dyn EmbeddingProvider> = match config.embedding.provider {
            EmbeddingProviderKind::Http => Arc::new(HttpEmbeddingProvider::from_settings(&config.embedding)?),
            EmbeddingProviderKind::Hashing => Arc::new(HashingEmbeddings::new()),
        };
        let store: Arc<dyn VectorStore> = match config.vector_store.kind {
            VectorStoreKind::Qdrant => Arc::new(
                QdrantVectorStore::connect(&config.vector_store)
                    .map_err(|e| PipelineError::Config(e.to_string()))?,
            ),
            VectorStoreKind::Memory => Arc::new(InMemoryVectorStore::new(config.vector_store.dimension)),
        };
        Self::with_parts(config, provider, store)
    }

    /// Build with an explicit provider and store, used by embedders and tests.
    pub fn with_parts(
        config: &RemcodeConfig,
        provider: Arc<dyn EmbeddingProvider>,
        store: Arc<dyn VectorStore>,
    ) -> Result<Self, PipelineError> {
        let generator = Arc::new(EmbeddingGenerator::new(
            provider.clone(),
            ModelSpec::from(&config.embedding.primary),
            config.embedding.fallback.as_ref().map(ModelSpec::from),
            EmbeddingConfig::from(&config.embedding),
        )?);
        info!(
            "Index service: provider {}, model {} ({} dims), namespace {}",
            provider.name(),
            generator.primary().id,
            generator.dimension(),
            config.vector_store.namespace
        );

        let pipeline = ProcessingPipeline::new(
            RepositoryScanner::new(ScannerConfig::from(&config.repository)),
            CodeChunker::new(ChunkerConfig::from(&config.chunking)),
            generator.clone(),
            store.clone(),
            PipelineConfig::from(config),
        );
        let search = SemanticSearchEngine::new(
            QueryProcessor::new(&config.search),
            generator.clone(),
            store.clone(),
            config.vector_store.namespace.clone(),
            config.search.clone(),
        );
        let similarity = SimilarityAnalyzer::new(
            generator.clone(),
            store,
            config.vector_store.namespace.clone(),
            config.similarity.clone(),
            config.search.clone(),
        );

        Ok(Self {
            pipeline,
            search,
            similarity,
            generator,
        })
    }

    pub fn pipeline(&self) -> &ProcessingPipeline {
        &self.pipeline
    }

    pub async fn run_incremental(&self) -> Result<ProcessingStats, PipelineError> {
        self.pipeline.run_incremental().await
    }

    pub async fn has_pending_changes(&self) -> Result<bool, PipelineError> {
        self.pipeline.has_pending_changes().await
    }

    /// Statistics of the last finished run; `None` before the first one.
    pub fn get_status(&self) -> Result<Option<ProcessingStats>, PipelineError> {
        self.pipeline.status()
    }

    pub async fn search(&self, query: &str, top_k: usize) -> Result<Vec<SearchResult>, SearchError> {
        self.search.search(query, top_k).await
    }

    pub async fn embed_text(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        self.generator.embed_text(text).await
    }

    pub async fn analyze_similarity(
        &self,
        snippet: &str,
        min_confidence: f32,
    ) -> Result<SimilarityReport, SearchError> {
        self.similarity.analyze(snippet, min_confidence).await
    }
}
