//! Query-driven retrieval over the vector store.
//!
//! Semantic queries are embedded and answered by nearest-neighbour search.
//! Exact queries are literal substring matches over stored chunk content and
//! pattern queries are regular expressions evaluated over stored chunks;
//! both score matches as 1.0.

pub mod annotate;

pub use annotate::Highlight;

use std::sync::Arc;

use regex::Regex;
use remcode_config::SearchSettings;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::embeddings::{EmbeddingError, EmbeddingGenerator};
use crate::query::{ProcessedQuery, QueryProcessor, QueryType};
use crate::store::{ChunkPayload, SearchFilter, StoreError, VectorStore};
use crate::text::highlight_terms;
use annotate::Matcher;

/// Errors that can occur during search.
#[derive(Error, Debug)]
pub enum SearchError {
    #[error("Failed to embed query: {0}")]
    Embedding(#[from] EmbeddingError),

    #[error("Vector store query failed: {0}")]
    Store(#[from] StoreError),

    #[error("Invalid pattern {pattern:?}: {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },
}

/// A ranked search hit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResult {
    pub chunk_id: String,
    /// Cosine similarity for semantic queries, 1.0 for exact and pattern matches
    pub score: f32,
    pub file_path: String,
    pub content: String,
    pub metadata: ChunkPayload,
    /// 1-indexed inclusive line range of the match within the file
    pub matched_line_range: (usize, usize),
    pub snippet: String,
    pub highlights: Vec<Highlight>,
    pub explanation: String,
}

impl SearchResult {
    pub fn line_count(&self) -> usize {
        self.metadata.line_count()
    }
}

/// Best score first; among equal scores the shorter, more specific chunk wins.
pub fn rank(results: &mut [SearchResult]) {
    results.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.line_count().cmp(&b.line_count()))
            .then_with(|| a.file_path.cmp(&b.file_path))
            .then_with(|| a.metadata.start_line.cmp(&b.metadata.start_line))
    });
}

/// Search engine over one namespace.
pub struct SemanticSearchEngine {
    processor: QueryProcessor,
    generator: Arc<EmbeddingGenerator>,
    store: Arc<dyn VectorStore>,
    namespace: String,
    settings: SearchSettings,
}

impl SemanticSearchEngine {
    pub fn new(
        processor: QueryProcessor,
        generator: Arc<EmbeddingGenerator>,
        store: Arc<dyn VectorStore>,
        namespace: impl Into<String>,
        settings: SearchSettings,
    ) -> Self {
        Self {
            processor,
            generator,
            store,
            namespace: namespace.into(),
            settings,
        }
    }

    pub fn processor(&self) -> &QueryProcessor {
        &self.processor
    }

    /// Classify `raw_query` and return at most `top_k` annotated results.
    ///
    /// An empty corpus or no match yields an empty list.
    pub async fn search(&self, raw_query: &str, top_k: usize) -> Result<Vec<SearchResult>, SearchError> {
        let query = self.processor.process(raw_query);
        self.search_processed(&query, top_k).await
    }

    pub async fn search_processed(
        &self,
        query: &ProcessedQuery,
        top_k: usize,
    ) -> Result<Vec<SearchResult>, SearchError> {
        if query.is_empty() || top_k == 0 {
            return Ok(Vec::new());
        }
        let filter: Option<&SearchFilter> = (!query.filter.is_empty()).then_some(&query.filter);
        let text = query.normalized_query.as_str();

        let mut results = match query.query_type {
            QueryType::Semantic => {
                let vector = self.generator.embed_text(text).await?;
                let hits = self.store.query(&self.namespace, &vector, top_k, filter).await?;
                let terms = highlight_terms(text);
                hits.into_iter()
                    .map(|hit| self.annotate(hit.score, hit.payload, query, &Matcher::Terms(&terms)))
                    .collect::<Vec<_>>()
            }
            QueryType::Exact => {
                let found = self
                    .store
                    .find_text(&self.namespace, text, filter, self.settings.scan_limit)
                    .await?;
                found
                    .into_iter()
                    .map(|payload| self.annotate(1.0, payload, query, &Matcher::Literal(text)))
                    .collect()
            }
            QueryType::Pattern => {
                let re = Regex::new(text).map_err(|source| SearchError::InvalidPattern {
                    pattern: text.to_string(),
                    source,
                })?;
                let candidates = self
                    .store
                    .scan(&self.namespace, filter, self.settings.scan_limit)
                    .await?;
                candidates
                    .into_iter()
                    .filter(|payload| re.is_match(&payload.content))
                    .map(|payload| self.annotate(1.0, payload, query, &Matcher::Pattern(&re)))
                    .collect()
            }
        };

        rank(&mut results);
        results.truncate(top_k);
        debug!(
            "{:?} query {:?} returned {} results",
            query.query_type,
            text,
            results.len()
        );
        Ok(results)
    }

    fn annotate(
        &self,
        score: f32,
        payload: ChunkPayload,
        query: &ProcessedQuery,
        matcher: &Matcher<'_>,
    ) -> SearchResult {
        let matched = matcher.matched_lines(&payload.content);
        SearchResult {
            chunk_id: payload.chunk_id.clone(),
            score,
            file_path: payload.file_path.clone(),
            content: payload.content.clone(),
            matched_line_range: annotate::matched_range(&payload, &matched),
            snippet: annotate::snippet(&payload, &matched, self.settings.context_lines),
            highlights: annotate::highlights(&payload, &matched, self.settings.max_highlights),
            explanation: annotate::explanation(score, &payload, query),
            metadata: payload,
        }
    }
}
