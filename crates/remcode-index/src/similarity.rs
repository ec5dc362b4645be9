//! Structural similarity of a snippet against the indexed corpus.
//!
//! Each candidate chunk is scored on three signals:
//! - cosine similarity of the embeddings
//! - Jaccard overlap of identifiers
//! - Jaccard overlap of idiom categories (error handling, async/await, ...)
//!
//! The weighted combination ranks candidates; the dominant idiom category
//! becomes the report's pattern type.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;
use remcode_config::{SearchSettings, SimilaritySettings};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::embeddings::EmbeddingGenerator;
use crate::search::annotate::{self, Matcher};
use crate::search::{rank, SearchError, SearchResult};
use crate::store::{ScoredChunk, VectorStore};
use crate::text::{jaccard, token_set};

/// Idiom categories recognised in code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternCategory {
    ErrorHandling,
    AsyncAwait,
    Iteration,
    ClassBased,
    FunctionDefinition,
    Testing,
    ResourceManagement,
}

impl PatternCategory {
    pub const ALL: [PatternCategory; 7] = [
        Self::ErrorHandling,
        Self::AsyncAwait,
        Self::Iteration,
        Self::ClassBased,
        Self::FunctionDefinition,
        Self::Testing,
        Self::ResourceManagement,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ErrorHandling => "error_handling",
            Self::AsyncAwait => "async_await",
            Self::Iteration => "iteration",
            Self::ClassBased => "class_based",
            Self::FunctionDefinition => "function_definition",
            Self::Testing => "testing",
            Self::ResourceManagement => "resource_management",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            Self::ErrorHandling => "error handling",
            Self::AsyncAwait => "async/await",
            Self::Iteration => "iteration",
            Self::ClassBased => "class-based structure",
            Self::FunctionDefinition => "function definition",
            Self::Testing => "test code",
            Self::ResourceManagement => "resource management",
        }
    }
}

static MARKERS: Lazy<Vec<(PatternCategory, Regex)>> = Lazy::new(|| {
    let table = [
        (
            PatternCategory::ErrorHandling,
            r"\b(try|catch|except|finally|raise|throw|throws|Err|Result|unwrap_or_else|map_err|panic)\b|\?;|\berr != nil\b",
        ),
        (
            PatternCategory::AsyncAwait,
            r"\b(async|await|Promise|Future|asyncio|tokio|spawn|go func)\b|\.await\b",
        ),
        (
            PatternCategory::Iteration,
            r"\b(for|while|loop|forEach|foreach|map|filter|reduce|iter|into_iter|range|enumerate)\b",
        ),
        (
            PatternCategory::ClassBased,
            r"\b(class|struct|impl|interface|trait|extends|implements|constructor|__init__)\b",
        ),
        (
            PatternCategory::FunctionDefinition,
            r"\b(fn|def|function|func|lambda)\b|=>",
        ),
        (
            PatternCategory::Testing,
            r"#\[(tokio::)?test\]|\b(assert\w*|describe|pytest|unittest)\b|\b(def|fn) test_",
        ),
        (
            PatternCategory::ResourceManagement,
            r"\b(with|open|close|Drop|drop|defer|using|dispose|lock|Mutex|RwLock|File)\b",
        ),
    ];
    table
        .into_iter()
        .map(|(category, pattern)| (category, Regex::new(pattern).expect("idiom marker regex is valid")))
        .collect()
});

/// Occurrences of each idiom category in `code`.
pub fn pattern_counts(code: &str) -> BTreeMap<PatternCategory, usize> {
    MARKERS
        .iter()
        .map(|(category, re)| (*category, re.find_iter(code).count()))
        .filter(|(_, count)| *count > 0)
        .collect()
}

/// Idiom categories present in `code`, most frequent first.
pub fn identify_patterns(code: &str) -> Vec<PatternCategory> {
    let mut counts: Vec<(PatternCategory, usize)> = pattern_counts(code).into_iter().collect();
    counts.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
    counts.into_iter().map(|(category, _)| category).collect()
}

fn category_set(code: &str) -> HashSet<PatternCategory> {
    pattern_counts(code).into_keys().collect()
}

/// Outcome of a similarity analysis.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SimilarityReport {
    /// Dominant idiom category; `None` when no idiom was recognised
    pub pattern_type: Option<PatternCategory>,
    /// Combined score of the best match
    pub confidence: f32,
    /// Signals that drove the classification, most important first
    pub reasons: Vec<String>,
    pub matches: Vec<SearchResult>,
}

/// Per-candidate signal breakdown.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Signals {
    pub embedding: f32,
    pub tokens: f32,
    pub structure: f32,
    pub combined: f32,
}

#[derive(Debug, Clone, Copy)]
struct Weights {
    embedding: f32,
    tokens: f32,
    structure: f32,
}

impl From<&SimilaritySettings> for Weights {
    fn from(settings: &SimilaritySettings) -> Self {
        let weights = Self {
            embedding: settings.embedding_weight.max(0.0),
            tokens: settings.token_weight.max(0.0),
            structure: settings.structure_weight.max(0.0),
        };
        if weights.embedding + weights.tokens + weights.structure <= f32::EPSILON {
            Self {
                embedding: 1.0,
                tokens: 1.0,
                structure: 1.0,
            }
        } else {
            weights
        }
    }
}

impl Weights {
    fn combine(&self, embedding: f32, tokens: f32, structure: f32) -> f32 {
        let total = self.embedding + self.tokens + self.structure;
        (self.embedding * embedding + self.tokens * tokens + self.structure * structure) / total
    }
}

/// Compares snippets with indexed chunks.
pub struct SimilarityAnalyzer {
    generator: Arc<EmbeddingGenerator>,
    store: Arc<dyn VectorStore>,
    namespace: String,
    settings: SimilaritySettings,
    search: SearchSettings,
}

impl SimilarityAnalyzer {
    pub fn new(
        generator: Arc<EmbeddingGenerator>,
        store: Arc<dyn VectorStore>,
        namespace: impl Into<String>,
        settings: SimilaritySettings,
        search: SearchSettings,
    ) -> Self {
        Self {
            generator,
            store,
            namespace: namespace.into(),
            settings,
            search,
        }
    }

    /// Rank indexed chunks by similarity to `snippet` and classify its idiom.
    ///
    /// Candidates whose combined score is below `min_confidence` are dropped.
    /// An empty corpus yields an empty report.
    pub async fn analyze(&self, snippet: &str, min_confidence: f32) -> Result<SimilarityReport, SearchError> {
        if snippet.trim().is_empty() {
            return Ok(SimilarityReport::default());
        }
        let stats = self.store.describe_stats(&self.namespace).await?;
        if stats.vector_count == 0 {
            debug!("Namespace {} is empty, nothing to compare against", self.namespace);
            return Ok(SimilarityReport::default());
        }

        let vector = self.generator.embed_text(snippet).await?;
        let candidates = self
            .store
            .query(&self.namespace, &vector, self.settings.candidate_pool, None)
            .await?;

        let weights = Weights::from(&self.settings);
        let snippet_tokens = token_set(snippet);
        let snippet_categories = category_set(snippet);

        let mut scored: Vec<(SearchResult, Signals, HashSet<PatternCategory>)> = candidates
            .into_iter()
            .map(|candidate| {
                let categories = category_set(&candidate.payload.content);
                let signals = self.signals(&weights, &candidate, &snippet_tokens, &snippet_categories, &categories);
                let result = self.to_result(candidate, &snippet_tokens, &signals);
                (result, signals, categories)
            })
            .filter(|(_, signals, _)| signals.combined >= min_confidence)
            .collect();

        let mut results: Vec<SearchResult> = scored.iter().map(|(r, _, _)| r.clone()).collect();
        rank(&mut results);
        scored.sort_by(|a, b| {
            b.1.combined
                .partial_cmp(&a.1.combined)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.line_count().cmp(&b.0.line_count()))
        });

        let pattern_type = dominant_category(
            snippet,
            scored.iter().map(|(_, _, categories)| categories),
        );
        let reasons = reasons(pattern_type, &snippet_tokens, &snippet_categories, &scored, min_confidence);
        let confidence = scored.first().map_or(0.0, |(_, signals, _)| signals.combined);

        debug!(
            "Similarity analysis: {} matches, pattern {:?}, confidence {:.2}",
            results.len(),
            pattern_type.map(|p| p.as_str()),
            confidence
        );

        Ok(SimilarityReport {
            pattern_type,
            confidence,
            reasons,
            matches: results,
        })
    }

    /// Token and structure similarity of two snippets, without the network.
    pub fn compare(&self, a: &str, b: &str) -> f32 {
        compare_code(&Weights::from(&self.settings), a, b)
    }

    fn signals(
        &self,
        weights: &Weights,
        candidate: &ScoredChunk,
        snippet_tokens: &HashSet<String>,
        snippet_categories: &HashSet<PatternCategory>,
        categories: &HashSet<PatternCategory>,
    ) -> Signals {
        let embedding = candidate.score.clamp(0.0, 1.0);
        let tokens = jaccard(snippet_tokens, &token_set(&candidate.payload.content));
        let structure = jaccard(snippet_categories, categories);
        Signals {
            embedding,
            tokens,
            structure,
            combined: weights.combine(embedding, tokens, structure),
        }
    }

    fn to_result(&self, candidate: ScoredChunk, snippet_tokens: &HashSet<String>, signals: &Signals) -> SearchResult {
        let payload = candidate.payload;
        let mut shared: Vec<String> = token_set(&payload.content)
            .intersection(snippet_tokens)
            .cloned()
            .collect();
        shared.sort();
        let matched = Matcher::Terms(&shared).matched_lines(&payload.content);

        SearchResult {
            chunk_id: payload.chunk_id.clone(),
            score: signals.combined,
            file_path: payload.file_path.clone(),
            content: payload.content.clone(),
            matched_line_range: annotate::matched_range(&payload, &matched),
            snippet: annotate::snippet(&payload, &matched, self.search.context_lines),
            highlights: annotate::highlights(&payload, &matched, self.search.max_highlights),
            explanation: format!(
                "Embedding {:.2} | Tokens {:.2} | Structure {:.2}",
                signals.embedding, signals.tokens, signals.structure
            ),
            metadata: payload,
        }
    }
}

fn compare_code(weights: &Weights, a: &str, b: &str) -> f32 {
    if a.trim().is_empty() || b.trim().is_empty() {
        return 0.0;
    }
    if a.trim() == b.trim() {
        return 1.0;
    }
    let tokens = jaccard(&token_set(a), &token_set(b));
    let structure = jaccard(&category_set(a), &category_set(b));
    let total = weights.tokens + weights.structure;
    if total <= f32::EPSILON {
        return (tokens + structure) / 2.0;
    }
    (weights.tokens * tokens + weights.structure * structure) / total
}

/// The snippet's most prominent idiom, counting how many matches share it.
/// Falls back to the matches' idioms when the snippet has none.
fn dominant_category<'a>(
    snippet: &str,
    matches: impl Iterator<Item = &'a HashSet<PatternCategory>>,
) -> Option<PatternCategory> {
    let snippet_counts = pattern_counts(snippet);
    let mut support: BTreeMap<PatternCategory, usize> = BTreeMap::new();
    for categories in matches {
        for category in categories {
            *support.entry(*category).or_default() += 1;
        }
    }

    if snippet_counts.is_empty() {
        return support
            .into_iter()
            .max_by(|a, b| a.1.cmp(&b.1).then(b.0.cmp(&a.0)))
            .map(|(category, _)| category);
    }

    snippet_counts
        .into_iter()
        .map(|(category, count)| {
            let shared = support.get(&category).copied().unwrap_or(0);
            (category, count * (1 + shared))
        })
        .max_by(|a, b| a.1.cmp(&b.1).then(b.0.cmp(&a.0)))
        .map(|(category, _)| category)
}

fn reasons(
    pattern_type: Option<PatternCategory>,
    snippet_tokens: &HashSet<String>,
    snippet_categories: &HashSet<PatternCategory>,
    scored: &[(SearchResult, Signals, HashSet<PatternCategory>)],
    min_confidence: f32,
) -> Vec<String> {
    let mut reasons = Vec::new();

    let Some((best, signals, categories)) = scored.first() else {
        reasons.push(format!("No indexed chunk reached confidence {:.2}", min_confidence));
        if let Some(category) = pattern_type {
            reasons.push(format!("Snippet shows {}", category.description()));
        }
        return reasons;
    };

    if let Some(category) = pattern_type {
        let sharing = scored.iter().filter(|(_, _, c)| c.contains(&category)).count();
        reasons.push(format!(
            "Dominant pattern: {} (shared by {} of {} matches)",
            category.description(),
            sharing,
            scored.len()
        ));
    }

    reasons.push(format!(
        "Embedding similarity {:.2} with {}:{}-{}",
        signals.embedding, best.file_path, best.metadata.start_line, best.metadata.end_line
    ));

    let mut shared: Vec<String> = token_set(&best.content)
        .intersection(snippet_tokens)
        .cloned()
        .collect();
    if !shared.is_empty() {
        shared.sort();
        let total = shared.len();
        shared.truncate(5);
        reasons.push(format!("{} shared identifiers: {}", total, shared.join(", ")));
    }

    let mut common: Vec<PatternCategory> = categories.intersection(snippet_categories).copied().collect();
    if !common.is_empty() {
        common.sort();
        let names: Vec<&str> = common.iter().map(|c| c.description()).collect();
        reasons.push(format!("Common idioms: {}", names.join(", ")));
    }

    reasons
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunker::{CodeChunker, FileMeta};
    use crate::embeddings::{EmbeddedChunk, EmbeddingConfig, HashingEmbeddings, ModelSpec};
    use crate::store::memory::InMemoryVectorStore;

    const DIM: usize = 256;

    const ASYNC_FETCH: &str = "async fn fetch_user(client: &Client, id: u64) -> Result<User, Error> {\n    let response = client.get(id).await.map_err(Error::Http)?;\n    Ok(response.json().await?)\n}\n";
    const LOOP_SUM: &str = "fn total(values: &[u32]) -> u32 {\n    let mut sum = 0;\n    for v in values {\n        sum += v;\n    }\n    sum\n}\n";

    fn analyzer(store: Arc<InMemoryVectorStore>) -> SimilarityAnalyzer {
        let generator = EmbeddingGenerator::new(
            Arc::new(HashingEmbeddings::new()),
            ModelSpec::pooled("hashing", DIM),
            None,
            EmbeddingConfig::default(),
        )
        .unwrap();
        SimilarityAnalyzer::new(
            Arc::new(generator),
            store,
            "main",
            SimilaritySettings::default(),
            SearchSettings::default(),
        )
    }

    async fn index(store: &InMemoryVectorStore, path: &str, source: &str) {
        let chunks: Vec<EmbeddedChunk> = CodeChunker::default()
            .chunk(source, &FileMeta::new(path))
            .into_iter()
            .map(|chunk| EmbeddedChunk {
                embedding: HashingEmbeddings::embed_one(&chunk.content, DIM),
                dimension: DIM,
                model_id: "hashing".to_string(),
                chunk,
            })
            .collect();
        store.upsert("main", &chunks).await.unwrap();
    }

    #[test]
    fn test_identify_patterns() {
        let patterns = identify_patterns(ASYNC_FETCH);
        assert!(patterns.contains(&PatternCategory::AsyncAwait));
        assert!(patterns.contains(&PatternCategory::ErrorHandling));
        assert!(patterns.contains(&PatternCategory::FunctionDefinition));
        assert!(!patterns.contains(&PatternCategory::Testing));

        let patterns = identify_patterns("#[test]\nfn test_sum() {\n    assert_eq!(total(&[1, 2]), 3);\n}\n");
        assert!(patterns.contains(&PatternCategory::Testing));

        assert!(identify_patterns("x = 1").is_empty());
    }

    #[test]
    fn test_python_idioms() {
        let source = "def load(path):\n    try:\n        with open(path) as f:\n            return f.read()\n    except OSError:\n        raise\n";
        let patterns = identify_patterns(source);
        assert_eq!(patterns[0], PatternCategory::ErrorHandling);
        assert!(patterns.contains(&PatternCategory::ResourceManagement));
    }

    #[tokio::test]
    async fn test_compare() {
        let analyzer = analyzer(Arc::new(InMemoryVectorStore::new(DIM)));
        assert_eq!(analyzer.compare(ASYNC_FETCH, ASYNC_FETCH), 1.0);
        assert_eq!(analyzer.compare("", ASYNC_FETCH), 0.0);

        let close = ASYNC_FETCH.replace("fetch_user", "fetch_order");
        assert!(analyzer.compare(ASYNC_FETCH, &close) > analyzer.compare(ASYNC_FETCH, LOOP_SUM));
    }

    #[tokio::test]
    async fn test_empty_corpus_gives_empty_report() {
        let analyzer = analyzer(Arc::new(InMemoryVectorStore::new(DIM)));
        let report = analyzer.analyze(ASYNC_FETCH, 0.1).await.unwrap();
        assert!(report.matches.is_empty());
        assert!(report.pattern_type.is_none());
        assert_eq!(report.confidence, 0.0);
    }

    #[tokio::test]
    async fn test_analyze_finds_similar_async_code() {
        let store = Arc::new(InMemoryVectorStore::new(DIM));
        index(&store, "src/users.rs", ASYNC_FETCH).await;
        index(&store, "src/math.rs", LOOP_SUM).await;
        let analyzer = analyzer(store);

        let snippet = "async fn fetch_order(client: &Client, id: u64) -> Result<Order, Error> {\n    let response = client.get(id).await.map_err(Error::Http)?;\n    Ok(response.json().await?)\n}\n";
        let report = analyzer.analyze(snippet, 0.0).await.unwrap();

        assert_eq!(report.matches.len(), 2);
        assert_eq!(report.matches[0].file_path, "src/users.rs");
        assert!(report.matches[0].score > report.matches[1].score);
        assert!((report.confidence - report.matches[0].score).abs() < 1e-6);
        assert!(matches!(
            report.pattern_type,
            Some(PatternCategory::AsyncAwait | PatternCategory::ErrorHandling)
        ));
        assert!(report.reasons.iter().any(|r| r.starts_with("Dominant pattern")));
        assert!(report.reasons.iter().any(|r| r.contains("shared identifiers")));
    }

    #[tokio::test]
    async fn test_min_confidence_filters_matches() {
        let store = Arc::new(InMemoryVectorStore::new(DIM));
        index(&store, "src/users.rs", ASYNC_FETCH).await;
        index(&store, "src/math.rs", LOOP_SUM).await;
        let analyzer = analyzer(store);

        let report = analyzer.analyze(ASYNC_FETCH, 0.9).await.unwrap();
        assert_eq!(report.matches.len(), 1);
        assert_eq!(report.matches[0].file_path, "src/users.rs");

        let report = analyzer.analyze("let x = 1;", 0.99).await.unwrap();
        assert!(report.matches.is_empty());
        assert!(report.reasons[0].starts_with("No indexed chunk reached confidence"));
    }
}
