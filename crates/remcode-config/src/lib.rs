//! Configuration management for remcode.
//!
//! Configuration is layered, later sources overriding earlier ones:
//!
//! 1. Built-in defaults (every section is `#[serde(default)]`)
//! 2. The user config file (`<config dir>/remcode/config.toml`)
//! 3. The project file (`.remcode.toml` in the working directory) or an explicit path
//! 4. `REMCODE_*` environment variables, `__` separating sections
//!    (e.g. `REMCODE_EMBEDDING__API_KEY`)
//!
//! String fields that name paths, endpoints or secrets accept `~` and `${VAR}`
//! expansion. The loaded [`RemcodeConfig`] is validated once and then passed
//! around as an immutable value.

use std::path::{Path, PathBuf};

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// Project-level configuration file name.
pub const PROJECT_CONFIG_FILE: &str = ".remcode.toml";

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "REMCODE";

/// Errors raised while loading or validating configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("Failed to expand `{field}`: {message}")]
    Expand { field: &'static str, message: String },

    #[error("Missing credentials: {0}")]
    MissingCredentials(String),

    #[error("Dimension mismatch: {0}")]
    DimensionMismatch(String),

    #[error("Invalid value for `{field}`: {message}")]
    Invalid { field: &'static str, message: String },

    #[error("Failed to write configuration: {0}")]
    Write(#[from] std::io::Error),

    #[error("Failed to serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RemcodeConfig {
    pub repository: RepositorySettings,
    pub embedding: EmbeddingSettings,
    pub vector_store: VectorStoreSettings,
    pub chunking: ChunkingSettings,
    pub pipeline: PipelineSettings,
    pub search: SearchSettings,
    pub similarity: SimilaritySettings,
}

/// Which repository to index and how to walk it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RepositorySettings {
    /// Repository root
    pub root: PathBuf,
    /// Directory (relative to root unless absolute) holding state and the run lock
    pub state_dir: PathBuf,
    /// File extensions to index, without the dot
    pub include_extensions: Vec<String>,
    /// Path segments that exclude a file anywhere in its path
    pub exclude_paths: Vec<String>,
    /// File name suffixes that exclude a file
    pub exclude_suffixes: Vec<String>,
    /// Files larger than this are skipped and reported
    pub max_file_bytes: u64,
    /// Honour .gitignore files
    pub respect_gitignore: bool,
}

impl Default for RepositorySettings {
    fn default() -> Self {
        Self {
            root: PathBuf::from("."),
            state_dir: PathBuf::from(".remcode"),
            include_extensions: [
                "ts", "tsx", "js", "jsx", "py", "java", "go", "rb", "php", "cpp", "c", "cs", "rs",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            exclude_paths: ["node_modules", ".git", "dist", "build", "target", "__pycache__", ".pytest_cache"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            exclude_suffixes: [".min.js", ".bundle.js"].iter().map(|s| s.to_string()).collect(),
            max_file_bytes: 1024 * 1024,
            respect_gitignore: true,
        }
    }
}

/// Embedding backend kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingProviderKind {
    /// Remote embedding service over HTTP
    Http,
    /// Deterministic local feature hashing, no network
    Hashing,
}

/// Declared output shape of a model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelOutput {
    /// One vector per input
    Pooled,
    /// One vector per token, mean-pooled client side
    Token,
}

/// A single embedding model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSettings {
    pub id: String,
    pub dimension: usize,
    #[serde(default = "default_model_output")]
    pub output: ModelOutput,
}

fn default_model_output() -> ModelOutput {
    ModelOutput::Pooled
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingSettings {
    pub provider: EmbeddingProviderKind,
    /// Endpoint accepting `{model, input}` requests
    pub endpoint: String,
    pub api_key: Option<String>,
    /// Treat a missing `api_key` as a configuration error
    pub require_api_key: bool,
    pub primary: ModelSettings,
    pub fallback: Option<ModelSettings>,
    pub batch_size: usize,
    /// Attempts against the primary model before falling back
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub request_timeout_secs: u64,
    pub max_concurrent_requests: usize,
}

impl Default for EmbeddingSettings {
    fn default() -> Self {
        Self {
            provider: EmbeddingProviderKind::Http,
            endpoint: "http://localhost:8080/v1/embeddings".to_string(),
            api_key: None,
            require_api_key: false,
            primary: ModelSettings {
                id: "microsoft/graphcodebert-base".to_string(),
                dimension: 768,
                output: ModelOutput::Token,
            },
            fallback: Some(ModelSettings {
                id: "sentence-transformers/all-mpnet-base-v2".to_string(),
                dimension: 768,
                output: ModelOutput::Pooled,
            }),
            batch_size: 16,
            max_attempts: 3,
            initial_backoff_ms: 500,
            max_backoff_ms: 10_000,
            request_timeout_secs: 30,
            max_concurrent_requests: 4,
        }
    }
}

/// Vector store backend kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VectorStoreKind {
    Qdrant,
    /// Process-local store, contents are lost on exit
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VectorStoreSettings {
    pub kind: VectorStoreKind,
    pub url: String,
    pub api_key: Option<String>,
    pub require_api_key: bool,
    /// Collection holding every namespace
    pub index_name: String,
    /// Partition for this repository/branch
    pub namespace: String,
    pub dimension: usize,
    pub upsert_batch_size: usize,
    pub max_concurrent_requests: usize,
    pub max_attempts: u32,
    pub request_timeout_secs: u64,
}

impl Default for VectorStoreSettings {
    fn default() -> Self {
        Self {
            kind: VectorStoreKind::Qdrant,
            url: "http://localhost:6334".to_string(),
            api_key: None,
            require_api_key: false,
            index_name: "remcode".to_string(),
            namespace: "main".to_string(),
            dimension: 768,
            upsert_batch_size: 100,
            max_concurrent_requests: 4,
            max_attempts: 3,
            request_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkingSettings {
    pub window_lines: usize,
    pub overlap_fraction: f32,
    /// Files with more top-level constructs than this use the sliding window
    pub max_structured_constructs: usize,
    /// Files with more lines than this use the sliding window
    pub monolith_lines: usize,
}

impl Default for ChunkingSettings {
    fn default() -> Self {
        Self {
            window_lines: 40,
            overlap_fraction: 0.25,
            max_structured_constructs: 8,
            monolith_lines: 1000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineSettings {
    /// Parallel chunking workers
    pub chunk_workers: usize,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self { chunk_workers: 4 }
    }
}

/// Phrase table for semantic intent inference.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IntentPhrases {
    pub find_definition: Vec<String>,
    pub find_similar: Vec<String>,
    pub find_implementation: Vec<String>,
}

impl Default for IntentPhrases {
    fn default() -> Self {
        let owned = |items: &[&str]| items.iter().map(|s| s.to_string()).collect();
        Self {
            find_definition: owned(&[
                "where is",
                "defined",
                "definition",
                "declared",
                "declaration",
                "signature of",
                "type of",
            ]),
            find_similar: owned(&[
                "similar to",
                "similar",
                "like this",
                "resembles",
                "same as",
                "equivalent to",
                "other examples of",
            ]),
            find_implementation: owned(&[
                "how does",
                "how do",
                "how is",
                "how to",
                "implement",
                "implementation",
                "works",
                "handle",
                "show me",
                "find",
            ]),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchSettings {
    /// Lines of context around a match in result snippets
    pub context_lines: usize,
    pub max_highlights: usize,
    /// Upper bound of stored chunks scanned by exact/pattern queries
    pub scan_limit: usize,
    /// Prefixes that mark a pattern query
    pub pattern_markers: Vec<String>,
    pub intents: IntentPhrases,
}

impl Default for SearchSettings {
    fn default() -> Self {
        Self {
            context_lines: 3,
            max_highlights: 5,
            scan_limit: 5000,
            pattern_markers: vec!["regex:".to_string(), "pattern:".to_string()],
            intents: IntentPhrases::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimilaritySettings {
    /// Nearest neighbours fetched before re-ranking
    pub candidate_pool: usize,
    pub embedding_weight: f32,
    pub token_weight: f32,
    pub structure_weight: f32,
}

impl Default for SimilaritySettings {
    fn default() -> Self {
        Self {
            candidate_pool: 25,
            embedding_weight: 0.6,
            token_weight: 0.25,
            structure_weight: 0.15,
        }
    }
}

impl RemcodeConfig {
    /// Load configuration from the layered sources and validate it.
    ///
    /// When `explicit` is given it replaces the project file and must exist.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = Config::builder();

        if let Some(user_path) = user_config_path() {
            debug!("Looking for user config at {:?}", user_path);
            builder = builder.add_source(File::from(user_path).required(false));
        }

        builder = match explicit {
            Some(path) => builder.add_source(File::from(path).required(true)),
            None => builder.add_source(File::from(PathBuf::from(PROJECT_CONFIG_FILE)).required(false)),
        };

        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config: RemcodeConfig = builder.build()?.try_deserialize()?;
        let config = config.expanded()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a TOML string, without file or environment layers.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: RemcodeConfig = Config::builder()
            .add_source(File::from_str(content, config::FileFormat::Toml))
            .build()?
            .try_deserialize()?;
        let config = config.expanded()?;
        config.validate()?;
        Ok(config)
    }

    /// Write this configuration as TOML.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Expand `~` and `${VAR}` in path, endpoint and secret fields.
    pub fn expanded(mut self) -> Result<Self, ConfigError> {
        self.repository.root = PathBuf::from(expand("repository.root", &self.repository.root.to_string_lossy())?);
        self.repository.state_dir =
            PathBuf::from(expand("repository.state_dir", &self.repository.state_dir.to_string_lossy())?);
        self.embedding.endpoint = expand("embedding.endpoint", &self.embedding.endpoint)?;
        self.embedding.api_key = expand_secret("embedding.api_key", self.embedding.api_key.take())?;
        self.vector_store.url = expand("vector_store.url", &self.vector_store.url)?;
        self.vector_store.api_key = expand_secret("vector_store.api_key", self.vector_store.api_key.take())?;
        Ok(self)
    }

    /// Check cross-field invariants. Every failure here is fatal before any network call.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let embedding = &self.embedding;

        if embedding.provider == EmbeddingProviderKind::Http
            && embedding.require_api_key
            && embedding.api_key.is_none()
        {
            return Err(ConfigError::MissingCredentials(
                "embedding.api_key is required by embedding.require_api_key".to_string(),
            ));
        }
        if self.vector_store.kind == VectorStoreKind::Qdrant
            && self.vector_store.require_api_key
            && self.vector_store.api_key.is_none()
        {
            return Err(ConfigError::MissingCredentials(
                "vector_store.api_key is required by vector_store.require_api_key".to_string(),
            ));
        }

        if embedding.primary.id.trim().is_empty() {
            return Err(invalid("embedding.primary.id", "model id must not be empty"));
        }
        if let Some(fallback) = &embedding.fallback {
            if fallback.id.trim().is_empty() {
                return Err(invalid("embedding.fallback.id", "model id must not be empty"));
            }
            if fallback.dimension != embedding.primary.dimension {
                return Err(ConfigError::DimensionMismatch(format!(
                    "fallback model {} produces {} dimensions, primary {} produces {}",
                    fallback.id, fallback.dimension, embedding.primary.id, embedding.primary.dimension
                )));
            }
        }
        if embedding.primary.dimension != self.vector_store.dimension {
            return Err(ConfigError::DimensionMismatch(format!(
                "model {} produces {} dimensions but index {} expects {}",
                embedding.primary.id,
                embedding.primary.dimension,
                self.vector_store.index_name,
                self.vector_store.dimension
            )));
        }

        if embedding.primary.dimension == 0 {
            return Err(invalid("embedding.primary.dimension", "must be positive"));
        }
        if embedding.batch_size == 0 {
            return Err(invalid("embedding.batch_size", "must be positive"));
        }
        if embedding.max_attempts == 0 {
            return Err(invalid("embedding.max_attempts", "must be at least 1"));
        }
        if embedding.max_concurrent_requests == 0 {
            return Err(invalid("embedding.max_concurrent_requests", "must be positive"));
        }
        if self.vector_store.upsert_batch_size == 0 {
            return Err(invalid("vector_store.upsert_batch_size", "must be positive"));
        }
        if self.vector_store.max_concurrent_requests == 0 {
            return Err(invalid("vector_store.max_concurrent_requests", "must be positive"));
        }
        if self.vector_store.max_attempts == 0 {
            return Err(invalid("vector_store.max_attempts", "must be at least 1"));
        }
        if self.vector_store.namespace.trim().is_empty() {
            return Err(invalid("vector_store.namespace", "must not be empty"));
        }
        if self.chunking.window_lines == 0 {
            return Err(invalid("chunking.window_lines", "must be positive"));
        }
        if !(0.0..=0.9).contains(&self.chunking.overlap_fraction) {
            return Err(invalid("chunking.overlap_fraction", "must be within [0, 0.9]"));
        }
        if self.pipeline.chunk_workers == 0 {
            return Err(invalid("pipeline.chunk_workers", "must be positive"));
        }

        Ok(())
    }

    /// State directory resolved against the repository root.
    pub fn state_dir(&self) -> PathBuf {
        if self.repository.state_dir.is_absolute() {
            self.repository.state_dir.clone()
        } else {
            self.repository.root.join(&self.repository.state_dir)
        }
    }
}

/// Location of the per-user configuration file, if the platform has a config dir.
pub fn user_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("remcode").join("config.toml"))
}

fn expand(field: &'static str, value: &str) -> Result<String, ConfigError> {
    shellexpand::full(value)
        .map(|v| v.into_owned())
        .map_err(|e| ConfigError::Expand {
            field,
            message: e.to_string(),
        })
}

fn expand_secret(field: &'static str, value: Option<String>) -> Result<Option<String>, ConfigError> {
    match value {
        Some(raw) => {
            let expanded = expand(field, &raw)?;
            Ok(if expanded.trim().is_empty() { None } else { Some(expanded) })
        }
        None => Ok(None),
    }
}

fn invalid(field: &'static str, message: &str) -> ConfigError {
    ConfigError::Invalid {
        field,
        message: message.to_string(),
    }
}
