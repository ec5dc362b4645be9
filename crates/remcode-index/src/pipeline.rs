//! Processing pipeline orchestrator.
//!
//! A run walks the state machine
//! `Idle -> ComputingDelta -> Chunking -> Embedding -> Storing -> Committed`,
//! ending in `PartiallyFailed` instead of `Committed` when some chunks could
//! not be embedded or stored. Files are committed to the state record only
//! when every one of their chunks made it into the store; everything else
//! stays pending for the next run.

use std::collections::{BTreeMap, HashSet};
use std::future::Future;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures::stream::{self, StreamExt};
use remcode_config::RemcodeConfig;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::chunker::{CodeChunk, CodeChunker, FileMeta};
use crate::embeddings::{EmbeddedChunk, EmbeddingGenerator};
use crate::error::PipelineError;
use crate::lock::RunLock;
use crate::retry::{retry_with_backoff, RetryConfig};
use crate::scanner::{current_revision, RepositoryScanner, ScannedFile};
use crate::state::{CommitSet, FileState, FileStateTracker, IndexBinding};
use crate::store::{StoreError, VectorStore};
use crate::text::sha256_hex;

/// Where a run currently is.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    #[default]
    Idle,
    ComputingDelta,
    Chunking,
    Embedding,
    Storing,
    Committed,
    PartiallyFailed,
}

/// How a finished run ended.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    #[default]
    Committed,
    /// Committed, but some files or chunks failed and stay pending
    PartiallyFailed,
}

/// Statistics of one run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessingStats {
    pub files_scanned: usize,
    /// Added or modified files
    pub files_changed: usize,
    pub files_deleted: usize,
    /// Files left out by the scanner (too large, not UTF-8, unreadable)
    pub files_skipped: usize,
    /// Changed or deleted files that stay pending for the next run
    pub files_failed: usize,
    pub chunks_created: usize,
    pub chunks_embedded: usize,
    pub chunks_failed: usize,
    pub vectors_stored: usize,
    pub vectors_deleted: usize,
    pub duration_ms: u64,
    pub status: RunStatus,
}

/// Which files a run looks at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunMode {
    Incremental,
    Full,
}

/// Pipeline parameters.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub state_dir: PathBuf,
    pub index_name: String,
    pub namespace: String,
    pub chunk_workers: usize,
    pub upsert_batch_size: usize,
    pub store_concurrency: usize,
    pub store_retry: RetryConfig,
    /// Upper bound of a single vector-store call
    pub store_timeout: Duration,
}

impl From<&RemcodeConfig> for PipelineConfig {
    fn from(config: &RemcodeConfig) -> Self {
        let store = &config.vector_store;
        Self {
            state_dir: config.state_dir(),
            index_name: store.index_name.clone(),
            namespace: store.namespace.clone(),
            chunk_workers: config.pipeline.chunk_workers.max(1),
            upsert_batch_size: store.upsert_batch_size.max(1),
            store_concurrency: store.max_concurrent_requests.max(1),
            store_retry: RetryConfig {
                max_attempts: store.max_attempts.max(1),
                ..RetryConfig::default()
            },
            store_timeout: Duration::from_secs(store.request_timeout_secs.max(1)),
        }
    }
}

/// A changed file after chunking.
struct ChunkedFile {
    path: String,
    content_hash: String,
    chunks: Vec<CodeChunk>,
}

/// Drives scanning, chunking, embedding and storage for one repository.
pub struct ProcessingPipeline {
    scanner: RepositoryScanner,
    chunker: CodeChunker,
    generator: Arc<EmbeddingGenerator>,
    store: Arc<dyn VectorStore>,
    config: PipelineConfig,
    state: Mutex<RunState>,
    last_stats: Mutex<Option<ProcessingStats>>,
}

impl ProcessingPipeline {
    pub fn new(
        scanner: RepositoryScanner,
        chunker: CodeChunker,
        generator: Arc<EmbeddingGenerator>,
        store: Arc<dyn VectorStore>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            scanner,
            chunker,
            generator,
            store,
            config,
            state: Mutex::new(RunState::Idle),
            last_stats: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Current state-machine state.
    pub fn run_state(&self) -> RunState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, state: RunState) {
        debug!("Pipeline state: {:?}", state);
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = state;
    }

    /// Statistics of the last finished run, from this process or the state record.
    pub fn status(&self) -> Result<Option<ProcessingStats>, PipelineError> {
        if let Some(stats) = self.last_stats.lock().unwrap_or_else(|e| e.into_inner()).clone() {
            return Ok(Some(stats));
        }
        let tracker = FileStateTracker::open(&self.config.state_dir)?;
        Ok(tracker.last_run().cloned())
    }

    /// Cheap dry check: scan and compare hashes, without chunking or network.
    pub async fn has_pending_changes(&self) -> Result<bool, PipelineError> {
        let mut tracker = FileStateTracker::open(&self.config.state_dir)?;
        tracker.bind(self.binding());
        let scan = self.scan().await?;
        Ok(tracker.has_pending_changes(&scan.hashes()))
    }

    /// Process files changed since the last committed run.
    pub async fn run_incremental(&self) -> Result<ProcessingStats, PipelineError> {
        self.run(RunMode::Incremental, CancellationToken::new()).await
    }

    /// Reprocess every file regardless of recorded hashes.
    pub async fn run_full(&self) -> Result<ProcessingStats, PipelineError> {
        self.run(RunMode::Full, CancellationToken::new()).await
    }

    /// Incremental run that stops when `cancel` fires. A cancelled run
    /// commits nothing.
    pub async fn run_incremental_with_cancel(
        &self,
        cancel: CancellationToken,
    ) -> Result<ProcessingStats, PipelineError> {
        self.run(RunMode::Incremental, cancel).await
    }

    async fn run(&self, mode: RunMode, cancel: CancellationToken) -> Result<ProcessingStats, PipelineError> {
        let _lock = RunLock::acquire(&self.config.state_dir)?;

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                info!("Run cancelled, nothing committed");
                Err(PipelineError::Cancelled)
            }
            result = self.execute(mode) => result,
        };

        match &result {
            Ok(stats) => {
                *self.last_stats.lock().unwrap_or_else(|e| e.into_inner()) = Some(stats.clone());
            }
            Err(_) => self.set_state(RunState::Idle),
        }
        result
    }

    fn binding(&self) -> IndexBinding {
        let model = self.generator.primary();
        IndexBinding {
            embedding_model: model.id.clone(),
            embedding_dimension: model.dimension,
            index_name: self.config.index_name.clone(),
            namespace: self.config.namespace.clone(),
        }
    }

    async fn scan(&self) -> Result<crate::scanner::ScanResult, PipelineError> {
        let scanner = self.scanner.clone();
        let scan = tokio::task::spawn_blocking(move || scanner.scan())
            .await
            .map_err(|e| PipelineError::Io(std::io::Error::other(e)))??;
        Ok(scan)
    }

    async fn execute(&self, mode: RunMode) -> Result<ProcessingStats, PipelineError> {
        let start = Instant::now();
        let mut stats = ProcessingStats::default();
        let namespace = self.config.namespace.as_str();

        self.set_state(RunState::ComputingDelta);
        let mut tracker = FileStateTracker::open(&self.config.state_dir)?;
        tracker.bind(self.binding());
        if mode == RunMode::Full {
            tracker.force_full_reprocess();
        }
        let state_was_lost = tracker.requires_full_reprocess() && tracker.record().files.is_empty();

        // Configuration problems surface before any network call.
        self.generator.check_dimension(self.store.dimension())?;
        self.store.ensure_namespace(namespace).await?;

        let scan = self.scan().await?;
        let revision = current_revision(self.scanner.root());
        let delta = tracker.compute_delta(&scan.hashes());
        stats.files_scanned = scan.files.len();
        stats.files_skipped = scan.skipped.len();
        stats.files_changed = delta.changed_count();
        stats.files_deleted = delta.deleted.len();
        info!(
            "Delta: {} added, {} modified, {} deleted ({} scanned, {} skipped)",
            delta.added.len(),
            delta.modified.len(),
            delta.deleted.len(),
            stats.files_scanned,
            stats.files_skipped
        );

        let mut failed_files: HashSet<String> = HashSet::new();
        let previous_ids = tracker.chunk_ids_of(delta.changed().chain(delta.deleted.iter()));

        let mut removed = Vec::new();
        for path in &delta.deleted {
            let owned = previous_ids.get(path).map_or(0, Vec::len);
            match self.store_call("delete file", || self.store.delete_file(namespace, path)).await {
                Ok(()) => {
                    stats.vectors_deleted += owned;
                    removed.push(path.clone());
                }
                Err(e) => {
                    warn!(file = %path, "Failed to delete vectors of removed file: {}", e);
                    failed_files.insert(path.clone());
                }
            }
        }

        self.set_state(RunState::Chunking);
        let scanned = scan.by_path();
        let changed: Vec<ScannedFile> = delta
            .changed()
            .filter_map(|path| scanned.get(path.as_str()).map(|&file| file.clone()))
            .collect();
        let chunked = self.chunk_files(changed, &mut failed_files).await;
        let mut file_chunks: BTreeMap<String, (String, Vec<String>)> = BTreeMap::new();
        let mut all_chunks = Vec::new();
        for file in chunked {
            let ids = file.chunks.iter().map(|c| c.id.clone()).collect();
            file_chunks.insert(file.path, (file.content_hash, ids));
            all_chunks.extend(file.chunks);
        }
        stats.chunks_created = all_chunks.len();

        self.set_state(RunState::Embedding);
        let outcome = if all_chunks.is_empty() {
            Default::default()
        } else {
            let selection = self.generator.select_models().await?;
            self.generator.embed(all_chunks, selection).await?
        };
        stats.chunks_embedded = outcome.embedded.len();
        stats.chunks_failed = outcome.failed.len();
        for failed in &outcome.failed {
            failed_files.insert(failed.chunk.file_path.clone());
        }

        self.set_state(RunState::Storing);
        if state_was_lost {
            // Vectors stored under a lost state record cannot be told apart
            // from current ones; start these files from a clean slate.
            for path in file_chunks.keys() {
                if let Err(e) = self.store_call("clear file", || self.store.delete_file(namespace, path)).await {
                    warn!(file = %path, "Failed to clear vectors: {}", e);
                    failed_files.insert(path.clone());
                }
            }
        }
        let store_failures = self.upsert_all(outcome.embedded, &mut stats).await;
        failed_files.extend(store_failures);

        let mut processed = Vec::new();
        for (path, (content_hash, ids)) in file_chunks {
            if failed_files.contains(&path) {
                continue;
            }
            let current: HashSet<&String> = ids.iter().collect();
            let stale: Vec<String> = previous_ids
                .get(&path)
                .map(|old| old.iter().filter(|id| !current.contains(id)).cloned().collect())
                .unwrap_or_default();
            if !stale.is_empty() {
                match self.store_call("delete stale", || self.store.delete_ids(namespace, &stale)).await {
                    Ok(()) => stats.vectors_deleted += stale.len(),
                    Err(e) => {
                        warn!(file = %path, "Failed to delete {} stale vectors: {}", stale.len(), e);
                        failed_files.insert(path);
                        continue;
                    }
                }
            }
            processed.push(FileState::new(path, content_hash, revision.clone(), ids));
        }

        stats.files_failed = failed_files.len();
        stats.status = if stats.files_failed > 0 || stats.chunks_failed > 0 {
            RunStatus::PartiallyFailed
        } else {
            RunStatus::Committed
        };
        stats.duration_ms = start.elapsed().as_millis() as u64;

        tracker.commit(CommitSet {
            processed,
            removed,
            revision: (stats.status == RunStatus::Committed).then_some(revision).flatten(),
            stats: stats.clone(),
        })?;

        self.set_state(match stats.status {
            RunStatus::Committed => RunState::Committed,
            RunStatus::PartiallyFailed => RunState::PartiallyFailed,
        });
        info!(
            "Run finished: {} files changed, {} chunks embedded, {} failed, {} vectors stored in {}ms",
            stats.files_changed, stats.chunks_embedded, stats.chunks_failed, stats.vectors_stored, stats.duration_ms
        );
        Ok(stats)
    }

    /// Read and chunk files on blocking workers, `chunk_workers` at a time.
    async fn chunk_files(&self, files: Vec<ScannedFile>, failed: &mut HashSet<String>) -> Vec<ChunkedFile> {
        let results: Vec<(String, Result<ChunkedFile, String>)> = stream::iter(files)
            .map(|file| {
                let scanner = self.scanner.clone();
                let chunker = self.chunker.clone();
                let path = file.path.clone();
                async move {
                    let task = tokio::task::spawn_blocking(move || -> Result<ChunkedFile, String> {
                        let content = scanner.read(&file).map_err(|e| e.to_string())?;
                        let chunks = chunker.chunk(&content, &FileMeta::new(file.path.clone()));
                        Ok(ChunkedFile {
                            path: file.path,
                            content_hash: sha256_hex(content.as_bytes()),
                            chunks,
                        })
                    });
                    let result = task.await.unwrap_or_else(|e| Err(e.to_string()));
                    (path, result)
                }
            })
            .buffer_unordered(self.config.chunk_workers)
            .collect()
            .await;

        let mut chunked = Vec::with_capacity(results.len());
        for (path, result) in results {
            match result {
                Ok(file) => {
                    debug!(file = %file.path, "{} chunks", file.chunks.len());
                    chunked.push(file);
                }
                Err(e) => {
                    warn!(file = %path, "Failed to chunk: {}", e);
                    failed.insert(path);
                }
            }
        }
        chunked.sort_by(|a, b| a.path.cmp(&b.path));
        chunked
    }

    /// Upsert in independent batches. Returns the files with chunks that
    /// could not be stored.
    async fn upsert_all(&self, embedded: Vec<EmbeddedChunk>, stats: &mut ProcessingStats) -> Vec<String> {
        if embedded.is_empty() {
            return Vec::new();
        }
        let namespace = self.config.namespace.as_str();

        let mut batches: Vec<Vec<EmbeddedChunk>> = Vec::new();
        let mut remaining = embedded.into_iter().peekable();
        while remaining.peek().is_some() {
            batches.push(remaining.by_ref().take(self.config.upsert_batch_size).collect());
        }
        debug!("Storing {} batches", batches.len());

        let results: Vec<(Vec<String>, Result<(), StoreError>)> = stream::iter(batches.into_iter().enumerate())
            .map(|(index, batch)| async move {
                let result = self.store_call("upsert", || self.store.upsert(namespace, &batch)).await;
                if let Err(e) = &result {
                    warn!(batch = index, "Failed to store {} chunks: {}", batch.len(), e);
                }
                let files = batch.into_iter().map(|c| c.chunk.file_path).collect();
                (files, result)
            })
            .buffer_unordered(self.config.store_concurrency)
            .collect()
            .await;

        let mut failed = Vec::new();
        for (files, result) in results {
            match result {
                Ok(()) => stats.vectors_stored += files.len(),
                Err(_) => {
                    stats.chunks_failed += files.len();
                    failed.extend(files);
                }
            }
        }
        failed.sort();
        failed.dedup();
        failed
    }

    /// One vector-store call with a timeout, retried on transient errors.
    async fn store_call<T, F, Fut>(&self, what: &str, operation: F) -> Result<T, StoreError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let timeout = self.config.store_timeout;
        let operation = &operation;
        retry_with_backoff(
            move || async move {
                match tokio::time::timeout(timeout, operation()).await {
                    Ok(result) => result,
                    Err(_) => Err(StoreError::Transient(format!("{} timed out after {:?}", what, timeout))),
                }
            },
            &self.config.store_retry,
            StoreError::is_transient,
            |_| None,
        )
        .await
    }
}

impl std::fmt::Debug for ProcessingPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessingPipeline")
            .field("config", &self.config)
            .field("state", &self.run_state())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::{EmbeddingConfig, EmbeddingError, EmbeddingProvider, HashingEmbeddings, ModelSpec};
    use crate::scanner::ScannerConfig;
    use crate::store::memory::InMemoryVectorStore;
    use crate::store::{ChunkPayload, ScoredChunk, SearchFilter, StoreStats};
    use async_trait::async_trait;
    use remcode_config::RepositorySettings;
    use std::fs;
    use std::path::Path;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tempfile::TempDir;

    const DIM: usize = 64;

    /// In-memory store that rejects upserts touching one file while `failing` is set.
    struct FlakyStore {
        inner: InMemoryVectorStore,
        broken_file: String,
        failing: AtomicBool,
    }

    #[async_trait]
    impl VectorStore for FlakyStore {
        fn dimension(&self) -> usize {
            self.inner.dimension()
        }

        async fn ensure_namespace(&self, namespace: &str) -> Result<(), StoreError> {
            self.inner.ensure_namespace(namespace).await
        }

        async fn upsert(&self, namespace: &str, chunks: &[EmbeddedChunk]) -> Result<(), StoreError> {
            if self.failing.load(Ordering::SeqCst) && chunks.iter().any(|c| c.chunk.file_path == self.broken_file) {
                return Err(StoreError::Permanent("rejected".to_string()));
            }
            self.inner.upsert(namespace, chunks).await
        }

        async fn query(
            &self,
            namespace: &str,
            vector: &[f32],
            top_k: usize,
            filter: Option<&SearchFilter>,
        ) -> Result<Vec<ScoredChunk>, StoreError> {
            self.inner.query(namespace, vector, top_k, filter).await
        }

        async fn find_text(
            &self,
            namespace: &str,
            text: &str,
            filter: Option<&SearchFilter>,
            limit: usize,
        ) -> Result<Vec<ChunkPayload>, StoreError> {
            self.inner.find_text(namespace, text, filter, limit).await
        }

        async fn scan(
            &self,
            namespace: &str,
            filter: Option<&SearchFilter>,
            limit: usize,
        ) -> Result<Vec<ChunkPayload>, StoreError> {
            self.inner.scan(namespace, filter, limit).await
        }

        async fn delete_ids(&self, namespace: &str, ids: &[String]) -> Result<(), StoreError> {
            self.inner.delete_ids(namespace, ids).await
        }

        async fn delete_file(&self, namespace: &str, file_path: &str) -> Result<(), StoreError> {
            self.inner.delete_file(namespace, file_path).await
        }

        async fn describe_stats(&self, namespace: &str) -> Result<StoreStats, StoreError> {
            self.inner.describe_stats(namespace).await
        }
    }

    fn write(root: &Path, path: &str, content: &str) {
        let full = root.join(path);
        fs::create_dir_all(full.parent().unwrap()).unwrap();
        fs::write(full, content).unwrap();
    }

    fn repo() -> TempDir {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "src/a.rs", "fn alpha() -> u32 {\n    1\n}\n\nfn beta() -> u32 {\n    2\n}\n");
        write(dir.path(), "src/b.rs", "pub struct Gamma {\n    value: i64,\n}\n");
        write(dir.path(), "lib/c.py", "def delta(x):\n    return x * 2\n");
        dir
    }

    fn pipeline_with_dim(root: &Path, store: Arc<dyn VectorStore>, dimension: usize) -> ProcessingPipeline {
        let generator = EmbeddingGenerator::new(
            Arc::new(HashingEmbeddings::new()),
            ModelSpec::pooled("hashing", dimension),
            None,
            EmbeddingConfig::default(),
        )
        .unwrap();
        pipeline_with_generator(root, store, generator)
    }

    fn pipeline_with_model(root: &Path, store: Arc<dyn VectorStore>, model_id: &str) -> ProcessingPipeline {
        let generator = EmbeddingGenerator::new(
            Arc::new(HashingEmbeddings::new()),
            ModelSpec::pooled(model_id, DIM),
            None,
            EmbeddingConfig::default(),
        )
        .unwrap();
        pipeline_with_generator(root, store, generator)
    }

    fn pipeline_with_generator(
        root: &Path,
        store: Arc<dyn VectorStore>,
        generator: EmbeddingGenerator,
    ) -> ProcessingPipeline {
        let settings = RepositorySettings {
            root: root.to_path_buf(),
            ..Default::default()
        };
        let config = PipelineConfig {
            state_dir: root.join(".remcode"),
            index_name: "remcode".to_string(),
            namespace: "main".to_string(),
            chunk_workers: 2,
            upsert_batch_size: 1,
            store_concurrency: 2,
            store_retry: RetryConfig::new(2, Duration::from_millis(1), Duration::from_millis(2)),
            store_timeout: Duration::from_secs(5),
        };
        ProcessingPipeline::new(
            RepositoryScanner::new(ScannerConfig::from(&settings)),
            CodeChunker::default(),
            Arc::new(generator),
            store,
            config,
        )
    }

    fn pipeline(root: &Path, store: Arc<dyn VectorStore>) -> ProcessingPipeline {
        pipeline_with_dim(root, store, DIM)
    }

    async fn stored_paths(store: &dyn VectorStore) -> Vec<String> {
        let mut paths: Vec<String> = store
            .scan("main", None, 1000)
            .await
            .unwrap()
            .into_iter()
            .map(|p| p.file_path)
            .collect();
        paths.dedup();
        paths
    }

    #[tokio::test]
    async fn test_first_run_indexes_everything_then_nothing() {
        let dir = repo();
        let store = Arc::new(InMemoryVectorStore::new(DIM));
        let pipeline = pipeline(dir.path(), store.clone());
        assert_eq!(pipeline.run_state(), RunState::Idle);

        let stats = pipeline.run_incremental().await.unwrap();
        assert_eq!(stats.status, RunStatus::Committed);
        assert_eq!(stats.files_scanned, 3);
        assert_eq!(stats.files_changed, 3);
        assert_eq!(stats.chunks_failed, 0);
        assert_eq!(stats.vectors_stored, stats.chunks_created);
        assert_eq!(pipeline.run_state(), RunState::Committed);
        assert_eq!(stored_paths(store.as_ref()).await, vec!["lib/c.py", "src/a.rs", "src/b.rs"]);
        assert!(!pipeline.has_pending_changes().await.unwrap());

        let again = pipeline.run_incremental().await.unwrap();
        assert_eq!(again.files_changed, 0);
        assert_eq!(again.chunks_created, 0);
        assert_eq!(again.status, RunStatus::Committed);
    }

    #[tokio::test]
    async fn test_modified_and_deleted_files_replace_vectors() {
        let dir = repo();
        let store = Arc::new(InMemoryVectorStore::new(DIM));
        let pipeline = pipeline(dir.path(), store.clone());
        pipeline.run_incremental().await.unwrap();
        let before = store.describe_stats("main").await.unwrap().vector_count;

        write(dir.path(), "src/a.rs", "fn alpha_renamed() -> u32 {\n    10\n}\n");
        fs::remove_file(dir.path().join("src/b.rs")).unwrap();
        assert!(pipeline.has_pending_changes().await.unwrap());

        let stats = pipeline.run_incremental().await.unwrap();
        assert_eq!(stats.files_changed, 1);
        assert_eq!(stats.files_deleted, 1);
        assert!(stats.vectors_deleted > 0);
        assert_eq!(stats.status, RunStatus::Committed);

        let payloads = store.scan("main", None, 1000).await.unwrap();
        assert!(payloads.iter().all(|p| p.file_path != "src/b.rs"));
        let a: Vec<_> = payloads.iter().filter(|p| p.file_path == "src/a.rs").collect();
        assert!(!a.is_empty());
        assert!(a.iter().all(|p| !p.content.contains("fn beta")));
        assert!(store.describe_stats("main").await.unwrap().vector_count < before);
    }

    #[tokio::test]
    async fn test_store_failure_keeps_file_pending() {
        let dir = repo();
        let store = Arc::new(FlakyStore {
            inner: InMemoryVectorStore::new(DIM),
            broken_file: "src/b.rs".to_string(),
            failing: AtomicBool::new(true),
        });
        let pipeline = pipeline(dir.path(), store.clone());

        let stats = pipeline.run_incremental().await.unwrap();
        assert_eq!(stats.status, RunStatus::PartiallyFailed);
        assert_eq!(stats.files_failed, 1);
        assert!(stats.chunks_failed >= 1);
        assert_eq!(pipeline.run_state(), RunState::PartiallyFailed);

        let tracker = FileStateTracker::open(&dir.path().join(".remcode")).unwrap();
        assert!(tracker.file_state("src/a.rs").is_some());
        assert!(tracker.file_state("src/b.rs").is_none());
        assert!(tracker.record().last_revision.is_none());

        store.failing.store(false, Ordering::SeqCst);
        let retry = pipeline.run_incremental().await.unwrap();
        assert_eq!(retry.files_changed, 1);
        assert_eq!(retry.status, RunStatus::Committed);
    }

    #[tokio::test]
    async fn test_cancelled_run_commits_nothing() {
        let dir = repo();
        let pipeline = pipeline(dir.path(), Arc::new(InMemoryVectorStore::new(DIM)));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = pipeline.run_incremental_with_cancel(cancel).await.unwrap_err();
        assert!(matches!(err, PipelineError::Cancelled));
        assert_eq!(pipeline.run_state(), RunState::Idle);
        assert!(!dir.path().join(".remcode").join(crate::STATE_FILE).exists());
        assert!(pipeline.status().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_concurrent_run_is_rejected() {
        let dir = repo();
        let pipeline = pipeline(dir.path(), Arc::new(InMemoryVectorStore::new(DIM)));
        let _held = RunLock::acquire(&dir.path().join(".remcode")).unwrap();

        let err = pipeline.run_incremental().await.unwrap_err();
        assert!(err.is_already_running());
    }

    #[tokio::test]
    async fn test_dimension_mismatch_fails_before_processing() {
        let dir = repo();
        let pipeline = pipeline_with_dim(dir.path(), Arc::new(InMemoryVectorStore::new(DIM)), DIM * 2);

        let err = pipeline.run_incremental().await.unwrap_err();
        assert!(matches!(err, PipelineError::Config(_)));
        assert!(!dir.path().join(".remcode").join(crate::STATE_FILE).exists());
    }

    #[tokio::test]
    async fn test_file_failing_after_model_change_is_reembedded_later() {
        let dir = repo();
        let store = Arc::new(FlakyStore {
            inner: InMemoryVectorStore::new(DIM),
            broken_file: "src/b.rs".to_string(),
            failing: AtomicBool::new(false),
        });
        let first = pipeline_with_model(dir.path(), store.clone(), "model-a")
            .run_incremental()
            .await
            .unwrap();
        assert_eq!(first.status, RunStatus::Committed);

        let switched = pipeline_with_model(dir.path(), store.clone(), "model-b");
        store.failing.store(true, Ordering::SeqCst);
        let second = switched.run_incremental().await.unwrap();
        assert_eq!(second.status, RunStatus::PartiallyFailed);
        assert_eq!(second.files_changed, 3);
        assert_eq!(second.files_failed, 1);
        assert!(switched.has_pending_changes().await.unwrap());

        store.failing.store(false, Ordering::SeqCst);
        let third = switched.run_incremental().await.unwrap();
        assert_eq!(third.files_changed, 1);
        assert_eq!(third.status, RunStatus::Committed);
        assert!(!switched.has_pending_changes().await.unwrap());

        let payloads = store.scan("main", None, 1000).await.unwrap();
        assert!(payloads.iter().any(|p| p.file_path == "src/b.rs"));
        assert!(payloads.iter().all(|p| p.model_id == "model-b"));
    }

    /// Hashing embeddings, except that `primary` answers with one extra dimension.
    struct MisreportingPrimary;

    #[async_trait]
    impl EmbeddingProvider for MisreportingPrimary {
        async fn embed_batch(&self, model: &ModelSpec, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
            let dimension = if model.id == "primary" { model.dimension + 1 } else { model.dimension };
            Ok(texts.iter().map(|t| HashingEmbeddings::embed_one(t, dimension)).collect())
        }

        fn name(&self) -> &str {
            "misreporting"
        }
    }

    #[tokio::test]
    async fn test_wrong_primary_dimension_aborts_instead_of_falling_back() {
        let dir = repo();
        let store = Arc::new(InMemoryVectorStore::new(DIM));
        let generator = EmbeddingGenerator::new(
            Arc::new(MisreportingPrimary),
            ModelSpec::pooled("primary", DIM),
            Some(ModelSpec::pooled("fallback", DIM)),
            EmbeddingConfig::default(),
        )
        .unwrap();
        let pipeline = pipeline_with_generator(dir.path(), store.clone(), generator);

        let err = pipeline.run_incremental().await.unwrap_err();
        assert!(matches!(err, PipelineError::Config(_)));
        assert!(!dir.path().join(".remcode").join(crate::STATE_FILE).exists());
        assert_eq!(store.describe_stats("main").await.unwrap().vector_count, 0);
    }

    #[tokio::test]
    async fn test_status_survives_restart_and_full_run_reprocesses() {
        let dir = repo();
        let store: Arc<dyn VectorStore> = Arc::new(InMemoryVectorStore::new(DIM));
        let first = pipeline(dir.path(), store.clone()).run_incremental().await.unwrap();

        let restarted = pipeline(dir.path(), store);
        let status = restarted.status().unwrap().unwrap();
        assert_eq!(status.files_changed, first.files_changed);

        let full = restarted.run_full().await.unwrap();
        assert_eq!(full.files_changed, 3);
        assert_eq!(full.vectors_deleted, 0);
        assert_eq!(full.status, RunStatus::Committed);
    }
}
