//! Persisted per-file state for incremental runs.
//!
//! The state record lives in `<state dir>/state.json` and remembers, for every
//! indexed file, the content hash and revision it was last processed at and
//! the chunk ids it owns. It also records which model and index produced the
//! vectors and the statistics of the last committed run.
//!
//! [`FileStateTracker::commit`] is the only write path. It is called by the
//! pipeline after a file's chunks have been stored, and writes atomically.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::pipeline::ProcessingStats;
use crate::STATE_FILE;

/// Version of the state record format
pub const STATE_VERSION: u32 = 1;

/// Errors reading or writing persisted state. Always fatal for a run.
#[derive(Error, Debug)]
pub enum StateError {
    #[error("State file {path} is not accessible: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to serialize state: {0}")]
    Serialize(#[source] serde_json::Error),
}

/// State of an indexed file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileState {
    /// Repository-relative path
    pub path: String,

    /// SHA256 hash of the file content
    pub content_hash: String,

    /// Repository revision the hash was recorded at
    pub last_processed_revision: Option<String>,

    pub last_processed_at: DateTime<Utc>,

    /// IDs of the chunks stored for this file
    pub chunk_ids: Vec<String>,
}

impl FileState {
    pub fn new(path: String, content_hash: String, revision: Option<String>, chunk_ids: Vec<String>) -> Self {
        Self {
            path,
            content_hash,
            last_processed_revision: revision,
            last_processed_at: Utc::now(),
            chunk_ids,
        }
    }
}

/// Which model and index the stored vectors belong to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexBinding {
    pub embedding_model: String,
    pub embedding_dimension: usize,
    pub index_name: String,
    pub namespace: String,
}

/// The persisted record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateRecord {
    pub version: u32,
    pub last_revision: Option<String>,
    pub binding: Option<IndexBinding>,
    pub last_run: Option<ProcessingStats>,
    pub updated_at: Option<DateTime<Utc>>,
    pub files: BTreeMap<String, FileState>,
}

impl Default for StateRecord {
    fn default() -> Self {
        Self {
            version: STATE_VERSION,
            last_revision: None,
            binding: None,
            last_run: None,
            updated_at: None,
            files: BTreeMap::new(),
        }
    }
}

/// Files that differ between the working tree and the recorded state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileDelta {
    /// Not present in state
    pub added: Vec<String>,
    /// Present in state with a different hash
    pub modified: Vec<String>,
    /// Present in state, gone from the working tree
    pub deleted: Vec<String>,
}

impl FileDelta {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.modified.is_empty() && self.deleted.is_empty()
    }

    /// Added and modified paths.
    pub fn changed(&self) -> impl Iterator<Item = &String> {
        self.added.iter().chain(self.modified.iter())
    }

    pub fn changed_count(&self) -> usize {
        self.added.len() + self.modified.len()
    }
}

/// What a successful run hands to [`FileStateTracker::commit`].
#[derive(Debug, Default)]
pub struct CommitSet {
    /// Files whose chunks were all embedded and stored
    pub processed: Vec<FileState>,
    /// Files removed from the repository and from the store
    pub removed: Vec<String>,
    pub revision: Option<String>,
    pub stats: ProcessingStats,
}

/// Owner of the persisted state record.
#[derive(Debug)]
pub struct FileStateTracker {
    path: PathBuf,
    record: StateRecord,
    binding: Option<IndexBinding>,
    full_reprocess: bool,
}

impl FileStateTracker {
    /// Load the state record from `state_dir`.
    ///
    /// A missing record starts empty. A record that cannot be parsed is
    /// discarded and every file is treated as added. Any other I/O error is
    /// returned.
    pub fn open(state_dir: &Path) -> Result<Self, StateError> {
        let path = state_dir.join(STATE_FILE);
        let mut full_reprocess = false;

        let record = match fs::read_to_string(&path) {
            Ok(content) => match serde_json::from_str::<StateRecord>(&content) {
                Ok(record) if record.version == STATE_VERSION => record,
                Ok(record) => {
                    warn!(
                        "State record version {} is not supported, reprocessing everything",
                        record.version
                    );
                    full_reprocess = true;
                    StateRecord::default()
                }
                Err(e) => {
                    warn!("Failed to parse {:?} ({}), reprocessing everything", path, e);
                    full_reprocess = true;
                    StateRecord::default()
                }
            },
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("No state record at {:?}, starting fresh", path);
                StateRecord::default()
            }
            Err(source) => return Err(StateError::Io { path, source }),
        };

        Ok(Self {
            path,
            binding: record.binding.clone(),
            record,
            full_reprocess,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn record(&self) -> &StateRecord {
        &self.record
    }

    pub fn file_state(&self, path: &str) -> Option<&FileState> {
        self.record.files.get(path)
    }

    pub fn last_run(&self) -> Option<&ProcessingStats> {
        self.record.last_run.as_ref()
    }

    /// Whether the next delta will report every file as added.
    pub fn requires_full_reprocess(&self) -> bool {
        self.full_reprocess
    }

    /// Treat every current file as added on the next delta.
    pub fn force_full_reprocess(&mut self) {
        self.full_reprocess = true;
    }

    /// Declare the model and index this run writes to. A change from the
    /// recorded binding forces a full reprocess.
    pub fn bind(&mut self, binding: IndexBinding) {
        if let Some(previous) = &self.record.binding {
            if *previous != binding {
                info!(
                    "Index binding changed ({} -> {}), reprocessing everything",
                    previous.embedding_model, binding.embedding_model
                );
                self.full_reprocess = true;
            }
        }
        self.binding = Some(binding);
    }

    /// Compare current `path -> content hash` pairs with the recorded state.
    pub fn compute_delta(&self, current: &BTreeMap<String, String>) -> FileDelta {
        let mut delta = FileDelta::default();

        for (path, hash) in current {
            match self.record.files.get(path) {
                None => delta.added.push(path.clone()),
                Some(_) if self.full_reprocess => delta.added.push(path.clone()),
                Some(state) if state.content_hash != *hash => delta.modified.push(path.clone()),
                Some(_) => {}
            }
        }
        delta.deleted = self
            .record
            .files
            .keys()
            .filter(|path| !current.contains_key(*path))
            .cloned()
            .collect();

        delta
    }

    /// Cheap dry check: would a run find anything to do?
    pub fn has_pending_changes(&self, current: &BTreeMap<String, String>) -> bool {
        self.full_reprocess || !self.compute_delta(current).is_empty()
    }

    /// Chunk ids recorded for the given files.
    pub fn chunk_ids_of<'a>(&self, paths: impl IntoIterator<Item = &'a String>) -> HashMap<String, Vec<String>> {
        paths
            .into_iter()
            .filter_map(|p| self.record.files.get(p).map(|s| (p.clone(), s.chunk_ids.clone())))
            .collect()
    }

    /// Persist processed and removed files together with run metadata.
    ///
    /// The in-memory record only changes once the write has succeeded.
    pub fn commit(&mut self, commit: CommitSet) -> Result<(), StateError> {
        let mut next = self.record.clone();
        for path in &commit.removed {
            next.files.remove(path);
        }
        if self.full_reprocess {
            // Entries this run does not rewrite were produced under the old
            // binding or are unknown; an empty hash keeps them pending.
            for state in next.files.values_mut() {
                state.content_hash.clear();
            }
        }
        for state in commit.processed {
            next.files.insert(state.path.clone(), state);
        }
        if commit.revision.is_some() {
            next.last_revision = commit.revision;
        }
        next.binding = self.binding.clone();
        next.last_run = Some(commit.stats);
        next.updated_at = Some(Utc::now());

        self.write(&next)?;
        debug!("Committed state for {} files", next.files.len());
        self.record = next;
        self.full_reprocess = false;
        Ok(())
    }

    fn write(&self, record: &StateRecord) -> Result<(), StateError> {
        let io_error = |source| StateError::Io {
            path: self.path.clone(),
            source,
        };

        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir).map_err(io_error)?;
        }
        let content = serde_json::to_string_pretty(record).map_err(StateError::Serialize)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, content).map_err(io_error)?;
        fs::rename(&tmp, &self.path).map_err(io_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn files(entries: &[(&str, &str)]) -> BTreeMap<String, String> {
        entries
            .iter()
            .map(|(p, h)| (p.to_string(), h.to_string()))
            .collect()
    }

    fn binding(model: &str) -> IndexBinding {
        IndexBinding {
            embedding_model: model.to_string(),
            embedding_dimension: 768,
            index_name: "remcode".to_string(),
            namespace: "main".to_string(),
        }
    }

    fn commit_all(tracker: &mut FileStateTracker, current: &BTreeMap<String, String>) {
        let processed = current
            .iter()
            .map(|(p, h)| FileState::new(p.clone(), h.clone(), Some("rev1".to_string()), vec![format!("{}#1", p)]))
            .collect();
        tracker
            .commit(CommitSet {
                processed,
                revision: Some("rev1".to_string()),
                ..Default::default()
            })
            .unwrap();
    }

    #[test]
    fn test_fresh_state_marks_everything_added() {
        let dir = TempDir::new().unwrap();
        let tracker = FileStateTracker::open(dir.path()).unwrap();
        let delta = tracker.compute_delta(&files(&[("a.rs", "h1"), ("b.rs", "h2")]));

        assert_eq!(delta.added, vec!["a.rs", "b.rs"]);
        assert!(delta.modified.is_empty());
        assert!(delta.deleted.is_empty());
    }

    #[test]
    fn test_delta_after_commit() {
        let dir = TempDir::new().unwrap();
        let mut tracker = FileStateTracker::open(dir.path()).unwrap();
        let current = files(&[("a.rs", "h1"), ("b.rs", "h2"), ("c.rs", "h3")]);
        commit_all(&mut tracker, &current);

        // Unchanged tree: nothing to do.
        assert!(tracker.compute_delta(&current).is_empty());
        assert!(!tracker.has_pending_changes(&current));

        // One edit, one deletion, one new file.
        let next = files(&[("a.rs", "h1"), ("b.rs", "h2-edited"), ("d.rs", "h4")]);
        let delta = tracker.compute_delta(&next);
        assert_eq!(delta.added, vec!["d.rs"]);
        assert_eq!(delta.modified, vec!["b.rs"]);
        assert_eq!(delta.deleted, vec!["c.rs"]);
        assert_eq!(delta.changed_count(), 2);
        assert!(tracker.has_pending_changes(&next));
    }

    #[test]
    fn test_commit_persists_and_reloads() {
        let dir = TempDir::new().unwrap();
        let current = files(&[("src/lib.rs", "h1")]);
        {
            let mut tracker = FileStateTracker::open(dir.path()).unwrap();
            tracker.bind(binding("model-a"));
            commit_all(&mut tracker, &current);
        }

        let tracker = FileStateTracker::open(dir.path()).unwrap();
        let state = tracker.file_state("src/lib.rs").unwrap();
        assert_eq!(state.content_hash, "h1");
        assert_eq!(state.last_processed_revision.as_deref(), Some("rev1"));
        assert_eq!(state.chunk_ids, vec!["src/lib.rs#1"]);
        assert_eq!(tracker.record().last_revision.as_deref(), Some("rev1"));
        assert_eq!(tracker.record().binding, Some(binding("model-a")));
        assert!(tracker.last_run().is_some());
        assert!(!dir.path().join("state.json.tmp").exists());
    }

    #[test]
    fn test_commit_removes_deleted_files() {
        let dir = TempDir::new().unwrap();
        let mut tracker = FileStateTracker::open(dir.path()).unwrap();
        commit_all(&mut tracker, &files(&[("a.rs", "h1"), ("b.rs", "h2")]));

        tracker
            .commit(CommitSet {
                removed: vec!["b.rs".to_string()],
                ..Default::default()
            })
            .unwrap();
        assert!(tracker.file_state("b.rs").is_none());
        assert!(tracker.file_state("a.rs").is_some());
        // Revision is kept when the commit carries none.
        assert_eq!(tracker.record().last_revision.as_deref(), Some("rev1"));
    }

    #[test]
    fn test_corrupt_state_forces_full_reprocess() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join(STATE_FILE), "{ not json").unwrap();

        let tracker = FileStateTracker::open(dir.path()).unwrap();
        assert!(tracker.requires_full_reprocess());
        let delta = tracker.compute_delta(&files(&[("a.rs", "h1")]));
        assert_eq!(delta.added, vec!["a.rs"]);
    }

    #[test]
    fn test_model_change_forces_full_reprocess() {
        let dir = TempDir::new().unwrap();
        let current = files(&[("a.rs", "h1")]);
        let mut tracker = FileStateTracker::open(dir.path()).unwrap();
        tracker.bind(binding("model-a"));
        commit_all(&mut tracker, &current);
        assert!(tracker.compute_delta(&current).is_empty());

        tracker.bind(binding("model-a"));
        assert!(!tracker.requires_full_reprocess());

        tracker.bind(binding("model-b"));
        assert!(tracker.requires_full_reprocess());
        assert_eq!(tracker.compute_delta(&current).added, vec!["a.rs"]);

        commit_all(&mut tracker, &current);
        assert!(!tracker.requires_full_reprocess());
    }

    #[test]
    fn test_file_failing_after_model_change_stays_pending() {
        let dir = TempDir::new().unwrap();
        let current = files(&[("a.rs", "h1"), ("b.rs", "h2")]);
        let mut tracker = FileStateTracker::open(dir.path()).unwrap();
        tracker.bind(binding("model-a"));
        commit_all(&mut tracker, &current);

        // Only a.rs makes it through the reprocess under the new model.
        tracker.bind(binding("model-b"));
        tracker
            .commit(CommitSet {
                processed: vec![FileState::new("a.rs".to_string(), "h1".to_string(), None, vec!["a.rs#2".to_string()])],
                ..Default::default()
            })
            .unwrap();
        assert!(!tracker.requires_full_reprocess());

        let delta = tracker.compute_delta(&current);
        assert!(delta.added.is_empty());
        assert_eq!(delta.modified, vec!["b.rs"]);
        // Old chunk ids are kept so the stale vectors can be replaced.
        assert_eq!(tracker.file_state("b.rs").unwrap().chunk_ids, vec!["b.rs#1"]);

        let mut reopened = FileStateTracker::open(dir.path()).unwrap();
        reopened.bind(binding("model-b"));
        assert!(!reopened.requires_full_reprocess());
        assert!(reopened.has_pending_changes(&current));
        assert_eq!(reopened.compute_delta(&current).modified, vec!["b.rs"]);
    }

    #[test]
    fn test_unreadable_state_is_fatal() {
        let dir = TempDir::new().unwrap();
        // A directory where the state file should be cannot be read as a file.
        fs::create_dir_all(dir.path().join(STATE_FILE)).unwrap();
        let err = FileStateTracker::open(dir.path()).unwrap_err();
        assert!(matches!(err, StateError::Io { .. }));
    }

    #[test]
    fn test_chunk_ids_of() {
        let dir = TempDir::new().unwrap();
        let mut tracker = FileStateTracker::open(dir.path()).unwrap();
        commit_all(&mut tracker, &files(&[("a.rs", "h1")]));

        let ids = tracker.chunk_ids_of(&["a.rs".to_string(), "missing.rs".to_string()]);
        assert_eq!(ids.len(), 1);
        assert_eq!(ids["a.rs"], vec!["a.rs#1"]);
    }
}
