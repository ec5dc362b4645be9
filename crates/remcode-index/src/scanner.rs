//! Repository walking and content hashing.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};

use ignore::WalkBuilder;
use remcode_config::RepositorySettings;
use serde::Serialize;
use tracing::{debug, warn};

use crate::text::sha256_hex;

/// Which files of a repository get indexed.
#[derive(Debug, Clone)]
pub struct ScannerConfig {
    pub root: PathBuf,
    pub include_extensions: Vec<String>,
    pub exclude_paths: Vec<String>,
    pub exclude_suffixes: Vec<String>,
    pub max_file_bytes: u64,
    pub respect_gitignore: bool,
}

impl From<&RepositorySettings> for ScannerConfig {
    fn from(settings: &RepositorySettings) -> Self {
        Self {
            root: settings.root.clone(),
            include_extensions: settings
                .include_extensions
                .iter()
                .map(|e| e.trim_start_matches('.').to_lowercase())
                .collect(),
            exclude_paths: settings.exclude_paths.clone(),
            exclude_suffixes: settings.exclude_suffixes.clone(),
            max_file_bytes: settings.max_file_bytes,
            respect_gitignore: settings.respect_gitignore,
        }
    }
}

/// A file selected for indexing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScannedFile {
    /// Repository-relative path with `/` separators
    pub path: String,
    pub absolute: PathBuf,
    pub content_hash: String,
    pub size: u64,
}

/// Why a candidate file was left out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum SkipReason {
    TooLarge { size: u64, limit: u64 },
    NotUtf8,
    Unreadable(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedFile {
    pub path: String,
    pub reason: SkipReason,
}

/// Result of a repository scan.
#[derive(Debug, Default)]
pub struct ScanResult {
    pub files: Vec<ScannedFile>,
    pub skipped: Vec<SkippedFile>,
}

impl ScanResult {
    /// `path -> content hash`, the input of delta computation.
    pub fn hashes(&self) -> BTreeMap<String, String> {
        self.files
            .iter()
            .map(|f| (f.path.clone(), f.content_hash.clone()))
            .collect()
    }

    /// Files keyed by relative path.
    pub fn by_path(&self) -> HashMap<&str, &ScannedFile> {
        self.files.iter().map(|f| (f.path.as_str(), f)).collect()
    }
}

/// Walks a repository honouring `.gitignore` and the configured filters.
#[derive(Debug, Clone)]
pub struct RepositoryScanner {
    config: ScannerConfig,
}

impl RepositoryScanner {
    pub fn new(config: ScannerConfig) -> Self {
        Self { config }
    }

    pub fn root(&self) -> &Path {
        &self.config.root
    }

    /// Collect indexable files with their content hashes, sorted by path.
    pub fn scan(&self) -> std::io::Result<ScanResult> {
        let root = &self.config.root;
        if !root.is_dir() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("repository root {:?} is not a directory", root),
            ));
        }

        let excluded = self.config.exclude_paths.clone();
        let walker = WalkBuilder::new(root)
            .hidden(true)
            .git_ignore(self.config.respect_gitignore)
            .git_global(self.config.respect_gitignore)
            .git_exclude(self.config.respect_gitignore)
            .require_git(false)
            .filter_entry(move |entry| {
                let name = entry.file_name().to_string_lossy();
                !excluded.iter().any(|e| *e == name)
            })
            .build();

        let mut result = ScanResult::default();
        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    debug!("Skipping unreadable entry: {}", e);
                    continue;
                }
            };
            let path = entry.path();
            if !entry.file_type().is_some_and(|t| t.is_file()) {
                continue;
            }
            let Some(relative) = relative_path(root, path) else {
                continue;
            };
            if !self.is_included(&relative) {
                continue;
            }

            match self.inspect(path, &relative) {
                Ok(file) => result.files.push(file),
                Err(reason) => {
                    warn!("Skipping {}: {:?}", relative, reason);
                    result.skipped.push(SkippedFile {
                        path: relative,
                        reason,
                    });
                }
            }
        }

        result.files.sort_by(|a, b| a.path.cmp(&b.path));
        debug!(
            "Scanned {} files ({} skipped) under {:?}",
            result.files.len(),
            result.skipped.len(),
            root
        );
        Ok(result)
    }

    /// Read a scanned file's content.
    pub fn read(&self, file: &ScannedFile) -> std::io::Result<String> {
        fs::read_to_string(&file.absolute)
    }

    fn is_included(&self, relative: &str) -> bool {
        let lower = relative.to_lowercase();
        if self
            .config
            .exclude_suffixes
            .iter()
            .any(|suffix| lower.ends_with(&suffix.to_lowercase()))
        {
            return false;
        }
        if relative
            .split('/')
            .any(|segment| self.config.exclude_paths.iter().any(|e| e == segment))
        {
            return false;
        }
        Path::new(&lower)
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|ext| self.config.include_extensions.iter().any(|i| i == ext))
    }

    fn inspect(&self, path: &Path, relative: &str) -> Result<ScannedFile, SkipReason> {
        let size = fs::metadata(path)
            .map_err(|e| SkipReason::Unreadable(e.to_string()))?
            .len();
        if size > self.config.max_file_bytes {
            return Err(SkipReason::TooLarge {
                size,
                limit: self.config.max_file_bytes,
            });
        }

        let bytes = fs::read(path).map_err(|e| SkipReason::Unreadable(e.to_string()))?;
        if std::str::from_utf8(&bytes).is_err() {
            return Err(SkipReason::NotUtf8);
        }

        Ok(ScannedFile {
            path: relative.to_string(),
            absolute: path.to_path_buf(),
            content_hash: sha256_hex(&bytes),
            size,
        })
    }
}

fn relative_path(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let joined = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/");
    if joined.is_empty() {
        None
    } else {
        Some(joined)
    }
}

/// Current git revision of the repository at `root`, if it is a git checkout.
///
/// Reads `.git/HEAD` directly: a detached HEAD is returned as is, a symbolic
/// ref is resolved through the loose ref file or `packed-refs`.
pub fn current_revision(root: &Path) -> Option<String> {
    let git_dir = git_dir(root)?;
    let head = fs::read_to_string(git_dir.join("HEAD")).ok()?;
    let head = head.trim();

    let Some(reference) = head.strip_prefix("ref:") else {
        return (!head.is_empty()).then(|| head.to_string());
    };
    let reference = reference.trim();

    if let Ok(sha) = fs::read_to_string(git_dir.join(reference)) {
        let sha = sha.trim();
        if !sha.is_empty() {
            return Some(sha.to_string());
        }
    }

    let packed = fs::read_to_string(git_dir.join("packed-refs")).ok()?;
    packed
        .lines()
        .filter(|line| !line.starts_with('#') && !line.starts_with('^'))
        .find_map(|line| {
            let (sha, name) = line.split_once(' ')?;
            (name.trim() == reference).then(|| sha.to_string())
        })
}

/// `.git` directory, following a `gitdir:` file for worktrees and submodules.
fn git_dir(root: &Path) -> Option<PathBuf> {
    let dot_git = root.join(".git");
    if dot_git.is_dir() {
        return Some(dot_git);
    }
    let content = fs::read_to_string(&dot_git).ok()?;
    let target = content.trim().strip_prefix("gitdir:")?.trim();
    let target = PathBuf::from(target);
    Some(if target.is_absolute() {
        target
    } else {
        root.join(target)
    })
}
