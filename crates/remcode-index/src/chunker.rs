//! Structure-aware code chunking.
//!
//! Files with a small number of recognizable top-level constructs are split on
//! construct boundaries (`function_level` / `class_level`). Everything else is
//! cut into overlapping line windows so that a unit spanning a window boundary
//! is still fully contained in at least one chunk.
//!
//! Chunking is pure: the same content and metadata always produce the same
//! chunks with the same ids.

use std::path::Path;

use anyhow::{anyhow, Result};
use remcode_config::ChunkingSettings;
use serde::{Deserialize, Serialize};
use tracing::debug;
use tree_sitter::{Language, Node, Parser};

use crate::text::sha256_hex;

/// Type of code chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkType {
    Function,
    Class,
    /// Top-level code between constructs (imports, constants, statements)
    Module,
    /// A sliding-window slice
    Window,
}

impl ChunkType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Function => "function",
            Self::Class => "class",
            Self::Module => "module",
            Self::Window => "window",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.to_lowercase().as_str() {
            "function" | "fn" | "method" => Some(Self::Function),
            "class" | "struct" | "type" => Some(Self::Class),
            "module" => Some(Self::Module),
            "window" => Some(Self::Window),
            _ => None,
        }
    }
}

/// How a file was split.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkStrategy {
    FunctionLevel,
    ClassLevel,
    SlidingWindow,
}

impl ChunkStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FunctionLevel => "function_level",
            Self::ClassLevel => "class_level",
            Self::SlidingWindow => "sliding_window",
        }
    }
}

/// What the chunker needs to know about a file besides its content.
#[derive(Debug, Clone)]
pub struct FileMeta {
    /// Repository-relative path, forward slashes
    pub path: String,
    pub language: Option<String>,
}

impl FileMeta {
    pub fn new(path: impl Into<String>) -> Self {
        let path = path.into();
        let language = CodeChunker::detect_language(Path::new(&path));
        Self { path, language }
    }

    fn extension(&self) -> Option<&str> {
        Path::new(&self.path).extension().and_then(|e| e.to_str())
    }
}

/// A chunk of code extracted from a source file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodeChunk {
    /// Deterministic id, see [`chunk_id`]
    pub id: String,

    /// Repository-relative file path
    pub file_path: String,

    /// The actual code content
    pub content: String,

    /// Start line (1-indexed, inclusive)
    pub start_line: usize,

    /// End line (1-indexed, inclusive)
    pub end_line: usize,

    pub chunk_type: ChunkType,

    /// Programming language
    pub language: String,

    /// Name of the construct, if the chunk is one
    pub symbol_name: Option<String>,

    pub strategy: ChunkStrategy,

    /// SHA256 hash of the chunk content
    pub content_hash: String,
}

impl CodeChunk {
    pub fn line_count(&self) -> usize {
        self.end_line + 1 - self.start_line
    }
}

/// Stable chunk id: hash of path, line range and content hash.
pub fn chunk_id(file_path: &str, start_line: usize, end_line: usize, content_hash: &str) -> String {
    sha256_hex(format!("{}:{}:{}:{}", file_path, start_line, end_line, content_hash).as_bytes())
}

/// Chunking parameters.
#[derive(Debug, Clone)]
pub struct ChunkerConfig {
    pub window_lines: usize,
    pub overlap_fraction: f32,
    pub max_structured_constructs: usize,
    pub monolith_lines: usize,
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self::from(&ChunkingSettings::default())
    }
}

impl From<&ChunkingSettings> for ChunkerConfig {
    fn from(settings: &ChunkingSettings) -> Self {
        Self {
            window_lines: settings.window_lines.max(1),
            overlap_fraction: settings.overlap_fraction,
            max_structured_constructs: settings.max_structured_constructs,
            monolith_lines: settings.monolith_lines,
        }
    }
}

impl ChunkerConfig {
    /// Lines shared by consecutive windows.
    pub fn overlap_lines(&self) -> usize {
        let overlap = (self.window_lines as f32 * self.overlap_fraction).floor() as usize;
        overlap.min(self.window_lines.saturating_sub(1))
    }
}

/// The shape of a file as seen by strategy selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileShape {
    pub constructs: usize,
    pub has_class: bool,
    pub line_count: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConstructKind {
    Function,
    Class,
}

/// A top-level construct, 1-indexed inclusive line range.
#[derive(Debug, Clone)]
struct Construct {
    kind: ConstructKind,
    name: Option<String>,
    start_line: usize,
    end_line: usize,
}

/// Line range waiting to become a chunk.
#[derive(Debug)]
struct Piece {
    start_line: usize,
    end_line: usize,
    chunk_type: ChunkType,
    symbol_name: Option<String>,
}

/// Splits file content into [`CodeChunk`]s.
#[derive(Debug, Clone, Default)]
pub struct CodeChunker {
    config: ChunkerConfig,
}

impl CodeChunker {
    pub fn new(config: ChunkerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ChunkerConfig {
        &self.config
    }

    /// Detect language from file extension.
    pub fn detect_language(path: &Path) -> Option<String> {
        let language = match path.extension()?.to_str()? {
            "rs" => "rust",
            "py" => "python",
            "js" | "jsx" | "mjs" | "cjs" => "javascript",
            "ts" | "tsx" => "typescript",
            "go" => "go",
            "java" => "java",
            "rb" => "ruby",
            "php" => "php",
            "cpp" | "cc" | "cxx" | "hpp" => "cpp",
            "c" | "h" => "c",
            "cs" => "csharp",
            _ => return None,
        };
        Some(language.to_string())
    }

    /// Pick the strategy for a file of the given shape.
    pub fn select_strategy(&self, shape: &FileShape) -> ChunkStrategy {
        if shape.constructs == 0
            || shape.constructs > self.config.max_structured_constructs
            || shape.line_count > self.config.monolith_lines
        {
            ChunkStrategy::SlidingWindow
        } else if shape.has_class {
            ChunkStrategy::ClassLevel
        } else {
            ChunkStrategy::FunctionLevel
        }
    }

    /// Chunk file content.
    pub fn chunk(&self, content: &str, meta: &FileMeta) -> Vec<CodeChunk> {
        if content.trim().is_empty() {
            return Vec::new();
        }

        let lines: Vec<&str> = content.lines().collect();
        let constructs = match Self::grammar_for(meta) {
            Some(language) => match Self::find_constructs(content, &language) {
                Ok(found) => attach_leading_comments(found, &lines),
                Err(e) => {
                    debug!("Structure detection failed for {}: {}", meta.path, e);
                    Vec::new()
                }
            },
            None => Vec::new(),
        };

        let shape = FileShape {
            constructs: constructs.len(),
            has_class: constructs.iter().any(|c| c.kind == ConstructKind::Class),
            line_count: lines.len(),
        };
        let strategy = self.select_strategy(&shape);
        debug!(
            "Chunking {} ({} lines, {} constructs) with {}",
            meta.path,
            shape.line_count,
            shape.constructs,
            strategy.as_str()
        );

        let pieces = match strategy {
            ChunkStrategy::SlidingWindow => self.window_pieces(&lines),
            ChunkStrategy::FunctionLevel | ChunkStrategy::ClassLevel => {
                structured_pieces(&constructs, &lines)
            }
        };

        let language = meta.language.clone().unwrap_or_else(|| "text".to_string());
        pieces
            .into_iter()
            .map(|piece| {
                let body = lines[piece.start_line - 1..piece.end_line].join("\n");
                let content_hash = sha256_hex(body.as_bytes());
                CodeChunk {
                    id: chunk_id(&meta.path, piece.start_line, piece.end_line, &content_hash),
                    file_path: meta.path.clone(),
                    content: body,
                    start_line: piece.start_line,
                    end_line: piece.end_line,
                    chunk_type: piece.chunk_type,
                    language: language.clone(),
                    symbol_name: piece.symbol_name,
                    strategy,
                    content_hash,
                }
            })
            .collect()
    }

    fn window_pieces(&self, lines: &[&str]) -> Vec<Piece> {
        let total = lines.len();
        let window = self.config.window_lines.max(1);
        let step = window - self.config.overlap_lines();

        let mut pieces = Vec::new();
        let mut start = 1;
        loop {
            let end = (start + window - 1).min(total);
            if lines[start - 1..end].iter().any(|l| !l.trim().is_empty()) {
                pieces.push(Piece {
                    start_line: start,
                    end_line: end,
                    chunk_type: ChunkType::Window,
                    symbol_name: None,
                });
            }
            if end == total {
                break;
            }
            start += step;
        }
        pieces
    }

    fn grammar_for(meta: &FileMeta) -> Option<Language> {
        let language: Language = match meta.language.as_deref()? {
            "rust" => tree_sitter_rust::LANGUAGE.into(),
            "python" => tree_sitter_python::LANGUAGE.into(),
            "javascript" => tree_sitter_javascript::LANGUAGE.into(),
            "typescript" if meta.extension() == Some("tsx") => {
                tree_sitter_typescript::LANGUAGE_TSX.into()
            }
            "typescript" => tree_sitter_typescript::LANGUAGE_TYPESCRIPT.into(),
            "go" => tree_sitter_go::LANGUAGE.into(),
            _ => return None,
        };
        Some(language)
    }

    fn find_constructs(source: &str, language: &Language) -> Result<Vec<Construct>> {
        let mut parser = Parser::new();
        parser.set_language(language)?;
        let tree = parser
            .parse(source, None)
            .ok_or_else(|| anyhow!("Failed to parse file"))?;

        let root = tree.root_node();
        let mut constructs = Vec::new();
        for child in root.named_children(&mut root.walk()) {
            if let Some((kind, name)) = classify_node(child, source) {
                let start_line = child.start_position().row + 1;
                let end = child.end_position();
                // A node ending at column 0 stops before that row.
                let end_row = if end.column == 0 && end.row > child.start_position().row {
                    end.row - 1
                } else {
                    end.row
                };
                constructs.push(Construct {
                    kind,
                    name,
                    start_line,
                    end_line: end_row + 1,
                });
            }
        }
        Ok(constructs)
    }
}

fn classify_node(node: Node, source: &str) -> Option<(ConstructKind, Option<String>)> {
    let name = |field: &str| field_text(node, field, source);

    match node.kind() {
        // Rust
        "function_item" => Some((ConstructKind::Function, name("name"))),
        "struct_item" | "enum_item" | "trait_item" | "union_item" => {
            Some((ConstructKind::Class, name("name")))
        }
        "impl_item" => Some((ConstructKind::Class, name("type"))),
        "mod_item" if node.child_by_field_name("body").is_some() => {
            Some((ConstructKind::Class, name("name")))
        }

        // Python
        "function_definition" => Some((ConstructKind::Function, name("name"))),
        "class_definition" => Some((ConstructKind::Class, name("name"))),
        "decorated_definition" => classify_node(node.child_by_field_name("definition")?, source),

        // JavaScript / TypeScript
        "function_declaration" | "generator_function_declaration" => {
            Some((ConstructKind::Function, name("name")))
        }
        "class_declaration"
        | "abstract_class_declaration"
        | "interface_declaration"
        | "enum_declaration"
        | "type_alias_declaration" => Some((ConstructKind::Class, name("name"))),
        "export_statement" => classify_node(node.child_by_field_name("declaration")?, source),
        "lexical_declaration" | "variable_declaration" => {
            let declarator = node
                .named_children(&mut node.walk())
                .find(|c| c.kind() == "variable_declarator")?;
            let value = declarator.child_by_field_name("value")?;
            match value.kind() {
                "arrow_function" | "function_expression" | "function" => Some((
                    ConstructKind::Function,
                    field_text(declarator, "name", source),
                )),
                "class" => Some((ConstructKind::Class, field_text(declarator, "name", source))),
                _ => None,
            }
        }

        // Go
        "method_declaration" => Some((ConstructKind::Function, name("name"))),
        "type_declaration" => {
            let spec = node
                .named_children(&mut node.walk())
                .find(|c| c.kind() == "type_spec")?;
            Some((ConstructKind::Class, field_text(spec, "name", source)))
        }

        _ => None,
    }
}

fn field_text(node: Node, field: &str, source: &str) -> Option<String> {
    node.child_by_field_name(field)
        .and_then(|child| child.utf8_text(source.as_bytes()).ok())
        .map(String::from)
}

fn is_annotation_line(line: &str) -> bool {
    let trimmed = line.trim_start();
    ["//", "/*", "*", "#", "@", "--"]
        .iter()
        .any(|prefix| trimmed.starts_with(prefix))
}

/// Extend each construct upward over directly preceding comment/attribute lines.
fn attach_leading_comments(mut constructs: Vec<Construct>, lines: &[&str]) -> Vec<Construct> {
    constructs.sort_by_key(|c| c.start_line);
    let mut floor = 1;
    for construct in constructs.iter_mut() {
        let mut start = construct.start_line;
        while start > floor && start >= 2 && is_annotation_line(lines[start - 2]) {
            start -= 1;
        }
        construct.start_line = start;
        floor = construct.end_line + 1;
    }
    constructs
}

/// Cover every line exactly once: constructs, non-blank gaps as module chunks,
/// blank gaps folded into a neighbour.
fn structured_pieces(constructs: &[Construct], lines: &[&str]) -> Vec<Piece> {
    let total = lines.len();
    let is_blank = |from: usize, to: usize| lines[from - 1..to].iter().all(|l| l.trim().is_empty());

    let mut pieces: Vec<Piece> = Vec::new();
    let mut cursor = 1;
    for construct in constructs {
        // Overlapping or out-of-range nodes can appear with parse errors.
        if construct.start_line < cursor || construct.end_line > total {
            continue;
        }
        let mut start = construct.start_line;
        if start > cursor {
            if !is_blank(cursor, start - 1) {
                pieces.push(Piece {
                    start_line: cursor,
                    end_line: start - 1,
                    chunk_type: ChunkType::Module,
                    symbol_name: None,
                });
            } else if let Some(previous) = pieces.last_mut() {
                previous.end_line = start - 1;
            } else {
                start = cursor;
            }
        }
        pieces.push(Piece {
            start_line: start,
            end_line: construct.end_line,
            chunk_type: match construct.kind {
                ConstructKind::Function => ChunkType::Function,
                ConstructKind::Class => ChunkType::Class,
            },
            symbol_name: construct.name.clone(),
        });
        cursor = construct.end_line + 1;
    }

    if cursor <= total {
        if !is_blank(cursor, total) {
            pieces.push(Piece {
                start_line: cursor,
                end_line: total,
                chunk_type: ChunkType::Module,
                symbol_name: None,
            });
        } else if let Some(last) = pieces.last_mut() {
            last.end_line = total;
        }
    }

    pieces
}
