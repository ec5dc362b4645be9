//! Result annotation: where in a chunk the query matched, a snippet window
//! around it, highlighted lines and a short relevance explanation.

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::chunker::ChunkType;
use crate::query::{ProcessedQuery, QueryIntent, QueryType};
use crate::store::ChunkPayload;

/// A chunk line containing a query match.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Highlight {
    /// 1-indexed line in the source file
    pub line: usize,
    pub text: String,
}

/// What counts as a match inside chunk content.
pub enum Matcher<'a> {
    /// Any of these lowercase terms, case-insensitively, per line
    Terms(&'a [String]),
    Literal(&'a str),
    Pattern(&'a Regex),
}

impl Matcher<'_> {
    /// 0-based indices of matched lines within `content`, ascending.
    pub fn matched_lines(&self, content: &str) -> Vec<usize> {
        match self {
            Matcher::Terms(terms) => {
                if terms.is_empty() {
                    return Vec::new();
                }
                content
                    .lines()
                    .enumerate()
                    .filter(|(_, line)| {
                        let lower = line.to_lowercase();
                        terms.iter().any(|t| lower.contains(t.as_str()))
                    })
                    .map(|(i, _)| i)
                    .collect()
            }
            Matcher::Literal(text) if text.is_empty() => Vec::new(),
            Matcher::Literal(text) => {
                let spans = content.match_indices(text).map(|(start, m)| (start, start + m.len()));
                lines_of_spans(content, spans)
            }
            Matcher::Pattern(re) => {
                let spans = re
                    .find_iter(content)
                    .filter(|m| !m.as_str().is_empty())
                    .map(|m| (m.start(), m.end()));
                lines_of_spans(content, spans)
            }
        }
    }
}

/// Lines touched by byte spans of `content`.
fn lines_of_spans(content: &str, spans: impl Iterator<Item = (usize, usize)>) -> Vec<usize> {
    let line_starts: Vec<usize> = std::iter::once(0)
        .chain(content.match_indices('\n').map(|(i, _)| i + 1))
        .collect();
    let line_of = |offset: usize| match line_starts.binary_search(&offset) {
        Ok(i) => i,
        Err(i) => i - 1,
    };

    let mut lines = Vec::new();
    for (start, end) in spans {
        let first = line_of(start);
        let last = line_of(end.saturating_sub(1).max(start));
        lines.extend(first..=last);
    }
    lines.sort_unstable();
    lines.dedup();
    lines
}

/// Absolute line range covered by the matches, or the whole chunk.
pub fn matched_range(payload: &ChunkPayload, matched: &[usize]) -> (usize, usize) {
    match (matched.first(), matched.last()) {
        (Some(first), Some(last)) => (payload.start_line + first, payload.start_line + last),
        _ => (payload.start_line, payload.end_line),
    }
}

/// Numbered snippet of the chunk around the matched lines, matched lines
/// marked with `>`. Without matches the top of the chunk is shown.
pub fn snippet(payload: &ChunkPayload, matched: &[usize], context: usize) -> String {
    let lines: Vec<&str> = payload.content.lines().collect();
    if lines.is_empty() {
        return String::new();
    }

    let (from, to) = match (matched.first(), matched.last()) {
        (Some(&first), Some(&last)) => (first.saturating_sub(context), (last + context).min(lines.len() - 1)),
        _ => (0, (2 * context).min(lines.len() - 1)),
    };

    (from..=to)
        .map(|i| {
            let marker = if matched.binary_search(&i).is_ok() { '>' } else { ' ' };
            format!("{:>5}{} {}", payload.start_line + i, marker, lines[i])
        })
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn highlights(payload: &ChunkPayload, matched: &[usize], max: usize) -> Vec<Highlight> {
    let lines: Vec<&str> = payload.content.lines().collect();
    matched
        .iter()
        .filter_map(|&i| lines.get(i).map(|text| (i, text.trim())))
        .filter(|(_, text)| !text.is_empty())
        .take(max)
        .map(|(i, text)| Highlight {
            line: payload.start_line + i,
            text: text.to_string(),
        })
        .collect()
}

fn relevance_band(score: f32) -> Option<&'static str> {
    if score > 0.9 {
        Some("Very high relevance")
    } else if score > 0.8 {
        Some("High relevance")
    } else if score > 0.7 {
        Some("Good relevance")
    } else {
        None
    }
}

/// Why a result was returned, as ` | `-separated phrases.
pub fn explanation(score: f32, payload: &ChunkPayload, query: &ProcessedQuery) -> String {
    let mut parts: Vec<String> = Vec::new();

    match query.query_type {
        QueryType::Exact => parts.push(format!("Contains \"{}\"", query.normalized_query)),
        QueryType::Pattern => parts.push(format!("Matches /{}/", query.normalized_query)),
        QueryType::Semantic => {
            if let Some(band) = relevance_band(score) {
                parts.push(format!("{} ({:.2})", band, score));
            } else {
                parts.push(format!("Similarity {:.2}", score));
            }
        }
    }

    match &payload.symbol_name {
        Some(name) => parts.push(format!("{} `{}`", capitalize(payload.chunk_type.as_str()), name)),
        None => parts.push(format!("Type: {}", payload.chunk_type.as_str())),
    }

    match query.intent {
        QueryIntent::FindImplementation
            if matches!(payload.chunk_type, ChunkType::Function | ChunkType::Class) =>
        {
            parts.push("Contains implementation details".to_string())
        }
        QueryIntent::FindDefinition if payload.symbol_name.is_some() => {
            parts.push("Defines a named symbol".to_string())
        }
        QueryIntent::FindSimilar => parts.push("Similar code pattern".to_string()),
        _ => {}
    }

    parts.join(" | ")
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}
