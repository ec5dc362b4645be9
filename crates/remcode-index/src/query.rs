//! Query classification.
//!
//! A raw query is classified by a fixed priority of rules:
//!
//! 1. wrapped in quotes: exact match, `find_definition`
//! 2. starts with a pattern marker (`regex:` by default): pattern, `find_similar`
//! 3. anything else: semantic, with the intent inferred by an [`IntentClassifier`]
//!
//! `lang:`, `path:` and `type:` tokens outside quotes are lifted into a
//! [`SearchFilter`] before classification.

use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;
use remcode_config::{IntentPhrases, SearchSettings};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::chunker::ChunkType;
use crate::store::SearchFilter;

static FILTER_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(?:^|\s)(lang|language|path|type):(\S+)").expect("filter token regex is valid")
});

/// Upper bound of confidence for inferred (semantic) intents
const MAX_INFERRED_CONFIDENCE: f32 = 0.95;

/// Confidence when no phrase matched and the default intent was used
const DEFAULT_INTENT_CONFIDENCE: f32 = 0.3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryType {
    Semantic,
    Exact,
    Pattern,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryIntent {
    FindImplementation,
    FindDefinition,
    FindSimilar,
}

impl QueryIntent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FindImplementation => "find_implementation",
            Self::FindDefinition => "find_definition",
            Self::FindSimilar => "find_similar",
        }
    }
}

/// A classified query. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessedQuery {
    pub raw_query: String,
    /// Markers, quotes and filter tokens removed; what gets embedded or matched
    pub normalized_query: String,
    pub query_type: QueryType,
    pub intent: QueryIntent,
    /// In `[0, 1]`; 1.0 only for explicit markers
    pub confidence: f32,
    #[serde(skip)]
    pub filter: SearchFilter,
}

impl ProcessedQuery {
    pub fn is_empty(&self) -> bool {
        self.normalized_query.is_empty()
    }
}

/// Infers the intent of a semantic query.
pub trait IntentClassifier: Send + Sync {
    /// Returns the intent and a confidence below 1.0.
    fn classify(&self, query: &str) -> (QueryIntent, f32);
}

/// Phrase-table classifier. Each matched phrase adds to its intent's score;
/// the best score wins, and a close runner-up lowers the confidence.
#[derive(Debug, Clone)]
pub struct KeywordIntentClassifier {
    table: Vec<(QueryIntent, Vec<String>)>,
}

impl KeywordIntentClassifier {
    pub fn new(phrases: &IntentPhrases) -> Self {
        let normalize = |items: &[String]| {
            items
                .iter()
                .map(|p| normalize_words(p))
                .filter(|p| !p.is_empty())
                .collect::<Vec<_>>()
        };
        // Order breaks ties: definitions and similarity are more specific.
        Self {
            table: vec![
                (QueryIntent::FindDefinition, normalize(&phrases.find_definition)),
                (QueryIntent::FindSimilar, normalize(&phrases.find_similar)),
                (QueryIntent::FindImplementation, normalize(&phrases.find_implementation)),
            ],
        }
    }

    fn score(phrases: &[String], padded_query: &str) -> f32 {
        phrases
            .iter()
            .filter(|phrase| padded_query.contains(&format!(" {} ", phrase)))
            // Multi-word phrases are stronger evidence than single keywords.
            .map(|phrase| 1.0 + 0.5 * (phrase.split(' ').count() - 1) as f32)
            .sum()
    }
}

impl Default for KeywordIntentClassifier {
    fn default() -> Self {
        Self::new(&IntentPhrases::default())
    }
}

impl IntentClassifier for KeywordIntentClassifier {
    fn classify(&self, query: &str) -> (QueryIntent, f32) {
        let padded = format!(" {} ", normalize_words(query));

        let mut scores: Vec<(QueryIntent, f32)> = self
            .table
            .iter()
            .map(|(intent, phrases)| (*intent, Self::score(phrases, &padded)))
            .collect();
        // Stable sort keeps table order among equal scores.
        scores.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

        let (intent, best) = scores[0];
        if best <= 0.0 {
            return (QueryIntent::FindImplementation, DEFAULT_INTENT_CONFIDENCE);
        }
        let runner_up = scores.get(1).map_or(0.0, |s| s.1);
        let confidence = (0.5 + 0.15 * best).min(MAX_INFERRED_CONFIDENCE) - 0.15 * runner_up;
        (intent, confidence.clamp(DEFAULT_INTENT_CONFIDENCE, MAX_INFERRED_CONFIDENCE))
    }
}

/// Lowercase words separated by single spaces, punctuation dropped.
fn normalize_words(text: &str) -> String {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric() && c != '_')
        .filter(|w| !w.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Turns raw query strings into [`ProcessedQuery`] values.
#[derive(Clone)]
pub struct QueryProcessor {
    classifier: Arc<dyn IntentClassifier>,
    pattern_markers: Vec<String>,
}

impl QueryProcessor {
    pub fn new(settings: &SearchSettings) -> Self {
        Self::with_classifier(settings, Arc::new(KeywordIntentClassifier::new(&settings.intents)))
    }

    /// Use a custom intent classifier for semantic queries.
    pub fn with_classifier(settings: &SearchSettings, classifier: Arc<dyn IntentClassifier>) -> Self {
        Self {
            classifier,
            pattern_markers: settings.pattern_markers.clone(),
        }
    }

    pub fn process(&self, raw_query: &str) -> ProcessedQuery {
        let (text, filter) = extract_filters(raw_query);
        let text = text.trim();

        let (normalized_query, query_type, intent, confidence) = if let Some(phrase) = unquote(text) {
            (phrase.to_string(), QueryType::Exact, QueryIntent::FindDefinition, 1.0)
        } else if let Some(pattern) = self.strip_pattern_marker(text) {
            (pattern.to_string(), QueryType::Pattern, QueryIntent::FindSimilar, 1.0)
        } else {
            let normalized = text.split_whitespace().collect::<Vec<_>>().join(" ");
            let (intent, confidence) = if normalized.is_empty() {
                (QueryIntent::FindImplementation, 0.0)
            } else {
                self.classifier.classify(&normalized)
            };
            (normalized, QueryType::Semantic, intent, confidence)
        };

        debug!(
            "Query {:?} -> {:?}/{} ({:.2})",
            raw_query,
            query_type,
            intent.as_str(),
            confidence
        );

        ProcessedQuery {
            raw_query: raw_query.to_string(),
            normalized_query,
            query_type,
            intent,
            confidence,
            filter,
        }
    }

    fn strip_pattern_marker<'a>(&self, text: &'a str) -> Option<&'a str> {
        self.pattern_markers.iter().find_map(|marker| {
            let head = text.get(..marker.len())?;
            head.eq_ignore_ascii_case(marker)
                .then(|| text[marker.len()..].trim())
        })
    }
}

impl std::fmt::Debug for QueryProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryProcessor")
            .field("pattern_markers", &self.pattern_markers)
            .finish_non_exhaustive()
    }
}

/// Inner text of a query wrapped in matching double or single quotes.
fn unquote(text: &str) -> Option<&str> {
    ['"', '\''].iter().find_map(|&quote| {
        let inner = text.strip_prefix(quote)?.strip_suffix(quote)?;
        Some(inner.trim())
    })
}

/// Lift filter tokens out of the query. Text between the first quote and
/// the last quote of the same kind is left untouched.
fn extract_filters(raw: &str) -> (String, SearchFilter) {
    let mut filter = SearchFilter::new();

    let span = raw.find(&['"', '\''][..]).and_then(|start| {
        let quote = raw[start..].chars().next()?;
        raw.rfind(quote).filter(|&end| end > start).map(|end| (start, end))
    });
    let (head, quoted, tail) = match span {
        Some((start, end)) => (&raw[..start], &raw[start..=end], &raw[end + 1..]),
        None => (raw, "", ""),
    };

    let mut text = strip_filter_tokens(head, &mut filter);
    text.push_str(quoted);
    text.push_str(&strip_filter_tokens(tail, &mut filter));
    (text, filter)
}

fn strip_filter_tokens(text: &str, filter: &mut SearchFilter) -> String {
    let mut kept = String::with_capacity(text.len());
    let mut last = 0;

    for caps in FILTER_RE.captures_iter(text) {
        let (Some(whole), Some(key), Some(value)) = (caps.get(0), caps.get(1), caps.get(2)) else {
            continue;
        };
        let applied = match key.as_str().to_lowercase().as_str() {
            "lang" | "language" => {
                *filter = std::mem::take(filter).with_language(value.as_str());
                true
            }
            "path" => {
                *filter = std::mem::take(filter).with_path_prefix(value.as_str());
                true
            }
            _ => {
                let types: Option<Vec<ChunkType>> = value.as_str().split(',').map(ChunkType::parse).collect();
                match types {
                    Some(types) => {
                        *filter = std::mem::take(filter).with_chunk_types(types);
                        true
                    }
                    None => false,
                }
            }
        };
        if applied {
            kept.push_str(&text[last..whole.start()]);
            kept.push(' ');
            last = whole.end();
        }
    }
    kept.push_str(&text[last..]);
    kept
}

#[cfg(test)]
mod tests {
    use super::*;

    fn processor() -> QueryProcessor {
        QueryProcessor::new(&SearchSettings::default())
    }

    #[test]
    fn test_quoted_query_is_exact() {
        let q = processor().process("\"fn load_config\"");
        assert_eq!(q.query_type, QueryType::Exact);
        assert_eq!(q.intent, QueryIntent::FindDefinition);
        assert_eq!(q.normalized_query, "fn load_config");
        assert_eq!(q.confidence, 1.0);

        let q = processor().process("  'parse_args'  ");
        assert_eq!(q.query_type, QueryType::Exact);
        assert_eq!(q.normalized_query, "parse_args");
    }

    #[test]
    fn test_pattern_marker() {
        let q = processor().process("regex: foo.*bar");
        assert_eq!(q.query_type, QueryType::Pattern);
        assert_eq!(q.intent, QueryIntent::FindSimilar);
        assert_eq!(q.normalized_query, "foo.*bar");
        assert_eq!(q.confidence, 1.0);

        let q = processor().process("Pattern:impl\\s+Drop");
        assert_eq!(q.query_type, QueryType::Pattern);
        assert_eq!(q.normalized_query, "impl\\s+Drop");
    }

    #[test]
    fn test_quotes_take_priority_over_pattern_marker() {
        let q = processor().process("\"regex: not a pattern\"");
        assert_eq!(q.query_type, QueryType::Exact);
        assert_eq!(q.normalized_query, "regex: not a pattern");
    }

    #[test]
    fn test_semantic_intents() {
        let p = processor();

        let q = p.process("how does the retry logic work");
        assert_eq!(q.query_type, QueryType::Semantic);
        assert_eq!(q.intent, QueryIntent::FindImplementation);
        assert!(q.confidence > DEFAULT_INTENT_CONFIDENCE && q.confidence < 1.0);

        let q = p.process("where is ChunkPayload defined?");
        assert_eq!(q.intent, QueryIntent::FindDefinition);
        assert!(q.confidence < 1.0);

        let q = p.process("code similar to this error handler");
        assert_eq!(q.intent, QueryIntent::FindSimilar);
    }

    #[test]
    fn test_default_intent_has_low_confidence() {
        let q = processor().process("  vector   upsert batching ");
        assert_eq!(q.query_type, QueryType::Semantic);
        assert_eq!(q.intent, QueryIntent::FindImplementation);
        assert_eq!(q.normalized_query, "vector upsert batching");
        assert_eq!(q.confidence, DEFAULT_INTENT_CONFIDENCE);
    }

    #[test]
    fn test_ambiguous_phrasing_lowers_confidence() {
        let p = processor();
        let clear = p.process("where is the config struct defined");
        let mixed = p.process("where is the code similar to the config struct defined");
        assert_eq!(mixed.intent, QueryIntent::FindDefinition);
        assert!(mixed.confidence < clear.confidence);
    }

    #[test]
    fn test_filter_tokens_are_lifted() {
        let q = processor().process("lang:Python path:src/store/ retry backoff type:function");
        assert_eq!(q.normalized_query, "retry backoff");
        assert_eq!(q.filter.language.as_deref(), Some("python"));
        assert_eq!(q.filter.path_prefix.as_deref(), Some("src/store"));
        assert_eq!(q.filter.chunk_types, Some(vec![ChunkType::Function]));
    }

    #[test]
    fn test_filters_outside_quotes_only() {
        let q = processor().process("\"path:literal\" lang:rust");
        assert_eq!(q.query_type, QueryType::Exact);
        assert_eq!(q.normalized_query, "path:literal");
        assert_eq!(q.filter.language.as_deref(), Some("rust"));
        assert!(q.filter.path_prefix.is_none());
    }

    #[test]
    fn test_single_quoted_filter_text_is_kept() {
        let q = processor().process("'path:x'");
        assert_eq!(q.query_type, QueryType::Exact);
        assert_eq!(q.normalized_query, "path:x");
        assert!(q.filter.is_empty());

        let q = processor().process("'type:function' lang:go");
        assert_eq!(q.normalized_query, "type:function");
        assert_eq!(q.filter.language.as_deref(), Some("go"));
        assert!(q.filter.chunk_types.is_none());
    }

    #[test]
    fn test_unknown_type_filter_stays_in_query() {
        let q = processor().process("type:banana parser");
        assert_eq!(q.normalized_query, "type:banana parser");
        assert!(q.filter.is_empty());
    }

    #[test]
    fn test_empty_query() {
        let q = processor().process("   ");
        assert!(q.is_empty());
        assert_eq!(q.query_type, QueryType::Semantic);
        assert_eq!(q.confidence, 0.0);
    }

    #[test]
    fn test_custom_classifier() {
        struct AlwaysSimilar;
        impl IntentClassifier for AlwaysSimilar {
            fn classify(&self, _query: &str) -> (QueryIntent, f32) {
                (QueryIntent::FindSimilar, 0.7)
            }
        }

        let p = QueryProcessor::with_classifier(&SearchSettings::default(), Arc::new(AlwaysSimilar));
        let q = p.process("how does it work");
        assert_eq!(q.intent, QueryIntent::FindSimilar);
        assert_eq!(q.confidence, 0.7);
    }

    #[test]
    fn test_custom_phrase_table() {
        let phrases = IntentPhrases {
            find_definition: vec!["wo ist".to_string()],
            find_similar: vec![],
            find_implementation: vec![],
        };
        let classifier = KeywordIntentClassifier::new(&phrases);
        let (intent, confidence) = classifier.classify("Wo ist die Konfiguration");
        assert_eq!(intent, QueryIntent::FindDefinition);
        assert!(confidence > DEFAULT_INTENT_CONFIDENCE);
    }
}
