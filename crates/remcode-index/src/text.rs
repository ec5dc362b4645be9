//! Small text helpers shared by chunking, search and similarity.

use std::collections::HashSet;

use sha2::{Digest, Sha256};

/// Tokenize text into lowercase identifier-like terms.
///
/// Splits on anything that is not alphanumeric or `_` and drops single characters.
pub fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric() && c != '_')
        .filter(|s| s.len() > 1)
        .map(String::from)
        .collect()
}

/// Distinct terms of `text`.
pub fn token_set(text: &str) -> HashSet<String> {
    tokenize(text).into_iter().collect()
}

/// Jaccard index of two sets; two empty sets score 0.
pub fn jaccard<T: Eq + std::hash::Hash>(a: &HashSet<T>, b: &HashSet<T>) -> f32 {
    let union = a.union(b).count();
    if union == 0 {
        return 0.0;
    }
    a.intersection(b).count() as f32 / union as f32
}

/// Query terms worth highlighting: longer than two characters.
pub fn highlight_terms(query: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    query
        .to_lowercase()
        .split_whitespace()
        .map(|w| w.trim_matches(|c: char| !c.is_alphanumeric() && c != '_'))
        .filter(|w| w.chars().count() > 2)
        .filter(|w| seen.insert(w.to_string()))
        .map(String::from)
        .collect()
}

/// Compute SHA256 hash of content as lowercase hex.
pub fn sha256_hex(content: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content);
    hex::encode(hasher.finalize())
}
