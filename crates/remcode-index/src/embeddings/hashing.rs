//! Offline embedding provider based on feature hashing.
//!
//! Each identifier of the input is hashed into one of `dimension` buckets with a
//! hash-derived sign, and the result is L2-normalised. Texts sharing identifiers
//! end up close in cosine space, which is enough for air-gapped setups and tests.

use async_trait::async_trait;

use super::pooling::l2_normalize;
use super::{EmbeddingError, EmbeddingProvider, ModelSpec};
use crate::text::tokenize;

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

fn fnv1a(bytes: &[u8]) -> u64 {
    bytes
        .iter()
        .fold(FNV_OFFSET, |hash, b| (hash ^ u64::from(*b)).wrapping_mul(FNV_PRIME))
}

/// Deterministic, network-free embeddings.
#[derive(Debug, Clone, Default)]
pub struct HashingEmbeddings;

impl HashingEmbeddings {
    pub fn new() -> Self {
        Self
    }

    /// Embed a single text into `dimension` buckets.
    pub fn embed_one(text: &str, dimension: usize) -> Vec<f32> {
        let mut vector = vec![0.0f32; dimension];
        if dimension == 0 {
            return vector;
        }
        for token in tokenize(text) {
            let hash = fnv1a(token.as_bytes());
            let bucket = (hash % dimension as u64) as usize;
            let sign = if hash >> 63 == 0 { 1.0 } else { -1.0 };
            vector[bucket] += sign;
        }
        l2_normalize(&mut vector);
        vector
    }
}

#[async_trait]
impl EmbeddingProvider for HashingEmbeddings {
    async fn embed_batch(
        &self,
        model: &ModelSpec,
        texts: &[String],
    ) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        Ok(texts
            .iter()
            .map(|text| Self::embed_one(text, model.dimension))
            .collect())
    }

    fn name(&self) -> &str {
        "hashing"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cosine(a: &[f32], b: &[f32]) -> f32 {
        a.iter().zip(b).map(|(x, y)| x * y).sum()
    }

    #[test]
    fn test_deterministic_and_normalized() {
        let a = HashingEmbeddings::embed_one("fn parse_config(path)", 64);
        let b = HashingEmbeddings::embed_one("fn parse_config(path)", 64);
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert!((cosine(&a, &a) - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_shared_identifiers_are_closer() {
        let query = HashingEmbeddings::embed_one("parse config file", 128);
        let related = HashingEmbeddings::embed_one("fn parse_config() { read config file }", 128);
        let unrelated = HashingEmbeddings::embed_one("render widget button color", 128);
        assert!(cosine(&query, &related) > cosine(&query, &unrelated));
    }

    #[test]
    fn test_text_without_tokens_is_zero_vector() {
        let v = HashingEmbeddings::embed_one("{ } ;", 16);
        assert!(v.iter().all(|x| *x == 0.0));
    }

    #[tokio::test]
    async fn test_provider_embeds_batch() {
        let provider = HashingEmbeddings::new();
        let model = ModelSpec::pooled("hashing", 32);
        let vectors = provider
            .embed_batch(&model, &["alpha beta".to_string(), "gamma".to_string()])
            .await
            .unwrap();
        assert_eq!(vectors.len(), 2);
        assert!(vectors.iter().all(|v| v.len() == 32));
    }
}
