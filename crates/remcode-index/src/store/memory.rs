//! In-memory [`VectorStore`] for tests and offline runs.
//!
//! Vector search is brute-force cosine similarity over the namespace.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;

use super::{ChunkPayload, ScoredChunk, SearchFilter, StoreError, StoreStats, VectorStore};
use crate::embeddings::EmbeddedChunk;

struct StoredVector {
    vector: Vec<f32>,
    payload: ChunkPayload,
}

type Namespaces = HashMap<String, HashMap<String, StoredVector>>;

/// In-memory store keyed by namespace, then chunk id.
pub struct InMemoryVectorStore {
    dimension: usize,
    namespaces: RwLock<Namespaces>,
}

impl InMemoryVectorStore {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            namespaces: RwLock::new(HashMap::new()),
        }
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, Namespaces>, StoreError> {
        self.namespaces
            .read()
            .map_err(|_| StoreError::Permanent("in-memory store lock poisoned".to_string()))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, Namespaces>, StoreError> {
        self.namespaces
            .write()
            .map_err(|_| StoreError::Permanent("in-memory store lock poisoned".to_string()))
    }

    /// Payloads matching `predicate`, ordered by path then line for stable output.
    fn collect(
        &self,
        namespace: &str,
        limit: usize,
        predicate: impl Fn(&ChunkPayload) -> bool,
    ) -> Result<Vec<ChunkPayload>, StoreError> {
        let namespaces = self.read()?;
        let mut payloads: Vec<ChunkPayload> = namespaces
            .get(namespace)
            .map(|points| {
                points
                    .values()
                    .filter(|p| predicate(&p.payload))
                    .map(|p| p.payload.clone())
                    .collect()
            })
            .unwrap_or_default();
        payloads.sort_by(|a, b| {
            a.file_path
                .cmp(&b.file_path)
                .then(a.start_line.cmp(&b.start_line))
        });
        payloads.truncate(limit);
        Ok(payloads)
    }
}

/// Cosine similarity; zero for mismatched or zero-length vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let mag_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let mag_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if mag_a < f32::EPSILON || mag_b < f32::EPSILON {
        0.0
    } else {
        dot / (mag_a * mag_b)
    }
}

#[async_trait]
impl VectorStore for InMemoryVectorStore {
    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn ensure_namespace(&self, namespace: &str) -> Result<(), StoreError> {
        self.write()?.entry(namespace.to_string()).or_default();
        Ok(())
    }

    async fn upsert(&self, namespace: &str, chunks: &[EmbeddedChunk]) -> Result<(), StoreError> {
        if let Some(bad) = chunks.iter().find(|c| c.embedding.len() != self.dimension) {
            return Err(StoreError::DimensionMismatch {
                index: "memory".to_string(),
                expected: self.dimension,
                actual: bad.embedding.len(),
            });
        }
        let mut namespaces = self.write()?;
        let points = namespaces.entry(namespace.to_string()).or_default();
        for chunk in chunks {
            points.insert(
                chunk.chunk.id.clone(),
                StoredVector {
                    vector: chunk.embedding.clone(),
                    payload: ChunkPayload::from_embedded(chunk),
                },
            );
        }
        Ok(())
    }

    async fn query(
        &self,
        namespace: &str,
        vector: &[f32],
        top_k: usize,
        filter: Option<&SearchFilter>,
    ) -> Result<Vec<ScoredChunk>, StoreError> {
        let namespaces = self.read()?;
        let Some(points) = namespaces.get(namespace) else {
            return Ok(Vec::new());
        };

        let mut scored: Vec<ScoredChunk> = points
            .values()
            .filter(|p| filter.map_or(true, |f| f.matches(&p.payload)))
            .map(|p| ScoredChunk {
                score: cosine_similarity(vector, &p.vector),
                payload: p.payload.clone(),
            })
            .collect();
        scored.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.payload.chunk_id.cmp(&b.payload.chunk_id))
        });
        scored.truncate(top_k);
        Ok(scored)
    }

    async fn find_text(
        &self,
        namespace: &str,
        text: &str,
        filter: Option<&SearchFilter>,
        limit: usize,
    ) -> Result<Vec<ChunkPayload>, StoreError> {
        self.collect(namespace, limit, |p| {
            p.content.contains(text) && filter.map_or(true, |f| f.matches(p))
        })
    }

    async fn scan(
        &self,
        namespace: &str,
        filter: Option<&SearchFilter>,
        limit: usize,
    ) -> Result<Vec<ChunkPayload>, StoreError> {
        self.collect(namespace, limit, |p| filter.map_or(true, |f| f.matches(p)))
    }

    async fn delete_ids(&self, namespace: &str, ids: &[String]) -> Result<(), StoreError> {
        if let Some(points) = self.write()?.get_mut(namespace) {
            for id in ids {
                points.remove(id);
            }
        }
        Ok(())
    }

    async fn delete_file(&self, namespace: &str, file_path: &str) -> Result<(), StoreError> {
        if let Some(points) = self.write()?.get_mut(namespace) {
            points.retain(|_, p| p.payload.file_path != file_path);
        }
        Ok(())
    }

    async fn describe_stats(&self, namespace: &str) -> Result<StoreStats, StoreError> {
        let vector_count = self.read()?.get(namespace).map_or(0, |points| points.len());
        Ok(StoreStats {
            vector_count,
            dimension: self.dimension,
        })
    }
}
