//! Qdrant-backed [`VectorStore`].
//!
//! All namespaces share one collection; each point carries its namespace as a
//! keyword payload field and every read or delete is scoped by it. Point ids
//! are UUIDs derived from `(namespace, chunk id)`, so re-upserting a chunk
//! overwrites the existing point.

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use qdrant_client::qdrant::{
    value::Kind, vectors_config, Condition, CountPointsBuilder, CreateCollectionBuilder,
    CreateFieldIndexCollectionBuilder, DeletePointsBuilder, Distance, FieldType, Filter, ListValue,
    PointId, PointStruct, PointsIdsList, ScrollPointsBuilder, SearchPointsBuilder,
    UpsertPointsBuilder, Value, VectorParamsBuilder,
};
use qdrant_client::{Qdrant, QdrantError};
use remcode_config::VectorStoreSettings;
use sha2::{Digest, Sha256};
use tracing::{debug, info};
use uuid::Uuid;

use super::{
    path_prefixes, ChunkPayload, ScoredChunk, SearchFilter, StoreError, StoreStats, VectorStore,
};
use crate::chunker::{ChunkStrategy, ChunkType};
use crate::embeddings::EmbeddedChunk;

const SCROLL_PAGE: u32 = 256;

/// Payload fields with a keyword index.
const KEYWORD_FIELDS: &[&str] = &[
    "namespace",
    "chunk_id",
    "file_path",
    "path_prefixes",
    "language",
    "chunk_type",
];

/// Qdrant collection wrapper.
pub struct QdrantVectorStore {
    client: Qdrant,
    collection_name: String,
    dimension: usize,
}

impl QdrantVectorStore {
    /// Connect to a Qdrant server.
    pub fn connect(settings: &VectorStoreSettings) -> Result<Self, StoreError> {
        info!("Connecting to Qdrant at {}", settings.url);

        let mut builder = Qdrant::from_url(&settings.url)
            .timeout(Duration::from_secs(settings.request_timeout_secs))
            .skip_compatibility_check();
        if let Some(ref api_key) = settings.api_key {
            builder = builder.api_key(api_key.clone());
        }
        let client = builder
            .build()
            .map_err(|e| StoreError::Permanent(format!("Failed to connect to Qdrant: {}", e)))?;

        Ok(Self {
            client,
            collection_name: settings.index_name.clone(),
            dimension: settings.dimension,
        })
    }

    /// Get collection name.
    pub fn collection_name(&self) -> &str {
        &self.collection_name
    }

    async fn collection_dimension(&self) -> Result<Option<usize>, StoreError> {
        let info = self
            .client
            .collection_info(&self.collection_name)
            .await
            .map_err(map_error)?;
        let size = info
            .result
            .and_then(|r| r.config)
            .and_then(|c| c.params)
            .and_then(|p| p.vectors_config)
            .and_then(|v| v.config)
            .and_then(|config| match config {
                vectors_config::Config::Params(params) => Some(params.size as usize),
                vectors_config::Config::ParamsMap(_) => None,
            });
        Ok(size)
    }

    /// Scroll the collection until `limit` payloads pass `keep`.
    async fn scroll(
        &self,
        filter: Filter,
        limit: usize,
        keep: impl Fn(&ChunkPayload) -> bool,
    ) -> Result<Vec<ChunkPayload>, StoreError> {
        collect_pages(limit, keep, |offset: Option<PointId>, page| {
            let mut request = ScrollPointsBuilder::new(&self.collection_name)
                .filter(filter.clone())
                .limit(page)
                .with_payload(true)
                .with_vectors(false);
            if let Some(start) = offset {
                request = request.offset(start);
            }
            async move {
                match self.client.scroll(request).await {
                    Ok(response) => Ok(Page {
                        payloads: response
                            .result
                            .iter()
                            .map(|p| qdrant_map_to_payload(&p.payload))
                            .collect(),
                        next: response.next_page_offset,
                    }),
                    Err(e) if is_missing_collection(&e) => Ok(Page {
                        payloads: Vec::new(),
                        next: None,
                    }),
                    Err(e) => Err(map_error(e)),
                }
            }
        })
        .await
    }
}

/// One scroll response and the cursor of the page after it.
struct Page<C> {
    payloads: Vec<ChunkPayload>,
    next: Option<C>,
}

/// Fetch pages until `limit` payloads pass `keep` or the cursor runs out.
async fn collect_pages<C, F, Fut>(
    limit: usize,
    keep: impl Fn(&ChunkPayload) -> bool,
    mut fetch: F,
) -> Result<Vec<ChunkPayload>, StoreError>
where
    F: FnMut(Option<C>, u32) -> Fut,
    Fut: Future<Output = Result<Page<C>, StoreError>>,
{
    let mut kept = Vec::new();
    let mut cursor = None;

    while kept.len() < limit {
        let Page { payloads, next } = fetch(cursor.take(), SCROLL_PAGE).await?;
        kept.extend(payloads.into_iter().filter(|p| keep(p)));
        match next {
            Some(next) => cursor = Some(next),
            None => break,
        }
    }
    kept.truncate(limit);
    Ok(kept)
}

/// Deterministic point id for a chunk within a namespace.
pub fn point_id(namespace: &str, chunk_id: &str) -> String {
    let digest = Sha256::digest(format!("{}:{}", namespace, chunk_id).as_bytes());
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&digest[..16]);
    Uuid::from_bytes(bytes).to_string()
}

/// Transient when the server or the connection is the problem.
fn map_error(e: QdrantError) -> StoreError {
    classify_message(e.to_string())
}

/// Reads against a collection nobody has written to yet see an empty corpus.
fn is_missing_collection(e: &QdrantError) -> bool {
    let message = e.to_string().to_lowercase();
    message.contains("not found") && message.contains("collection")
}

fn classify_message(message: String) -> StoreError {
    let lower = message.to_lowercase();
    let transient = [
        "unavailable",
        "deadline",
        "timeout",
        "timed out",
        "connection",
        "transport",
        "resource exhausted",
        "too many",
    ]
    .iter()
    .any(|needle| lower.contains(needle));

    if transient {
        StoreError::Transient(message)
    } else {
        StoreError::Permanent(message)
    }
}

fn namespace_filter(namespace: &str, filter: Option<&SearchFilter>) -> Filter {
    let mut conditions = vec![Condition::matches("namespace", namespace.to_string())];

    if let Some(f) = filter {
        if let Some(prefix) = &f.path_prefix {
            conditions.push(Condition::matches("path_prefixes", prefix.clone()));
        }
        if let Some(language) = &f.language {
            conditions.push(Condition::matches("language", language.clone()));
        }
        if let Some(types) = &f.chunk_types {
            conditions.push(Condition::matches(
                "chunk_type",
                types.iter().map(|t| t.as_str().to_string()).collect::<Vec<_>>(),
            ));
        }
    }

    Filter::must(conditions)
}

#[async_trait]
impl VectorStore for QdrantVectorStore {
    fn dimension(&self) -> usize {
        self.dimension
    }

    /// Create collection and payload indexes if they don't exist.
    async fn ensure_namespace(&self, namespace: &str) -> Result<(), StoreError> {
        let collections = self.client.list_collections().await.map_err(map_error)?;
        let exists = collections
            .collections
            .iter()
            .any(|c| c.name == self.collection_name);

        if !exists {
            info!(
                "Creating collection: {} with {} dimensions",
                self.collection_name, self.dimension
            );
            self.client
                .create_collection(
                    CreateCollectionBuilder::new(&self.collection_name).vectors_config(
                        VectorParamsBuilder::new(self.dimension as u64, Distance::Cosine),
                    ),
                )
                .await
                .map_err(map_error)?;

            for field in KEYWORD_FIELDS {
                self.client
                    .create_field_index(CreateFieldIndexCollectionBuilder::new(
                        &self.collection_name,
                        *field,
                        FieldType::Keyword,
                    ))
                    .await
                    .map_err(map_error)?;
            }
            self.client
                .create_field_index(CreateFieldIndexCollectionBuilder::new(
                    &self.collection_name,
                    "content",
                    FieldType::Text,
                ))
                .await
                .map_err(map_error)?;
        } else if let Some(actual) = self.collection_dimension().await? {
            if actual != self.dimension {
                return Err(StoreError::DimensionMismatch {
                    index: self.collection_name.clone(),
                    expected: self.dimension,
                    actual,
                });
            }
        }

        debug!("Namespace {} ready in {}", namespace, self.collection_name);
        Ok(())
    }

    async fn upsert(&self, namespace: &str, chunks: &[EmbeddedChunk]) -> Result<(), StoreError> {
        if chunks.is_empty() {
            debug!("No points to upsert");
            return Ok(());
        }
        if let Some(bad) = chunks.iter().find(|c| c.embedding.len() != self.dimension) {
            return Err(StoreError::DimensionMismatch {
                index: self.collection_name.clone(),
                expected: self.dimension,
                actual: bad.embedding.len(),
            });
        }

        debug!("Upserting {} points into {}", chunks.len(), namespace);
        let points: Vec<PointStruct> = chunks
            .iter()
            .map(|c| {
                let payload = payload_to_qdrant_map(namespace, &ChunkPayload::from_embedded(c));
                PointStruct::new(point_id(namespace, &c.chunk.id), c.embedding.clone(), payload)
            })
            .collect();

        self.client
            .upsert_points(UpsertPointsBuilder::new(&self.collection_name, points).wait(true))
            .await
            .map_err(map_error)?;
        Ok(())
    }

    async fn query(
        &self,
        namespace: &str,
        vector: &[f32],
        top_k: usize,
        filter: Option<&SearchFilter>,
    ) -> Result<Vec<ScoredChunk>, StoreError> {
        if top_k == 0 {
            return Ok(Vec::new());
        }
        debug!("Searching for {} similar vectors", top_k);

        let request = SearchPointsBuilder::new(&self.collection_name, vector.to_vec(), top_k as u64)
            .filter(namespace_filter(namespace, filter))
            .with_payload(true);
        let results = match self.client.search_points(request).await {
            Ok(results) => results,
            Err(e) if is_missing_collection(&e) => return Ok(Vec::new()),
            Err(e) => return Err(map_error(e)),
        };

        let hits: Vec<ScoredChunk> = results
            .result
            .into_iter()
            .map(|p| ScoredChunk {
                score: p.score,
                payload: qdrant_map_to_payload(&p.payload),
            })
            .collect();
        debug!("Found {} search hits", hits.len());
        Ok(hits)
    }

    async fn find_text(
        &self,
        namespace: &str,
        text: &str,
        filter: Option<&SearchFilter>,
        limit: usize,
    ) -> Result<Vec<ChunkPayload>, StoreError> {
        let mut scoped = namespace_filter(namespace, filter);
        scoped.must.push(Condition::matches_text("content", text));

        // The text index matches tokens; keep only literal occurrences.
        self.scroll(scoped, limit, |p| p.content.contains(text)).await
    }

    async fn scan(
        &self,
        namespace: &str,
        filter: Option<&SearchFilter>,
        limit: usize,
    ) -> Result<Vec<ChunkPayload>, StoreError> {
        self.scroll(namespace_filter(namespace, filter), limit, |_| true).await
    }

    async fn delete_ids(&self, namespace: &str, ids: &[String]) -> Result<(), StoreError> {
        if ids.is_empty() {
            debug!("No points to delete");
            return Ok(());
        }
        debug!("Deleting {} points from {}", ids.len(), namespace);

        let point_ids: Vec<PointId> = ids
            .iter()
            .map(|id| PointId::from(point_id(namespace, id)))
            .collect();
        self.client
            .delete_points(
                DeletePointsBuilder::new(&self.collection_name)
                    .points(PointsIdsList { ids: point_ids })
                    .wait(true),
            )
            .await
            .map_err(map_error)?;
        Ok(())
    }

    async fn delete_file(&self, namespace: &str, file_path: &str) -> Result<(), StoreError> {
        debug!("Deleting points of {} from {}", file_path, namespace);
        let filter = Filter::must([
            Condition::matches("namespace", namespace.to_string()),
            Condition::matches("file_path", file_path.to_string()),
        ]);
        self.client
            .delete_points(
                DeletePointsBuilder::new(&self.collection_name)
                    .points(filter)
                    .wait(true),
            )
            .await
            .map_err(map_error)?;
        Ok(())
    }

    async fn describe_stats(&self, namespace: &str) -> Result<StoreStats, StoreError> {
        let response = match self
            .client
            .count(
                CountPointsBuilder::new(&self.collection_name)
                    .filter(namespace_filter(namespace, None))
                    .exact(true),
            )
            .await
        {
            Ok(response) => response,
            Err(e) if is_missing_collection(&e) => {
                return Ok(StoreStats {
                    vector_count: 0,
                    dimension: self.dimension,
                })
            }
            Err(e) => return Err(map_error(e)),
        };
        let vector_count = response.result.map(|r| r.count as usize).unwrap_or(0);

        Ok(StoreStats {
            vector_count,
            dimension: self.dimension,
        })
    }
}

/// Convert a payload to Qdrant's HashMap<String, Value>.
fn payload_to_qdrant_map(namespace: &str, payload: &ChunkPayload) -> HashMap<String, Value> {
    let mut map = HashMap::new();

    map.insert("namespace".to_string(), Value::from(namespace.to_string()));
    map.insert("chunk_id".to_string(), Value::from(payload.chunk_id.clone()));
    map.insert("file_path".to_string(), Value::from(payload.file_path.clone()));
    map.insert(
        "path_prefixes".to_string(),
        Value {
            kind: Some(Kind::ListValue(ListValue {
                values: path_prefixes(&payload.file_path)
                    .into_iter()
                    .map(Value::from)
                    .collect(),
            })),
        },
    );
    map.insert(
        "chunk_type".to_string(),
        Value::from(payload.chunk_type.as_str().to_string()),
    );
    map.insert("language".to_string(), Value::from(payload.language.clone()));
    map.insert("start_line".to_string(), Value::from(payload.start_line as i64));
    map.insert("end_line".to_string(), Value::from(payload.end_line as i64));
    map.insert(
        "strategy".to_string(),
        Value::from(payload.strategy.as_str().to_string()),
    );
    map.insert("model_id".to_string(), Value::from(payload.model_id.clone()));
    map.insert("content".to_string(), Value::from(payload.content.clone()));

    if let Some(ref name) = payload.symbol_name {
        map.insert("symbol_name".to_string(), Value::from(name.clone()));
    }

    map
}

/// Convert Qdrant's HashMap<String, Value> back to a payload.
fn qdrant_map_to_payload(map: &HashMap<String, Value>) -> ChunkPayload {
    ChunkPayload {
        chunk_id: extract_string(map.get("chunk_id")),
        file_path: extract_string(map.get("file_path")),
        chunk_type: ChunkType::parse(&extract_string(map.get("chunk_type")))
            .unwrap_or(ChunkType::Window),
        language: extract_string(map.get("language")),
        symbol_name: map.get("symbol_name").and_then(extract_string_opt),
        start_line: extract_integer(map.get("start_line")) as usize,
        end_line: extract_integer(map.get("end_line")) as usize,
        strategy: match extract_string(map.get("strategy")).as_str() {
            "function_level" => ChunkStrategy::FunctionLevel,
            "class_level" => ChunkStrategy::ClassLevel,
            _ => ChunkStrategy::SlidingWindow,
        },
        model_id: extract_string(map.get("model_id")),
        content: extract_string(map.get("content")),
    }
}

fn extract_string(value: Option<&Value>) -> String {
    value.and_then(extract_string_opt).unwrap_or_default()
}

fn extract_string_opt(value: &Value) -> Option<String> {
    if let Some(Kind::StringValue(s)) = &value.kind {
        Some(s.clone())
    } else {
        None
    }
}

fn extract_integer(value: Option<&Value>) -> i64 {
    value
        .and_then(|v| {
            if let Some(Kind::IntegerValue(i)) = &v.kind {
                Some(*i)
            } else {
                None
            }
        })
        .unwrap_or(0)
}
