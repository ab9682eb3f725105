//! VectorStore adapter (SPEC_FULL.md §4.6/§4.6a): deterministic chunk ids,
//! metadata normalization, and an HNSW-backed concrete binding. Grounded on
//! the teacher's `embedder.rs::WorkspaceVectorState`/`EmbeddingManager`
//! (usearch `IndexOptions`, per-collection state, throttled disk save).

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use usearch::ffi::{IndexOptions, MetricKind, ScalarKind};
use usearch::Index;

use crate::chunker::Chunk;
use crate::embedding::Embedder;
use crate::error::{AppError, AppResult};

/// Upper bound for `delete_chunks_by_prefix`'s scan range. The Chunker caps
/// a single file at `MAX_CHUNKS_PER_FILE` (500) chunks, so 1000 comfortably
/// covers every id this store will ever be asked to evict (§9 open-question
/// resolution: enforced at chunk emission, not via a secondary index).
pub const DELETE_PREFIX_SAFE_BOUND: usize = 1000;

const SAVE_THROTTLE: Duration = Duration::from_secs(10);

pub fn chunk_id(relative_path: &str, index: usize) -> String {
    format!("{relative_path}::chunk_{index}")
}

#[derive(Debug, Clone)]
pub struct QueryRow {
    pub id: String,
    pub text: String,
    pub metadata: Map<String, Value>,
    pub distance: Option<f32>,
}

/// Equality filter over normalized chunk metadata fields.
#[derive(Debug, Clone, Default)]
pub struct WhereFilter(pub HashMap<String, Value>);

#[async_trait]
pub trait VectorStore: Send + Sync {
    async fn upsert_chunks(&self, chunks: &[Chunk], relative_path: &str) -> AppResult<usize>;

    async fn query(
        &self,
        query_text: &str,
        n_results: usize,
        where_filter: Option<&WhereFilter>,
        where_document: Option<&str>,
    ) -> AppResult<Vec<QueryRow>>;

    async fn delete_by_relative_path(&self, relative_path: &str) -> AppResult<()>;

    async fn delete_chunks_by_prefix(&self, relative_path: &str, from_index: usize) -> AppResult<()>;

    async fn clear(&self) -> AppResult<()>;

    /// All `(id, text)` pairs currently stored, for HybridSearcher's BM25
    /// rebuild (§4.8 — rebuilt from the current corpus on each sync, not
    /// maintained incrementally).
    fn corpus_snapshot(&self) -> Vec<(String, String)>;
}

/// Only scalars and null pass through unchanged; arrays/objects are
/// JSON-encoded to a string; anything else is stringified (SPEC_FULL.md
/// §4.6's metadata normalization rule).
pub fn normalize_metadata(value: &Value) -> Map<String, Value> {
    let mut out = Map::new();
    let Value::Object(obj) = value else {
        return out;
    };
    for (k, v) in obj {
        let normalized = match v {
            Value::Null | Value::Bool(_) | Value::Number(_) | Value::String(_) => v.clone(),
            Value::Array(_) | Value::Object(_) => {
                Value::String(serde_json::to_string(v).unwrap_or_default())
            }
        };
        out.insert(k.clone(), normalized);
    }
    out
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Row {
    id: String,
    text: String,
    metadata: Map<String, Value>,
    relative_path: String,
    chunk_index: usize,
}

struct HnswInner {
    index: Index,
    rows: HashMap<u64, Row>,
    id_to_key: HashMap<String, u64>,
    next_key: u64,
    dirty: bool,
    last_save: Instant,
}

/// One collection's HNSW index plus its sidecar id→(text, metadata) table.
/// The index itself only stores vectors and integer keys, so everything
/// needed for ranking and filtering lives alongside it in `rows`.
pub struct HnswVectorStore {
    embedder: Arc<dyn Embedder>,
    inner: RwLock<HnswInner>,
    persist_dir: PathBuf,
}

impl HnswVectorStore {
    pub fn open(persist_dir: PathBuf, embedder: Arc<dyn Embedder>) -> AppResult<Self> {
        std::fs::create_dir_all(&persist_dir).map_err(AppError::Io)?;
        let index = Self::new_index(embedder.dimension())?;
        let (index, rows) = Self::load_or_init(&persist_dir, index)?;
        let id_to_key = rows.iter().map(|(k, r)| (r.id.clone(), *k)).collect();
        let next_key = rows.keys().copied().max().map(|k| k + 1).unwrap_or(0);

        Ok(Self {
            embedder,
            inner: RwLock::new(HnswInner {
                index,
                rows,
                id_to_key,
                next_key,
                dirty: false,
                last_save: Instant::now(),
            }),
            persist_dir,
        })
    }

    fn new_index(dimensions: usize) -> AppResult<Index> {
        let options = IndexOptions {
            dimensions,
            metric: MetricKind::Cos,
            quantization: ScalarKind::F16,
            connectivity: 16,
            expansion_add: 128,
            expansion_search: 64,
            multi: false,
        };
        let index = Index::new(&options)
            .map_err(|e| AppError::VectorStore(format!("failed to create HNSW index: {e}")))?;
        index
            .reserve(1024)
            .map_err(|e| AppError::VectorStore(format!("failed to reserve index capacity: {e}")))?;
        Ok(index)
    }

    fn index_path(dir: &std::path::Path) -> PathBuf {
        dir.join("index.usearch")
    }
    fn rows_path(dir: &std::path::Path) -> PathBuf {
        dir.join("rows.json")
    }

    fn load_or_init(dir: &std::path::Path, index: Index) -> AppResult<(Index, HashMap<u64, Row>)> {
        let index_path = Self::index_path(dir);
        let rows_path = Self::rows_path(dir);
        if index_path.exists() && rows_path.exists() {
            if index.load(index_path.to_string_lossy().as_ref()).is_ok() {
                let rows: HashMap<u64, Row> = std::fs::read_to_string(&rows_path)
                    .ok()
                    .and_then(|s| serde_json::from_str(&s).ok())
                    .unwrap_or_default();
                return Ok((index, rows));
            }
        }
        Ok((index, HashMap::new()))
    }

    fn save_locked(&self, inner: &mut HnswInner) -> AppResult<()> {
        inner
            .index
            .save(Self::index_path(&self.persist_dir).to_string_lossy().as_ref())
            .map_err(|e| AppError::VectorStore(format!("failed to save HNSW index: {e}")))?;
        let json = serde_json::to_string(&inner.rows)?;
        std::fs::write(Self::rows_path(&self.persist_dir), json).map_err(AppError::Io)?;
        inner.dirty = false;
        inner.last_save = Instant::now();
        Ok(())
    }

    fn maybe_save(&self, inner: &mut HnswInner) -> AppResult<()> {
        if inner.dirty && inner.last_save.elapsed() >= SAVE_THROTTLE {
            self.save_locked(inner)?;
        }
        Ok(())
    }

    /// Force a save regardless of the throttle; callers that need
    /// durability before returning (e.g. after `clear()`) use this.
    pub fn flush(&self) -> AppResult<()> {
        let mut inner = self.inner.write();
        self.save_locked(&mut inner)
    }
}

#[async_trait]
impl VectorStore for HnswVectorStore {
    async fn upsert_chunks(&self, chunks: &[Chunk], relative_path: &str) -> AppResult<usize> {
        if chunks.is_empty() {
            return Ok(0);
        }
        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        let embeddings = self.embedder.embed_documents(&texts).await?;
        if embeddings.len() != chunks.len() {
            return Err(AppError::VectorStore(
                "embedder returned a mismatched number of vectors".into(),
            ));
        }

        let mut inner = self.inner.write();
        for (i, chunk) in chunks.iter().enumerate() {
            let id = chunk_id(relative_path, i);
            let metadata_value = serde_json::to_value(&chunk.metadata)
                .unwrap_or_else(|_| Value::Object(Map::new()));
            let metadata = normalize_metadata(&metadata_value);

            if let Some(old_key) = inner.id_to_key.remove(&id) {
                let _ = inner.index.remove(old_key);
                inner.rows.remove(&old_key);
            }

            let key = inner.next_key;
            inner.next_key += 1;

            if inner.index.size() + 1 >= inner.index.capacity() {
                let new_cap = (inner.index.capacity() * 2).max(1024);
                let _ = inner.index.reserve(new_cap);
            }
            inner
                .index
                .add(key, &embeddings[i])
                .map_err(|e| AppError::VectorStore(format!("failed to add vector: {e}")))?;

            inner.rows.insert(
                key,
                Row {
                    id: id.clone(),
                    text: chunk.text.clone(),
                    metadata,
                    relative_path: relative_path.to_string(),
                    chunk_index: i,
                },
            );
            inner.id_to_key.insert(id, key);
        }

        inner.dirty = true;
        self.maybe_save(&mut inner)?;
        Ok(chunks.len())
    }

    async fn query(
        &self,
        query_text: &str,
        n_results: usize,
        where_filter: Option<&WhereFilter>,
        where_document: Option<&str>,
    ) -> AppResult<Vec<QueryRow>> {
        if n_results == 0 {
            return Ok(Vec::new());
        }
        let query_vec = self.embedder.embed_query(query_text).await?;

        let inner = self.inner.read();
        if inner.rows.is_empty() {
            return Ok(Vec::new());
        }

        // usearch has no native metadata filter, so oversample and filter
        // in-process; documented tradeoff, acceptable at vault scale.
        let oversample = (n_results * 4).max(n_results).min(inner.rows.len().max(1));
        let result = inner
            .index
            .search(&query_vec, oversample)
            .map_err(|e| AppError::VectorStore(format!("vector search failed: {e}")))?;

        let mut rows = Vec::with_capacity(result.keys.len());
        for (key, distance) in result.keys.iter().zip(result.distances.iter()) {
            let Some(row) = inner.rows.get(key) else {
                continue;
            };
            if let Some(filter) = where_filter {
                let matches = filter
                    .0
                    .iter()
                    .all(|(k, v)| row.metadata.get(k) == Some(v));
                if !matches {
                    continue;
                }
            }
            if let Some(needle) = where_document {
                if !row.text.contains(needle) {
                    continue;
                }
            }
            rows.push(QueryRow {
                id: row.id.clone(),
                text: row.text.clone(),
                metadata: row.metadata.clone(),
                distance: Some(*distance),
            });
            if rows.len() >= n_results {
                break;
            }
        }
        Ok(rows)
    }

    async fn delete_by_relative_path(&self, relative_path: &str) -> AppResult<()> {
        let mut inner = self.inner.write();
        let keys: Vec<u64> = inner
            .rows
            .iter()
            .filter(|(_, r)| r.relative_path == relative_path)
            .map(|(k, _)| *k)
            .collect();
        for key in keys {
            let _ = inner.index.remove(key);
            if let Some(row) = inner.rows.remove(&key) {
                inner.id_to_key.remove(&row.id);
            }
        }
        inner.dirty = true;
        self.maybe_save(&mut inner)?;
        Ok(())
    }

    async fn delete_chunks_by_prefix(&self, relative_path: &str, from_index: usize) -> AppResult<()> {
        let mut inner = self.inner.write();
        for i in from_index..(from_index + DELETE_PREFIX_SAFE_BOUND) {
            let id = chunk_id(relative_path, i);
            // Missing ids are silently ignored per the spec's deletion contract.
            if let Some(key) = inner.id_to_key.remove(&id) {
                let _ = inner.index.remove(key);
                inner.rows.remove(&key);
            }
        }
        inner.dirty = true;
        self.maybe_save(&mut inner)?;
        Ok(())
    }

    async fn clear(&self) -> AppResult<()> {
        let mut inner = self.inner.write();
        inner.index = Self::new_index(self.embedder.dimension())?;
        inner.rows.clear();
        inner.id_to_key.clear();
        inner.next_key = 0;
        self.save_locked(&mut inner)
    }

    fn corpus_snapshot(&self) -> Vec<(String, String)> {
        let inner = self.inner.read();
        inner.rows.values().map(|r| (r.id.clone(), r.text.clone())).collect()
    }
}
