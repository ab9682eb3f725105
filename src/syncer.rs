//! Syncer (SPEC_FULL.md §4.5): orchestrates Scanner → FileTracker diff →
//! Chunker → VectorStore upsert/delete → Registry update. Grounded on the
//! teacher's `indexer.rs::index_workspace` / `embedder.rs::index_workspace_vectors_inner`
//! smart-diff orchestration, unified here across the single vector-store
//! concern this crate has (the teacher keeps full-text and vector indices
//! separate).

use chrono::Utc;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use crate::chunker;
use crate::error::AppResult;
use crate::file_tracker::{self, FileState};
use crate::registry::{Registry, RegistryEntry};
use crate::scanner::{self, ScannedFile};
use crate::vector_store::VectorStore;

const DEFAULT_CHUNK_MIN_SIZE: usize = 200;
const DEFAULT_CHUNK_MAX_SIZE: usize = 1500;
const DEFAULT_CHUNK_LEVEL: u8 = 2;

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct SyncResult {
    pub added: usize,
    pub modified: usize,
    pub deleted: usize,
    pub skipped: usize,
    pub total_chunks: usize,
    pub errors: Vec<String>,
}

pub struct Syncer {
    root: PathBuf,
    extensions: Vec<String>,
    ignore_dirs: Vec<String>,
    chunk_min_size: usize,
    chunk_max_size: usize,
    chunk_level: u8,
    registry: Registry,
    store: Arc<dyn VectorStore>,
}

impl Syncer {
    pub fn new(root: PathBuf, registry_path: PathBuf, store: Arc<dyn VectorStore>, extensions: Vec<String>) -> Self {
        Self {
            root,
            extensions,
            ignore_dirs: scanner::DEFAULT_IGNORE_DIRS.iter().map(|s| s.to_string()).collect(),
            chunk_min_size: DEFAULT_CHUNK_MIN_SIZE,
            chunk_max_size: DEFAULT_CHUNK_MAX_SIZE,
            chunk_level: DEFAULT_CHUNK_LEVEL,
            registry: Registry::load(registry_path),
            store,
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Decide between an incremental `sync()` and a `full_sync()` per
    /// §4.5's vault-change/corruption promotion rule, then run it.
    pub async fn trigger(&mut self, include_paths: Option<&[String]>, force_reindex: bool) -> AppResult<SyncResult> {
        let root_str = self.root.to_string_lossy().to_string();
        let vault_changed = !self.registry.get_vault_path().is_empty() && self.registry.get_vault_path() != root_str;
        let corrupted = !self.registry.files().is_empty() && !self.registry.sample_paths_exist(&self.root);

        if force_reindex || vault_changed || corrupted {
            self.full_sync().await
        } else {
            self.sync(include_paths).await
        }
    }

    pub async fn full_sync(&mut self) -> AppResult<SyncResult> {
        self.registry.clear();
        self.store.clear().await?;
        self.sync(None).await
    }

    pub async fn sync(&mut self, include_paths: Option<&[String]>) -> AppResult<SyncResult> {
        let mut result = SyncResult::default();
        self.registry.set_vault_path(self.root.to_string_lossy().to_string());

        let extensions: Vec<&str> = self.extensions.iter().map(|s| s.as_str()).collect();
        let scanned = scanner::scan(&self.root, &extensions, &self.ignore_dirs, include_paths)?;

        let mut scanned_by_path: HashMap<String, &ScannedFile> = HashMap::new();
        for file in &scanned {
            scanned_by_path.insert(file.relative_path.clone(), file);
        }

        // Hashing is CPU+IO bound per file and independent across files, so
        // it runs on rayon's pool rather than blocking the async task
        // sequentially (§5: "filesystem I/O and hashing may run on a worker
        // pool").
        let hash_results: Vec<(String, AppResult<FileState>)> = {
            use rayon::prelude::*;
            scanned
                .par_iter()
                .map(|file| {
                    (
                        file.relative_path.clone(),
                        file_tracker::get_file_state(&file.full_path, &file.relative_path),
                    )
                })
                .collect()
        };

        let mut current_states: Vec<FileState> = Vec::with_capacity(scanned.len());
        for (relative_path, outcome) in hash_results {
            match outcome {
                Ok(state) => current_states.push(state),
                Err(e) => result.errors.push(format!("{relative_path}: {e}")),
            }
        }

        let changes = file_tracker::detect_changes(&current_states, self.registry.files());
        result.skipped = changes.unchanged.len();

        let state_by_path: HashMap<&str, &FileState> =
            current_states.iter().map(|s| (s.relative_path.as_str(), s)).collect();
        let added: std::collections::HashSet<&str> = changes.added.iter().map(|s| s.as_str()).collect();

        for relative_path in changes.added.iter().chain(changes.modified.iter()) {
            let Some(scanned_file) = scanned_by_path.get(relative_path) else {
                continue;
            };
            let Some(file_state) = state_by_path.get(relative_path.as_str()) else {
                continue;
            };

            let text = match std::fs::read_to_string(&scanned_file.full_path) {
                Ok(t) => t,
                Err(e) => {
                    result.errors.push(format!("{relative_path}: {e}"));
                    continue;
                }
            };

            let chunks = chunker::semantic_chunk(
                &text,
                &scanned_file.filename,
                relative_path,
                &scanned_file.folder_path,
                self.chunk_min_size,
                self.chunk_max_size,
                self.chunk_level,
                Default::default(),
            );

            let old_chunk_count = self
                .registry
                .files()
                .get(relative_path)
                .map(|e| e.chunk_count)
                .unwrap_or(0);
            let new_chunk_count = chunks.len();

            match self.store.upsert_chunks(&chunks, relative_path).await {
                Ok(_) => {
                    if new_chunk_count < old_chunk_count {
                        let _ = self.store.delete_chunks_by_prefix(relative_path, new_chunk_count).await;
                    }
                    self.registry.update_file_info(
                        relative_path.clone(),
                        RegistryEntry {
                            content_hash: file_state.content_hash.clone(),
                            mtime: file_state.mtime,
                            chunk_count: new_chunk_count,
                            last_synced: Utc::now(),
                        },
                    );
                    result.total_chunks += new_chunk_count;
                    if added.contains(relative_path.as_str()) {
                        result.added += 1;
                    } else {
                        result.modified += 1;
                    }
                }
                Err(e) => {
                    // Registry entry is deliberately left untouched so the
                    // next cycle retries this file (§4.5 failure semantics).
                    result.errors.push(format!("{relative_path}: {e}"));
                }
            }
        }

        for relative_path in &changes.deleted {
            match self.store.delete_by_relative_path(relative_path).await {
                Ok(_) => {
                    self.registry.remove_file_info(relative_path);
                    result.deleted += 1;
                }
                Err(e) => result.errors.push(format!("{relative_path}: {e}")),
            }
        }

        self.registry.save()?;
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::Embedder;
    use crate::vector_store::HnswVectorStore;
    use async_trait::async_trait;
    use std::fs;

    struct FakeEmbedder;
    #[async_trait]
    impl Embedder for FakeEmbedder {
        async fn embed_documents(&self, texts: &[String]) -> AppResult<Vec<Vec<f32>>> {
            Ok(texts.iter().map(|t| vec![t.len() as f32, 0.0]).collect())
        }
        async fn embed_query(&self, text: &str) -> AppResult<Vec<f32>> {
            Ok(vec![text.len() as f32, 0.0])
        }
        fn dimension(&self) -> usize {
            2
        }
        fn model_name(&self) -> &str {
            "fake"
        }
    }

    fn make_syncer(vault: &std::path::Path, store_dir: &std::path::Path) -> Syncer {
        let store = Arc::new(HnswVectorStore::open(store_dir.to_path_buf(), Arc::new(FakeEmbedder)).unwrap());
        Syncer::new(
            vault.to_path_buf(),
            store_dir.join("registry.json"),
            store,
            vec!["md".to_string()],
        )
    }

    #[tokio::test]
    async fn new_file_is_added_with_two_chunks() {
        let vault = tempfile::tempdir().unwrap();
        let store_dir = tempfile::tempdir().unwrap();
        fs::write(vault.path().join("a.md"), "## X\ntext\n## Y\ntext2\n").unwrap();

        let mut syncer = make_syncer(vault.path(), store_dir.path());
        let result = syncer.sync(None).await.unwrap();

        assert_eq!(result.added, 1);
        assert_eq!(result.modified, 0);
        assert_eq!(result.deleted, 0);
        assert_eq!(result.total_chunks, 2);
        assert_eq!(syncer.registry().files().get("a.md").unwrap().chunk_count, 2);
    }

    #[tokio::test]
    async fn touch_only_is_unchanged_on_rescan() {
        let vault = tempfile::tempdir().unwrap();
        let store_dir = tempfile::tempdir().unwrap();
        fs::write(vault.path().join("a.md"), "## X\ntext\n").unwrap();

        let mut syncer = make_syncer(vault.path(), store_dir.path());
        syncer.sync(None).await.unwrap();
        let before = syncer.registry().files().get("a.md").unwrap().clone();

        let result = syncer.sync(None).await.unwrap();
        assert_eq!(result.added, 0);
        assert_eq!(result.modified, 0);
        assert_eq!(result.skipped, 1);
        let after = syncer.registry().files().get("a.md").unwrap().clone();
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn shrinking_file_evicts_straggler_chunk() {
        let vault = tempfile::tempdir().unwrap();
        let store_dir = tempfile::tempdir().unwrap();
        fs::write(vault.path().join("a.md"), "## X\ntext\n## Y\ntext2\n").unwrap();

        let mut syncer = make_syncer(vault.path(), store_dir.path());
        syncer.sync(None).await.unwrap();

        fs::write(vault.path().join("a.md"), "## X\ntext\n").unwrap();
        let result = syncer.sync(None).await.unwrap();

        assert_eq!(result.modified, 1);
        assert_eq!(result.total_chunks, 1);
        assert_eq!(syncer.registry().files().get("a.md").unwrap().chunk_count, 1);
    }

    #[tokio::test]
    async fn deleted_file_is_removed_from_registry() {
        let vault = tempfile::tempdir().unwrap();
        let store_dir = tempfile::tempdir().unwrap();
        fs::write(vault.path().join("a.md"), "## X\ntext\n").unwrap();

        let mut syncer = make_syncer(vault.path(), store_dir.path());
        syncer.sync(None).await.unwrap();

        fs::remove_file(vault.path().join("a.md")).unwrap();
        let result = syncer.sync(None).await.unwrap();

        assert_eq!(result.deleted, 1);
        assert!(syncer.registry().files().get("a.md").is_none());
    }

    #[tokio::test]
    async fn full_sync_clears_registry_and_store_first() {
        let vault = tempfile::tempdir().unwrap();
        let store_dir = tempfile::tempdir().unwrap();
        fs::write(vault.path().join("a.md"), "## X\ntext\n").unwrap();

        let mut syncer = make_syncer(vault.path(), store_dir.path());
        syncer.sync(None).await.unwrap();

        let result = syncer.full_sync().await.unwrap();
        assert_eq!(result.added, 1);
        assert_eq!(syncer.registry().files().len(), 1);
    }
}
