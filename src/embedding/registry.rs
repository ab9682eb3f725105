//! Deterministic collection naming and per-model download/cache tracking
//! (SPEC_FULL.md §4.11). Grounded on
//! `examples/original_source/src/core/embedding/model_manager.py` for the
//! state machine, generalized from Python's module-level singleton into a
//! `DashMap`-backed service matching the teacher's per-resource concurrent
//! map idiom (`embedder.rs::EmbeddingManager`).

use dashmap::DashMap;
use regex::Regex;
use std::sync::LazyLock;
use tokio::sync::Mutex;

static IPV4_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d{1,3}(\.\d{1,3}){3}$").unwrap());
static INVALID_CHAR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^a-z0-9_\-.]").unwrap());
static DOUBLE_DOT: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\.\.+").unwrap());
static DOUBLE_UNDERSCORE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"__+").unwrap());

/// `sanitize(base + "_" + model_name)` per SPEC_FULL.md §4.11: lowercase,
/// `/` → `_`, disallowed chars → `_`, collapse `..`/`__`, trim separators,
/// pad to ≥3 chars, truncate to ≤63, guard against looking like an IPv4.
pub fn collection_name(base: &str, model_name: &str) -> String {
    let combined = format!("{base}_{model_name}");
    let mut s = combined.to_lowercase().replace('/', "_");
    s = INVALID_CHAR.replace_all(&s, "_").to_string();
    s = DOUBLE_DOT.replace_all(&s, ".").to_string();
    s = DOUBLE_UNDERSCORE.replace_all(&s, "_").to_string();
    s = s.trim_matches(|c| c == '_' || c == '-' || c == '.').to_string();

    if s.len() < 3 {
        s = format!("{s:_<3}");
    }
    if s.len() > 63 {
        s.truncate(63);
    }
    if IPV4_PATTERN.is_match(&s) {
        s = format!("col_{s}");
        if s.len() > 63 {
            s.truncate(63);
        }
    }
    s
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelStatus {
    NotFound,
    Downloading,
    Ready,
    Error,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ModelCacheState {
    pub status: ModelStatus,
    /// 0..=100, capped at 90 until warm-up completes per SPEC_FULL.md §4.11.
    pub progress: u8,
    pub error: Option<String>,
}

impl Default for ModelCacheState {
    fn default() -> Self {
        Self {
            status: ModelStatus::NotFound,
            progress: 0,
            error: None,
        }
    }
}

/// Process-wide model download/cache tracker. Downloads for the same
/// `model_id` are serialized: a caller that finds an in-flight download
/// reuses its progress rather than starting a second one.
pub struct EmbedderRegistry {
    states: DashMap<String, ModelCacheState>,
    download_locks: DashMap<String, std::sync::Arc<Mutex<()>>>,
}

impl Default for EmbedderRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl EmbedderRegistry {
    pub fn new() -> Self {
        Self {
            states: DashMap::new(),
            download_locks: DashMap::new(),
        }
    }

    pub fn status(&self, model_id: &str) -> ModelCacheState {
        self.states.get(model_id).map(|s| s.clone()).unwrap_or_default()
    }

    fn lock_for(&self, model_id: &str) -> std::sync::Arc<Mutex<()>> {
        self.download_locks
            .entry(model_id.to_string())
            .or_insert_with(|| std::sync::Arc::new(Mutex::new(())))
            .clone()
    }

    /// Begin (or join) a download for `model_id`. If a download is already
    /// in progress, this returns immediately with the existing state rather
    /// than starting a second download.
    pub async fn start_download<F, Fut>(&self, model_id: &str, downloader: F) -> ModelCacheState
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<(), String>>,
    {
        if matches!(
            self.status(model_id).status,
            ModelStatus::Downloading | ModelStatus::Ready
        ) {
            return self.status(model_id);
        }

        let lock = self.lock_for(model_id);
        let _guard = lock.lock().await;

        // Re-check after acquiring the lock: another task may have finished.
        if matches!(
            self.status(model_id).status,
            ModelStatus::Downloading | ModelStatus::Ready
        ) {
            return self.status(model_id);
        }

        self.states.insert(
            model_id.to_string(),
            ModelCacheState {
                status: ModelStatus::Downloading,
                progress: 0,
                error: None,
            },
        );

        match downloader().await {
            Ok(()) => {
                self.states.insert(
                    model_id.to_string(),
                    ModelCacheState {
                        status: ModelStatus::Ready,
                        progress: 100,
                        error: None,
                    },
                );
            }
            Err(e) => {
                self.states.insert(
                    model_id.to_string(),
                    ModelCacheState {
                        status: ModelStatus::Error,
                        progress: 0,
                        error: Some(e),
                    },
                );
            }
        }
        self.status(model_id)
    }

    /// Report progress while a download is in flight, capped at 90% until
    /// the caller promotes the state to `Ready` via `start_download`'s
    /// completion path.
    pub fn report_progress(&self, model_id: &str, bytes_done: u64, bytes_expected: u64) {
        if bytes_expected == 0 {
            return;
        }
        let pct = ((bytes_done as f64 / bytes_expected as f64) * 100.0).min(90.0) as u8;
        if let Some(mut entry) = self.states.get_mut(model_id) {
            if entry.status == ModelStatus::Downloading {
                entry.progress = pct;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitizes_model_path_and_collapses_separators() {
        let name = collection_name("obsidian_notes", "BAAI/bge-m3");
        assert_eq!(name, "obsidian_notes_baai_bge-m3");
    }

    #[test]
    fn pads_short_names() {
        let name = collection_name("a", "b");
        assert!(name.len() >= 3);
    }

    #[test]
    fn guards_against_ipv4_collision() {
        // An empty base leaves the joining "_" at the very front, which
        // trim_matches then strips, so the sanitized string is exactly the
        // dotted-quad "1.2.3.4" and trips the IPv4 guard.
        let name = collection_name("", "1.2.3.4");
        assert_eq!(name, "col_1.2.3.4");
    }

    #[test]
    fn truncates_long_names() {
        let long_model = "x".repeat(100);
        let name = collection_name("base", &long_model);
        assert!(name.len() <= 63);
    }
}
