//! In-process embedder backed by `fastembed`'s candle runtime, grounded
//! directly on the teacher's `embedder.rs::EmbeddingManager`: lazy
//! double-checked-lock model init, `Qwen3TextEmbedding::from_hf`, CPU
//! device, and last-token-pooled, pre-normalized output vectors.

use async_trait::async_trait;
use candle_core::{DType, Device};
use fastembed::Qwen3TextEmbedding;
use std::sync::Mutex;

use crate::error::{AppError, AppResult};

use super::Embedder;

/// Qwen3-Embedding-0.6B's `config.hidden_size`; other local models would
/// need their own constant, but this crate only wires up the one model the
/// teacher's `qwen3` fastembed feature already depends on.
const EMBEDDING_DIM: usize = 1024;
const MAX_LENGTH: usize = 8192;

pub struct LocalEmbedder {
    model_name: String,
    repo_id: String,
    inner: Mutex<Option<Qwen3TextEmbedding>>,
}

impl LocalEmbedder {
    pub fn new(model_name: String) -> AppResult<Self> {
        Ok(Self {
            repo_id: model_name.clone(),
            model_name,
            inner: Mutex::new(None),
        })
    }

    fn ensure_model(&self) -> AppResult<()> {
        let mut guard = self
            .inner
            .lock()
            .map_err(|e| AppError::Embedding(format!("local embedder lock poisoned: {e}")))?;
        if guard.is_some() {
            return Ok(());
        }
        tracing::info!(model = %self.repo_id, dim = EMBEDDING_DIM, "loading local embedding model");
        let model = Qwen3TextEmbedding::from_hf(&self.repo_id, &Device::Cpu, DType::F32, MAX_LENGTH)
            .map_err(|e| AppError::Embedding(format!("failed to load local embedder: {e}")))?;
        let actual_dim = model.config().hidden_size;
        if actual_dim != EMBEDDING_DIM {
            return Err(AppError::Embedding(format!(
                "model dimension mismatch: expected {EMBEDDING_DIM} but got {actual_dim}"
            )));
        }
        *guard = Some(model);
        Ok(())
    }

    /// Candle inference is CPU-bound and synchronous; `block_in_place` runs
    /// it without yielding the worker thread back to the async scheduler,
    /// matching the teacher's use of a plain `std::sync::Mutex` around the
    /// model rather than an async one.
    async fn embed_raw(&self, texts: Vec<String>) -> AppResult<Vec<Vec<f32>>> {
        tokio::task::block_in_place(|| {
            self.ensure_model()?;
            let guard = self
                .inner
                .lock()
                .map_err(|e| AppError::Embedding(format!("local embedder lock poisoned: {e}")))?;
            let model = guard
                .as_ref()
                .ok_or_else(|| AppError::Embedding("embedder not initialized".into()))?;
            model
                .embed(&texts)
                .map_err(|e| AppError::Embedding(format!("embedding failed: {e}")))
        })
    }
}

#[async_trait]
impl Embedder for LocalEmbedder {
    async fn embed_documents(&self, texts: &[String]) -> AppResult<Vec<Vec<f32>>> {
        self.embed_raw(texts.to_vec()).await
    }

    async fn embed_query(&self, text: &str) -> AppResult<Vec<f32>> {
        // Qwen3 is an instruction-tuned decoder-only embedder; queries get an
        // explicit instruction prefix the way the teacher's semantic_search
        // does, documents do not.
        let prefixed = format!("Instruct: Retrieve relevant passages\nQuery: {text}");
        let mut vecs = self.embed_raw(vec![prefixed]).await?;
        vecs.pop()
            .ok_or_else(|| AppError::Embedding("empty embedding result".into()))
    }

    fn dimension(&self) -> usize {
        EMBEDDING_DIM
    }

    fn model_name(&self) -> &str {
        &self.model_name
    }
}
