//! Embedding strategy: a capability trait plus a small tagged-config factory,
//! generalizing the duck-typed Python embedding strategies into explicit Rust
//! interfaces (SPEC_FULL.md §9, §4.11a).

mod local;
mod openai;
pub mod registry;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::{AppError, AppResult};

pub use registry::EmbedderRegistry;

/// A model's embedding capability: documents and queries may use distinct
/// encodings (E5-style `"query: "` / `"passage: "` prefixing), so the two
/// methods are kept separate rather than collapsed into one.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed_documents(&self, texts: &[String]) -> AppResult<Vec<Vec<f32>>>;
    async fn embed_query(&self, text: &str) -> AppResult<Vec<f32>>;
    fn dimension(&self) -> usize;
    fn model_name(&self) -> &str;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "provider", rename_all = "snake_case")]
pub enum EmbedderConfig {
    /// In-process candle-backed model, no network calls.
    Local { model_name: String },
    /// OpenAI's embeddings API.
    OpenAi {
        model_name: String,
        api_key: String,
    },
    /// Any OpenAI-compatible HTTP endpoint (Ollama, LM Studio, vLLM, ...).
    OpenAiCompatible {
        model_name: String,
        base_url: String,
        api_key: Option<String>,
    },
}

impl EmbedderConfig {
    /// Validate at construction time, not at first use.
    pub fn validate(&self) -> AppResult<()> {
        match self {
            EmbedderConfig::Local { model_name } => {
                if model_name.trim().is_empty() {
                    return Err(AppError::Config("embedder model_name must not be empty".into()));
                }
            }
            EmbedderConfig::OpenAi { api_key, .. } => {
                if !api_key.starts_with("sk-") {
                    return Err(AppError::Config(
                        "OpenAI API keys must start with 'sk-'".into(),
                    ));
                }
            }
            EmbedderConfig::OpenAiCompatible { base_url, .. } => {
                if base_url.trim().is_empty() {
                    return Err(AppError::Config(
                        "openai_compatible embedder requires a base_url".into(),
                    ));
                }
            }
        }
        Ok(())
    }

    pub fn model_name(&self) -> &str {
        match self {
            EmbedderConfig::Local { model_name } => model_name,
            EmbedderConfig::OpenAi { model_name, .. } => model_name,
            EmbedderConfig::OpenAiCompatible { model_name, .. } => model_name,
        }
    }
}

/// Construct a concrete `Embedder` from a validated config. Invalid
/// combinations are rejected by `EmbedderConfig::validate` before this is
/// ever called.
pub fn build_embedder(config: &EmbedderConfig) -> AppResult<Arc<dyn Embedder>> {
    config.validate()?;
    match config {
        EmbedderConfig::Local { model_name } => {
            Ok(Arc::new(local::LocalEmbedder::new(model_name.clone())?))
        }
        EmbedderConfig::OpenAi { model_name, api_key } => Ok(Arc::new(
            openai::OpenAiEmbedder::new(model_name.clone(), api_key.clone(), None),
        )),
        EmbedderConfig::OpenAiCompatible {
            model_name,
            base_url,
            api_key,
        } => Ok(Arc::new(openai::OpenAiEmbedder::new(
            model_name.clone(),
            api_key.clone().unwrap_or_default(),
            Some(base_url.clone()),
        ))),
    }
}
