//! Ambient configuration (SPEC_FULL.md §7b): a single `AppConfig` loaded
//! once via `from_env()`. Grounded on the teacher's `config.rs::from_env()`
//! env-var-with-defaults pattern, generalized from workspace/indexing knobs
//! to vault/embedding/LLM/retrieval knobs; now fallible, since a missing
//! vault root or invalid API key prefix aborts startup (§6).

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::embedding::EmbedderConfig;
use crate::error::{AppError, AppResult};
use crate::llm::LlmConfig;

/// Markdown-family extensions the Scanner walks by default.
pub const DEFAULT_EXTENSIONS: &[&str] = &["md", "markdown"];

const DEFAULT_DENSE_WEIGHT: f32 = 0.7;
const DEFAULT_SPARSE_WEIGHT: f32 = 0.3;
const DEFAULT_QUALITY_THRESHOLD: f32 = 0.5;
const DEFAULT_MAX_RETRIES: u32 = 2;
const DEFAULT_SYNC_DEBOUNCE_MS: u64 = 2000;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RerankerSettings {
    pub model_name: String,
    pub base_url: String,
    pub api_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub vault_root: PathBuf,
    pub listen_addr: String,
    pub data_dir: String,
    pub auth_token: Option<String>,
    pub embedder: EmbedderConfig,
    pub llm: LlmConfig,
    pub reranker: Option<RerankerSettings>,
    pub dense_weight: f32,
    pub sparse_weight: f32,
    pub quality_threshold: f32,
    pub max_retries: u32,
    pub sync_debounce_ms: u64,
}

impl AppConfig {
    pub fn from_env() -> AppResult<Self> {
        let vault_root = std::env::var("VAULT_RAG_VAULT_PATH").map_err(|_| {
            AppError::Config("VAULT_RAG_VAULT_PATH is required (path to the Markdown vault)".into())
        })?;
        let vault_root = PathBuf::from(vault_root);

        let port = std::env::var("VAULT_RAG_PORT").unwrap_or_else(|_| "8787".to_string());

        let data_dir = std::env::var("VAULT_RAG_DATA_DIR").unwrap_or_else(|_| {
            dirs::data_local_dir()
                .map(|d| d.join("vault-rag").to_string_lossy().to_string())
                .unwrap_or_else(|| ".vault-rag-data".to_string())
        });

        let auth_token = std::env::var("VAULT_RAG_AUTH_TOKEN").ok().filter(|s| !s.is_empty());

        let embedder = Self::embedder_from_env()?;
        let llm = Self::llm_from_env()?;
        let reranker = Self::reranker_from_env();

        let dense_weight = Self::parse_env_f32("VAULT_RAG_DENSE_WEIGHT", DEFAULT_DENSE_WEIGHT);
        let sparse_weight = Self::parse_env_f32("VAULT_RAG_SPARSE_WEIGHT", DEFAULT_SPARSE_WEIGHT);
        let quality_threshold = Self::parse_env_f32("VAULT_RAG_QUALITY_THRESHOLD", DEFAULT_QUALITY_THRESHOLD);
        let max_retries = std::env::var("VAULT_RAG_MAX_RETRIES")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_MAX_RETRIES);
        let sync_debounce_ms = std::env::var("VAULT_RAG_SYNC_DEBOUNCE_MS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_SYNC_DEBOUNCE_MS);

        let config = Self {
            vault_root,
            listen_addr: format!("127.0.0.1:{port}"),
            data_dir,
            auth_token,
            embedder,
            llm,
            reranker,
            dense_weight,
            sparse_weight,
            quality_threshold,
            max_retries,
            sync_debounce_ms,
        };

        config.embedder.validate()?;
        config.llm.validate()?;
        Ok(config)
    }

    fn embedder_from_env() -> AppResult<EmbedderConfig> {
        let provider = std::env::var("VAULT_RAG_EMBEDDER_PROVIDER").unwrap_or_else(|_| "local".to_string());
        let model_name = std::env::var("VAULT_RAG_EMBEDDER_MODEL")
            .unwrap_or_else(|_| "Qwen/Qwen3-Embedding-0.6B".to_string());

        Ok(match provider.as_str() {
            "local" => EmbedderConfig::Local { model_name },
            "openai" => {
                let api_key = std::env::var("VAULT_RAG_EMBEDDER_API_KEY").map_err(|_| {
                    AppError::Config("VAULT_RAG_EMBEDDER_API_KEY is required for the openai embedder provider".into())
                })?;
                EmbedderConfig::OpenAi { model_name, api_key }
            }
            "openai_compatible" => {
                let base_url = std::env::var("VAULT_RAG_EMBEDDER_BASE_URL").map_err(|_| {
                    AppError::Config(
                        "VAULT_RAG_EMBEDDER_BASE_URL is required for the openai_compatible embedder provider".into(),
                    )
                })?;
                let api_key = std::env::var("VAULT_RAG_EMBEDDER_API_KEY").ok();
                EmbedderConfig::OpenAiCompatible {
                    model_name,
                    base_url,
                    api_key,
                }
            }
            other => {
                return Err(AppError::Config(format!(
                    "unknown VAULT_RAG_EMBEDDER_PROVIDER '{other}' (expected local, openai, or openai_compatible)"
                )))
            }
        })
    }

    fn llm_from_env() -> AppResult<LlmConfig> {
        let provider = std::env::var("VAULT_RAG_LLM_PROVIDER").unwrap_or_else(|_| "openai".to_string());
        let model_name = std::env::var("VAULT_RAG_LLM_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string());

        Ok(match provider.as_str() {
            "openai" => {
                let api_key = std::env::var("VAULT_RAG_LLM_API_KEY")
                    .map_err(|_| AppError::Config("VAULT_RAG_LLM_API_KEY is required for the openai llm provider".into()))?;
                LlmConfig::OpenAi { model_name, api_key }
            }
            "openai_compatible" => {
                let base_url = std::env::var("VAULT_RAG_LLM_BASE_URL").map_err(|_| {
                    AppError::Config("VAULT_RAG_LLM_BASE_URL is required for the openai_compatible llm provider".into())
                })?;
                let api_key = std::env::var("VAULT_RAG_LLM_API_KEY").ok();
                LlmConfig::OpenAiCompatible {
                    model_name,
                    base_url,
                    api_key,
                }
            }
            other => {
                return Err(AppError::Config(format!(
                    "unknown VAULT_RAG_LLM_PROVIDER '{other}' (expected openai or openai_compatible)"
                )))
            }
        })
    }

    fn reranker_from_env() -> Option<RerankerSettings> {
        let base_url = std::env::var("VAULT_RAG_RERANKER_BASE_URL").ok()?;
        let model_name =
            std::env::var("VAULT_RAG_RERANKER_MODEL").unwrap_or_else(|_| crate::reranker::DEFAULT_MODEL.to_string());
        let api_key = std::env::var("VAULT_RAG_RERANKER_API_KEY").ok();
        Some(RerankerSettings {
            model_name,
            base_url,
            api_key,
        })
    }

    fn parse_env_f32(key: &str, default: f32) -> f32 {
        std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_vault_path_is_a_config_error() {
        // SAFETY: test runs single-threaded within this process's env;
        // no other test reads VAULT_RAG_VAULT_PATH concurrently.
        unsafe {
            std::env::remove_var("VAULT_RAG_VAULT_PATH");
        }
        let result = AppConfig::from_env();
        assert!(matches!(result, Err(AppError::Config(_))));
    }

    #[test]
    fn default_weights_sum_to_one() {
        assert!((DEFAULT_DENSE_WEIGHT + DEFAULT_SPARSE_WEIGHT - 1.0).abs() < 0.001);
    }
}
