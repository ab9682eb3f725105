//! LLM strategy: a capability trait plus a tagged-config factory, mirroring
//! `crate::embedding`'s shape (SPEC_FULL.md §9). Only an HTTP-based strategy
//! is implemented — the teacher has no local-inference LLM to generalize
//! from, and per-provider SDK plumbing is out of core scope.

mod openai;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::{AppError, AppResult};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerateResponse {
    pub content: String,
    pub model: String,
    pub usage: Usage,
}

#[derive(Debug, Clone, Copy)]
pub struct GenerateOptions {
    pub temperature: f32,
    pub max_tokens: u32,
}

impl Default for GenerateOptions {
    fn default() -> Self {
        Self {
            temperature: 0.2,
            max_tokens: 1024,
        }
    }
}

#[async_trait]
pub trait Llm: Send + Sync {
    async fn generate(
        &self,
        messages: &[Message],
        options: GenerateOptions,
    ) -> AppResult<GenerateResponse>;

    /// Stream of content deltas; the final usage accompanies the SSE `done`
    /// event produced by the chat route, not this stream itself.
    async fn stream_generate(
        &self,
        messages: &[Message],
        options: GenerateOptions,
    ) -> AppResult<BoxStream<'static, AppResult<String>>>;

    fn model_name(&self) -> &str;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "provider", rename_all = "snake_case")]
pub enum LlmConfig {
    OpenAi {
        model_name: String,
        api_key: String,
    },
    OpenAiCompatible {
        model_name: String,
        base_url: String,
        api_key: Option<String>,
    },
}

impl LlmConfig {
    pub fn validate(&self) -> AppResult<()> {
        match self {
            LlmConfig::OpenAi { api_key, .. } => {
                if !api_key.starts_with("sk-") {
                    return Err(AppError::Config(
                        "OpenAI API keys must start with 'sk-'".into(),
                    ));
                }
            }
            LlmConfig::OpenAiCompatible { base_url, .. } => {
                if base_url.trim().is_empty() {
                    return Err(AppError::Config(
                        "openai_compatible llm requires a base_url".into(),
                    ));
                }
            }
        }
        Ok(())
    }

    pub fn model_name(&self) -> &str {
        match self {
            LlmConfig::OpenAi { model_name, .. } => model_name,
            LlmConfig::OpenAiCompatible { model_name, .. } => model_name,
        }
    }
}

pub fn build_llm(config: &LlmConfig) -> AppResult<Arc<dyn Llm>> {
    config.validate()?;
    match config {
        LlmConfig::OpenAi { model_name, api_key } => Ok(Arc::new(openai::OpenAiLlm::new(
            model_name.clone(),
            api_key.clone(),
            None,
        ))),
        LlmConfig::OpenAiCompatible {
            model_name,
            base_url,
            api_key,
        } => Ok(Arc::new(openai::OpenAiLlm::new(
            model_name.clone(),
            api_key.clone().unwrap_or_default(),
            Some(base_url.clone()),
        ))),
    }
}
