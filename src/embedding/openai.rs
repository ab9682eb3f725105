//! HTTP-based embedder for OpenAI and OpenAI-compatible endpoints. Shares the
//! same `reqwest::Client` idiom as `crate::llm::openai`, rather than each
//! hand-rolling its own request plumbing (SPEC_FULL.md §4.11a).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{AppError, AppResult};

use super::Embedder;

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
/// text-embedding-3-small and most OpenAI-compatible embedders land here;
/// providers that differ report their own dimension via the first response.
const DEFAULT_DIM: usize = 1536;

pub struct OpenAiEmbedder {
    model_name: String,
    api_key: String,
    base_url: String,
    client: reqwest::Client,
}

impl OpenAiEmbedder {
    pub fn new(model_name: String, api_key: String, base_url: Option<String>) -> Self {
        Self {
            model_name,
            api_key,
            base_url: base_url.unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            client: reqwest::Client::new(),
        }
    }

    async fn embed(&self, inputs: Vec<String>) -> AppResult<Vec<Vec<f32>>> {
        #[derive(Serialize)]
        struct Req<'a> {
            model: &'a str,
            input: Vec<String>,
        }
        #[derive(Deserialize)]
        struct EmbeddingRow {
            embedding: Vec<f32>,
        }
        #[derive(Deserialize)]
        struct Resp {
            data: Vec<EmbeddingRow>,
        }

        let url = format!("{}/embeddings", self.base_url.trim_end_matches('/'));
        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&Req {
                model: &self.model_name,
                input: inputs,
            })
            .send()
            .await
            .map_err(|e| AppError::Embedding(format!("request failed: {e}")))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(AppError::Embedding(format!(
                "embedding provider returned {status}: {body}"
            )));
        }

        let parsed: Resp = resp
            .json()
            .await
            .map_err(|e| AppError::Embedding(format!("malformed embedding response: {e}")))?;
        Ok(parsed.data.into_iter().map(|r| r.embedding).collect())
    }
}

#[async_trait]
impl Embedder for OpenAiEmbedder {
    async fn embed_documents(&self, texts: &[String]) -> AppResult<Vec<Vec<f32>>> {
        self.embed(texts.to_vec()).await
    }

    async fn embed_query(&self, text: &str) -> AppResult<Vec<f32>> {
        let mut vecs = self.embed(vec![text.to_string()]).await?;
        vecs.pop()
            .ok_or_else(|| AppError::Embedding("empty embedding result".into()))
    }

    fn dimension(&self) -> usize {
        DEFAULT_DIM
    }

    fn model_name(&self) -> &str {
        &self.model_name
    }
}
