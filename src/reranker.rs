//! Reranker and RerankedRetriever (SPEC_FULL.md §4.9). Grounded on
//! `examples/original_source/src/core/rag/reranker.py`'s `RankedDocument`/
//! `RerankedRetriever` shape, with the cross-encoder itself exposed as an
//! HTTP-based provider (no in-process cross-encoder crate exists in the
//! example pack; the client style mirrors `llm/openai.rs`).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{AppError, AppResult};
use crate::retriever::{ContextFormat, Retriever, RetrievedChunk};
use crate::vector_store::WhereFilter;

pub const DEFAULT_MODEL: &str = "cross-encoder/ms-marco-MiniLM-L-6-v2";

#[derive(Debug, Clone)]
pub struct RankedDocument {
    pub text: String,
    pub score: f32,
    pub original_index: usize,
}

#[async_trait]
pub trait Reranker: Send + Sync {
    async fn rerank(&self, query: &str, documents: &[String], top_k: usize) -> AppResult<Vec<RankedDocument>>;
    fn model_name(&self) -> &str;
}

/// Sorts `documents` by descending relevance score from `scores_fn`, keeping
/// each document's index into the original slice. Shared by every Reranker
/// backend so the ordering/tie-break contract (§8 invariant 9) lives once.
fn rank(documents: &[String], scores: &[f32], top_k: usize) -> Vec<RankedDocument> {
    let mut ranked: Vec<RankedDocument> = documents
        .iter()
        .zip(scores.iter())
        .enumerate()
        .map(|(i, (doc, score))| RankedDocument {
            text: doc.clone(),
            score: *score,
            original_index: i,
        })
        .collect();
    ranked.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.original_index.cmp(&b.original_index))
    });
    ranked.truncate(top_k);
    ranked
}

pub struct HttpReranker {
    model_name: String,
    base_url: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl HttpReranker {
    pub fn new(model_name: String, base_url: String, api_key: Option<String>) -> Self {
        Self {
            model_name,
            base_url,
            api_key,
            client: reqwest::Client::new(),
        }
    }

    fn rerank_url(&self) -> String {
        format!("{}/rerank", self.base_url.trim_end_matches('/'))
    }
}

#[derive(Serialize)]
struct RerankRequest<'a> {
    model: &'a str,
    query: &'a str,
    documents: &'a [String],
}

#[derive(Deserialize)]
struct RerankResultRow {
    index: usize,
    relevance_score: f32,
}

#[derive(Deserialize)]
struct RerankResponse {
    results: Vec<RerankResultRow>,
}

#[async_trait]
impl Reranker for HttpReranker {
    async fn rerank(&self, query: &str, documents: &[String], top_k: usize) -> AppResult<Vec<RankedDocument>> {
        if documents.is_empty() {
            return Ok(Vec::new());
        }

        let mut request = self.client.post(self.rerank_url()).json(&RerankRequest {
            model: &self.model_name,
            query,
            documents,
        });
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let resp = request
            .send()
            .await
            .map_err(|e| AppError::VectorStore(format!("reranker request failed: {e}")))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(AppError::VectorStore(format!(
                "reranker provider returned {status}: {body}"
            )));
        }

        let parsed: RerankResponse = resp
            .json()
            .await
            .map_err(|e| AppError::VectorStore(format!("malformed reranker response: {e}")))?;

        let mut scores = vec![0.0f32; documents.len()];
        for row in parsed.results {
            if let Some(slot) = scores.get_mut(row.index) {
                *slot = row.relevance_score;
            }
        }
        Ok(rank(documents, &scores, top_k))
    }

    fn model_name(&self) -> &str {
        &self.model_name
    }
}

/// Wraps a base Retriever: fetches `initial_k` candidates, reranks down to
/// `top_k`, and reports the cross-encoder score as each chunk's `score`.
pub struct RerankedRetriever {
    base: Retriever,
    reranker: Box<dyn Reranker>,
    initial_k: usize,
}

impl RerankedRetriever {
    pub fn new(base: Retriever, reranker: Box<dyn Reranker>, initial_k: usize) -> Self {
        Self {
            base,
            reranker,
            initial_k,
        }
    }

    pub async fn retrieve(
        &self,
        query: &str,
        top_k: usize,
        where_filter: Option<&WhereFilter>,
    ) -> AppResult<Vec<RetrievedChunk>> {
        let initial = self.base.retrieve(query, self.initial_k, where_filter).await?;
        if initial.is_empty() {
            return Ok(initial);
        }

        let documents: Vec<String> = initial.iter().map(|c| c.text.clone()).collect();
        let ranked = self.reranker.rerank(query, &documents, top_k).await?;

        Ok(ranked
            .into_iter()
            .map(|r| {
                let original = &initial[r.original_index];
                RetrievedChunk {
                    id: original.id.clone(),
                    text: original.text.clone(),
                    metadata: original.metadata.clone(),
                    score: r.score,
                }
            })
            .collect())
    }

    pub async fn retrieve_with_context(
        &self,
        query: &str,
        top_k: usize,
        where_filter: Option<&WhereFilter>,
        format: ContextFormat,
    ) -> AppResult<(Vec<RetrievedChunk>, String)> {
        let chunks = self.retrieve(query, top_k, where_filter).await?;
        let context = crate::retriever::format_context(&chunks, format);
        Ok((chunks, context))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rank_sorts_descending_and_breaks_ties_by_original_index() {
        let documents = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let scores = vec![0.5, 0.9, 0.9];
        let ranked = rank(&documents, &scores, 3);
        assert_eq!(ranked[0].original_index, 1);
        assert_eq!(ranked[1].original_index, 2);
        assert_eq!(ranked[2].original_index, 0);
    }

    #[test]
    fn rank_truncates_to_top_k() {
        let documents = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let scores = vec![0.1, 0.9, 0.5];
        let ranked = rank(&documents, &scores, 2);
        assert_eq!(ranked.len(), 2);
        assert_eq!(ranked[0].text, "b");
    }

    struct FixedReranker {
        scores: Vec<f32>,
    }

    #[async_trait]
    impl Reranker for FixedReranker {
        async fn rerank(&self, _query: &str, documents: &[String], top_k: usize) -> AppResult<Vec<RankedDocument>> {
            Ok(rank(documents, &self.scores, top_k))
        }
        fn model_name(&self) -> &str {
            "fixed"
        }
    }

    #[tokio::test]
    async fn reranked_retriever_reorders_by_cross_encoder_score() {
        use crate::chunker::{Chunk, ChunkMetadata};
        use crate::embedding::Embedder;
        use crate::vector_store::HnswVectorStore;
        use async_trait::async_trait;
        use std::sync::Arc;

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

        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(HnswVectorStore::open(dir.path().to_path_buf(), Arc::new(FakeEmbedder)).unwrap());
        store
            .upsert_chunks(
                &[
                    Chunk {
                        text: "first".to_string(),
                        metadata: ChunkMetadata {
                            source: "a.md".into(),
                            relative_path: "a.md".into(),
                            ..Default::default()
                        },
                    },
                    Chunk {
                        text: "second-longer".to_string(),
                        metadata: ChunkMetadata {
                            source: "a.md".into(),
                            relative_path: "a.md".into(),
                            ..Default::default()
                        },
                    },
                ],
                "a.md",
            )
            .await
            .unwrap();

        let base = Retriever::new(store);
        let reranker = Box::new(FixedReranker { scores: vec![0.1, 0.95] });
        let reranked = RerankedRetriever::new(base, reranker, 10);
        let chunks = reranked.retrieve("query", 1, None).await.unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, "second-longer");
        assert_eq!(chunks[0].score, 0.95);
    }
}
