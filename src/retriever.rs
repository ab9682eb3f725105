//! Retriever (SPEC_FULL.md §4.7): the thin layer between a VectorStore and
//! chat-ready context strings. Grounded on the teacher's
//! `embedder.rs::semantic_search` distance→score mapping, generalized to the
//! `VectorStore` trait rather than a concrete workspace state.

use std::sync::Arc;

use crate::error::AppResult;
use crate::vector_store::{VectorStore, WhereFilter};

#[derive(Debug, Clone)]
pub struct RetrievedChunk {
    pub id: String,
    pub text: String,
    pub metadata: serde_json::Map<String, serde_json::Value>,
    pub score: f32,
}

#[derive(Debug, Clone, Copy, Default)]
pub enum ContextFormat {
    #[default]
    Numbered,
    Delimited,
}

#[derive(Clone)]
pub struct Retriever {
    store: Arc<dyn VectorStore>,
}

impl Retriever {
    pub fn new(store: Arc<dyn VectorStore>) -> Self {
        Self { store }
    }

    /// Fetch the `n_results` nearest chunks to `query`. Distance is mapped
    /// to score as `1 / (1 + distance)`, so closer chunks score nearer 1.0
    /// without needing the distance metric to be bounded in `[0, 1]`.
    pub async fn retrieve(
        &self,
        query: &str,
        n_results: usize,
        where_filter: Option<&WhereFilter>,
    ) -> AppResult<Vec<RetrievedChunk>> {
        let rows = self.store.query(query, n_results, where_filter, None).await?;
        Ok(rows
            .into_iter()
            .map(|row| RetrievedChunk {
                id: row.id,
                text: row.text,
                metadata: row.metadata,
                score: row.distance.map(|d| 1.0 / (1.0 + d)).unwrap_or(0.0),
            })
            .collect())
    }

    /// `retrieve` plus a chat-ready context string in the requested format.
    pub async fn retrieve_with_context(
        &self,
        query: &str,
        n_results: usize,
        where_filter: Option<&WhereFilter>,
        format: ContextFormat,
    ) -> AppResult<(Vec<RetrievedChunk>, String)> {
        let chunks = self.retrieve(query, n_results, where_filter).await?;
        let context = format_context(&chunks, format);
        Ok((chunks, context))
    }
}

fn chunk_source(chunk: &RetrievedChunk) -> &str {
    chunk
        .metadata
        .get("source")
        .and_then(|v| v.as_str())
        .unwrap_or("unknown")
}

pub fn format_context(chunks: &[RetrievedChunk], format: ContextFormat) -> String {
    match format {
        ContextFormat::Numbered => chunks
            .iter()
            .enumerate()
            .map(|(i, c)| format!("[{}] Source: {}\n{}", i + 1, chunk_source(c), c.text))
            .collect::<Vec<_>>()
            .join("\n\n"),
        ContextFormat::Delimited => chunks
            .iter()
            .map(|c| c.text.clone())
            .collect::<Vec<_>>()
            .join("\n---\n"),
    }
}
