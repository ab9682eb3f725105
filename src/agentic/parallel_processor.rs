use std::collections::HashSet;
use std::sync::Arc;

use futures_util::stream::{FuturesUnordered, StreamExt};
use tokio::sync::Semaphore;

use crate::retriever::{RetrievedChunk, Retriever};
use crate::vector_store::WhereFilter;

const DEFAULT_MAX_WORKERS: usize = 3;

#[derive(Debug, Clone, Default)]
pub struct AggregatedResult {
    pub queries: Vec<String>,
    pub chunks: Vec<RetrievedChunk>,
    pub total_count: usize,
}

pub struct ParallelQueryProcessor {
    retriever: Arc<Retriever>,
    max_workers: usize,
}

impl ParallelQueryProcessor {
    pub fn new(retriever: Arc<Retriever>) -> Self {
        Self {
            retriever,
            max_workers: DEFAULT_MAX_WORKERS,
        }
    }

    pub fn with_max_workers(mut self, max_workers: usize) -> Self {
        self.max_workers = max_workers.max(1);
        self
    }

    /// Fans `queries` out to the Retriever, bounded by `max_workers`
    /// concurrent in-flight requests. A query whose retrieval fails is
    /// dropped silently; the rest still complete (§4.10).
    pub async fn process_queries(&self, queries: &[String], top_k: usize) -> Vec<(String, Vec<RetrievedChunk>)> {
        if queries.is_empty() {
            return Vec::new();
        }

        let semaphore = Arc::new(Semaphore::new(self.max_workers));
        let mut tasks = FuturesUnordered::new();

        for query in queries {
            let retriever = Arc::clone(&self.retriever);
            let semaphore = Arc::clone(&semaphore);
            let query = query.clone();
            tasks.push(async move {
                let _permit = semaphore.acquire().await.ok()?;
                let chunks = retriever.retrieve(&query, top_k, None as Option<&WhereFilter>).await.ok()?;
                Some((query, chunks))
            });
        }

        let mut results = Vec::new();
        while let Some(outcome) = tasks.next().await {
            if let Some(pair) = outcome {
                results.push(pair);
            }
        }
        results
    }

    /// Union chunks across `results`, dedup by id, sort by score descending,
    /// truncate to `top_k`.
    pub fn aggregate_results(results: &[(String, Vec<RetrievedChunk>)], top_k: usize) -> AggregatedResult {
        if results.is_empty() {
            return AggregatedResult::default();
        }

        let queries: Vec<String> = results.iter().map(|(q, _)| q.clone()).collect();
        let mut seen: HashSet<String> = HashSet::new();
        let mut all_chunks: Vec<RetrievedChunk> = Vec::new();

        for (_, chunks) in results {
            for chunk in chunks {
                if seen.contains(&chunk.id) {
                    continue;
                }
                seen.insert(chunk.id.clone());
                all_chunks.push(chunk.clone());
            }
        }

        all_chunks.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        let total_count = all_chunks.len();
        all_chunks.truncate(top_k);

        AggregatedResult {
            queries,
            chunks: all_chunks,
            total_count,
        }
    }

    pub async fn process_and_aggregate(&self, queries: &[String], top_k_per_query: usize, top_k_final: usize) -> AggregatedResult {
        let results = self.process_queries(queries, top_k_per_query).await;
        Self::aggregate_results(&results, top_k_final)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunker::{Chunk, ChunkMetadata};
    use crate::embedding::Embedder;
    use crate::vector_store::HnswVectorStore;
    use async_trait::async_trait;

    struct FakeEmbedder;
    #[async_trait]
    impl Embedder for FakeEmbedder {
        async fn embed_documents(&self, texts: &[String]) -> crate::error::AppResult<Vec<Vec<f32>>> {
            Ok(texts.iter().map(|t| vec![t.len() as f32, 0.0]).collect())
        }
        async fn embed_query(&self, text: &str) -> crate::error::AppResult<Vec<f32>> {
            Ok(vec![text.len() as f32, 0.0])
        }
        fn dimension(&self) -> usize {
            2
        }
        fn model_name(&self) -> &str {
            "fake"
        }
    }

    #[tokio::test]
    async fn aggregate_dedups_by_id_and_sorts_by_score() {
        let shared = RetrievedChunk {
            id: "dup".to_string(),
            text: "shared".to_string(),
            metadata: Default::default(),
            score: 0.4,
        };
        let results = vec![
            (
                "q1".to_string(),
                vec![
                    shared.clone(),
                    RetrievedChunk {
                        id: "only-in-q1".to_string(),
                        text: "x".to_string(),
                        metadata: Default::default(),
                        score: 0.9,
                    },
                ],
            ),
            (
                "q2".to_string(),
                vec![RetrievedChunk {
                    id: "dup".to_string(),
                    text: "shared-again".to_string(),
                    metadata: Default::default(),
                    score: 0.99,
                }],
            ),
        ];

        let aggregated = ParallelQueryProcessor::aggregate_results(&results, 10);
        assert_eq!(aggregated.chunks.len(), 2);
        assert_eq!(aggregated.chunks[0].id, "only-in-q1");
        assert_eq!(aggregated.total_count, 2);
    }

    #[tokio::test]
    async fn process_queries_runs_all_queries_concurrently() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(HnswVectorStore::open(dir.path().to_path_buf(), Arc::new(FakeEmbedder)).unwrap());
        store
            .upsert_chunks(
                &[Chunk {
                    text: "alpha beta".to_string(),
                    metadata: ChunkMetadata {
                        source: "a.md".into(),
                        relative_path: "a.md".into(),
                        ..Default::default()
                    },
                }],
                "a.md",
            )
            .await
            .unwrap();

        let retriever = Arc::new(Retriever::new(store));
        let processor = ParallelQueryProcessor::new(retriever).with_max_workers(2);
        let queries = vec!["alpha".to_string(), "beta".to_string(), "gamma".to_string()];
        let results = processor.process_queries(&queries, 5).await;
        assert_eq!(results.len(), 3);
    }
}
