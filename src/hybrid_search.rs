//! HybridSearcher (SPEC_FULL.md §4.8): dense vector search blended with a
//! hand-rolled Okapi BM25 sparse score. No `bm25` crate exists anywhere in
//! the retrieved reference pack, so BM25 is implemented directly here,
//! grounded in the standard Okapi formulation (k1=1.5, b=0.75) rather than
//! any single example file. The combination is a weighted sum, not
//! reciprocal-rank fusion, per the spec's explicit choice.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{AppError, AppResult};
use crate::vector_store::VectorStore;

const BM25_K1: f32 = 1.5;
const BM25_B: f32 = 0.75;

fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
        .collect()
}

/// A BM25 index built from a full corpus snapshot. Rebuilt wholesale after
/// each sync completes (§9: no incremental append path; documented scaling
/// limitation, not addressed here).
#[derive(Default)]
pub struct Bm25Index {
    doc_len: HashMap<String, usize>,
    term_freqs: HashMap<String, HashMap<String, u32>>,
    doc_freq: HashMap<String, usize>,
    avg_doc_len: f32,
    n_docs: usize,
}

impl Bm25Index {
    pub fn build(corpus: &[(String, String)]) -> Self {
        let mut doc_len = HashMap::new();
        let mut term_freqs: HashMap<String, HashMap<String, u32>> = HashMap::new();
        let mut doc_freq: HashMap<String, usize> = HashMap::new();
        let mut total_len = 0usize;

        for (id, text) in corpus {
            let tokens = tokenize(text);
            total_len += tokens.len();
            doc_len.insert(id.clone(), tokens.len());

            let mut freqs: HashMap<String, u32> = HashMap::new();
            for tok in &tokens {
                *freqs.entry(tok.clone()).or_insert(0) += 1;
            }
            for term in freqs.keys() {
                *doc_freq.entry(term.clone()).or_insert(0) += 1;
            }
            term_freqs.insert(id.clone(), freqs);
        }

        let n_docs = corpus.len();
        let avg_doc_len = if n_docs > 0 {
            total_len as f32 / n_docs as f32
        } else {
            0.0
        };

        Self {
            doc_len,
            term_freqs,
            doc_freq,
            avg_doc_len,
            n_docs,
        }
    }

    fn idf(&self, term: &str) -> f32 {
        let df = *self.doc_freq.get(term).unwrap_or(&0) as f32;
        (((self.n_docs as f32 - df + 0.5) / (df + 0.5)) + 1.0).ln()
    }

    /// Raw (un-normalized) BM25 score per document id that contains at
    /// least one query term.
    pub fn score(&self, query: &str) -> HashMap<String, f32> {
        let query_terms = tokenize(query);
        let mut scores: HashMap<String, f32> = HashMap::new();
        if self.n_docs == 0 || query_terms.is_empty() {
            return scores;
        }

        for term in &query_terms {
            let idf = self.idf(term);
            for (doc_id, freqs) in &self.term_freqs {
                let Some(&freq) = freqs.get(term) else {
                    continue;
                };
                let dl = *self.doc_len.get(doc_id).unwrap_or(&0) as f32;
                let denom = freq as f32
                    + BM25_K1 * (1.0 - BM25_B + BM25_B * (dl / self.avg_doc_len.max(1.0)));
                let term_score = idf * (freq as f32 * (BM25_K1 + 1.0)) / denom.max(1e-6);
                *scores.entry(doc_id.clone()).or_insert(0.0) += term_score;
            }
        }
        scores
    }
}

#[derive(Debug, Clone)]
pub struct HybridHit {
    pub id: String,
    pub text: String,
    pub metadata: serde_json::Map<String, serde_json::Value>,
    pub dense_score: f32,
    pub sparse_score: f32,
    pub final_score: f32,
}

pub struct HybridSearcher {
    store: Arc<dyn VectorStore>,
    dense_weight: f32,
    sparse_weight: f32,
    bm25: RwLock<Bm25Index>,
}

impl HybridSearcher {
    pub fn new(store: Arc<dyn VectorStore>, dense_weight: f32, sparse_weight: f32) -> AppResult<Self> {
        if !(0.0..=1.0).contains(&dense_weight) || !(0.0..=1.0).contains(&sparse_weight) {
            return Err(AppError::Config(
                "hybrid search weights must each be in [0, 1]".into(),
            ));
        }
        if (dense_weight + sparse_weight - 1.0).abs() > 0.01 {
            return Err(AppError::Config(
                "hybrid search weights must sum to 1.0 (±0.01)".into(),
            ));
        }
        Ok(Self {
            store,
            dense_weight,
            sparse_weight,
            bm25: RwLock::new(Bm25Index::default()),
        })
    }

    /// Rebuild the BM25 index from the VectorStore's current corpus. Call
    /// this once a sync completes.
    pub fn rebuild_bm25(&self) {
        let corpus = self.store.corpus_snapshot();
        *self.bm25.write() = Bm25Index::build(&corpus);
    }

    pub async fn search(&self, query: &str, top_k: usize) -> AppResult<Vec<HybridHit>> {
        if top_k == 0 {
            return Ok(Vec::new());
        }
        let dense_rows = self.store.query(query, top_k * 2, None, None).await?;
        let sparse_scores = self.bm25.read().score(query);
        let max_sparse = sparse_scores.values().cloned().fold(0.0f32, f32::max);

        let mut hits: Vec<HybridHit> = dense_rows
            .into_iter()
            .map(|row| {
                let dense_score = row.distance.map(|d| 1.0 / (1.0 + d)).unwrap_or(0.0);
                let raw_sparse = sparse_scores.get(&row.id).copied().unwrap_or(0.0);
                let sparse_score = if max_sparse > 0.0 {
                    raw_sparse / max_sparse
                } else {
                    0.0
                };
                let final_score = self.dense_weight * dense_score + self.sparse_weight * sparse_score;
                HybridHit {
                    id: row.id,
                    text: row.text,
                    metadata: row.metadata,
                    dense_score,
                    sparse_score,
                    final_score,
                }
            })
            .collect();

        hits.sort_by(|a, b| b.final_score.partial_cmp(&a.final_score).unwrap_or(std::cmp::Ordering::Equal));
        hits.truncate(top_k);
        Ok(hits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bm25_ranks_exact_term_match_above_unrelated_doc() {
        let corpus = vec![
            ("a".to_string(), "the quick brown fox jumps over the lazy dog".to_string()),
            ("b".to_string(), "completely unrelated content about gardening".to_string()),
        ];
        let index = Bm25Index::build(&corpus);
        let scores = index.score("fox");
        assert!(scores.get("a").copied().unwrap_or(0.0) > 0.0);
        assert!(scores.get("b").is_none());
    }

    #[test]
    fn empty_query_yields_no_scores() {
        let corpus = vec![("a".to_string(), "some text".to_string())];
        let index = Bm25Index::build(&corpus);
        assert!(index.score("   ").is_empty());
    }

    #[test]
    fn weight_validation_rejects_totals_far_from_one() {
        let dir = tempfile::tempdir().unwrap();
        let _ = dir;
        let result = HybridSearcher::new(Arc::new(NoopStore), 0.9, 0.9);
        assert!(result.is_err());
    }

    struct NoopStore;

    #[async_trait::async_trait]
    impl VectorStore for NoopStore {
        async fn upsert_chunks(&self, _: &[crate::chunker::Chunk], _: &str) -> AppResult<usize> {
            Ok(0)
        }
        async fn query(
            &self,
            _: &str,
            _: usize,
            _: Option<&crate::vector_store::WhereFilter>,
            _: Option<&str>,
        ) -> AppResult<Vec<crate::vector_store::QueryRow>> {
            Ok(Vec::new())
        }
        async fn delete_by_relative_path(&self, _: &str) -> AppResult<()> {
            Ok(())
        }
        async fn delete_chunks_by_prefix(&self, _: &str, _: usize) -> AppResult<()> {
            Ok(())
        }
        async fn clear(&self) -> AppResult<()> {
            Ok(())
        }
        fn corpus_snapshot(&self) -> Vec<(String, String)> {
            Vec::new()
        }
    }

    #[tokio::test]
    async fn dense_weight_one_reduces_to_pure_vector_ranking() {
        use crate::chunker::{Chunk, ChunkMetadata};
        use crate::embedding::Embedder;
        use crate::vector_store::HnswVectorStore;
        use async_trait::async_trait;

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
                &[Chunk {
                    text: "alpha".to_string(),
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

        let searcher = HybridSearcher::new(store, 1.0, 0.0).unwrap();
        searcher.rebuild_bm25();
        let hits = searcher.search("alpha", 5).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].sparse_score, 0.0);
    }
}
