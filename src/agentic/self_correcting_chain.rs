use std::sync::Arc;

use crate::error::AppResult;
use crate::llm::{GenerateOptions, Llm, Message};
use crate::retriever::{ContextFormat, RetrievedChunk, Retriever};
use crate::vector_store::WhereFilter;

const DEFAULT_QUALITY_THRESHOLD: f32 = 0.5;
const DEFAULT_MAX_RETRIES: u32 = 2;
const BROADEN_TEMPERATURE: f32 = 0.3;

const BROADEN_PROMPT_TEMPLATE: &str = "The following search query did not find good results.
Please rewrite it to be broader and more likely to find relevant documents.
Keep the core meaning but use more general terms or synonyms.
Respond with ONLY the rewritten query, nothing else.

Original query: {query}

Rewritten query:";

const ANSWER_PROMPT_TEMPLATE: &str = "Based on the following context, answer the question.
If the context doesn't contain enough information, say so honestly.

Context:
{context}

Question: {question}

Answer:";

const NO_CONTEXT_ANSWER: &str = "I couldn't find relevant information to answer your question.";

#[derive(Debug, Clone)]
pub struct CorrectionResult {
    pub answer: String,
    pub attempts: u32,
    pub final_query: String,
    pub retrieval_quality: f32,
    pub all_queries: Vec<String>,
    pub chunks: Vec<RetrievedChunk>,
}

pub struct SelfCorrectingRAGChain {
    retriever: Retriever,
    llm: Arc<dyn Llm>,
    quality_threshold: f32,
    max_retries: u32,
}

impl SelfCorrectingRAGChain {
    pub fn new(retriever: Retriever, llm: Arc<dyn Llm>) -> Self {
        Self {
            retriever,
            llm,
            quality_threshold: DEFAULT_QUALITY_THRESHOLD,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    pub fn with_thresholds(mut self, quality_threshold: f32, max_retries: u32) -> Self {
        self.quality_threshold = quality_threshold;
        self.max_retries = max_retries;
        self
    }

    pub async fn query(&self, question: &str, top_k: usize, temperature: f32) -> AppResult<CorrectionResult> {
        let mut current_query = question.to_string();
        let mut attempts = 0u32;
        let mut all_queries = vec![question.to_string()];
        let mut chunks: Vec<RetrievedChunk> = Vec::new();
        let mut quality = 0.0f32;

        loop {
            attempts += 1;
            chunks = self.retriever.retrieve(&current_query, top_k, None as Option<&WhereFilter>).await?;
            quality = Self::evaluate_quality(&chunks);

            if quality >= self.quality_threshold {
                let answer = self.generate_answer(question, &chunks, temperature).await?;
                return Ok(CorrectionResult {
                    answer,
                    attempts,
                    final_query: current_query,
                    retrieval_quality: quality,
                    all_queries,
                    chunks,
                });
            }

            if attempts > self.max_retries {
                break;
            }
            current_query = self.broaden_query(&current_query).await?;
            all_queries.push(current_query.clone());
        }

        let answer = self.generate_answer(question, &chunks, temperature).await?;
        Ok(CorrectionResult {
            answer,
            attempts,
            final_query: current_query,
            retrieval_quality: quality,
            all_queries,
            chunks,
        })
    }

    fn evaluate_quality(chunks: &[RetrievedChunk]) -> f32 {
        let top = &chunks[..chunks.len().min(3)];
        if top.is_empty() {
            return 0.0;
        }
        top.iter().map(|c| c.score).sum::<f32>() / top.len() as f32
    }

    async fn broaden_query(&self, query: &str) -> AppResult<String> {
        let prompt = BROADEN_PROMPT_TEMPLATE.replace("{query}", query);
        let response = self
            .llm
            .generate(
                &[Message {
                    role: "user".to_string(),
                    content: prompt,
                }],
                GenerateOptions {
                    temperature: BROADEN_TEMPERATURE,
                    ..GenerateOptions::default()
                },
            )
            .await?;
        Ok(response.content.trim().to_string())
    }

    async fn generate_answer(&self, question: &str, chunks: &[RetrievedChunk], temperature: f32) -> AppResult<String> {
        if chunks.is_empty() {
            return Ok(NO_CONTEXT_ANSWER.to_string());
        }
        let context = crate::retriever::format_context(
            &chunks.iter().take(5).cloned().collect::<Vec<_>>(),
            ContextFormat::Numbered,
        );
        let prompt = ANSWER_PROMPT_TEMPLATE
            .replace("{context}", &context)
            .replace("{question}", question);
        let response = self
            .llm
            .generate(
                &[Message {
                    role: "user".to_string(),
                    content: prompt,
                }],
                GenerateOptions {
                    temperature,
                    ..GenerateOptions::default()
                },
            )
            .await?;
        Ok(response.content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunker::{Chunk, ChunkMetadata};
    use crate::embedding::Embedder;
    use crate::vector_store::HnswVectorStore;
    use async_trait::async_trait;
    use futures_util::stream::BoxStream;
    use std::sync::atomic::{AtomicUsize, Ordering};

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

    struct CountingLlm {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Llm for CountingLlm {
        async fn generate(&self, _messages: &[Message], _options: GenerateOptions) -> AppResult<crate::llm::GenerateResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(crate::llm::GenerateResponse {
                content: "broader query".to_string(),
                model: "fake".to_string(),
                usage: Default::default(),
            })
        }
        async fn stream_generate(
            &self,
            _messages: &[Message],
            _options: GenerateOptions,
        ) -> AppResult<BoxStream<'static, AppResult<String>>> {
            unimplemented!()
        }
        fn model_name(&self) -> &str {
            "fake"
        }
    }

    #[tokio::test]
    async fn empty_retrieval_returns_fallback_message_after_exhaustion() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(HnswVectorStore::open(dir.path().to_path_buf(), Arc::new(FakeEmbedder)).unwrap());
        let retriever = Retriever::new(store);
        let llm = Arc::new(CountingLlm { calls: AtomicUsize::new(0) });
        let chain = SelfCorrectingRAGChain::new(retriever, llm.clone()).with_thresholds(0.5, 2);

        let result = chain.query("anything", 5, 0.7).await.unwrap();
        assert_eq!(result.answer, NO_CONTEXT_ANSWER);
        assert_eq!(result.attempts, 3);
        assert_eq!(llm.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn high_quality_retrieval_returns_on_first_attempt() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(HnswVectorStore::open(dir.path().to_path_buf(), Arc::new(FakeEmbedder)).unwrap());
        store
            .upsert_chunks(
                &[Chunk {
                    text: "rust ownership explained".to_string(),
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

        let retriever = Retriever::new(store);
        let llm = Arc::new(CountingLlm { calls: AtomicUsize::new(0) });
        let chain = SelfCorrectingRAGChain::new(retriever, llm.clone()).with_thresholds(0.0, 2);

        let result = chain.query("rust ownership", 5, 0.7).await.unwrap();
        assert_eq!(result.attempts, 1);
        assert_eq!(llm.calls.load(Ordering::SeqCst), 1);
    }
}
