//! Shared application state (ambient, §7b/§6). Grounded on the teacher's
//! `AppState` — a single `Clone`-cheap struct of `Arc`-wrapped services
//! handed to every route — generalized from workspace/indexer/watcher
//! services to the vault-sync and retrieval services this crate actually
//! exposes.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::agentic::{ParallelQueryProcessor, QueryRewriter, SelfCorrectingRAGChain};
use crate::config::AppConfig;
use crate::embedding::{self, Embedder, EmbedderRegistry};
use crate::error::AppResult;
use crate::hybrid_search::HybridSearcher;
use crate::llm::{self, Llm};
use crate::reranker::{HttpReranker, Reranker, RerankedRetriever};
use crate::retriever::Retriever;
use crate::syncer::Syncer;
use crate::vector_store::{HnswVectorStore, VectorStore};

/// Everything a request handler needs, cloned cheaply (every field is an
/// `Arc` or a small value type) into each `axum` handler's extractor.
#[derive(Clone)]
pub struct AppState {
    pub config: AppConfig,
    pub collection_name: String,
    pub store: Arc<dyn VectorStore>,
    pub retriever: Retriever,
    pub hybrid: Arc<HybridSearcher>,
    pub reranked: Option<Arc<RerankedRetriever>>,
    pub llm: Arc<dyn Llm>,
    pub query_rewriter: Arc<QueryRewriter>,
    pub self_correcting: Arc<SelfCorrectingRAGChain>,
    pub parallel_processor: Arc<ParallelQueryProcessor>,
    pub embedder_registry: Arc<EmbedderRegistry>,
    /// Single-writer discipline over the registry (§5): only one `sync()`/
    /// `full_sync()` may run at a time.
    pub syncer: Arc<Mutex<Syncer>>,
}

impl AppState {
    pub async fn new(config: AppConfig) -> AppResult<Self> {
        let embedder: Arc<dyn Embedder> = embedding::build_embedder(&config.embedder)?;
        let llm: Arc<dyn Llm> = llm::build_llm(&config.llm)?;

        // §4.11: changing the embedding model yields a disjoint collection
        // (and registry file), preventing cross-model contamination.
        let collection_name = embedding::registry::collection_name("obsidian_notes", embedder.model_name());

        let data_dir = PathBuf::from(&config.data_dir);
        let collection_dir = data_dir.join("collections").join(&collection_name);
        tokio::fs::create_dir_all(&collection_dir)
            .await
            .map_err(crate::error::AppError::Io)?;

        let store: Arc<dyn VectorStore> = Arc::new(HnswVectorStore::open(
            collection_dir.join("vectors"),
            embedder.clone(),
        )?);

        let registry_path = collection_dir.join("registry.json");
        let syncer = Syncer::new(
            config.vault_root.clone(),
            registry_path,
            store.clone(),
            crate::config::DEFAULT_EXTENSIONS.iter().map(|s| s.to_string()).collect(),
        );

        let retriever = Retriever::new(store.clone());
        let hybrid = Arc::new(HybridSearcher::new(store.clone(), config.dense_weight, config.sparse_weight)?);
        hybrid.rebuild_bm25();

        let reranked = config.reranker.as_ref().map(|r| {
            let reranker: Box<dyn Reranker> =
                Box::new(HttpReranker::new(r.model_name.clone(), r.base_url.clone(), r.api_key.clone()));
            Arc::new(RerankedRetriever::new(retriever.clone(), reranker, 20))
        });

        let query_rewriter = Arc::new(QueryRewriter::new(llm.clone()));
        let self_correcting = Arc::new(
            SelfCorrectingRAGChain::new(retriever.clone(), llm.clone())
                .with_thresholds(config.quality_threshold, config.max_retries),
        );
        let parallel_processor = Arc::new(ParallelQueryProcessor::new(Arc::new(retriever.clone())));

        Ok(Self {
            config,
            collection_name,
            store,
            retriever,
            hybrid,
            reranked,
            llm,
            query_rewriter,
            self_correcting,
            parallel_processor,
            embedder_registry: Arc::new(EmbedderRegistry::new()),
            syncer: Arc::new(Mutex::new(syncer)),
        })
    }
}
