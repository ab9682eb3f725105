//! Agentic RAG layer (SPEC_FULL.md §4.10): query rewriting with history,
//! quality-threshold self-correction, and bounded concurrent query fan-out.
//! Grounded module-for-module on
//! `examples/original_source/src/core/rag/agentic/*.py`, reworked from
//! Python duck-typed strategies into the crate's `Llm`/`Retriever` traits.

mod parallel_processor;
mod query_rewriter;
mod self_correcting_chain;

pub use parallel_processor::{AggregatedResult, ParallelQueryProcessor};
pub use query_rewriter::{QueryRewriter, RewriteResult};
pub use self_correcting_chain::{CorrectionResult, SelfCorrectingRAGChain};
