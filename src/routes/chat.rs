//! Chat endpoint (SPEC_FULL.md §6): a thin SSE binding over the core
//! retrieval pipeline (QueryRewriter → Retriever/RerankedRetriever → LLM).
//! Grounded on the teacher's `ws_handler` event-streaming pattern,
//! generalized from a WebSocket event bus to a per-request Server-Sent
//! Events stream as the spec's chat contract requires.

use std::convert::Infallible;

use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::Json;
use futures_util::stream::{self, Stream, StreamExt};
use serde::{Deserialize, Serialize};

use crate::error::AppResult;
use crate::llm::{GenerateOptions, Llm, Message, Usage};
use crate::retriever::ContextFormat;
use crate::state::AppState;
use crate::vector_store::WhereFilter;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub message: String,
    #[serde(default)]
    pub history: Vec<ChatMessage>,
    #[serde(default)]
    pub top_k: Option<usize>,
}

fn sse_json(event: &str, body: serde_json::Value) -> Event {
    Event::default()
        .event(event)
        .json_data(body)
        .unwrap_or_else(|_| Event::default().event(event).data("{}"))
}

/// `POST /chat`. Resolves anaphora against `history`, retrieves context
/// (reranked if a reranker is configured, else dense-only), then streams
/// the LLM's answer as SSE: an initial `start` event with sources and
/// model, per-token `content` events, and a terminal `done` event.
pub async fn chat(
    State(state): State<AppState>,
    Json(req): Json<ChatRequest>,
) -> AppResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    let top_k = req.top_k.unwrap_or(5);
    let history: Vec<Message> = req
        .history
        .iter()
        .map(|m| Message {
            role: m.role.clone(),
            content: m.content.clone(),
        })
        .collect();

    let resolved_query = state.query_rewriter.resolve_references(&req.message, &history).await?;

    let (chunks, context) = if let Some(reranked) = &state.reranked {
        reranked
            .retrieve_with_context(&resolved_query, top_k, None::<&WhereFilter>, ContextFormat::default())
            .await?
    } else {
        state
            .retriever
            .retrieve_with_context(&resolved_query, top_k, None::<&WhereFilter>, ContextFormat::default())
            .await?
    };

    let sources: Vec<String> = chunks
        .iter()
        .map(|c| {
            c.metadata
                .get("source")
                .and_then(|v| v.as_str())
                .unwrap_or(&c.id)
                .to_string()
        })
        .collect();
    let model = state.llm.model_name().to_string();

    let system_prompt = format!(
        "Answer the question using only the following context from the user's notes. \
         If the context doesn't contain the answer, say so honestly.\n\nContext:\n{context}"
    );

    let mut messages = vec![Message {
        role: "system".to_string(),
        content: system_prompt,
    }];
    messages.extend(history);
    messages.push(Message {
        role: "user".to_string(),
        content: req.message.clone(),
    });

    let llm_stream = state.llm.stream_generate(&messages, GenerateOptions::default()).await?;

    let start_event = sse_json(
        "start",
        serde_json::json!({"type": "start", "sources": sources, "model": model}),
    );

    let content_stream = llm_stream
        .map(|chunk| match chunk {
            Ok(content) => sse_json("content", serde_json::json!({"type": "content", "content": content})),
            Err(e) => sse_json("content", serde_json::json!({"type": "error", "error": e.to_string()})),
        })
        .map(Ok::<_, Infallible>);

    let done_event = sse_json("done", serde_json::json!({"type": "done", "usage": Usage::default()}));

    let stream = stream::once(async move { Ok::<_, Infallible>(start_event) })
        .chain(content_stream)
        .chain(stream::once(async move { Ok::<_, Infallible>(done_event) }));

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}
