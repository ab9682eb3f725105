use async_trait::async_trait;
use futures_util::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};

use crate::error::{AppError, AppResult};

use super::{GenerateOptions, GenerateResponse, Llm, Message, Usage};

const DONE_MARKER: &str = "[DONE]";

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

pub struct OpenAiLlm {
    model_name: String,
    api_key: String,
    base_url: String,
    client: reqwest::Client,
}

impl OpenAiLlm {
    pub fn new(model_name: String, api_key: String, base_url: Option<String>) -> Self {
        Self {
            model_name,
            api_key,
            base_url: base_url.unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            client: reqwest::Client::new(),
        }
    }

    fn chat_url(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [Message],
    temperature: f32,
    max_tokens: u32,
    stream: bool,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessageResp,
}

#[derive(Deserialize)]
struct ChatMessageResp {
    content: String,
}

#[derive(Deserialize)]
struct ChatUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
    total_tokens: u32,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
    usage: Option<ChatUsage>,
}

#[derive(Deserialize)]
struct StreamChoiceDelta {
    content: Option<String>,
}

#[derive(Deserialize)]
struct StreamChoice {
    delta: StreamChoiceDelta,
}

#[derive(Deserialize)]
struct StreamChunk {
    choices: Vec<StreamChoice>,
}

/// Split a raw SSE byte buffer on blank-line event boundaries, returning
/// complete events and leaving any trailing partial event in `buf` for the
/// next read.
fn drain_sse_events(buf: &mut String) -> Vec<String> {
    let mut events = Vec::new();
    while let Some(pos) = buf.find("\n\n") {
        let event = buf[..pos].to_string();
        *buf = buf[pos + 2..].to_string();
        events.push(event);
    }
    events
}

/// Extract the `data: ` payload lines from one SSE event block and parse
/// each as a `StreamChunk`, yielding its delta content (skipping `[DONE]`
/// and keep-alive/comment lines).
fn parse_sse_event(event: &str) -> Option<String> {
    for line in event.lines() {
        let Some(data) = line.strip_prefix("data:") else {
            continue;
        };
        let data = data.trim();
        if data.is_empty() || data == DONE_MARKER {
            continue;
        }
        if let Ok(chunk) = serde_json::from_str::<StreamChunk>(data) {
            if let Some(choice) = chunk.choices.into_iter().next() {
                if let Some(content) = choice.delta.content {
                    if !content.is_empty() {
                        return Some(content);
                    }
                }
            }
        }
    }
    None
}

#[async_trait]
impl Llm for OpenAiLlm {
    async fn generate(
        &self,
        messages: &[Message],
        options: GenerateOptions,
    ) -> AppResult<GenerateResponse> {
        let resp = self
            .client
            .post(self.chat_url())
            .bearer_auth(&self.api_key)
            .json(&ChatRequest {
                model: &self.model_name,
                messages,
                temperature: options.temperature,
                max_tokens: options.max_tokens,
                stream: false,
            })
            .send()
            .await
            .map_err(|e| AppError::llm(format!("request failed: {e}"), true))?;

        if !resp.status().is_success() {
            let retriable = resp.status().is_server_error();
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(AppError::llm(
                format!("LLM provider returned {status}: {body}"),
                retriable,
            ));
        }

        let parsed: ChatResponse = resp
            .json()
            .await
            .map_err(|e| AppError::llm(format!("malformed LLM response: {e}"), false))?;

        let content = parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .unwrap_or_default();

        let usage = parsed
            .usage
            .map(|u| Usage {
                prompt_tokens: u.prompt_tokens,
                completion_tokens: u.completion_tokens,
                total_tokens: u.total_tokens,
            })
            .unwrap_or_default();

        Ok(GenerateResponse {
            content,
            model: self.model_name.clone(),
            usage,
        })
    }

    async fn stream_generate(
        &self,
        messages: &[Message],
        options: GenerateOptions,
    ) -> AppResult<BoxStream<'static, AppResult<String>>> {
        let resp = self
            .client
            .post(self.chat_url())
            .bearer_auth(&self.api_key)
            .json(&ChatRequest {
                model: &self.model_name,
                messages,
                temperature: options.temperature,
                max_tokens: options.max_tokens,
                stream: true,
            })
            .send()
            .await
            .map_err(|e| AppError::llm(format!("request failed: {e}"), true))?;

        if !resp.status().is_success() {
            let retriable = resp.status().is_server_error();
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(AppError::llm(
                format!("LLM provider returned {status}: {body}"),
                retriable,
            ));
        }

        let mut byte_stream = resp.bytes_stream();
        let state = (String::new(), std::collections::VecDeque::<String>::new());
        let stream = stream::unfold(state, move |(mut buf, mut pending)| {
            let bytes_stream = &mut byte_stream;
            async move {
                loop {
                    if let Some(content) = pending.pop_front() {
                        return Some((Ok(content), (buf, pending)));
                    }
                    for event in drain_sse_events(&mut buf) {
                        if let Some(content) = parse_sse_event(&event) {
                            pending.push_back(content);
                        }
                    }
                    if let Some(content) = pending.pop_front() {
                        return Some((Ok(content), (buf, pending)));
                    }
                    match bytes_stream.next().await {
                        Some(Ok(bytes)) => {
                            buf.push_str(&String::from_utf8_lossy(&bytes));
                        }
                        Some(Err(e)) => {
                            return Some((
                                Err(AppError::llm(format!("stream read failed: {e}"), true)),
                                (buf, pending),
                            ));
                        }
                        None => return None,
                    }
                }
            }
        });
        Ok(stream.boxed())
    }

    fn model_name(&self) -> &str {
        &self.model_name
    }
}
