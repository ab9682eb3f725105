use regex::Regex;
use serde::Deserialize;
use std::sync::{Arc, LazyLock};

use crate::error::AppResult;
use crate::llm::{GenerateOptions, Llm, Message};

const REWRITE_PROMPT_TEMPLATE: &str = "You are a query analysis expert.

Given the conversation history and current question, analyze and rewrite the query if needed.

Conversation History:
{history}

Current Question:
{query}

Rules:
1. If the question contains ambiguous references (e.g., \"it\", \"that\", \"this\"), resolve them using conversation history
2. If the question is complex, split it into up to 3 sub-questions
3. If the question is already clear and simple, return it as-is
4. Always respond in the SAME LANGUAGE as the original question

Response Format (JSON only, no markdown):
{{
    \"is_clear\": true/false,
    \"rewritten_queries\": [\"query1\", \"query2\", ...],
    \"clarification_needed\": \"what clarification is needed, or null if not needed\"
}}";

static AMBIGUOUS_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(it|this|that|these|those|the same)\b|그것|이것|저것|같은 것|마찬가지").unwrap()
});

static CODE_FENCE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"```(?:json)?\s*").unwrap());
static BRACE_OBJECT: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\{[^{}]*\}").unwrap());

#[derive(Debug, Clone, Default)]
pub struct RewriteResult {
    pub is_clear: bool,
    pub rewritten_queries: Vec<String>,
    pub clarification_needed: Option<String>,
    pub original_query: String,
}

#[derive(Debug, Deserialize, Default)]
struct RawRewrite {
    #[serde(default = "default_true")]
    is_clear: bool,
    #[serde(default)]
    rewritten_queries: Vec<String>,
    #[serde(default)]
    clarification_needed: Option<String>,
}

fn default_true() -> bool {
    true
}

pub struct QueryRewriter {
    llm: Arc<dyn Llm>,
}

impl QueryRewriter {
    pub fn new(llm: Arc<dyn Llm>) -> Self {
        Self { llm }
    }

    pub async fn rewrite(&self, query: &str, history: &[Message]) -> AppResult<RewriteResult> {
        let history_text = Self::format_history(history);
        let prompt = REWRITE_PROMPT_TEMPLATE
            .replace(
                "{history}",
                if history_text.is_empty() {
                    "(No previous conversation)"
                } else {
                    &history_text
                },
            )
            .replace("{query}", query);

        let response = self
            .llm
            .generate(
                &[Message {
                    role: "user".to_string(),
                    content: prompt,
                }],
                GenerateOptions::default(),
            )
            .await?;

        let parsed = Self::parse_response(&response.content, query);
        Ok(RewriteResult {
            is_clear: parsed.is_clear,
            rewritten_queries: if parsed.rewritten_queries.is_empty() {
                vec![query.to_string()]
            } else {
                parsed.rewritten_queries
            },
            clarification_needed: parsed.clarification_needed,
            original_query: query.to_string(),
        })
    }

    fn format_history(history: &[Message]) -> String {
        history
            .iter()
            .rev()
            .take(6)
            .rev()
            .map(|m| {
                let content = if m.content.chars().count() > 200 {
                    let truncated: String = m.content.chars().take(200).collect();
                    format!("{truncated}...")
                } else {
                    m.content.clone()
                };
                format!("{}: {content}", m.role)
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Tolerant parse: strips code fences, tries whole-body JSON, falls
    /// back to the first brace-delimited fragment, and finally falls back
    /// to treating the raw content as the single rewritten query.
    fn parse_response(content: &str, original_query: &str) -> RawRewrite {
        let trimmed = content.trim();
        let unfenced = if trimmed.starts_with("```") {
            CODE_FENCE.replace(trimmed, "").trim_end_matches('`').trim().to_string()
        } else {
            trimmed.to_string()
        };

        if let Ok(parsed) = serde_json::from_str::<RawRewrite>(&unfenced) {
            return parsed;
        }
        if let Some(m) = BRACE_OBJECT.find(&unfenced) {
            if let Ok(parsed) = serde_json::from_str::<RawRewrite>(m.as_str()) {
                return parsed;
            }
        }

        RawRewrite {
            is_clear: true,
            rewritten_queries: if unfenced.is_empty() {
                Vec::new()
            } else {
                vec![unfenced]
            },
            clarification_needed: None,
        }
        .tap_fallback(original_query)
    }

    /// Cheap pre-check before `rewrite`: only calls the LLM when the query
    /// contains an anaphoric/ambiguous token.
    pub async fn resolve_references(&self, query: &str, history: &[Message]) -> AppResult<String> {
        if history.is_empty() || !AMBIGUOUS_PATTERN.is_match(query) {
            return Ok(query.to_string());
        }
        let result = self.rewrite(query, history).await?;
        Ok(result
            .rewritten_queries
            .into_iter()
            .next()
            .unwrap_or_else(|| query.to_string()))
    }
}

trait TapFallback {
    fn tap_fallback(self, original_query: &str) -> Self;
}

impl TapFallback for RawRewrite {
    fn tap_fallback(mut self, original_query: &str) -> Self {
        if self.rewritten_queries.is_empty() {
            self.rewritten_queries.push(original_query.to_string());
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use futures_util::stream::BoxStream;

    struct FixedLlm {
        content: String,
    }

    #[async_trait]
    impl Llm for FixedLlm {
        async fn generate(&self, _messages: &[Message], _options: GenerateOptions) -> AppResult<crate::llm::GenerateResponse> {
            Ok(crate::llm::GenerateResponse {
                content: self.content.clone(),
                model: "fixed".to_string(),
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
            "fixed"
        }
    }

    #[tokio::test]
    async fn parses_code_fenced_json() {
        let llm = Arc::new(FixedLlm {
            content: "```json\n{\"is_clear\": false, \"rewritten_queries\": [\"a\", \"b\"], \"clarification_needed\": null}\n```".to_string(),
        });
        let rewriter = QueryRewriter::new(llm);
        let result = rewriter.rewrite("it?", &[]).await.unwrap();
        assert!(!result.is_clear);
        assert_eq!(result.rewritten_queries, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn malformed_json_falls_back_to_original_query() {
        let llm = Arc::new(FixedLlm {
            content: "not json at all".to_string(),
        });
        let rewriter = QueryRewriter::new(llm);
        let result = rewriter.rewrite("what is rust?", &[]).await.unwrap();
        assert!(result.is_clear);
        assert_eq!(result.rewritten_queries, vec!["not json at all"]);
    }

    #[tokio::test]
    async fn resolve_references_skips_llm_without_ambiguous_token() {
        let llm = Arc::new(FixedLlm {
            content: "{\"is_clear\": false, \"rewritten_queries\": [\"should not be used\"]}".to_string(),
        });
        let rewriter = QueryRewriter::new(llm);
        let history = vec![Message {
            role: "user".to_string(),
            content: "earlier".to_string(),
        }];
        let resolved = rewriter.resolve_references("what is rust?", &history).await.unwrap();
        assert_eq!(resolved, "what is rust?");
    }

    #[tokio::test]
    async fn resolve_references_invokes_llm_on_ambiguous_token() {
        let llm = Arc::new(FixedLlm {
            content: "{\"is_clear\": true, \"rewritten_queries\": [\"what is rust ownership\"]}".to_string(),
        });
        let rewriter = QueryRewriter::new(llm);
        let history = vec![Message {
            role: "user".to_string(),
            content: "tell me about rust ownership".to_string(),
        }];
        let resolved = rewriter.resolve_references("explain it more", &history).await.unwrap();
        assert_eq!(resolved, "what is rust ownership");
    }

    #[test]
    fn format_history_truncates_long_messages_and_keeps_last_six() {
        let long = "x".repeat(250);
        let history: Vec<Message> = (0..8)
            .map(|i| Message {
                role: "user".to_string(),
                content: if i == 7 { long.clone() } else { format!("msg{i}") },
            })
            .collect();
        let formatted = QueryRewriter::format_history(&history);
        assert!(!formatted.contains("msg0"));
        assert!(formatted.contains("msg2"));
        assert!(formatted.ends_with("..."));
    }
}
