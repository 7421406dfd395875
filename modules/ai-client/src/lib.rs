mod client;
pub mod error;
pub(crate) mod types;
pub mod util;

pub use error::{AiError, Result};

use std::time::Duration;

use base64::Engine;
use tracing::{debug, warn};

use client::LlmHttpClient;
use types::{ChatRequest, ImageSource, WireMessage};

const STRUCTURED_TOOL: &str = "structured_response";

/// A parsed completion plus the token usage that produced it.
#[derive(Debug, Clone)]
pub struct Completion {
    pub value: serde_json::Value,
    pub input_tokens: u32,
    pub output_tokens: u32,
}

/// Text-LLM client. `complete_json` forces the response through a tool
/// definition carrying the caller's JSON schema, so the returned value is
/// already parsed; a single "return only valid JSON" repair re-prompt runs
/// before giving up.
pub struct TextLlm {
    client: LlmHttpClient,
    model: String,
}

impl TextLlm {
    pub fn new(api_key: &str, model: &str) -> Self {
        Self {
            client: LlmHttpClient::new(api_key, Duration::from_secs(30)),
            model: model.to_string(),
        }
    }

    pub fn with_base_url(mut self, url: &str) -> Self {
        self.client = self.client.with_base_url(url);
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Chat completion returning schema-conforming JSON.
    pub async fn complete_json(
        &self,
        system: &str,
        user: &str,
        schema: serde_json::Value,
    ) -> Result<Completion> {
        let request = ChatRequest::new(&self.model)
            .system(system)
            .message(WireMessage::user(user))
            .temperature(0.0)
            .forced_tool(STRUCTURED_TOOL, schema.clone());

        let response = self.client.chat(&request).await?;
        let usage = response.usage.unwrap_or_default();

        if let Some(input) = response.tool_input() {
            return Ok(Completion {
                value: input.clone(),
                input_tokens: usage.input_tokens,
                output_tokens: usage.output_tokens,
            });
        }

        // Model answered in prose. Try the text as JSON, then repair once.
        if let Some(text) = response.text() {
            if let Ok(value) = serde_json::from_str(util::strip_code_blocks(&text)) {
                return Ok(Completion {
                    value,
                    input_tokens: usage.input_tokens,
                    output_tokens: usage.output_tokens,
                });
            }
            warn!(model = %self.model, "Non-JSON completion, retrying with repair prompt");
            return self.repair(system, user, &text, schema, usage).await;
        }

        Err(AiError::Empty)
    }

    /// One-shot repair: replay the conversation with the malformed answer
    /// and an explicit instruction to return only valid JSON.
    async fn repair(
        &self,
        system: &str,
        user: &str,
        malformed: &str,
        schema: serde_json::Value,
        prior_usage: types::Usage,
    ) -> Result<Completion> {
        let request = ChatRequest::new(&self.model)
            .system(system)
            .message(WireMessage::user(user))
            .message(WireMessage::assistant(malformed))
            .message(WireMessage::user(
                "Return only valid JSON matching the schema. No prose, no code fences.",
            ))
            .temperature(0.0)
            .forced_tool(STRUCTURED_TOOL, schema);

        let response = self.client.chat(&request).await?;
        let usage = response.usage.unwrap_or_default();
        let input_tokens = prior_usage.input_tokens + usage.input_tokens;
        let output_tokens = prior_usage.output_tokens + usage.output_tokens;

        if let Some(input) = response.tool_input() {
            return Ok(Completion {
                value: input.clone(),
                input_tokens,
                output_tokens,
            });
        }
        if let Some(text) = response.text() {
            if let Ok(value) = serde_json::from_str(util::strip_code_blocks(&text)) {
                return Ok(Completion {
                    value,
                    input_tokens,
                    output_tokens,
                });
            }
            return Err(AiError::SchemaMismatch(util::truncate_to_char_boundary(
                &text, 500,
            )
            .to_string()));
        }
        Err(AiError::Empty)
    }
}

/// Vision-LLM client: one or more PNG screenshots plus a prompt, returning
/// schema-conforming JSON through the same forced-tool path.
pub struct VisionLlm {
    client: LlmHttpClient,
    model: String,
}

impl VisionLlm {
    pub fn new(api_key: &str, model: &str) -> Self {
        Self {
            client: LlmHttpClient::new(api_key, Duration::from_secs(60)),
            model: model.to_string(),
        }
    }

    pub fn with_base_url(mut self, url: &str) -> Self {
        self.client = self.client.with_base_url(url);
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub async fn analyze_json(
        &self,
        prompt: &str,
        images: &[Vec<u8>],
        schema: serde_json::Value,
    ) -> Result<Completion> {
        if images.is_empty() {
            return Err(AiError::SchemaMismatch(
                "vision analysis requires at least one image".into(),
            ));
        }

        let sources: Vec<ImageSource> = images
            .iter()
            .map(|bytes| ImageSource {
                source_type: "base64".to_string(),
                media_type: "image/png".to_string(),
                data: base64::engine::general_purpose::STANDARD.encode(bytes),
            })
            .collect();

        debug!(model = %self.model, images = sources.len(), "Vision analysis request");

        let request = ChatRequest::new(&self.model)
            .message(WireMessage::user_with_images(sources, prompt))
            .temperature(0.0)
            .forced_tool(STRUCTURED_TOOL, schema);

        let response = self.client.chat(&request).await?;
        let usage = response.usage.unwrap_or_default();

        response
            .tool_input()
            .map(|input| Completion {
                value: input.clone(),
                input_tokens: usage.input_tokens,
                output_tokens: usage.output_tokens,
            })
            .or_else(|| {
                response.text().and_then(|text| {
                    serde_json::from_str(util::strip_code_blocks(&text))
                        .ok()
                        .map(|value| Completion {
                            value,
                            input_tokens: usage.input_tokens,
                            output_tokens: usage.output_tokens,
                        })
                })
            })
            .ok_or(AiError::Empty)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_llm_holds_model() {
        let llm = TextLlm::new("sk-test", "claude-haiku-4-5-20251001");
        assert_eq!(llm.model(), "claude-haiku-4-5-20251001");
    }

    #[tokio::test]
    async fn vision_requires_images() {
        let llm = VisionLlm::new("sk-test", "claude-haiku-4-5-20251001");
        let err = llm
            .analyze_json("extract", &[], serde_json::json!({"type": "object"}))
            .await
            .unwrap_err();
        assert!(matches!(err, AiError::SchemaMismatch(_)));
    }
}
