use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::errors::{OrchestratorError, StepError};

/// Current API version
const ANTHROPIC_VERSION: &str = "2023-06-01";

// ── Message model ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        is_error: bool,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: Vec<ContentBlock>,
}

impl Message {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: vec![ContentBlock::Text { text: text.into() }],
        }
    }

    pub fn assistant(content: Vec<ContentBlock>) -> Self {
        Self {
            role: Role::Assistant,
            content,
        }
    }

    pub fn tool_results(content: Vec<ContentBlock>) -> Self {
        Self {
            role: Role::User,
            content,
        }
    }
}

/// A tool call emitted by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub input: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    ToolCalls,
    Length,
    Other,
}

impl FinishReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stop => "stop",
            Self::ToolCalls => "tool_calls",
            Self::Length => "length",
            Self::Other => "other",
        }
    }

    /// Map an Anthropic `stop_reason`.
    pub fn from_stop_reason(reason: Option<&str>) -> Self {
        match reason {
            Some("end_turn") | Some("stop_sequence") | None => Self::Stop,
            Some("tool_use") => Self::ToolCalls,
            Some("max_tokens") => Self::Length,
            Some(_) => Self::Other,
        }
    }
}

impl std::fmt::Display for FinishReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelRequest {
    pub model: String,
    pub system: String,
    pub messages: Vec<Message>,
    pub tools: Vec<ToolDefinition>,
    pub max_tokens: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelResponse {
    pub content: Vec<ContentBlock>,
    pub finish_reason: FinishReason,
    #[serde(default)]
    pub usage: Usage,
}

impl ModelResponse {
    /// A plain text reply that ends the loop.
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content: vec![ContentBlock::Text { text: text.into() }],
            finish_reason: FinishReason::Stop,
            usage: Usage::default(),
        }
    }

    /// A reply that asks for the given tool calls, in order.
    pub fn tool_calls(calls: Vec<ToolCall>) -> Self {
        Self {
            content: calls
                .into_iter()
                .map(|c| ContentBlock::ToolUse {
                    id: c.id,
                    name: c.name,
                    input: c.input,
                })
                .collect(),
            finish_reason: FinishReason::ToolCalls,
            usage: Usage::default(),
        }
    }

    /// Concatenated text blocks.
    pub fn output_text(&self) -> String {
        self.content
            .iter()
            .filter_map(|b| match b {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Tool calls in emission order.
    pub fn calls(&self) -> Vec<ToolCall> {
        self.content
            .iter()
            .filter_map(|b| match b {
                ContentBlock::ToolUse { id, name, input } => Some(ToolCall {
                    id: id.clone(),
                    name: name.clone(),
                    input: input.clone(),
                }),
                _ => None,
            })
            .collect()
    }
}

/// One model call. Implementations must be stateless across calls.
#[async_trait]
pub trait ModelClient: Send + Sync {
    async fn generate(&self, request: &ModelRequest) -> Result<ModelResponse>;
}

// ── Anthropic Messages API ───────────────────────────────────────────

pub struct AnthropicClient {
    client: reqwest::Client,
    api_base: String,
    api_key: String,
}

impl AnthropicClient {
    pub fn new(api_base: &str, api_key: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_base: api_base.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        }
    }

    /// Build from `ANTHROPIC_API_KEY`.
    pub fn from_env(api_base: &str) -> Result<Self> {
        let key = std::env::var("ANTHROPIC_API_KEY")
            .map_err(|_| OrchestratorError::MissingEnv("ANTHROPIC_API_KEY"))?;
        Ok(Self::new(api_base, &key))
    }

    fn build_request_body(request: &ModelRequest) -> serde_json::Value {
        let mut body = serde_json::json!({
            "model": request.model,
            "max_tokens": request.max_tokens,
            "messages": request.messages,
        });
        if !request.system.is_empty() {
            body["system"] = serde_json::json!(request.system);
        }
        if !request.tools.is_empty() {
            body["tools"] = serde_json::json!(request.tools);
        }
        body
    }

    fn parse_response(response: MessagesResponse) -> ModelResponse {
        // Block types this client does not model (thinking, etc.) are dropped.
        let content = response
            .content
            .into_iter()
            .filter_map(|block| serde_json::from_value::<ContentBlock>(block).ok())
            .collect();
        ModelResponse {
            content,
            finish_reason: FinishReason::from_stop_reason(response.stop_reason.as_deref()),
            usage: Usage {
                input_tokens: response.usage.input_tokens,
                output_tokens: response.usage.output_tokens,
            },
        }
    }
}

#[async_trait]
impl ModelClient for AnthropicClient {
    async fn generate(&self, request: &ModelRequest) -> Result<ModelResponse> {
        let response = self
            .client
            .post(format!("{}/v1/messages", self.api_base))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("content-type", "application/json")
            .json(&Self::build_request_body(request))
            .send()
            .await
            .map_err(|e| StepError::Transient(format!("model request failed: {}", e)))?;

        let status = response.status();
        let body_text = response
            .text()
            .await
            .map_err(|e| StepError::Transient(format!("model response read failed: {}", e)))?;

        // 529 is Anthropic's "overloaded".
        if status.is_server_error()
            || status == reqwest::StatusCode::TOO_MANY_REQUESTS
            || status.as_u16() == 529
        {
            return Err(StepError::Transient(format!("model API returned {}", status)).into());
        }
        if !status.is_success() {
            anyhow::bail!("model API returned {}: {}", status, body_text);
        }

        let parsed: MessagesResponse =
            serde_json::from_str(&body_text).context("Failed to parse model response")?;
        Ok(Self::parse_response(parsed))
    }
}

/// Messages API response body
#[derive(Debug, Deserialize)]
struct MessagesResponse {
    content: Vec<serde_json::Value>,
    stop_reason: Option<String>,
    usage: ResponseUsage,
}

#[derive(Debug, Deserialize)]
struct ResponseUsage {
    input_tokens: u64,
    output_tokens: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stop_reason_mapping() {
        assert_eq!(FinishReason::from_stop_reason(Some("end_turn")), FinishReason::Stop);
        assert_eq!(
            FinishReason::from_stop_reason(Some("stop_sequence")),
            FinishReason::Stop
        );
        assert_eq!(
            FinishReason::from_stop_reason(Some("tool_use")),
            FinishReason::ToolCalls
        );
        assert_eq!(
            FinishReason::from_stop_reason(Some("max_tokens")),
            FinishReason::Length
        );
        assert_eq!(FinishReason::from_stop_reason(Some("refusal")), FinishReason::Other);
    }

    #[test]
    fn test_message_wire_format() {
        let msg = Message::tool_results(vec![ContentBlock::ToolResult {
            tool_use_id: "t1".into(),
            content: "{}".into(),
            is_error: false,
        }]);
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["role"], "user");
        assert_eq!(json["content"][0]["type"], "tool_result");
        assert_eq!(json["content"][0]["tool_use_id"], "t1");
        assert!(json["content"][0].get("is_error").is_none());
    }

    #[test]
    fn test_request_body_includes_tools_and_system() {
        let request = ModelRequest {
            model: "claude-sonnet-4-5".into(),
            system: "be brief".into(),
            messages: vec![Message::user("hi")],
            tools: vec![ToolDefinition {
                name: "read_file".into(),
                description: "Read".into(),
                input_schema: serde_json::json!({"type": "object"}),
            }],
            max_tokens: 1024,
        };
        let body = AnthropicClient::build_request_body(&request);
        assert_eq!(body["system"], "be brief");
        assert_eq!(body["tools"][0]["name"], "read_file");
        assert_eq!(body["messages"][0]["content"][0]["text"], "hi");
    }

    #[test]
    fn test_parse_response_skips_unknown_blocks() {
        let raw: MessagesResponse = serde_json::from_value(serde_json::json!({
            "content": [
                {"type": "thinking", "thinking": "hmm"},
                {"type": "text", "text": "Looking"},
                {"type": "tool_use", "id": "t1", "name": "glob", "input": {"pattern": "*"}}
            ],
            "stop_reason": "tool_use",
            "usage": {"input_tokens": 10, "output_tokens": 5}
        }))
        .unwrap();
        let response = AnthropicClient::parse_response(raw);
        assert_eq!(response.finish_reason, FinishReason::ToolCalls);
        assert_eq!(response.output_text(), "Looking");
        assert_eq!(response.calls().len(), 1);
        assert_eq!(response.usage.output_tokens, 5);
    }
}
