use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::protocol::UnknownFields;

/// Request body for the Anthropic Messages API.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Request {
    /// The model that will complete the prompt.
    pub model: String,
    /// Conversation turns supplied to the Messages API.
    pub messages: Vec<InputMessage>,
    /// Maximum output tokens the backend may generate.
    pub max_tokens: u32,

    /// System prompt providing global instructions for the assistant.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<SystemPrompt>,

    /// Sampling temperature controlling randomness.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,

    /// Probability mass cutoff used for nucleus sampling.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,

    /// Top-K sampling limit that constrains candidate tokens.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,

    /// Custom strings that cause generation to stop when produced.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_sequences: Option<Vec<String>>,

    /// When true, deliver a Server-Sent Events stream instead of a single body.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,

    /// Optional metadata describing the end user.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,

    /// Tool specifications the model may call during this request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<Tool>>,

    /// Directive controlling if and how the model must use tools.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<ToolChoice>,

    /// Additional undocumented fields preserved for forward compatibility.
    #[serde(flatten)]
    pub unknown_fields: UnknownFields,
}

/// System prompt payload accepted by the Messages API.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum SystemPrompt {
    /// Plain-text system prompt.
    Text(String),
    /// Structured system prompt comprised of content blocks.
    Blocks(Vec<SystemBlock>),
}

impl SystemPrompt {
    /// Normalize to the block form: a string becomes a single text block
    /// without a cache marker.
    pub fn normalized(&self) -> Vec<SystemBlock> {
        match self {
            SystemPrompt::Text(text) => vec![SystemBlock::Text(TextBlock {
                text: text.clone(),
                cache_control: None,
                unknown_fields: UnknownFields::default(),
            })],
            SystemPrompt::Blocks(blocks) => blocks.clone(),
        }
    }
}

/// A single system prompt block.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SystemBlock {
    /// A text block, optionally cache-marked.
    Text(TextBlock),
    /// Unrecognized block shapes carried through untouched.
    #[serde(untagged)]
    Unknown(Value),
}

/// A single input message provided to the Messages API.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct InputMessage {
    /// Originating role for the message turn.
    pub role: Role,
    /// Message body provided as text or structured blocks.
    pub content: MessageContent,

    /// Extra message fields passed through untouched.
    #[serde(flatten)]
    pub unknown_fields: UnknownFields,
}

/// Supported message roles.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    #[serde(untagged)]
    Unknown(String),
}

/// Message content may be provided as a raw string or as structured blocks.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

/// Structured content blocks accepted by the Messages API.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text(TextBlock),
    Image(ImageBlock),
    ToolUse(ToolUseBlock),
    ToolResult(ToolResultBlock),
    #[serde(untagged)]
    Unknown(Value),
}

impl ContentBlock {
    /// The block's cache-control annotation, when its shape carries one.
    pub fn cache_control(&self) -> Option<&CacheControl> {
        match self {
            ContentBlock::Text(block) => block.cache_control.as_ref(),
            ContentBlock::Image(block) => block.cache_control.as_ref(),
            ContentBlock::ToolUse(block) => block.cache_control.as_ref(),
            ContentBlock::ToolResult(block) => block.cache_control.as_ref(),
            ContentBlock::Unknown(_) => None,
        }
    }
}

/// Text content supplied to the API.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TextBlock {
    /// Raw text body for the content block.
    pub text: String,

    /// Optional cache-control hints attached to the block.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_control: Option<CacheControl>,

    /// Additional fields retained for forward compatibility.
    #[serde(flatten)]
    pub unknown_fields: UnknownFields,
}

/// Image content block.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ImageBlock {
    /// Image source descriptor (base64 or URL reference).
    pub source: Value,

    /// Optional cache-control hints attached to the block.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_control: Option<CacheControl>,

    /// Additional unknown properties carried through untouched.
    #[serde(flatten)]
    pub unknown_fields: UnknownFields,
}

/// Tool use block replayed by the caller in conversation history.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ToolUseBlock {
    /// Unique identifier referencing the tool use.
    pub id: String,

    /// Name of the tool being invoked.
    pub name: String,

    /// Tool input payload.
    pub input: Value,

    /// Optional cache-control hints associated with the block.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_control: Option<CacheControl>,

    /// Additional unknown fields preserved verbatim.
    #[serde(flatten)]
    pub unknown_fields: UnknownFields,
}

/// Tool result block describing the outcome of a tool invocation.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ToolResultBlock {
    /// Identifier of the tool use this result corresponds to.
    pub tool_use_id: String,

    /// Optional content returned by the tool (string or block array).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<Value>,

    /// Indicates whether the tool invocation failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_error: Option<bool>,

    /// Optional cache-control configuration for the result.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_control: Option<CacheControl>,

    /// Unknown fields retained for schema-forward compatibility.
    #[serde(flatten)]
    pub unknown_fields: UnknownFields,
}

/// Cache-control hints attached to a content block.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CacheControl {
    Ephemeral {
        /// Unspecified cache-control properties retained verbatim.
        #[serde(flatten)]
        unknown_fields: UnknownFields,
    },
    #[serde(untagged)]
    Unknown(Value),
}

impl CacheControl {
    /// Only ephemeral markers count toward caching decisions.
    pub fn is_ephemeral(&self) -> bool {
        matches!(self, CacheControl::Ephemeral { .. })
    }
}

/// Optional metadata forwarded with the request.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Metadata {
    /// External identifier for the end user associated with this request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,

    /// Additional metadata keys retained for compatibility.
    #[serde(flatten)]
    pub unknown_fields: UnknownFields,
}

/// Tool specification the model may call.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Tool {
    /// The name of the tool.
    pub name: String,

    /// Description of what the tool does.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// JSON Schema for the tool's input parameters.
    pub input_schema: Value,

    /// Unknown tool fields carried through untouched.
    #[serde(flatten)]
    pub unknown_fields: UnknownFields,
}

/// Directive controlling how the model uses tools.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ToolChoice {
    /// Let the model decide whether to use tools.
    Auto,
    /// Force the model to use any available tool.
    Any,
    /// Force the model to use a specific tool.
    Tool {
        /// The name of the tool to use.
        name: String,
    },
    #[serde(untagged)]
    Unknown(Value),
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn deserialize_string_content_and_blocks() {
        let request: Request = serde_json::from_value(json!({
            "model": "qwen-7b",
            "max_tokens": 512,
            "messages": [
                { "role": "user", "content": "hello" },
                { "role": "assistant", "content": [{ "type": "text", "text": "hi" }] },
            ],
        }))
        .unwrap();

        assert!(matches!(request.messages[0].content, MessageContent::Text(_)));
        assert!(matches!(request.messages[1].content, MessageContent::Blocks(_)));
        assert_eq!(request.messages[0].role, Role::User);
    }

    #[test]
    fn string_system_prompt_normalizes_to_one_block() {
        let system = SystemPrompt::Text("be terse".to_string());
        let blocks = system.normalized();

        assert_eq!(blocks.len(), 1);
        let SystemBlock::Text(block) = &blocks[0] else {
            unreachable!("expected text block");
        };
        assert_eq!(block.text, "be terse");
        assert!(block.cache_control.is_none());
    }

    #[test]
    fn cache_control_roundtrips_with_unknown_mode() {
        let ephemeral: CacheControl = serde_json::from_value(json!({ "type": "ephemeral" })).unwrap();
        assert!(ephemeral.is_ephemeral());

        let unknown: CacheControl = serde_json::from_value(json!({ "type": "sticky" })).unwrap();
        assert!(!unknown.is_ephemeral());
    }

    #[test]
    fn unknown_request_fields_survive_roundtrip() {
        let input = json!({
            "model": "m",
            "max_tokens": 16,
            "messages": [],
            "some_future_field": { "nested": true },
        });

        let request: Request = serde_json::from_value(input.clone()).unwrap();
        let output = serde_json::to_value(&request).unwrap();

        assert_eq!(output["some_future_field"], input["some_future_field"]);
    }

    #[test]
    fn unrecognized_content_block_is_preserved() {
        let message: InputMessage = serde_json::from_value(json!({
            "role": "user",
            "content": [{ "type": "video", "frames": 3 }],
        }))
        .unwrap();

        let MessageContent::Blocks(blocks) = &message.content else {
            unreachable!("expected blocks");
        };
        assert!(matches!(blocks[0], ContentBlock::Unknown(_)));
    }
}
