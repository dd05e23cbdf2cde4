use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::protocol::UnknownFields;

use super::Role;

/// Response body from the Messages API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    /// Unique identifier for this completion.
    pub id: String,

    /// The type of response (always "message" for completions).
    pub r#type: String,

    /// The role of the response (always "assistant").
    pub role: Role,

    /// The content of the response.
    pub content: Vec<ResponseContent>,

    /// The model that generated the response.
    pub model: String,

    /// Stop reason for the completion.
    pub stop_reason: Option<StopReason>,

    /// Stop sequence that caused the model to stop, if any.
    pub stop_sequence: Option<String>,

    /// Token usage statistics.
    pub usage: Usage,

    /// Unknown response fields carried through untouched.
    #[serde(flatten)]
    pub unknown_fields: UnknownFields,
}

/// Content block in a response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResponseContent {
    /// Plain text content.
    Text {
        /// The text content.
        text: String,
    },
    /// Tool invocation requested by the model.
    ToolUse {
        /// Unique identifier for this tool use.
        id: String,
        /// Name of the tool to use.
        name: String,
        /// Input parameters for the tool.
        input: Value,
    },
}

/// The reason why the model stopped generating tokens.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// The model reached a natural stopping point.
    EndTurn,
    /// The generation hit the requested maximum token limit.
    MaxTokens,
    /// The model produced a configured stop sequence.
    StopSequence,
    /// The model invoked a tool.
    ToolUse,
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StopReason::EndTurn => f.write_str("end_turn"),
            StopReason::MaxTokens => f.write_str("max_tokens"),
            StopReason::StopSequence => f.write_str("stop_sequence"),
            StopReason::ToolUse => f.write_str("tool_use"),
        }
    }
}

/// Token usage statistics.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Usage {
    /// Number of input tokens.
    #[serde(default)]
    pub input_tokens: u32,

    /// Number of output tokens.
    #[serde(default)]
    pub output_tokens: u32,
}

/// Error body in the Anthropic wire format.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Always "error".
    pub r#type: String,

    /// Error details.
    pub error: ErrorDetails,
}

impl ErrorBody {
    /// Build the standard error envelope.
    pub fn new(error_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            r#type: "error".to_string(),
            error: ErrorDetails {
                r#type: error_type.into(),
                message: message.into(),
            },
        }
    }
}

/// Error details in the Anthropic wire format.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorDetails {
    /// The type of error that occurred.
    pub r#type: String,

    /// Human-readable error message.
    pub message: String,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn deserialize_tool_use_response() {
        let json = json!({
            "id": "msg_123",
            "type": "message",
            "role": "assistant",
            "content": [
                { "type": "text", "text": "Checking." },
                {
                    "type": "tool_use",
                    "id": "toolu_456",
                    "name": "get_weather",
                    "input": { "location": "Portland, OR" }
                }
            ],
            "model": "qwen-7b",
            "stop_reason": "tool_use",
            "stop_sequence": null,
            "usage": { "input_tokens": 50, "output_tokens": 30 }
        });

        let response: Response = serde_json::from_value(json).unwrap();

        assert_eq!(response.content.len(), 2);
        assert_eq!(response.stop_reason, Some(StopReason::ToolUse));

        let ResponseContent::ToolUse { id, name, input } = &response.content[1] else {
            unreachable!("expected tool use content");
        };
        assert_eq!(id, "toolu_456");
        assert_eq!(name, "get_weather");
        assert_eq!(input["location"], "Portland, OR");
    }
}
