//! Anthropic-edge to chat-completions request translation.

use serde::Serialize;
use serde_json::Value;

use crate::protocol::anthropic::{
    ContentBlock, MessageContent, Request, Role, SystemPrompt, ToolChoice,
};
use crate::tokens::tool_result_text;

/// Chat-completions request body.
#[derive(Debug, Serialize)]
pub(crate) struct OpenAiRequest {
    pub model: String,
    pub messages: Vec<OpenAiMessage>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop: Option<Vec<String>>,

    pub stream: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream_options: Option<StreamOptions>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<OpenAiTool>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<Value>,
}

#[derive(Debug, Serialize)]
pub(crate) struct StreamOptions {
    pub include_usage: bool,
}

#[derive(Debug, Serialize)]
pub(crate) struct OpenAiMessage {
    pub role: &'static str,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<OpenAiToolCall>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub(crate) struct OpenAiToolCall {
    pub id: String,
    pub r#type: &'static str,
    pub function: OpenAiFunctionCall,
}

#[derive(Debug, Serialize)]
pub(crate) struct OpenAiFunctionCall {
    pub name: String,
    pub arguments: String,
}

#[derive(Debug, Serialize)]
pub(crate) struct OpenAiTool {
    pub r#type: &'static str,
    pub function: OpenAiFunctionDef,
}

#[derive(Debug, Serialize)]
pub(crate) struct OpenAiFunctionDef {
    pub name: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    pub parameters: Value,
}

impl OpenAiRequest {
    /// Translate an edge request. `stream` is decided by the caller, not
    /// the client's own flag.
    pub(crate) fn from_request(request: Request, stream: bool) -> Self {
        let mut messages = Vec::with_capacity(request.messages.len() + 1);

        if let Some(system) = &request.system {
            let text = system_text(system);
            if !text.is_empty() {
                messages.push(OpenAiMessage {
                    role: "system",
                    content: Some(text),
                    tool_calls: None,
                    tool_call_id: None,
                });
            }
        }

        for message in request.messages {
            convert_message(message.role, message.content, &mut messages);
        }

        let tools = request.tools.map(|tools| {
            tools
                .into_iter()
                .map(|tool| OpenAiTool {
                    r#type: "function",
                    function: OpenAiFunctionDef {
                        name: tool.name,
                        description: tool.description,
                        parameters: tool.input_schema,
                    },
                })
                .collect()
        });

        Self {
            model: request.model,
            messages,
            max_tokens: Some(request.max_tokens),
            temperature: request.temperature,
            top_p: request.top_p,
            stop: request.stop_sequences,
            stream,
            stream_options: stream.then_some(StreamOptions { include_usage: true }),
            tools,
            tool_choice: request.tool_choice.map(convert_tool_choice),
        }
    }
}

fn system_text(system: &SystemPrompt) -> String {
    match system {
        SystemPrompt::Text(text) => text.clone(),
        SystemPrompt::Blocks(blocks) => blocks
            .iter()
            .filter_map(|block| match block {
                crate::protocol::anthropic::SystemBlock::Text(text) => Some(text.text.as_str()),
                crate::protocol::anthropic::SystemBlock::Unknown(_) => None,
            })
            .collect::<Vec<_>>()
            .join("\n"),
    }
}

/// Tool results become their own `tool`-role messages; everything else in
/// the turn is flattened into one message for that role.
fn convert_message(role: Role, content: MessageContent, out: &mut Vec<OpenAiMessage>) {
    let role_str = match role {
        Role::Assistant => "assistant",
        _ => "user",
    };

    match content {
        MessageContent::Text(text) => out.push(OpenAiMessage {
            role: role_str,
            content: Some(text),
            tool_calls: None,
            tool_call_id: None,
        }),
        MessageContent::Blocks(blocks) => {
            let mut texts = Vec::new();
            let mut tool_calls = Vec::new();

            for block in blocks {
                match block {
                    ContentBlock::Text(text) => texts.push(text.text),
                    ContentBlock::ToolUse(tool_use) => tool_calls.push(OpenAiToolCall {
                        id: tool_use.id,
                        r#type: "function",
                        function: OpenAiFunctionCall {
                            name: tool_use.name,
                            arguments: tool_use.input.to_string(),
                        },
                    }),
                    ContentBlock::ToolResult(result) => {
                        let content = result.content.as_ref().map(tool_result_text).unwrap_or_default();
                        out.push(OpenAiMessage {
                            role: "tool",
                            content: Some(content),
                            tool_calls: None,
                            tool_call_id: Some(result.tool_use_id),
                        });
                    }
                    // Images and unknown blocks have no chat-completions
                    // equivalent in this dialect.
                    ContentBlock::Image(_) | ContentBlock::Unknown(_) => {}
                }
            }

            if !texts.is_empty() || !tool_calls.is_empty() {
                out.push(OpenAiMessage {
                    role: role_str,
                    content: (!texts.is_empty()).then(|| texts.join("\n")),
                    tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
                    tool_call_id: None,
                });
            }
        }
    }
}

fn convert_tool_choice(choice: ToolChoice) -> Value {
    match choice {
        ToolChoice::Auto => Value::String("auto".to_string()),
        ToolChoice::Any => Value::String("required".to_string()),
        ToolChoice::Tool { name } => serde_json::json!({
            "type": "function",
            "function": { "name": name },
        }),
        ToolChoice::Unknown(value) => value,
    }
}
