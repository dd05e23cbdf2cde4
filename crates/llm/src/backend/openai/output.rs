//! Chat-completions response parsing into edge types and producer events.

use std::collections::HashMap;

use serde::Deserialize;

use crate::protocol::anthropic::{Response, ResponseContent, Role, StopReason, Usage};
use crate::protocol::UnknownFields;
use crate::stream::{FinishReason, SourceEvent, StreamUsage, strip_marker_tokens};

/// Non-streaming chat-completions response body.
#[derive(Debug, Deserialize)]
pub(crate) struct OpenAiResponse {
    #[serde(default)]
    pub id: Option<String>,
    pub choices: Vec<OpenAiChoice>,
    #[serde(default)]
    pub usage: Option<OpenAiUsage>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct OpenAiChoice {
    pub message: OpenAiChoiceMessage,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct OpenAiChoiceMessage {
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub tool_calls: Option<Vec<OpenAiToolCallOut>>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct OpenAiToolCallOut {
    pub id: String,
    pub function: OpenAiFunctionOut,
}

#[derive(Debug, Deserialize)]
pub(crate) struct OpenAiFunctionOut {
    pub name: String,
    #[serde(default)]
    pub arguments: String,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub(crate) struct OpenAiUsage {
    #[serde(default)]
    pub prompt_tokens: u32,
    #[serde(default)]
    pub completion_tokens: u32,
}

impl OpenAiResponse {
    /// Assemble the edge-dialect response for a non-streaming call.
    pub(crate) fn into_response(self, model: &str) -> Response {
        let mut content = Vec::new();
        let mut stop_reason = None;

        if let Some(choice) = self.choices.into_iter().next() {
            if let Some(text) = choice.message.content {
                let text = strip_marker_tokens(&text);
                if !text.is_empty() {
                    content.push(ResponseContent::Text { text });
                }
            }

            for call in choice.message.tool_calls.unwrap_or_default() {
                let input = serde_json::from_str(&call.function.arguments)
                    .unwrap_or(serde_json::Value::String(call.function.arguments));

                content.push(ResponseContent::ToolUse {
                    id: call.id,
                    name: call.function.name,
                    input,
                });
            }

            stop_reason = choice
                .finish_reason
                .as_deref()
                .map(|reason| FinishReason::parse(reason).stop_reason());
        }

        // tool_use wins over whatever the wire said when calls are present.
        if content.iter().any(|block| matches!(block, ResponseContent::ToolUse { .. })) {
            stop_reason = Some(StopReason::ToolUse);
        }

        Response {
            id: self
                .id
                .unwrap_or_else(|| format!("msg_{}", uuid::Uuid::new_v4().simple())),
            r#type: "message".to_string(),
            role: Role::Assistant,
            content,
            model: model.to_string(),
            stop_reason,
            stop_sequence: None,
            usage: self
                .usage
                .map(|usage| Usage {
                    input_tokens: usage.prompt_tokens,
                    output_tokens: usage.completion_tokens,
                })
                .unwrap_or_default(),
            unknown_fields: UnknownFields::default(),
        }
    }
}

/// One SSE chunk of a streaming chat-completions response.
#[derive(Debug, Deserialize)]
pub(crate) struct OpenAiStreamChunk {
    #[serde(default)]
    pub choices: Vec<OpenAiStreamChoice>,
    #[serde(default)]
    pub usage: Option<OpenAiUsage>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct OpenAiStreamChoice {
    #[serde(default)]
    pub delta: OpenAiDelta,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct OpenAiDelta {
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub tool_calls: Option<Vec<OpenAiDeltaToolCall>>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct OpenAiDeltaToolCall {
    #[serde(default)]
    pub index: u32,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub function: Option<OpenAiDeltaFunction>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct OpenAiDeltaFunction {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub arguments: Option<String>,
}

/// Stateful conversion of chat-completions chunks into producer events.
///
/// Tracks open text and tool-call state so the transcoder downstream sees
/// properly bracketed start/delta/end sequences.
#[derive(Debug, Default)]
pub(crate) struct ChunkAdapter {
    text_open: bool,
    /// chat-completions tool index -> call id, in first-seen order.
    tool_ids: HashMap<u32, String>,
    open_order: Vec<u32>,
    usage: StreamUsage,
    finished: bool,
}

impl ChunkAdapter {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn handle(&mut self, chunk: OpenAiStreamChunk) -> Vec<SourceEvent> {
        let mut events = Vec::new();

        if let Some(usage) = chunk.usage {
            self.usage = StreamUsage {
                input_tokens: usage.prompt_tokens,
                output_tokens: usage.completion_tokens,
            };
        }

        for choice in chunk.choices {
            if let Some(text) = choice.delta.content
                && !text.is_empty()
            {
                if !self.text_open {
                    self.text_open = true;
                    events.push(SourceEvent::TextStart);
                }
                events.push(SourceEvent::TextDelta(text));
            }

            for call in choice.delta.tool_calls.unwrap_or_default() {
                self.handle_tool_delta(call, &mut events);
            }

            if let Some(reason) = choice.finish_reason.as_deref()
                && !self.finished
            {
                self.finished = true;
                self.close_open_blocks(&mut events);
                events.push(SourceEvent::StepFinish {
                    reason: FinishReason::parse(reason),
                    usage: self.usage,
                });
            }
        }

        events
    }

    /// Late usage chunks arrive after finish_reason; fold them into the
    /// final step event at stream end when that happened.
    pub(crate) fn usage(&self) -> StreamUsage {
        self.usage
    }

    pub(crate) fn finished(&self) -> bool {
        self.finished
    }

    fn handle_tool_delta(&mut self, call: OpenAiDeltaToolCall, events: &mut Vec<SourceEvent>) {
        if !self.tool_ids.contains_key(&call.index) {
            let Some(function) = &call.function else {
                return;
            };
            let Some(name) = function.name.clone() else {
                return;
            };

            let id = call
                .id
                .clone()
                .unwrap_or_else(|| format!("call_{}", uuid::Uuid::new_v4().simple()));

            if self.text_open {
                self.text_open = false;
                events.push(SourceEvent::TextEnd);
            }

            self.tool_ids.insert(call.index, id.clone());
            self.open_order.push(call.index);
            events.push(SourceEvent::ToolInputStart { id, name });
        }

        if let Some(fragment) = call.function.and_then(|function| function.arguments)
            && !fragment.is_empty()
            && let Some(id) = self.tool_ids.get(&call.index)
        {
            events.push(SourceEvent::ToolInputDelta {
                id: id.clone(),
                fragment,
            });
        }
    }

    fn close_open_blocks(&mut self, events: &mut Vec<SourceEvent>) {
        if self.text_open {
            self.text_open = false;
            events.push(SourceEvent::TextEnd);
        }

        for index in self.open_order.drain(..) {
            if let Some(id) = self.tool_ids.get(&index) {
                events.push(SourceEvent::ToolInputEnd { id: id.clone() });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn chunk(value: serde_json::Value) -> OpenAiStreamChunk {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn text_chunks_bracket_with_start_and_end() {
        let mut adapter = ChunkAdapter::new();

        let first = adapter.handle(chunk(json!({
            "choices": [{ "delta": { "content": "Hel" } }],
        })));
        assert_eq!(
            first,
            vec![SourceEvent::TextStart, SourceEvent::TextDelta("Hel".into())]
        );

        let second = adapter.handle(chunk(json!({
            "choices": [{ "delta": { "content": "lo" } }],
        })));
        assert_eq!(second, vec![SourceEvent::TextDelta("lo".into())]);

        let last = adapter.handle(chunk(json!({
            "choices": [{ "delta": {}, "finish_reason": "stop" }],
            "usage": { "prompt_tokens": 5, "completion_tokens": 10 },
        })));
        assert_eq!(
            last,
            vec![
                SourceEvent::TextEnd,
                SourceEvent::StepFinish {
                    reason: FinishReason::Stop,
                    usage: StreamUsage {
                        input_tokens: 5,
                        output_tokens: 10,
                    },
                },
            ]
        );
    }

    #[test]
    fn fragmented_tool_calls_stream_as_deltas() {
        let mut adapter = ChunkAdapter::new();

        let start = adapter.handle(chunk(json!({
            "choices": [{
                "delta": {
                    "tool_calls": [{
                        "index": 0,
                        "id": "call_1",
                        "function": { "name": "Read", "arguments": "" },
                    }],
                },
            }],
        })));
        assert_eq!(
            start,
            vec![SourceEvent::ToolInputStart {
                id: "call_1".into(),
                name: "Read".into(),
            }]
        );

        let fragment = adapter.handle(chunk(json!({
            "choices": [{
                "delta": {
                    "tool_calls": [{ "index": 0, "function": { "arguments": "{\"file" } }],
                },
            }],
        })));
        assert_eq!(
            fragment,
            vec![SourceEvent::ToolInputDelta {
                id: "call_1".into(),
                fragment: "{\"file".into(),
            }]
        );

        let finish = adapter.handle(chunk(json!({
            "choices": [{ "delta": {}, "finish_reason": "tool_calls" }],
        })));
        assert_eq!(
            finish,
            vec![
                SourceEvent::ToolInputEnd { id: "call_1".into() },
                SourceEvent::StepFinish {
                    reason: FinishReason::ToolCalls,
                    usage: StreamUsage::default(),
                },
            ]
        );
    }

    #[test]
    fn tool_call_without_id_gets_a_generated_one() {
        let mut adapter = ChunkAdapter::new();

        let events = adapter.handle(chunk(json!({
            "choices": [{
                "delta": {
                    "tool_calls": [{ "index": 0, "function": { "name": "Bash" } }],
                },
            }],
        })));

        let SourceEvent::ToolInputStart { id, name } = &events[0] else {
            unreachable!("expected tool input start");
        };
        assert_eq!(name, "Bash");
        assert!(id.starts_with("call_"));
    }

    #[test]
    fn non_streaming_response_assembles_content_blocks() {
        let response: OpenAiResponse = serde_json::from_value(json!({
            "id": "chatcmpl-1",
            "choices": [{
                "message": {
                    "content": "Checking.</s>",
                    "tool_calls": [{
                        "id": "call_2",
                        "type": "function",
                        "function": { "name": "Read", "arguments": "{\"file_path\":\"/x\"}" },
                    }],
                },
                "finish_reason": "stop",
            }],
            "usage": { "prompt_tokens": 7, "completion_tokens": 3 },
        }))
        .unwrap();

        let response = response.into_response("qwen-7b");

        assert_eq!(response.content.len(), 2);
        assert!(matches!(&response.content[0], ResponseContent::Text { text } if text == "Checking."));
        assert!(matches!(&response.content[1], ResponseContent::ToolUse { name, .. } if name == "Read"));
        assert_eq!(response.stop_reason, Some(StopReason::ToolUse));
        assert_eq!(response.usage.input_tokens, 7);
    }

    #[test]
    fn unparseable_arguments_fall_back_to_a_string() {
        let response: OpenAiResponse = serde_json::from_value(json!({
            "choices": [{
                "message": {
                    "tool_calls": [{
                        "id": "call_3",
                        "function": { "name": "Bash", "arguments": "not json" },
                    }],
                },
                "finish_reason": "tool_calls",
            }],
        }))
        .unwrap();

        let response = response.into_response("qwen-7b");

        let ResponseContent::ToolUse { input, .. } = &response.content[0] else {
            unreachable!("expected tool_use");
        };
        assert_eq!(input, &serde_json::Value::String("not json".into()));
    }
}
