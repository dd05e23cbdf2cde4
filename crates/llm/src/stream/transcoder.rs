//! Re-frames a producer event stream into the Anthropic SSE event shape.

use std::collections::{HashMap, HashSet, VecDeque};

use futures::{StreamExt, stream::BoxStream};

use crate::protocol::anthropic::{
    ContentDelta, MessageDelta, MessageStart, ResponseContent, Role, StreamEvent, Usage,
};
use crate::stream::source::{SourceEvent, SourceEventStream, StreamUsage};
use crate::stream::tracker::{ToolCallTracker, TrackedEmission};

/// End-of-turn marker tokens stripped from text deltas. Exact,
/// case-sensitive matches only.
const END_OF_TURN_MARKERS: [&str; 5] = ["<|im_end|>", "<|endoftext|>", "</s>", "<|eot_id|>", "<|end_of_text|>"];

/// Client-side web-search tool names dropped when stripping is enabled,
/// compared case-folded.
const WEB_SEARCH_TOOLS: [&str; 2] = ["websearch", "web_search"];

/// Per-request options for the transcoder.
#[derive(Debug, Clone)]
pub struct TranscodeOptions {
    /// Model name echoed in the message envelope.
    pub model: String,
    /// Message id to use; generated when absent.
    pub message_id: Option<String>,
    /// Discard client-side web-search tool invocations entirely.
    pub strip_web_search: bool,
}

/// Remove end-of-turn marker tokens from a text fragment.
///
/// Runs to a fixpoint so that stripping is idempotent even when a removal
/// would expose a new marker.
pub fn strip_marker_tokens(text: &str) -> String {
    let mut current = text.to_string();

    loop {
        let mut next = current.clone();
        for marker in END_OF_TURN_MARKERS {
            next = next.replace(marker, "");
        }

        if next == current {
            return next;
        }
        current = next;
    }
}

fn is_web_search_tool(name: &str) -> bool {
    let folded = name.to_lowercase();
    WEB_SEARCH_TOOLS.contains(&folded.as_str())
}

/// Convert a producer event stream into the client-edge SSE event sequence.
///
/// Events are emitted in strict producer order; a terminal `message_stop`
/// is guaranteed even when the producer terminates without a final event.
/// Dropping the returned stream drops the producer stream with it.
pub fn transcode(source: SourceEventStream, options: TranscodeOptions) -> BoxStream<'static, StreamEvent> {
    let state = TranscoderState::new(source, options);

    futures::stream::unfold(state, |mut state| async move {
        loop {
            if let Some(event) = state.queue.pop_front() {
                return Some((event, state));
            }

            if state.done {
                return None;
            }

            match state.source.next().await {
                Some(Ok(event)) => state.handle(event),
                Some(Err(error)) => {
                    log::warn!("Producer stream failed mid-response, truncating cleanly: {error}");
                    state.flush();
                }
                None => state.flush(),
            }
        }
    })
    .boxed()
}

struct TranscoderState {
    source: SourceEventStream,
    queue: VecDeque<StreamEvent>,
    tracker: ToolCallTracker,
    strip_web_search: bool,
    next_index: u32,
    open_text_index: Option<u32>,
    tool_indices: HashMap<String, u32>,
    stripped_tool_ids: HashSet<String>,
    usage: StreamUsage,
    finish_emitted: bool,
    done: bool,
}

impl TranscoderState {
    fn new(source: SourceEventStream, options: TranscodeOptions) -> Self {
        let message_id = options
            .message_id
            .unwrap_or_else(|| format!("msg_{}", uuid::Uuid::new_v4().simple()));

        let mut queue = VecDeque::new();
        queue.push_back(StreamEvent::MessageStart {
            message: MessageStart {
                id: message_id,
                r#type: "message".to_string(),
                role: Role::Assistant,
                content: Vec::new(),
                model: options.model,
                usage: Usage::default(),
            },
        });

        Self {
            source,
            queue,
            tracker: ToolCallTracker::new(),
            strip_web_search: options.strip_web_search,
            next_index: 0,
            open_text_index: None,
            tool_indices: HashMap::new(),
            stripped_tool_ids: HashSet::new(),
            usage: StreamUsage::default(),
            finish_emitted: false,
            done: false,
        }
    }

    fn handle(&mut self, event: SourceEvent) {
        if self.done {
            return;
        }

        match event {
            SourceEvent::StepStart => {}
            SourceEvent::TextStart => self.open_text_block(),
            SourceEvent::TextDelta(text) => {
                let text = strip_marker_tokens(&text);
                if text.is_empty() {
                    return;
                }

                if self.open_text_index.is_none() {
                    self.open_text_block();
                }

                let index = self.open_text_index.unwrap_or_default();
                self.queue.push_back(StreamEvent::ContentBlockDelta {
                    index,
                    delta: ContentDelta::TextDelta { text },
                });
            }
            SourceEvent::TextEnd => self.close_text_block(),
            SourceEvent::ToolInputStart { id, name } => {
                if self.strip_web_search && is_web_search_tool(&name) {
                    self.stripped_tool_ids.insert(id);
                    return;
                }

                self.close_text_block();
                let emissions = self.tracker.input_start(&id, &name);
                self.apply(emissions);
            }
            SourceEvent::ToolInputDelta { id, fragment } => {
                if self.stripped_tool_ids.contains(&id) {
                    return;
                }

                let emissions = self.tracker.input_delta(&id, &fragment);
                self.apply(emissions);
            }
            SourceEvent::ToolInputEnd { id } => {
                if self.stripped_tool_ids.contains(&id) {
                    return;
                }

                let emissions = self.tracker.input_end(&id);
                self.apply(emissions);
            }
            SourceEvent::ToolCall { id, name, input } => {
                if self.stripped_tool_ids.contains(&id) {
                    return;
                }

                if self.strip_web_search && is_web_search_tool(&name) {
                    self.stripped_tool_ids.insert(id);
                    return;
                }

                self.close_text_block();
                let emissions = self.tracker.whole_call(&id, &name, &input);
                self.apply(emissions);
            }
            SourceEvent::StepFinish { reason, usage } => {
                self.close_text_block();
                self.usage = usage;

                if !self.finish_emitted {
                    self.finish_emitted = true;
                    self.queue.push_back(StreamEvent::MessageDelta {
                        delta: MessageDelta {
                            stop_reason: Some(reason.stop_reason()),
                            stop_sequence: None,
                        },
                        usage: Usage {
                            input_tokens: usage.input_tokens,
                            output_tokens: usage.output_tokens,
                        },
                    });
                }
            }
            SourceEvent::Finish => self.flush(),
        }
    }

    fn apply(&mut self, emissions: Vec<TrackedEmission>) {
        for emission in emissions {
            match emission {
                TrackedEmission::Start { id, name } => {
                    let index = self.next_index;
                    self.next_index += 1;
                    self.tool_indices.insert(id.clone(), index);

                    self.queue.push_back(StreamEvent::ContentBlockStart {
                        index,
                        content_block: ResponseContent::ToolUse {
                            id,
                            name,
                            input: serde_json::json!({}),
                        },
                    });
                }
                TrackedEmission::Delta { id, partial_json } => {
                    let Some(&index) = self.tool_indices.get(&id) else {
                        continue;
                    };

                    self.queue.push_back(StreamEvent::ContentBlockDelta {
                        index,
                        delta: ContentDelta::InputJsonDelta { partial_json },
                    });
                }
                TrackedEmission::Stop { id } => {
                    let Some(&index) = self.tool_indices.get(&id) else {
                        continue;
                    };

                    self.queue.push_back(StreamEvent::ContentBlockStop { index });
                }
            }
        }
    }

    fn open_text_block(&mut self) {
        if self.open_text_index.is_some() {
            return;
        }

        let index = self.next_index;
        self.next_index += 1;
        self.open_text_index = Some(index);

        self.queue.push_back(StreamEvent::ContentBlockStart {
            index,
            content_block: ResponseContent::Text { text: String::new() },
        });
    }

    fn close_text_block(&mut self) {
        if let Some(index) = self.open_text_index.take() {
            self.queue.push_back(StreamEvent::ContentBlockStop { index });
        }
    }

    /// End-of-stream fallback: close anything still open and guarantee the
    /// terminal `message_delta`/`message_stop` pair.
    fn flush(&mut self) {
        if self.done {
            return;
        }

        self.close_text_block();
        let emissions = self.tracker.finish();
        self.apply(emissions);

        if !self.finish_emitted {
            self.finish_emitted = true;
            self.queue.push_back(StreamEvent::MessageDelta {
                delta: MessageDelta {
                    stop_reason: Some(crate::protocol::anthropic::StopReason::EndTurn),
                    stop_sequence: None,
                },
                usage: Usage {
                    input_tokens: self.usage.input_tokens,
                    output_tokens: self.usage.output_tokens,
                },
            });
        }

        self.queue.push_back(StreamEvent::MessageStop);
        self.done = true;
    }
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;
    use serde_json::json;

    use crate::error::LlmError;
    use crate::stream::source::FinishReason;

    use super::*;

    fn options() -> TranscodeOptions {
        TranscodeOptions {
            model: "qwen-7b".to_string(),
            message_id: Some("msg_test".to_string()),
            strip_web_search: false,
        }
    }

    fn source(events: Vec<SourceEvent>) -> SourceEventStream {
        futures::stream::iter(events.into_iter().map(Ok)).boxed()
    }

    async fn run(events: Vec<SourceEvent>, options: TranscodeOptions) -> Vec<StreamEvent> {
        transcode(source(events), options).collect().await
    }

    fn text_of(events: &[StreamEvent]) -> String {
        events
            .iter()
            .filter_map(|event| match event {
                StreamEvent::ContentBlockDelta {
                    delta: ContentDelta::TextDelta { text },
                    ..
                } => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn normal_text_stream_produces_full_event_sequence() {
        let events = run(
            vec![
                SourceEvent::StepStart,
                SourceEvent::TextStart,
                SourceEvent::TextDelta("Hello, ".to_string()),
                SourceEvent::TextDelta("world!".to_string()),
                SourceEvent::TextEnd,
                SourceEvent::StepFinish {
                    reason: FinishReason::Stop,
                    usage: StreamUsage {
                        input_tokens: 5,
                        output_tokens: 10,
                    },
                },
                SourceEvent::Finish,
            ],
            options(),
        )
        .await;

        assert!(matches!(events[0], StreamEvent::MessageStart { .. }));
        assert!(matches!(
            events[1],
            StreamEvent::ContentBlockStart {
                index: 0,
                content_block: ResponseContent::Text { .. }
            }
        ));
        assert_eq!(text_of(&events), "Hello, world!");
        assert!(matches!(events[4], StreamEvent::ContentBlockStop { index: 0 }));

        let StreamEvent::MessageDelta { delta, usage } = &events[5] else {
            unreachable!("expected message_delta, got {:?}", events[5]);
        };
        assert_eq!(delta.stop_reason, Some(crate::protocol::anthropic::StopReason::EndTurn));
        assert_eq!(usage.input_tokens, 5);
        assert_eq!(usage.output_tokens, 10);

        assert_eq!(events.last(), Some(&StreamEvent::MessageStop));
        assert_eq!(events.len(), 7);
    }

    #[tokio::test]
    async fn degenerate_tool_stream_yields_one_lifecycle() {
        let events = run(
            vec![
                SourceEvent::ToolInputStart {
                    id: "call_456".to_string(),
                    name: "Read".to_string(),
                },
                SourceEvent::ToolInputEnd {
                    id: "call_456".to_string(),
                },
                SourceEvent::ToolCall {
                    id: "call_456".to_string(),
                    name: "Read".to_string(),
                    input: json!({ "file_path": "/x" }),
                },
                SourceEvent::ToolCall {
                    id: "call_456".to_string(),
                    name: "Read".to_string(),
                    input: json!({ "file_path": "/x" }),
                },
                SourceEvent::Finish,
            ],
            options(),
        )
        .await;

        let starts: Vec<_> = events
            .iter()
            .filter(|event| matches!(event, StreamEvent::ContentBlockStart { .. }))
            .collect();
        assert_eq!(starts.len(), 1);

        let StreamEvent::ContentBlockStart {
            content_block: ResponseContent::ToolUse { id, name, .. },
            ..
        } = starts[0]
        else {
            unreachable!("expected tool_use block start");
        };
        assert_eq!(id, "call_456");
        assert_eq!(name, "Read");

        let deltas: Vec<_> = events
            .iter()
            .filter_map(|event| match event {
                StreamEvent::ContentBlockDelta {
                    delta: ContentDelta::InputJsonDelta { partial_json },
                    ..
                } => Some(partial_json.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(deltas, vec![r#"{"file_path":"/x"}"#]);

        let stops = events
            .iter()
            .filter(|event| matches!(event, StreamEvent::ContentBlockStop { .. }))
            .count();
        assert_eq!(stops, 1);
    }

    #[tokio::test]
    async fn truncated_stream_still_emits_message_stop() {
        let events = run(
            vec![
                SourceEvent::StepStart,
                SourceEvent::TextStart,
                SourceEvent::TextDelta("Test".to_string()),
                SourceEvent::TextEnd,
            ],
            options(),
        )
        .await;

        assert_eq!(text_of(&events), "Test");
        assert_eq!(events.last(), Some(&StreamEvent::MessageStop));
    }

    #[tokio::test]
    async fn producer_error_truncates_cleanly() {
        let stream = futures::stream::iter(vec![
            Ok(SourceEvent::TextStart),
            Ok(SourceEvent::TextDelta("partial".to_string())),
            Err(LlmError::Protocol("truncated chunk".to_string())),
        ])
        .boxed();

        let events: Vec<_> = transcode(stream, options()).collect().await;

        assert_eq!(text_of(&events), "partial");
        assert_eq!(events.last(), Some(&StreamEvent::MessageStop));
    }

    #[tokio::test]
    async fn pending_tool_entry_is_closed_at_stream_end() {
        let events = run(
            vec![
                SourceEvent::ToolInputStart {
                    id: "call_1".to_string(),
                    name: "Bash".to_string(),
                },
                SourceEvent::ToolInputDelta {
                    id: "call_1".to_string(),
                    fragment: r#"{"command":"ls"}"#.to_string(),
                },
            ],
            options(),
        )
        .await;

        let stops = events
            .iter()
            .filter(|event| matches!(event, StreamEvent::ContentBlockStop { .. }))
            .count();
        assert_eq!(stops, 1, "pending tool block must be closed: {events:?}");
        assert_eq!(events.last(), Some(&StreamEvent::MessageStop));
    }

    #[tokio::test]
    async fn marker_tokens_are_stripped_from_text() {
        let events = run(
            vec![
                SourceEvent::TextStart,
                SourceEvent::TextDelta("Hello<|im_end|>".to_string()),
                SourceEvent::TextDelta("</s>".to_string()),
                SourceEvent::TextEnd,
                SourceEvent::Finish,
            ],
            options(),
        )
        .await;

        assert_eq!(text_of(&events), "Hello");

        // A delta that strips to nothing emits no event at all.
        let delta_count = events
            .iter()
            .filter(|event| matches!(event, StreamEvent::ContentBlockDelta { .. }))
            .count();
        assert_eq!(delta_count, 1);
    }

    #[test]
    fn marker_stripping_is_idempotent() {
        let inputs = [
            "plain text",
            "trailing<|im_end|>",
            "<|eot_id|>leading",
            "nested<|im_<|im_end|>end|>marker",
            "</s></s></s>",
        ];

        for input in inputs {
            let once = strip_marker_tokens(input);
            let twice = strip_marker_tokens(&once);
            assert_eq!(once, twice, "stripping must be idempotent for {input:?}");
        }
    }

    #[test]
    fn marker_matching_is_case_sensitive() {
        assert_eq!(strip_marker_tokens("<|IM_END|>"), "<|IM_END|>");
        assert_eq!(strip_marker_tokens("<|im_end|>"), "");
    }

    #[tokio::test]
    async fn web_search_tools_are_stripped_without_opening_blocks() {
        let stripping = TranscodeOptions {
            strip_web_search: true,
            ..options()
        };

        let events = run(
            vec![
                SourceEvent::ToolInputStart {
                    id: "call_ws".to_string(),
                    name: "WebSearch".to_string(),
                },
                SourceEvent::ToolInputDelta {
                    id: "call_ws".to_string(),
                    fragment: r#"{"query":"rust"}"#.to_string(),
                },
                SourceEvent::ToolInputEnd {
                    id: "call_ws".to_string(),
                },
                SourceEvent::ToolCall {
                    id: "call_ws".to_string(),
                    name: "WebSearch".to_string(),
                    input: json!({ "query": "rust" }),
                },
                SourceEvent::TextStart,
                SourceEvent::TextDelta("answer".to_string()),
                SourceEvent::TextEnd,
                SourceEvent::Finish,
            ],
            stripping,
        )
        .await;

        let tool_blocks = events
            .iter()
            .filter(|event| {
                matches!(
                    event,
                    StreamEvent::ContentBlockStart {
                        content_block: ResponseContent::ToolUse { .. },
                        ..
                    }
                )
            })
            .count();
        assert_eq!(tool_blocks, 0);
        assert_eq!(text_of(&events), "answer");
    }

    #[tokio::test]
    async fn text_without_text_start_synthesizes_a_block() {
        let events = run(
            vec![SourceEvent::TextDelta("orphan".to_string()), SourceEvent::Finish],
            options(),
        )
        .await;

        assert!(matches!(
            events[1],
            StreamEvent::ContentBlockStart {
                index: 0,
                content_block: ResponseContent::Text { .. }
            }
        ));
        assert_eq!(text_of(&events), "orphan");
    }

    #[tokio::test]
    async fn tool_use_finish_reason_is_forwarded() {
        let events = run(
            vec![
                SourceEvent::ToolCall {
                    id: "call_1".to_string(),
                    name: "Read".to_string(),
                    input: json!({ "file_path": "/tmp/a" }),
                },
                SourceEvent::StepFinish {
                    reason: FinishReason::ToolCalls,
                    usage: StreamUsage::default(),
                },
                SourceEvent::Finish,
            ],
            options(),
        )
        .await;

        let StreamEvent::MessageDelta { delta, .. } = events
            .iter()
            .find(|event| matches!(event, StreamEvent::MessageDelta { .. }))
            .unwrap()
        else {
            unreachable!();
        };
        assert_eq!(delta.stop_reason, Some(crate::protocol::anthropic::StopReason::ToolUse));
    }
}
