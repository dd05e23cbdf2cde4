use futures::stream::BoxStream;
use serde_json::Value;

use crate::error::LlmError;
use crate::protocol::anthropic::StopReason;

/// Producer-side events decoded from a backend stream.
///
/// Every backend dialect is parsed down to this shape so one transcoder
/// serves them all.
#[derive(Debug, Clone, PartialEq)]
pub enum SourceEvent {
    /// A generation step began.
    StepStart,
    /// A text segment is opening.
    TextStart,
    /// A text fragment.
    TextDelta(String),
    /// The current text segment is complete.
    TextEnd,
    /// A streamed tool invocation is opening.
    ToolInputStart {
        /// Producer-assigned call id.
        id: String,
        /// Tool name.
        name: String,
    },
    /// A fragment of the tool invocation's JSON arguments.
    ToolInputDelta {
        /// Producer-assigned call id.
        id: String,
        /// Partial JSON fragment.
        fragment: String,
    },
    /// The streamed tool invocation arguments are complete.
    ToolInputEnd {
        /// Producer-assigned call id.
        id: String,
    },
    /// A whole tool invocation delivered in one event, possibly repeating
    /// an earlier streamed one.
    ToolCall {
        /// Producer-assigned call id.
        id: String,
        /// Tool name.
        name: String,
        /// Complete input object.
        input: Value,
    },
    /// The generation step finished with a reason and usage counters.
    StepFinish {
        /// Why generation stopped.
        reason: FinishReason,
        /// Token usage for the step.
        usage: StreamUsage,
    },
    /// The producer stream is complete.
    Finish,
}

/// Why a producer finished generating.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    /// Natural end of turn.
    Stop,
    /// Output token limit reached.
    Length,
    /// The model invoked tools.
    ToolCalls,
}

impl FinishReason {
    /// Map to the client-edge stop reason.
    pub fn stop_reason(self) -> StopReason {
        match self {
            FinishReason::Stop => StopReason::EndTurn,
            FinishReason::Length => StopReason::MaxTokens,
            FinishReason::ToolCalls => StopReason::ToolUse,
        }
    }

    /// Parse an OpenAI-style finish_reason string.
    pub fn parse(raw: &str) -> FinishReason {
        match raw {
            "length" => FinishReason::Length,
            "tool_calls" | "function_call" => FinishReason::ToolCalls,
            _ => FinishReason::Stop,
        }
    }
}

/// Usage counters reported by a producer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamUsage {
    /// Prompt tokens consumed.
    pub input_tokens: u32,
    /// Completion tokens produced.
    pub output_tokens: u32,
}

/// A fallible stream of producer events.
pub type SourceEventStream = BoxStream<'static, Result<SourceEvent, LlmError>>;
