use serde::{Deserialize, Serialize};

use super::{ErrorDetails, ResponseContent, Role, StopReason, Usage};

/// Server-sent event surface emitted on the client edge.
///
/// Each serialized value maps to a concrete SSE `event:` name. Streams
/// begin with [`StreamEvent::MessageStart`], emit one or more content block
/// lifecycles (`content_block_start` -> `content_block_delta*` ->
/// `content_block_stop`), carry a [`StreamEvent::MessageDelta`] with the
/// stop reason and usage, and always finish with a terminal
/// [`StreamEvent::MessageStop`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    /// Announces the streamed message and its metadata.
    MessageStart {
        /// The initial message envelope.
        message: MessageStart,
    },

    /// Signals the start of a content block at `index`.
    ContentBlockStart {
        /// Index used by subsequent delta and stop events.
        index: u32,
        /// The content block being started.
        content_block: ResponseContent,
    },

    /// Incremental update for the referenced block.
    ContentBlockDelta {
        /// Index of the block being updated.
        index: u32,
        /// The delta payload.
        delta: ContentDelta,
    },

    /// Marks the end of updates for the indexed block.
    ContentBlockStop {
        /// Index of the block being closed.
        index: u32,
    },

    /// Carries the stop reason and cumulative usage.
    MessageDelta {
        /// Top-level message changes.
        delta: MessageDelta,
        /// Cumulative usage counters.
        usage: Usage,
    },

    /// No further events will be emitted for the stream.
    MessageStop,

    /// Heartbeat holding the connection open past intermediary timeouts.
    Ping,

    /// Recoverable error surfaced without tearing down the connection.
    Error {
        /// The error that occurred.
        error: ErrorDetails,
    },
}

impl StreamEvent {
    /// The SSE `event:` name this value serializes under.
    pub fn name(&self) -> &'static str {
        match self {
            StreamEvent::MessageStart { .. } => "message_start",
            StreamEvent::ContentBlockStart { .. } => "content_block_start",
            StreamEvent::ContentBlockDelta { .. } => "content_block_delta",
            StreamEvent::ContentBlockStop { .. } => "content_block_stop",
            StreamEvent::MessageDelta { .. } => "message_delta",
            StreamEvent::MessageStop => "message_stop",
            StreamEvent::Ping => "ping",
            StreamEvent::Error { .. } => "error",
        }
    }
}

/// Envelope provided with the initial `message_start` event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MessageStart {
    /// Identifier of the streamed message.
    pub id: String,

    /// Always "message".
    pub r#type: String,

    /// Always the assistant role.
    pub role: Role,

    /// Content blocks observed at stream start, normally empty.
    pub content: Vec<ResponseContent>,

    /// Model emitting the streamed response.
    pub model: String,

    /// Usage snapshot captured at stream start.
    pub usage: Usage,
}

/// Delta payloads for content blocks.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentDelta {
    /// Streaming text for a text block.
    TextDelta {
        /// Additional text content.
        text: String,
    },
    /// Partial JSON for a tool_use block's input.
    InputJsonDelta {
        /// Partial JSON string fragment.
        partial_json: String,
    },
}

/// Top-level message changes carried by `message_delta`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MessageDelta {
    /// Stop reason once the message is complete.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<StopReason>,

    /// Stop sequence if one was encountered.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_sequence: Option<String>,
}
