//! Streaming engine: producer events, tool-call reassembly, and the
//! transcoder that re-frames producer streams into the Anthropic SSE shape.

mod source;
mod tracker;
mod transcoder;

pub use source::{FinishReason, SourceEvent, SourceEventStream, StreamUsage};
pub use tracker::ToolCallTracker;
pub use transcoder::{TranscodeOptions, strip_marker_tokens, transcode};
