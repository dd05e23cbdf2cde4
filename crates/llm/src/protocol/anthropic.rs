mod request;
mod response;
mod sse;

pub use request::{
    CacheControl, ContentBlock, ImageBlock, InputMessage, MessageContent, Metadata, Request, Role, SystemBlock,
    SystemPrompt, TextBlock, Tool, ToolChoice, ToolResultBlock, ToolUseBlock,
};
pub use response::{ErrorBody, ErrorDetails, Response, ResponseContent, StopReason, Usage};
pub use sse::{ContentDelta, MessageDelta, MessageStart, StreamEvent};
