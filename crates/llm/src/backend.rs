//! Backend clients translating the Anthropic edge dialect into each
//! upstream's own and back.

pub mod claude;
pub mod openai;

use async_trait::async_trait;

use crate::error::Result;
use crate::protocol::anthropic::{Request, Response};
use crate::stream::SourceEventStream;

pub use claude::ClaudeBackend;
pub use openai::OpenAiCompatBackend;

/// A dispatchable upstream.
///
/// Implementations consult their circuit breaker before dispatching and
/// record success latency or failure after each call.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Stable backend name used in logs and circuit errors.
    fn name(&self) -> &str;

    /// Non-streaming completion.
    async fn chat(&self, request: Request) -> Result<Response>;

    /// Streaming completion, returning producer events for the transcoder.
    async fn chat_stream(&self, request: Request) -> Result<SourceEventStream>;

    /// Ask the backend for the model's context window, when advertised.
    async fn discover_context_window(&self, model: &str) -> Option<u32>;
}

/// Strip a trailing `/v1` segment (and trailing slashes) from a base URL.
pub fn normalize_base_url(raw: &str) -> String {
    let trimmed = raw.trim_end_matches('/');
    trimmed.strip_suffix("/v1").unwrap_or(trimmed).to_string()
}

/// Extract a context window from a model advertisement entry.
///
/// The first recognized field present wins: `loaded_context_length`, then
/// `context_length`, then `max_context_length`. The value is accepted only
/// when it is a finite positive integer; strings, zero, negatives, and
/// fractional numbers yield `None`.
pub fn context_window_from(entry: &serde_json::Value) -> Option<u32> {
    const FIELDS: [&str; 3] = ["loaded_context_length", "context_length", "max_context_length"];

    for field in FIELDS {
        let Some(value) = entry.get(field) else {
            continue;
        };

        return value
            .as_u64()
            .filter(|&window| window > 0 && window <= u64::from(u32::MAX))
            .map(|window| window as u32);
    }

    None
}
