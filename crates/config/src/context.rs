//! Context window management settings.

use serde::Deserialize;

/// Context window management settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ContextConfig {
    /// Fraction of the context window at which compression starts.
    pub compress_threshold: f64,
    /// Number of most recent messages kept verbatim during compression.
    pub keep_recent_messages: usize,
    /// Token budget for an individual tool result before truncation.
    pub tool_result_max_tokens: u32,
    /// Replace older history with a single summary block when compressing.
    pub enable_summarization: bool,
    /// Fixed context window override. When unset the window is discovered
    /// from the backend, falling back to per-family defaults.
    pub context_window: Option<u32>,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            compress_threshold: 0.85,
            keep_recent_messages: 5,
            tool_result_max_tokens: 500,
            enable_summarization: false,
            context_window: None,
        }
    }
}
