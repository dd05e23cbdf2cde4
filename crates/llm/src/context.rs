//! Fits multi-turn conversations into a model's context window through
//! partitioning, tool-result compression, and optional summarization.

use config::ContextConfig;

use crate::error::LlmError;
use crate::protocol::anthropic::{
    ContentBlock, InputMessage, MessageContent, Role, SystemPrompt, TextBlock, Tool, ToolResultBlock,
};
use crate::protocol::UnknownFields;
use crate::tokens;

/// Fallback windows for models whose backend advertises none.
fn default_window(model: &str) -> u32 {
    let model = model.to_ascii_lowercase();

    if model.contains("claude") {
        200_000
    } else if model.contains("llama-3") || model.contains("llama3") {
        128_000
    } else if model.contains("llama") {
        8_192
    } else {
        8_192
    }
}

/// Point-in-time usage report for a conversation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UsageSnapshot {
    /// Total estimated tokens.
    pub tokens: u32,
    /// Total as a percentage of the window.
    pub percent_of_window: f64,
    /// Tokens attributed to conversation messages.
    pub messages_tokens: u32,
    /// Tokens attributed to the system prompt.
    pub system_tokens: u32,
    /// Tokens attributed to tool specifications.
    pub tools_tokens: u32,
}

/// Result of [`ContextManager::manage`].
#[derive(Debug)]
pub struct ManagedConversation {
    /// The conversation to send, possibly reshaped.
    pub messages: Vec<InputMessage>,
    /// Whether any compression was applied.
    pub was_compressed: bool,
}

/// Deterministic summarization of older conversation turns.
pub trait Summarizer: Send + Sync {
    /// Produce a single text summary of the given messages. Must be a pure
    /// function of its input.
    fn summarize(&self, older: &[InputMessage]) -> String;
}

/// Extractive summarizer: the first sentence of every text block, in
/// order. Pure and cheap, which is all the compression path needs.
#[derive(Debug, Default)]
pub struct ExtractiveSummarizer;

impl Summarizer for ExtractiveSummarizer {
    fn summarize(&self, older: &[InputMessage]) -> String {
        let mut sentences = Vec::new();

        for message in older {
            let texts: Vec<&str> = match &message.content {
                MessageContent::Text(text) => vec![text.as_str()],
                MessageContent::Blocks(blocks) => blocks
                    .iter()
                    .filter_map(|block| match block {
                        ContentBlock::Text(text) => Some(text.text.as_str()),
                        _ => None,
                    })
                    .collect(),
            };

            for text in texts {
                let sentence = text
                    .split_inclusive(['.', '!', '?'])
                    .next()
                    .unwrap_or(text)
                    .trim();

                if !sentence.is_empty() {
                    sentences.push(sentence.to_string());
                }
            }
        }

        format!("[Summary of earlier conversation: {}]", sentences.join(" "))
    }
}

/// Keeps a conversation within the model's context window.
pub struct ContextManager {
    config: ContextConfig,
    model: String,
    discovered_window: Option<u32>,
    summarizer: Box<dyn Summarizer>,
}

impl ContextManager {
    /// Create a manager for `model`. Unknown model names are accepted and
    /// fall back to the default window.
    pub fn new(config: ContextConfig, model: impl Into<String>) -> Self {
        Self {
            config,
            model: model.into(),
            discovered_window: None,
            summarizer: Box::new(ExtractiveSummarizer),
        }
    }

    /// Replace the summarizer implementation.
    pub fn with_summarizer(mut self, summarizer: Box<dyn Summarizer>) -> Self {
        self.summarizer = summarizer;
        self
    }

    /// Inject a window discovered from the backend's model advertisement.
    pub fn set_discovered_window(&mut self, window: Option<u32>) {
        self.discovered_window = window;
    }

    /// The effective window: configured override, then the discovered
    /// value, then the per-family fallback.
    pub fn window(&self) -> u32 {
        self.config
            .context_window
            .or(self.discovered_window)
            .unwrap_or_else(|| default_window(&self.model))
    }

    /// Token budget the managed conversation must fit within.
    fn budget(&self) -> u32 {
        (self.window() as f64 * self.config.compress_threshold) as u32
    }

    /// Estimate usage for a conversation.
    pub fn usage(&self, messages: &[InputMessage], system: Option<&SystemPrompt>, tools: &[Tool]) -> UsageSnapshot {
        let messages_tokens: u32 = messages
            .iter()
            .map(|message| tokens::estimate_message(message, &self.model))
            .sum();

        let system_tokens = system
            .map(|system| tokens::estimate_system(system, &self.model))
            .unwrap_or(0);

        let tools_tokens: u32 = tools.iter().map(|tool| tokens::estimate_tool(tool, &self.model)).sum();

        let total = messages_tokens + system_tokens + tools_tokens;

        UsageSnapshot {
            tokens: total,
            percent_of_window: total as f64 / self.window() as f64 * 100.0,
            messages_tokens,
            system_tokens,
            tools_tokens,
        }
    }

    /// Split a conversation into the last `keep_recent_n` messages and the
    /// remainder. Counted per message, not per user/assistant pair.
    pub fn partition(messages: Vec<InputMessage>, keep_recent_n: usize) -> (Vec<InputMessage>, Vec<InputMessage>) {
        if messages.len() <= keep_recent_n {
            return (Vec::new(), messages);
        }

        let split_at = messages.len() - keep_recent_n;
        let mut older = messages;
        let recent = older.split_off(split_at);

        (older, recent)
    }

    /// Truncate a tool result to fit `max_tokens`, appending a marker with
    /// the original and new sizes. Content at or under budget is returned
    /// verbatim.
    pub fn compress_tool_result(&self, content: &str, max_tokens: u32) -> String {
        let original_tokens = tokens::estimate_text(content, &self.model);

        if original_tokens <= max_tokens {
            return content.to_string();
        }

        let keep_chars = (content.chars().count() * max_tokens as usize) / original_tokens as usize;
        let prefix: String = content.chars().take(keep_chars).collect();
        let new_tokens = tokens::estimate_text(&prefix, &self.model);

        format!("{prefix}[... Output truncated: {original_tokens} → {new_tokens} tokens]")
    }

    /// Reshape `messages` so the conversation fits the compression budget.
    ///
    /// Under the threshold the input is returned unchanged. Over it, older
    /// messages get their tool results compressed and, when enabled, are
    /// replaced by a single summary block. If the result still exceeds the
    /// budget, the overflow is reported rather than silently truncated.
    pub fn manage(
        &self,
        messages: Vec<InputMessage>,
        system: Option<&SystemPrompt>,
        tools: &[Tool],
    ) -> Result<ManagedConversation, LlmError> {
        if messages.is_empty() {
            return Ok(ManagedConversation {
                messages,
                was_compressed: false,
            });
        }

        let usage = self.usage(&messages, system, tools);
        let budget = self.budget();

        if usage.tokens <= budget {
            return Ok(ManagedConversation {
                messages,
                was_compressed: false,
            });
        }

        log::debug!(
            "Conversation at {} tokens ({:.1}% of window) exceeds budget {budget}, compressing",
            usage.tokens,
            usage.percent_of_window
        );

        let (older, recent) = Self::partition(messages, self.config.keep_recent_messages);

        let older: Vec<InputMessage> = older
            .into_iter()
            .map(|message| self.compress_message(message))
            .collect();

        let mut managed = if self.config.enable_summarization && !older.is_empty() {
            let summary = self.summarizer.summarize(&older);
            vec![InputMessage {
                role: Role::User,
                content: MessageContent::Blocks(vec![ContentBlock::Text(TextBlock {
                    text: summary,
                    cache_control: None,
                    unknown_fields: UnknownFields::default(),
                })]),
                unknown_fields: UnknownFields::default(),
            }]
        } else {
            older
        };

        managed.extend(recent);

        let usage = self.usage(&managed, system, tools);
        if usage.tokens > budget {
            return Err(LlmError::ContextOverflow {
                tokens: usage.tokens,
                budget,
            });
        }

        Ok(ManagedConversation {
            messages: managed,
            was_compressed: true,
        })
    }

    fn compress_message(&self, mut message: InputMessage) -> InputMessage {
        let MessageContent::Blocks(blocks) = message.content else {
            return message;
        };

        let blocks = blocks
            .into_iter()
            .map(|block| match block {
                ContentBlock::ToolResult(result) => ContentBlock::ToolResult(self.compress_tool_result_block(result)),
                other => other,
            })
            .collect();

        message.content = MessageContent::Blocks(blocks);
        message
    }

    fn compress_tool_result_block(&self, mut block: ToolResultBlock) -> ToolResultBlock {
        let Some(content) = &block.content else {
            return block;
        };

        let text = tokens::tool_result_text(content);
        let compressed = self.compress_tool_result(&text, self.config.tool_result_max_tokens);

        if compressed != text {
            block.content = Some(serde_json::Value::String(compressed));
        }

        block
    }
}
