//! Passthrough client for the upstream Anthropic API.
//!
//! Requests are already in the right dialect; the interesting work is
//! re-parsing the upstream SSE stream into producer events so the same
//! transcoder path serves every backend.

use std::collections::HashMap;
use std::time::Instant;

use async_trait::async_trait;
use circuit_breaker::CircuitBreaker;
use eventsource_stream::Eventsource;
use futures::StreamExt;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};

use crate::backend::{Backend, normalize_base_url};
use crate::error::{LlmError, Result, transport_error};
use crate::http_client::http_client;
use crate::protocol::anthropic::{
    ContentDelta, Request, Response, ResponseContent, StopReason, StreamEvent,
};
use crate::stream::{FinishReason, SourceEvent, SourceEventStream, StreamUsage};

const DEFAULT_ANTHROPIC_API_URL: &str = "https://api.anthropic.com";
const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Client for the upstream Anthropic Messages API.
pub struct ClaudeBackend {
    client: Client,
    base_url: String,
    api_key: Option<SecretString>,
    breaker: CircuitBreaker,
}

impl ClaudeBackend {
    /// Create the upstream client. `base_url` defaults to the public API.
    pub fn new(base_url: Option<&str>, api_key: Option<SecretString>, breaker: CircuitBreaker) -> Self {
        Self {
            client: http_client(),
            base_url: normalize_base_url(base_url.unwrap_or(DEFAULT_ANTHROPIC_API_URL)),
            api_key,
            breaker,
        }
    }

    fn guard(&self) -> Result<()> {
        if self.breaker.can_execute() {
            Ok(())
        } else {
            Err(LlmError::CircuitOpen {
                backend: "claude".to_string(),
            })
        }
    }

    fn record_outcome<T>(&self, result: &Result<T>, started: Instant) {
        match result {
            Ok(_) => {
                self.breaker.record_success();
                self.breaker
                    .record_latency(started.elapsed().as_millis().min(u128::from(u64::MAX)) as u64);
            }
            Err(error) if error.counts_as_backend_failure() => self.breaker.record_failure(),
            Err(_) => {}
        }
    }

    async fn send(&self, request: &Request, stream: bool) -> Result<reqwest::Response> {
        let url = format!("{}/v1/messages", self.base_url);

        let mut body = serde_json::to_value(request)
            .map_err(|e| LlmError::Internal(Some(format!("failed to serialize request: {e}"))))?;
        body["stream"] = serde_json::Value::Bool(stream);

        let mut builder = self
            .client
            .post(&url)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&body);

        if let Some(key) = &self.api_key {
            builder = builder.header("x-api-key", key.expose_secret());
        }

        let response = builder.send().await.map_err(transport_error)?;
        let status = response.status();

        if status.is_success() {
            return Ok(response);
        }

        let retry_after = response
            .headers()
            .get(http::header::RETRY_AFTER)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.trim().parse::<u64>().ok());

        let message = response.text().await.unwrap_or_else(|_| "Unknown error".to_string());
        log::error!("Anthropic API error ({status}): {message}");

        Err(LlmError::Upstream {
            status: status.as_u16(),
            message,
            retry_after: retry_after.filter(|_| status.as_u16() == 429),
        })
    }
}

#[async_trait]
impl Backend for ClaudeBackend {
    fn name(&self) -> &str {
        "claude"
    }

    async fn chat(&self, request: Request) -> Result<Response> {
        self.guard()?;
        let started = Instant::now();

        let result = async {
            let response = self.send(&request, false).await?;
            let body = response.text().await.map_err(transport_error)?;

            serde_json::from_str::<Response>(&body).map_err(|e| {
                log::error!("Failed to parse Anthropic response: {e}");
                LlmError::Protocol(format!("unparseable messages response: {e}"))
            })
        }
        .await;

        self.record_outcome(&result, started);
        result
    }

    async fn chat_stream(&self, request: Request) -> Result<SourceEventStream> {
        self.guard()?;
        let started = Instant::now();

        let result = self.send(&request, true).await;
        self.record_outcome(&result, started);
        let response = result?;

        let events = response.bytes_stream().eventsource().boxed();
        let adapter = UpstreamAdapter::default();

        let stream = futures::stream::unfold(
            (events, adapter, false),
            |(mut events, mut adapter, mut done)| async move {
                loop {
                    if done {
                        return None;
                    }

                    match events.next().await {
                        Some(Ok(event)) => {
                            let Ok(upstream) = serde_json::from_str::<StreamEvent>(&event.data) else {
                                log::warn!("Skipping unparseable upstream stream event");
                                continue;
                            };

                            let emitted = adapter.handle(upstream);
                            if adapter.done {
                                done = true;
                            }

                            if emitted.is_empty() {
                                continue;
                            }

                            return Some((
                                emitted.into_iter().map(Ok).collect::<Vec<_>>(),
                                (events, adapter, done),
                            ));
                        }
                        Some(Err(error)) => {
                            done = true;
                            let error = LlmError::Protocol(format!("upstream stream failed: {error}"));
                            return Some((vec![Err(error)], (events, adapter, done)));
                        }
                        None => {
                            done = true;
                            return Some((vec![Ok(SourceEvent::Finish)], (events, adapter, done)));
                        }
                    }
                }
            },
        )
        .flat_map(futures::stream::iter);

        Ok(stream.boxed())
    }

    async fn discover_context_window(&self, _model: &str) -> Option<u32> {
        // The upstream API does not advertise context lengths; callers
        // fall back to configured defaults.
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum BlockKind {
    Text,
    Tool,
}

/// Converts upstream Anthropic SSE events into producer events.
#[derive(Debug, Default)]
struct UpstreamAdapter {
    blocks: HashMap<u32, (BlockKind, Option<String>)>,
    usage: StreamUsage,
    done: bool,
}

impl UpstreamAdapter {
    fn handle(&mut self, event: StreamEvent) -> Vec<SourceEvent> {
        match event {
            StreamEvent::MessageStart { message } => {
                self.usage.input_tokens = message.usage.input_tokens;
                vec![SourceEvent::StepStart]
            }
            StreamEvent::ContentBlockStart { index, content_block } => match content_block {
                ResponseContent::Text { .. } => {
                    self.blocks.insert(index, (BlockKind::Text, None));
                    vec![SourceEvent::TextStart]
                }
                ResponseContent::ToolUse { id, name, .. } => {
                    self.blocks.insert(index, (BlockKind::Tool, Some(id.clone())));
                    vec![SourceEvent::ToolInputStart { id, name }]
                }
            },
            StreamEvent::ContentBlockDelta { index, delta } => match delta {
                ContentDelta::TextDelta { text } => vec![SourceEvent::TextDelta(text)],
                ContentDelta::InputJsonDelta { partial_json } => {
                    let Some((_, Some(id))) = self.blocks.get(&index) else {
                        return Vec::new();
                    };
                    vec![SourceEvent::ToolInputDelta {
                        id: id.clone(),
                        fragment: partial_json,
                    }]
                }
            },
            StreamEvent::ContentBlockStop { index } => match self.blocks.remove(&index) {
                Some((BlockKind::Text, _)) => vec![SourceEvent::TextEnd],
                Some((BlockKind::Tool, Some(id))) => vec![SourceEvent::ToolInputEnd { id }],
                _ => Vec::new(),
            },
            StreamEvent::MessageDelta { delta, usage } => {
                self.usage.output_tokens = usage.output_tokens;

                let reason = match delta.stop_reason {
                    Some(StopReason::MaxTokens) => FinishReason::Length,
                    Some(StopReason::ToolUse) => FinishReason::ToolCalls,
                    _ => FinishReason::Stop,
                };

                vec![SourceEvent::StepFinish {
                    reason,
                    usage: StreamUsage {
                        input_tokens: self.usage.input_tokens,
                        output_tokens: usage.output_tokens,
                    },
                }]
            }
            StreamEvent::MessageStop => {
                self.done = true;
                vec![SourceEvent::Finish]
            }
            StreamEvent::Ping | StreamEvent::Error { .. } => Vec::new(),
        }
    }
}
