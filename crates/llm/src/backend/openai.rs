mod input;
mod output;

use std::time::Instant;

use async_trait::async_trait;
use circuit_breaker::CircuitBreaker;
use eventsource_stream::Eventsource;
use futures::StreamExt;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};

use self::input::OpenAiRequest;
use self::output::{ChunkAdapter, OpenAiResponse, OpenAiStreamChunk};

use crate::backend::{Backend, context_window_from, normalize_base_url};
use crate::error::{LlmError, Result, transport_error};
use crate::http_client::http_client;
use crate::protocol::anthropic::{Request, Response};
use crate::stream::{SourceEvent, SourceEventStream};

const DEFAULT_LOCAL_URL: &str = "http://localhost:1234";
const DEFAULT_OPENROUTER_URL: &str = "https://openrouter.ai/api";

/// Client for OpenAI-compatible chat-completions backends: local inference
/// servers, cluster worker nodes, and the OpenRouter aggregator.
pub struct OpenAiCompatBackend {
    client: Client,
    base_url: String,
    api_key: Option<SecretString>,
    name: String,
    breaker: CircuitBreaker,
}

impl OpenAiCompatBackend {
    /// Client for a local inference server.
    pub fn local(base_url: Option<&str>, api_key: Option<SecretString>, breaker: CircuitBreaker) -> Self {
        Self::new("local", base_url.unwrap_or(DEFAULT_LOCAL_URL), api_key, breaker)
    }

    /// Client for the OpenRouter aggregator.
    pub fn openrouter(base_url: Option<&str>, api_key: Option<SecretString>, breaker: CircuitBreaker) -> Self {
        Self::new("openrouter", base_url.unwrap_or(DEFAULT_OPENROUTER_URL), api_key, breaker)
    }

    /// Client for a single cluster worker node.
    pub fn cluster_node(node_id: &str, base_url: &str, breaker: CircuitBreaker) -> Self {
        Self::new(node_id, base_url, None, breaker)
    }

    fn new(name: &str, base_url: &str, api_key: Option<SecretString>, breaker: CircuitBreaker) -> Self {
        Self {
            client: http_client(),
            base_url: normalize_base_url(base_url),
            api_key,
            name: name.to_string(),
            breaker,
        }
    }

    fn guard(&self) -> Result<()> {
        if self.breaker.can_execute() {
            Ok(())
        } else {
            Err(LlmError::CircuitOpen {
                backend: self.name.clone(),
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

    async fn send(&self, request: OpenAiRequest) -> Result<reqwest::Response> {
        let url = format!("{}/v1/chat/completions", self.base_url);

        let mut builder = self.client.post(&url).json(&request);

        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key.expose_secret());
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
        log::error!("{} API error ({status}): {message}", self.name);

        Err(LlmError::Upstream {
            status: status.as_u16(),
            message,
            retry_after: retry_after.filter(|_| status.as_u16() == 429),
        })
    }
}

#[async_trait]
impl Backend for OpenAiCompatBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn chat(&self, request: Request) -> Result<Response> {
        self.guard()?;
        let started = Instant::now();
        let model = request.model.clone();

        let result = async {
            let response = self.send(OpenAiRequest::from_request(request, false)).await?;

            let body = response.text().await.map_err(transport_error)?;

            let parsed: OpenAiResponse = serde_json::from_str(&body).map_err(|e| {
                log::error!("Failed to parse {} chat completion response: {e}", self.name);
                LlmError::Protocol(format!("unparseable chat completion response: {e}"))
            })?;

            Ok(parsed.into_response(&model))
        }
        .await;

        self.record_outcome(&result, started);
        result
    }

    async fn chat_stream(&self, request: Request) -> Result<SourceEventStream> {
        self.guard()?;
        let started = Instant::now();

        let result = self.send(OpenAiRequest::from_request(request, true)).await;
        self.record_outcome(&result, started);
        let response = result?;

        let events = response.bytes_stream().eventsource().boxed();
        let adapter = ChunkAdapter::new();
        let backend_name = self.name.clone();

        let stream = futures::stream::unfold(
            (events, adapter, false, backend_name),
            |(mut events, mut adapter, mut done, name)| async move {
                loop {
                    if done {
                        return None;
                    }

                    match events.next().await {
                        Some(Ok(event)) => {
                            if event.data == "[DONE]" {
                                done = true;
                                let mut emitted = Vec::new();

                                if !adapter.finished() {
                                    // Producer never sent a finish_reason;
                                    // surface what usage we have.
                                    emitted.push(Ok(SourceEvent::StepFinish {
                                        reason: crate::stream::FinishReason::Stop,
                                        usage: adapter.usage(),
                                    }));
                                }

                                emitted.push(Ok(SourceEvent::Finish));
                                return Some((emitted, (events, adapter, done, name)));
                            }

                            let Ok(chunk) = serde_json::from_str::<OpenAiStreamChunk>(&event.data) else {
                                log::warn!("Skipping unparseable streaming chunk from {name}");
                                continue;
                            };

                            let emitted: Vec<_> = adapter.handle(chunk).into_iter().map(Ok).collect();
                            if emitted.is_empty() {
                                continue;
                            }

                            return Some((emitted, (events, adapter, done, name)));
                        }
                        Some(Err(error)) => {
                            done = true;
                            let error = LlmError::Protocol(format!("stream from {name} failed: {error}"));
                            return Some((vec![Err(error)], (events, adapter, done, name)));
                        }
                        None => {
                            done = true;
                            return Some((vec![Ok(SourceEvent::Finish)], (events, adapter, done, name)));
                        }
                    }
                }
            },
        )
        .flat_map(futures::stream::iter);

        Ok(stream.boxed())
    }

    async fn discover_context_window(&self, model: &str) -> Option<u32> {
        let url = format!("{}/v1/models", self.base_url);

        let mut builder = self.client.get(&url);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key.expose_secret());
        }

        let response = match builder.send().await {
            Ok(response) if response.status().is_success() => response,
            Ok(response) => {
                log::debug!("Model discovery on {} returned {}", self.name, response.status());
                return None;
            }
            Err(error) => {
                log::debug!("Model discovery on {} failed: {error}", self.name);
                return None;
            }
        };

        let body: serde_json::Value = response.json().await.ok()?;
        let entries = body.get("data")?.as_array()?;

        let entry = entries
            .iter()
            .find(|entry| entry.get("id").and_then(|id| id.as_str()) == Some(model))
            .or_else(|| entries.first())?;

        context_window_from(entry)
    }
}
