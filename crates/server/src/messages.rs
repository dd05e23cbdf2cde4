//! The `/v1/messages` handler: the full request-path pipeline.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json,
    extract::State,
    response::{
        IntoResponse, Response,
        sse::{Event, KeepAlive, Sse},
    },
};
use futures::StreamExt;
use llm::LlmError;
use llm::cache::extract_cache_markers;
use llm::context::ContextManager;
use llm::protocol::anthropic::Request;
use llm::stream::{TranscodeOptions, transcode};

use crate::{ProxyState, error::ApiError};

/// Handle message creation requests.
///
/// The pipeline: cache markers annotate the request, the context manager
/// reshapes it to fit the model window, the dispatcher sends it to the
/// configured backend, and for streaming requests the transcoder re-frames
/// producer events into the Anthropic SSE sequence.
pub(crate) async fn messages(
    State(state): State<Arc<ProxyState>>,
    Json(request): Json<Request>,
) -> Result<Response, ApiError> {
    if request.model.is_empty() {
        return Err(LlmError::Validation("model must not be empty".to_string()).into());
    }

    if request.max_tokens == 0 {
        return Err(LlmError::Validation("max_tokens must be a positive integer".to_string()).into());
    }

    log::debug!(
        "Messages request for model {} with {} message(s), streaming: {}",
        request.model,
        request.messages.len(),
        request.stream.unwrap_or(false)
    );

    let markers = extract_cache_markers(&request);

    if markers.has_system_cache {
        log::debug!(
            "Request carries a cacheable system prefix ({} user cacheable block(s))",
            markers.user_cacheable_block_count
        );
    }

    let mut manager = ContextManager::new(state.config.context.clone(), &request.model);
    manager.set_discovered_window(state.dispatcher.discover_context_window(&request.model).await);

    let mut request = request;
    let managed = manager.manage(
        std::mem::take(&mut request.messages),
        request.system.as_ref(),
        request.tools.as_deref().unwrap_or_default(),
    )?;

    if managed.was_compressed {
        log::info!("Conversation compressed to fit the context window of {}", manager.window());
    }
    request.messages = managed.messages;

    let fingerprint = markers.fingerprint.clone();

    if request.stream.unwrap_or(false) {
        let source = state
            .dispatcher
            .chat_stream(request.clone(), fingerprint.as_deref())
            .await?;

        let events = transcode(
            source,
            TranscodeOptions {
                model: request.model.clone(),
                message_id: None,
                strip_web_search: state.config.backend.strip_web_search,
            },
        );

        let sse_stream = events.map(|event| {
            let data = serde_json::to_string(&event).unwrap_or_else(|e| {
                log::error!("Failed to serialize stream event: {e}");
                r#"{"type":"error","error":{"type":"internal_error","message":"serialization failed"}}"#.to_string()
            });

            Ok::<_, Infallible>(Event::default().event(event.name()).data(data))
        });

        let keep_alive = KeepAlive::new()
            .interval(Duration::from_secs(state.config.server.keep_alive_interval_secs))
            .text("ping");

        Ok(Sse::new(sse_stream).keep_alive(keep_alive).into_response())
    } else {
        let response = state.dispatcher.chat(request, fingerprint.as_deref()).await?;

        log::debug!("Messages completion finished with {} content block(s)", response.content.len());

        Ok(Json(response).into_response())
    }
}
