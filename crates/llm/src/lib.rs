//! Core request-path engine for the anyclaude proxy.
//!
//! The pieces compose left to right on the request path: cache-marker
//! extraction annotates the request, the context manager reshapes it to
//! fit the model window, a backend client (or the cluster router)
//! dispatches it under its circuit breaker, and the stream transcoder
//! re-frames the producer's events into the Anthropic SSE shape.

pub mod backend;
pub mod cache;
pub mod cluster;
pub mod context;
mod error;
mod http_client;
pub mod protocol;
pub mod search;
pub mod stream;
pub mod tokens;

pub use error::{LlmError, Result, TransportKind};
