use http::StatusCode;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, LlmError>;

/// Classified transport failure conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// Connection refused or could not be established.
    Connect,
    /// Name resolution failed.
    Dns,
    /// TLS handshake failed.
    Tls,
    /// The peer reset the connection mid-exchange.
    Reset,
    /// The deadline elapsed before a response arrived.
    Timeout,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportKind::Connect => f.write_str("connection"),
            TransportKind::Dns => f.write_str("dns"),
            TransportKind::Tls => f.write_str("tls"),
            TransportKind::Reset => f.write_str("reset"),
            TransportKind::Timeout => f.write_str("timeout"),
        }
    }
}

/// Proxy errors with appropriate HTTP status codes.
#[derive(Debug, Error)]
pub enum LlmError {
    /// Network-level failure reaching the backend.
    #[error("Backend {kind} error: {message}")]
    Transport {
        /// The classified failure condition.
        kind: TransportKind,
        /// Underlying error text.
        message: String,
    },

    /// The backend replied with something that does not parse as expected.
    #[error("Upstream returned a malformed response: {0}")]
    Protocol(String),

    /// The backend replied with an error status.
    #[error("Upstream error ({status}): {message}")]
    Upstream {
        /// HTTP status returned by the backend.
        status: u16,
        /// Error body text.
        message: String,
        /// Server-hinted back-off in seconds, when provided on 429.
        retry_after: Option<u64>,
    },

    /// The circuit breaker is OPEN; the backend was not contacted.
    #[error("Backend '{backend}' is unavailable (circuit open)")]
    CircuitOpen {
        /// Name of the backend binding.
        backend: String,
    },

    /// The client request failed validation. Never recorded against a breaker.
    #[error("Invalid request: {0}")]
    Validation(String),

    /// Every eligible cluster node was tried and failed.
    #[error("Cluster dispatch failed after {attempts} attempt(s): {last_error}")]
    ClusterExhausted {
        /// Number of dispatch attempts made.
        attempts: u32,
        /// Description of the final node failure.
        last_error: String,
    },

    /// The conversation cannot fit the model's context window.
    #[error("Conversation of {tokens} tokens exceeds the context budget of {budget}")]
    ContextOverflow {
        /// Estimated tokens after compression.
        tokens: u32,
        /// Allowed budget (threshold fraction of the window).
        budget: u32,
    },

    /// Internal error. `Some` messages came from a backend and may be shown.
    #[error("Internal server error")]
    Internal(Option<String>),
}

impl LlmError {
    /// The HTTP status this error maps to on the client edge.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Validation(_) | Self::ContextOverflow { .. } => StatusCode::BAD_REQUEST,
            Self::Transport { .. } | Self::Protocol(_) | Self::ClusterExhausted { .. } => StatusCode::BAD_GATEWAY,
            Self::CircuitOpen { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::Upstream { status, .. } => match *status {
                400 => StatusCode::BAD_REQUEST,
                401 => StatusCode::UNAUTHORIZED,
                403 => StatusCode::FORBIDDEN,
                404 => StatusCode::NOT_FOUND,
                429 => StatusCode::TOO_MANY_REQUESTS,
                _ => StatusCode::BAD_GATEWAY,
            },
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Anthropic-compatible error type string for the response body.
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::Validation(_) | Self::ContextOverflow { .. } => "invalid_request_error",
            Self::Upstream { status: 429, .. } => "rate_limit_error",
            Self::Upstream { status: 401, .. } => "authentication_error",
            Self::Upstream { status: 403, .. } => "permission_error",
            Self::CircuitOpen { .. } => "overloaded_error",
            Self::Transport { .. } | Self::Protocol(_) | Self::Upstream { .. } | Self::ClusterExhausted { .. } => {
                "api_error"
            }
            Self::Internal(_) => "internal_error",
        }
    }

    /// Message that is safe to expose to API consumers.
    pub fn client_message(&self) -> String {
        match self {
            Self::Internal(Some(backend_msg)) => backend_msg.clone(),
            Self::Internal(None) => "Internal server error".to_string(),
            _ => self.to_string(),
        }
    }

    /// Whether the failure counts against the backend's circuit breaker.
    ///
    /// Transport failures and 5xx upstream errors count; client-side
    /// validation and 4xx responses never do.
    pub fn counts_as_backend_failure(&self) -> bool {
        match self {
            Self::Transport { .. } | Self::Protocol(_) => true,
            Self::Upstream { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

/// Classify a reqwest error by its failure condition.
pub(crate) fn classify_transport(error: &reqwest::Error) -> TransportKind {
    if error.is_timeout() {
        TransportKind::Timeout
    } else if error.is_connect() {
        let text = error.to_string();
        if text.contains("dns") || text.contains("resolve") {
            TransportKind::Dns
        } else if text.contains("tls") || text.contains("certificate") {
            TransportKind::Tls
        } else {
            TransportKind::Connect
        }
    } else if error.is_body() || error.is_decode() {
        TransportKind::Reset
    } else {
        TransportKind::Connect
    }
}

pub(crate) fn transport_error(error: reqwest::Error) -> LlmError {
    LlmError::Transport {
        kind: classify_transport(&error),
        message: error.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_errors_never_count_against_breakers() {
        assert!(!LlmError::Validation("bad".into()).counts_as_backend_failure());
        assert!(
            !LlmError::ContextOverflow {
                tokens: 100,
                budget: 50
            }
            .counts_as_backend_failure()
        );
    }

    #[test]
    fn transport_and_5xx_count_as_failures() {
        let transport = LlmError::Transport {
            kind: TransportKind::Timeout,
            message: "deadline elapsed".into(),
        };
        assert!(transport.counts_as_backend_failure());

        let upstream = LlmError::Upstream {
            status: 503,
            message: "overloaded".into(),
            retry_after: None,
        };
        assert!(upstream.counts_as_backend_failure());

        let too_many = LlmError::Upstream {
            status: 429,
            message: "slow down".into(),
            retry_after: Some(3),
        };
        assert!(!too_many.counts_as_backend_failure());
    }

    #[test]
    fn circuit_open_maps_to_service_unavailable() {
        let error = LlmError::CircuitOpen {
            backend: "local".into(),
        };
        assert_eq!(error.status_code(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(error.error_type(), "overloaded_error");
    }
}
