//! Circuit breaker configuration and per-mode defaults.

use std::time::Duration;

use serde::Deserialize;

use crate::BackendMode;

// Local inference gets two minutes before latency tripping; cloud
// backends get thirty seconds.
const LOCAL_LATENCY_THRESHOLD_MS: u64 = 120_000;
const CLOUD_LATENCY_THRESHOLD_MS: u64 = 30_000;

const DEFAULT_FAILURE_THRESHOLD: u32 = 5;
const DEFAULT_RETRY_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_LATENCY_CONSECUTIVE_CHECKS: u32 = 3;
const DEFAULT_LATENCY_WINDOW_MS: u64 = 60_000;

/// User-facing circuit breaker overrides. Unset fields fall back to the
/// defaults for the configured backend mode.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CircuitBreakerConfig {
    /// Master switch. When false, latency tripping is forced off even if a
    /// positive threshold is configured.
    pub enabled: bool,
    /// Failures required to trip CLOSED -> OPEN.
    pub failure_threshold: Option<u32>,
    /// How long an OPEN breaker waits before probing, in milliseconds.
    pub retry_timeout_ms: Option<u64>,
    /// Average latency that counts as "high", in milliseconds. 0 disables
    /// latency-based tripping.
    pub latency_threshold_ms: Option<u64>,
    /// Consecutive high-latency checks required to trip. 0 disables
    /// latency-based tripping.
    pub latency_consecutive_checks: Option<u32>,
    /// Sliding window over which latency samples are averaged, in
    /// milliseconds.
    pub latency_window_ms: Option<u64>,
    /// Run the threshold check on every recorded latency sample.
    pub auto_check_latency: Option<bool>,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            failure_threshold: None,
            retry_timeout_ms: None,
            latency_threshold_ms: None,
            latency_consecutive_checks: None,
            latency_window_ms: None,
            auto_check_latency: None,
        }
    }
}

impl CircuitBreakerConfig {
    /// Resolve user overrides against the defaults for `mode`, field by
    /// field. `enabled: false` forces the latency threshold to 0 regardless
    /// of any explicit value.
    pub fn resolve(&self, mode: BackendMode) -> ResolvedCircuitBreakerConfig {
        let default_latency_threshold = match mode.effective() {
            BackendMode::Local | BackendMode::MlxCluster | BackendMode::Lmstudio => LOCAL_LATENCY_THRESHOLD_MS,
            BackendMode::Openrouter | BackendMode::Claude => CLOUD_LATENCY_THRESHOLD_MS,
        };

        let latency_threshold_ms = if self.enabled {
            self.latency_threshold_ms.unwrap_or(default_latency_threshold)
        } else {
            0
        };

        ResolvedCircuitBreakerConfig {
            enabled: self.enabled,
            failure_threshold: self.failure_threshold.unwrap_or(DEFAULT_FAILURE_THRESHOLD),
            retry_timeout: Duration::from_millis(self.retry_timeout_ms.unwrap_or(DEFAULT_RETRY_TIMEOUT_MS)),
            latency_threshold_ms,
            latency_consecutive_checks: self
                .latency_consecutive_checks
                .unwrap_or(DEFAULT_LATENCY_CONSECUTIVE_CHECKS),
            latency_window: Duration::from_millis(self.latency_window_ms.unwrap_or(DEFAULT_LATENCY_WINDOW_MS)),
            auto_check_latency: self.auto_check_latency.unwrap_or(true),
        }
    }
}

/// Circuit breaker settings after per-mode defaults have been applied.
#[derive(Debug, Clone)]
pub struct ResolvedCircuitBreakerConfig {
    /// Whether the breaker participates in dispatch decisions at all.
    pub enabled: bool,
    /// Failures required to trip CLOSED -> OPEN.
    pub failure_threshold: u32,
    /// How long an OPEN breaker waits before probing.
    pub retry_timeout: Duration,
    /// Average latency that counts as "high", in milliseconds; 0 disables
    /// latency-based tripping.
    pub latency_threshold_ms: u64,
    /// Consecutive high-latency checks required to trip; 0 disables
    /// latency-based tripping.
    pub latency_consecutive_checks: u32,
    /// Sliding window over which latency samples are averaged.
    pub latency_window: Duration,
    /// Run the threshold check on every recorded latency sample.
    pub auto_check_latency: bool,
}
