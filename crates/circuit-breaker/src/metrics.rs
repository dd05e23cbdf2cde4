//! Point-in-time metrics snapshot for a circuit breaker.

use serde::Serialize;

use crate::{BreakerState, CircuitState};

/// Consistent view of a breaker's state and latency statistics.
///
/// Serialized verbatim by the `/v1/circuit-breaker/metrics` endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    /// Current phase of the breaker.
    pub state: CircuitState,
    /// Failures observed since the last success or reset.
    pub failure_count: u32,
    /// Total successes recorded.
    pub success_count: u32,
    /// Average latency over the live window, 0 when no samples exist.
    pub avg_latency_ms: f64,
    /// Number of samples currently in the window.
    pub latency_sample_count: usize,
    /// Smallest latency in the window.
    pub min_latency_ms: u64,
    /// Largest latency in the window.
    pub max_latency_ms: u64,
    /// 50th percentile latency.
    pub p50_latency_ms: u64,
    /// 95th percentile latency.
    pub p95_latency_ms: u64,
    /// 99th percentile latency.
    pub p99_latency_ms: u64,
    /// Consecutive high-latency checks observed.
    pub consecutive_high_latency: u32,
    /// ISO-8601 timestamp of the next allowed attempt, null unless OPEN.
    pub next_attempt: Option<String>,
    /// ISO-8601 timestamp of when this snapshot was taken.
    pub timestamp: String,
}

pub(crate) fn snapshot(state: &BreakerState) -> MetricsSnapshot {
    let mut latencies: Vec<u64> = state.latency_samples.iter().map(|&(_, ms)| ms).collect();
    latencies.sort_unstable();

    let avg = if latencies.is_empty() {
        0.0
    } else {
        latencies.iter().sum::<u64>() as f64 / latencies.len() as f64
    };

    MetricsSnapshot {
        state: state.phase,
        failure_count: state.failure_count,
        success_count: state.success_count,
        avg_latency_ms: avg,
        latency_sample_count: latencies.len(),
        min_latency_ms: latencies.first().copied().unwrap_or(0),
        max_latency_ms: latencies.last().copied().unwrap_or(0),
        p50_latency_ms: percentile(&latencies, 50),
        p95_latency_ms: percentile(&latencies, 95),
        p99_latency_ms: percentile(&latencies, 99),
        consecutive_high_latency: state.consecutive_high_latency,
        next_attempt: state
            .next_attempt
            .map(|(_, wall)| wall.to_string())
            .filter(|_| state.phase == CircuitState::Open),
        timestamp: jiff::Timestamp::now().to_string(),
    }
}

/// Nearest-rank percentile over a sorted slice.
///
/// With fewer than three samples this degrades to min/median/max, and an
/// empty slice yields 0 for every percentile.
fn percentile(sorted: &[u64], pct: u32) -> u64 {
    if sorted.is_empty() {
        return 0;
    }

    let rank = (sorted.len() as f64 * pct as f64 / 100.0).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}
