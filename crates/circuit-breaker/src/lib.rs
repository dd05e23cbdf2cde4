//! Per-backend circuit breaker with failure- and latency-driven tripping.
//!
//! Each backend binding owns one [`CircuitBreaker`] for its whole lifetime.
//! The breaker serializes state transitions behind a single mutex so that
//! observers always see monotonic phase changes and metrics snapshots are
//! never torn.

#![deny(missing_docs)]

mod metrics;

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use config::ResolvedCircuitBreakerConfig;

pub use metrics::MetricsSnapshot;

/// Phase of the breaker state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Requests flow normally.
    Closed,
    /// Requests fail fast until the retry timeout elapses.
    Open,
    /// A single probe request is allowed through to test recovery.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => f.write_str("CLOSED"),
            CircuitState::Open => f.write_str("OPEN"),
            CircuitState::HalfOpen => f.write_str("HALF_OPEN"),
        }
    }
}

/// Callback invoked on every phase transition with the new phase and a
/// human-readable reason.
pub type TransitionListener = Box<dyn Fn(CircuitState, &str) + Send + Sync>;

struct BreakerState {
    phase: CircuitState,
    failure_count: u32,
    success_count: u32,
    /// Monotonic deadline plus the wall-clock timestamp exposed in metrics.
    next_attempt: Option<(Instant, jiff::Timestamp)>,
    consecutive_high_latency: u32,
    /// Ring of `(recorded_at, latency_ms)`; entries older than the window are
    /// evicted lazily on access.
    latency_samples: VecDeque<(Instant, u64)>,
}

impl BreakerState {
    fn new() -> Self {
        Self {
            phase: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            next_attempt: None,
            consecutive_high_latency: 0,
            latency_samples: VecDeque::new(),
        }
    }

    fn evict_expired(&mut self, window: Duration, now: Instant) {
        while let Some(&(at, _)) = self.latency_samples.front() {
            if now.duration_since(at) > window {
                self.latency_samples.pop_front();
            } else {
                break;
            }
        }
    }

    fn average_latency(&self) -> Option<f64> {
        if self.latency_samples.is_empty() {
            return None;
        }

        let sum: u64 = self.latency_samples.iter().map(|(_, ms)| ms).sum();
        Some(sum as f64 / self.latency_samples.len() as f64)
    }
}

struct Inner {
    config: ResolvedCircuitBreakerConfig,
    state: Mutex<BreakerState>,
    listener: Mutex<Option<TransitionListener>>,
}

/// Circuit breaker guarding a single backend binding.
///
/// Cloning is cheap and every clone observes the same state.
#[derive(Clone)]
pub struct CircuitBreaker {
    inner: Arc<Inner>,
}

/// Transition recorded while the state lock is held, notified after release.
struct Transition {
    phase: CircuitState,
    reason: String,
}

impl CircuitBreaker {
    /// Create a breaker from a resolved configuration.
    pub fn new(config: ResolvedCircuitBreakerConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                state: Mutex::new(BreakerState::new()),
                listener: Mutex::new(None),
            }),
        }
    }

    /// Register the transition listener. Replaces any previous listener.
    pub fn on_transition(&self, listener: TransitionListener) {
        *self.inner.listener.lock().expect("breaker listener poisoned") = Some(listener);
    }

    /// Whether latency-driven tripping is active for this breaker.
    fn latency_checks_enabled(&self) -> bool {
        self.inner.config.latency_threshold_ms > 0 && self.inner.config.latency_consecutive_checks > 0
    }

    /// Whether a request may be dispatched right now.
    ///
    /// An OPEN breaker whose retry timeout has elapsed transitions to
    /// HALF_OPEN and admits the caller as the recovery probe.
    pub fn can_execute(&self) -> bool {
        let mut transitions = Vec::new();

        let allowed = {
            let mut state = self.lock_state();

            match state.phase {
                CircuitState::Closed | CircuitState::HalfOpen => true,
                CircuitState::Open => {
                    let elapsed = state
                        .next_attempt
                        .is_none_or(|(deadline, _)| Instant::now() >= deadline);

                    if elapsed {
                        state.phase = CircuitState::HalfOpen;
                        transitions.push(Transition {
                            phase: CircuitState::HalfOpen,
                            reason: "retry timeout elapsed, probing backend".to_string(),
                        });
                        true
                    } else {
                        false
                    }
                }
            }
        };

        self.notify(transitions);
        allowed
    }

    /// Record a successful call.
    pub fn record_success(&self) {
        let mut transitions = Vec::new();

        {
            let mut state = self.lock_state();
            state.success_count += 1;
            state.failure_count = 0;

            if state.phase == CircuitState::HalfOpen {
                let now = Instant::now();
                state.evict_expired(self.inner.config.latency_window, now);

                let latency_normal = !self.latency_checks_enabled()
                    || state
                        .average_latency()
                        .is_none_or(|avg| avg < self.inner.config.latency_threshold_ms as f64);

                if latency_normal {
                    state.phase = CircuitState::Closed;
                    state.next_attempt = None;
                    state.consecutive_high_latency = 0;
                    transitions.push(Transition {
                        phase: CircuitState::Closed,
                        reason: "probe succeeded, backend recovered".to_string(),
                    });
                } else {
                    self.open_locked(&mut state, &mut transitions, "latency threshold exceeded during recovery probe");
                }
            }
        }

        self.notify(transitions);
    }

    /// Record a failed call.
    pub fn record_failure(&self) {
        let mut transitions = Vec::new();

        {
            let mut state = self.lock_state();
            state.failure_count += 1;

            match state.phase {
                CircuitState::HalfOpen => {
                    self.open_locked(&mut state, &mut transitions, "probe failed");
                }
                CircuitState::Closed if state.failure_count >= self.inner.config.failure_threshold => {
                    let reason = format!(
                        "failure threshold reached ({}/{})",
                        state.failure_count, self.inner.config.failure_threshold
                    );
                    self.open_locked(&mut state, &mut transitions, &reason);
                }
                _ => {}
            }
        }

        self.notify(transitions);
    }

    /// Append a latency observation to the ring.
    ///
    /// With `auto_check_latency` enabled every recording also runs the
    /// threshold check.
    pub fn record_latency(&self, latency_ms: u64) {
        {
            let mut state = self.lock_state();
            let now = Instant::now();
            state.latency_samples.push_back((now, latency_ms));
            state.evict_expired(self.inner.config.latency_window, now);
        }

        if self.inner.config.auto_check_latency {
            self.check_latency_threshold();
        }
    }

    /// Compare the windowed average against the threshold and update the
    /// consecutive high-latency counter, tripping the breaker when the
    /// configured number of consecutive checks is reached.
    pub fn check_latency_threshold(&self) {
        if !self.latency_checks_enabled() {
            return;
        }

        let mut transitions = Vec::new();

        {
            let mut state = self.lock_state();
            state.evict_expired(self.inner.config.latency_window, Instant::now());

            let Some(avg) = state.average_latency() else {
                return;
            };

            let threshold = self.inner.config.latency_threshold_ms as f64;

            if avg >= threshold {
                state.consecutive_high_latency += 1;

                if state.consecutive_high_latency >= self.inner.config.latency_consecutive_checks
                    && state.phase != CircuitState::Open
                {
                    let reason = format!("latency threshold exceeded (avg {avg:.0}ms >= {threshold:.0}ms)");
                    self.open_locked(&mut state, &mut transitions, &reason);
                }
            } else {
                state.consecutive_high_latency = 0;
            }
        }

        self.notify(transitions);
    }

    /// Force the breaker back to CLOSED and zero all counters and samples.
    pub fn reset(&self) {
        let mut transitions = Vec::new();

        {
            let mut state = self.lock_state();
            let was_closed = state.phase == CircuitState::Closed;
            *state = BreakerState::new();

            if !was_closed {
                transitions.push(Transition {
                    phase: CircuitState::Closed,
                    reason: "breaker explicitly reset".to_string(),
                });
            }
        }

        self.notify(transitions);
    }

    /// Current phase.
    pub fn state(&self) -> CircuitState {
        self.lock_state().phase
    }

    /// Current failure count, exposed for readiness reporting.
    pub fn failure_count(&self) -> u32 {
        self.lock_state().failure_count
    }

    /// A consistent point-in-time metrics snapshot.
    pub fn get_metrics(&self) -> MetricsSnapshot {
        let mut state = self.lock_state();
        state.evict_expired(self.inner.config.latency_window, Instant::now());
        metrics::snapshot(&state)
    }

    fn open_locked(&self, state: &mut BreakerState, transitions: &mut Vec<Transition>, reason: &str) {
        state.phase = CircuitState::Open;
        state.next_attempt = Some((
            Instant::now() + self.inner.config.retry_timeout,
            jiff::Timestamp::now() + self.inner.config.retry_timeout,
        ));
        transitions.push(Transition {
            phase: CircuitState::Open,
            reason: reason.to_string(),
        });
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, BreakerState> {
        self.inner.state.lock().expect("breaker state poisoned")
    }

    fn notify(&self, transitions: Vec<Transition>) {
        if transitions.is_empty() {
            return;
        }

        let listener = self.inner.listener.lock().expect("breaker listener poisoned");

        for transition in transitions {
            log::info!("circuit breaker -> {}: {}", transition.phase, transition.reason);

            if let Some(listener) = listener.as_ref() {
                listener(transition.phase, &transition.reason);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    fn test_config() -> ResolvedCircuitBreakerConfig {
        ResolvedCircuitBreakerConfig {
            enabled: true,
            failure_threshold: 5,
            retry_timeout: Duration::from_millis(50),
            latency_threshold_ms: 100,
            latency_consecutive_checks: 3,
            latency_window: Duration::from_secs(60),
            auto_check_latency: true,
        }
    }

    #[test]
    fn trips_open_after_failure_threshold() {
        let breaker = CircuitBreaker::new(test_config());

        for _ in 0..4 {
            breaker.record_failure();
            assert_eq!(breaker.state(), CircuitState::Closed);
        }

        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.can_execute());
    }

    #[test]
    fn latency_trip_notifies_listener_with_reason() {
        let breaker = CircuitBreaker::new(test_config());
        let reasons = Arc::new(Mutex::new(Vec::new()));

        let captured = reasons.clone();
        breaker.on_transition(Box::new(move |phase, reason| {
            captured
                .lock()
                .expect("listener reasons")
                .push((phase, reason.to_string()));
        }));

        breaker.record_latency(200);
        breaker.record_latency(210);
        assert_eq!(breaker.state(), CircuitState::Closed);

        breaker.record_latency(220);
        assert_eq!(breaker.state(), CircuitState::Open);

        let reasons = reasons.lock().expect("listener reasons");
        assert_eq!(reasons.len(), 1);
        assert_eq!(reasons[0].0, CircuitState::Open);
        assert!(reasons[0].1.contains("latency"), "reason was: {}", reasons[0].1);
    }

    #[test]
    fn success_resets_failure_streak() {
        let breaker = CircuitBreaker::new(test_config());

        breaker.record_failure();
        breaker.record_failure();
        breaker.record_success();

        for _ in 0..4 {
            breaker.record_failure();
        }

        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn open_breaker_half_opens_after_retry_timeout() {
        let breaker = CircuitBreaker::new(test_config());

        for _ in 0..5 {
            breaker.record_failure();
        }
        assert!(!breaker.can_execute());

        std::thread::sleep(Duration::from_millis(60));

        assert!(breaker.can_execute());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn half_open_failure_reopens() {
        let breaker = CircuitBreaker::new(test_config());

        for _ in 0..5 {
            breaker.record_failure();
        }

        std::thread::sleep(Duration::from_millis(60));
        assert!(breaker.can_execute());

        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[test]
    fn reset_forces_closed_and_zeroes_counters() {
        let breaker = CircuitBreaker::new(test_config());

        for _ in 0..5 {
            breaker.record_failure();
        }
        breaker.record_latency(500);

        breaker.reset();

        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.failure_count(), 0);

        let metrics = breaker.get_metrics();
        assert_eq!(metrics.latency_sample_count, 0);
        assert_eq!(metrics.avg_latency_ms, 0.0);
    }

    #[test]
    fn zero_consecutive_checks_disables_latency_tripping() {
        let config = ResolvedCircuitBreakerConfig {
            latency_consecutive_checks: 0,
            ..test_config()
        };
        let breaker = CircuitBreaker::new(config);

        for _ in 0..10 {
            breaker.record_latency(10_000);
        }

        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn zero_threshold_disables_latency_tripping() {
        let config = ResolvedCircuitBreakerConfig {
            latency_threshold_ms: 0,
            ..test_config()
        };
        let breaker = CircuitBreaker::new(config);

        for _ in 0..10 {
            breaker.record_latency(10_000);
        }

        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn low_latency_zeroes_consecutive_counter() {
        let breaker = CircuitBreaker::new(test_config());

        breaker.record_latency(200);
        breaker.record_latency(210);
        assert_eq!(breaker.get_metrics().consecutive_high_latency, 2);

        // Bring the window average below the threshold.
        for _ in 0..10 {
            breaker.record_latency(10);
        }

        assert_eq!(breaker.get_metrics().consecutive_high_latency, 0);
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn metrics_snapshot_serializes_expected_fields() {
        let breaker = CircuitBreaker::new(test_config());
        breaker.record_latency(10);
        breaker.record_latency(20);
        breaker.record_success();

        let json = serde_json::to_value(breaker.get_metrics()).expect("snapshot serializes");

        assert_eq!(json["state"], "CLOSED");
        assert_eq!(json["success_count"], 1);
        assert_eq!(json["latency_sample_count"], 2);
        assert_eq!(json["avg_latency_ms"], 15.0);
        assert_eq!(json["min_latency_ms"], 10);
        assert_eq!(json["max_latency_ms"], 20);
        assert_eq!(json["p50_latency_ms"], 10);
        assert_eq!(json["p99_latency_ms"], 20);
        assert_eq!(json["next_attempt"], serde_json::Value::Null);
        assert!(json["timestamp"].as_str().is_some_and(|ts| ts.contains('T')));
    }

    #[test]
    fn listener_sees_monotonic_transitions() {
        let breaker = CircuitBreaker::new(test_config());
        let count = Arc::new(AtomicU32::new(0));

        let captured = count.clone();
        breaker.on_transition(Box::new(move |_, _| {
            captured.fetch_add(1, Ordering::SeqCst);
        }));

        for _ in 0..5 {
            breaker.record_failure();
        }

        // Only the CLOSED -> OPEN edge fires, not one event per failure.
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
