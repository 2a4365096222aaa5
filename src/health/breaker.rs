//! Circuit breakers for worker-facing operations
//!
//! One breaker guards each (worker, operation class) pair. The classic
//! three-state machine applies: CLOSED counts consecutive failures and a
//! rolling error-rate window; OPEN rejects until a growing reset timeout
//! expires; HALF_OPEN admits probes one at a time until enough consecutive
//! successes close the breaker again.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::Serialize;
use tracing::{info, warn};

use crate::config::Args;
use crate::types::{GatewayError, Result};

/// Breaker tuning knobs
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive failures that open the breaker
    pub failure_threshold: u32,
    /// Consecutive half-open successes that close it
    pub success_threshold: u32,
    /// Initial OPEN duration
    pub reset_timeout: Duration,
    /// Ceiling for the growing OPEN duration
    pub max_reset_timeout: Duration,
    /// Minimum window samples before the error-rate rule applies
    pub volume_threshold: usize,
    /// Rolling error rate (percent) that opens the breaker
    pub error_threshold_pct: u32,
    /// Rolling window span
    pub window: Duration,
    /// Deadline for a single guarded call
    pub call_timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            success_threshold: 2,
            reset_timeout: Duration::from_secs(15),
            max_reset_timeout: Duration::from_secs(120),
            volume_threshold: 10,
            error_threshold_pct: 50,
            window: Duration::from_secs(60),
            call_timeout: Duration::from_secs(30),
        }
    }
}

impl BreakerConfig {
    pub fn from_args(args: &Args) -> Self {
        Self {
            failure_threshold: args.breaker_failure_threshold,
            success_threshold: args.breaker_success_threshold,
            reset_timeout: Duration::from_secs(args.breaker_reset_timeout_secs),
            max_reset_timeout: Duration::from_secs(args.breaker_max_reset_timeout_secs),
            volume_threshold: args.breaker_volume_threshold,
            error_threshold_pct: args.breaker_error_threshold_pct,
            window: Duration::from_secs(args.breaker_window_secs),
            call_timeout: Duration::from_secs(30),
        }
    }
}

/// The three breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BreakerState::Closed => "CLOSED",
            BreakerState::Open => "OPEN",
            BreakerState::HalfOpen => "HALF_OPEN",
        }
    }
}

/// Serializable view of one breaker for the admin API
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub name: String,
    pub state: BreakerState,
    pub consecutive_failures: u32,
    pub half_open_successes: u32,
    pub window_samples: usize,
    pub window_error_rate_pct: f64,
    pub current_reset_timeout_ms: u64,
    /// Milliseconds until the next probe is admitted, while OPEN
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_in_ms: Option<u64>,
}

struct BreakerInner {
    state: BreakerState,
    consecutive_failures: u32,
    half_open_successes: u32,
    /// One probe at a time while HALF_OPEN
    probe_in_flight: bool,
    /// Rolling (timestamp, success) outcomes
    window: VecDeque<(Instant, bool)>,
    next_attempt_at: Option<Instant>,
    current_reset_timeout: Duration,
}

/// One circuit breaker instance
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(name: &str, config: BreakerConfig) -> Self {
        let current_reset_timeout = config.reset_timeout;
        Self {
            name: name.to_string(),
            config,
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                half_open_successes: 0,
                probe_in_flight: false,
                window: VecDeque::new(),
                next_attempt_at: None,
                current_reset_timeout,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Deadline the caller must apply to the guarded operation
    pub fn call_timeout(&self) -> Duration {
        self.config.call_timeout
    }

    /// Admit or reject a call. OPEN auto-transitions to HALF_OPEN once the
    /// reset timer expires; HALF_OPEN admits a single probe at a time. A
    /// caller granted admission must follow up with `record_success` or
    /// `record_failure`.
    pub fn try_acquire(&self) -> Result<()> {
        let mut inner = self.lock();
        match inner.state {
            BreakerState::Closed => Ok(()),
            BreakerState::Open => {
                let expired = inner
                    .next_attempt_at
                    .map(|at| Instant::now() >= at)
                    .unwrap_or(true);
                if expired {
                    info!(breaker = %self.name, "Circuit breaker OPEN -> HALF_OPEN (probing)");
                    inner.state = BreakerState::HalfOpen;
                    inner.half_open_successes = 0;
                    inner.probe_in_flight = true;
                    Ok(())
                } else {
                    Err(GatewayError::BreakerOpen(self.name.clone()))
                }
            }
            BreakerState::HalfOpen => {
                if inner.probe_in_flight {
                    Err(GatewayError::BreakerOpen(self.name.clone()))
                } else {
                    inner.probe_in_flight = true;
                    Ok(())
                }
            }
        }
    }

    /// Non-mutating dispatchability check used by the load balancer filter
    pub fn would_allow(&self) -> bool {
        let inner = self.lock();
        match inner.state {
            BreakerState::Closed => true,
            BreakerState::Open => inner
                .next_attempt_at
                .map(|at| Instant::now() >= at)
                .unwrap_or(true),
            BreakerState::HalfOpen => !inner.probe_in_flight,
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.lock();
        let now = Instant::now();
        Self::prune_window(&mut inner, now, self.config.window);
        inner.window.push_back((now, true));

        match inner.state {
            BreakerState::Closed => {
                inner.consecutive_failures = 0;
            }
            BreakerState::HalfOpen => {
                inner.probe_in_flight = false;
                inner.half_open_successes += 1;
                if inner.half_open_successes >= self.config.success_threshold {
                    info!(breaker = %self.name, "Circuit breaker HALF_OPEN -> CLOSED");
                    inner.state = BreakerState::Closed;
                    inner.consecutive_failures = 0;
                    inner.half_open_successes = 0;
                    inner.next_attempt_at = None;
                    inner.current_reset_timeout = self.config.reset_timeout;
                }
            }
            // A success while OPEN can only come from a call admitted before
            // the breaker tripped; the timer decides recovery.
            BreakerState::Open => {}
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.lock();
        let now = Instant::now();
        Self::prune_window(&mut inner, now, self.config.window);
        inner.window.push_back((now, false));

        match inner.state {
            BreakerState::Closed => {
                inner.consecutive_failures += 1;
                let errors = inner.window.iter().filter(|(_, ok)| !ok).count();
                let total = inner.window.len();
                let rate_tripped = total >= self.config.volume_threshold
                    && errors * 100 > self.config.error_threshold_pct as usize * total;

                if inner.consecutive_failures >= self.config.failure_threshold || rate_tripped {
                    self.open(&mut inner, false);
                }
            }
            BreakerState::HalfOpen => {
                inner.probe_in_flight = false;
                self.open(&mut inner, true);
            }
            BreakerState::Open => {}
        }
    }

    /// Admin: force the breaker open. Bypasses counters, emits the same
    /// state-transition events.
    pub fn force_open(&self) {
        let mut inner = self.lock();
        warn!(breaker = %self.name, "Circuit breaker forced OPEN");
        inner.probe_in_flight = false;
        self.open(&mut inner, false);
    }

    /// Admin: force the breaker closed and reset its counters
    pub fn force_close(&self) {
        let mut inner = self.lock();
        info!(breaker = %self.name, from = inner.state.as_str(), "Circuit breaker forced CLOSED");
        inner.state = BreakerState::Closed;
        inner.consecutive_failures = 0;
        inner.half_open_successes = 0;
        inner.probe_in_flight = false;
        inner.next_attempt_at = None;
        inner.current_reset_timeout = self.config.reset_timeout;
    }

    pub fn state(&self) -> BreakerState {
        self.lock().state
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let mut inner = self.lock();
        let now = Instant::now();
        Self::prune_window(&mut inner, now, self.config.window);

        let total = inner.window.len();
        let errors = inner.window.iter().filter(|(_, ok)| !ok).count();
        let rate = if total > 0 {
            errors as f64 * 100.0 / total as f64
        } else {
            0.0
        };

        BreakerSnapshot {
            name: self.name.clone(),
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            half_open_successes: inner.half_open_successes,
            window_samples: total,
            window_error_rate_pct: rate,
            current_reset_timeout_ms: inner.current_reset_timeout.as_millis() as u64,
            retry_in_ms: match inner.state {
                BreakerState::Open => inner
                    .next_attempt_at
                    .map(|at| at.saturating_duration_since(now).as_millis() as u64),
                _ => None,
            },
        }
    }

    /// Transition to OPEN. A reopen (from HALF_OPEN) grows the reset
    /// timeout by 1.5x up to the configured ceiling.
    fn open(&self, inner: &mut BreakerInner, reopen: bool) {
        if reopen {
            let grown = inner.current_reset_timeout.mul_f64(1.5);
            inner.current_reset_timeout = grown.min(self.config.max_reset_timeout);
        }
        let from = inner.state.as_str();
        inner.state = BreakerState::Open;
        inner.half_open_successes = 0;
        inner.next_attempt_at = Some(Instant::now() + inner.current_reset_timeout);
        warn!(
            breaker = %self.name,
            from = from,
            reset_timeout_ms = inner.current_reset_timeout.as_millis() as u64,
            "Circuit breaker OPEN"
        );
    }

    fn prune_window(inner: &mut BreakerInner, now: Instant, window: Duration) {
        while let Some((ts, _)) = inner.window.front() {
            if now.duration_since(*ts) > window {
                inner.window.pop_front();
            } else {
                break;
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, BreakerInner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Name-keyed collection of breakers, created on first use
pub struct BreakerRegistry {
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    config: BreakerConfig,
}

impl BreakerRegistry {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            breakers: DashMap::new(),
            config,
        }
    }

    /// Get or create the breaker with this name
    pub fn breaker(&self, name: &str) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(name, self.config.clone())))
            .clone()
    }

    /// Lookup without creating
    pub fn get(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get(name).map(|e| Arc::clone(e.value()))
    }

    pub fn snapshots(&self) -> Vec<BreakerSnapshot> {
        let mut out: Vec<BreakerSnapshot> =
            self.breakers.iter().map(|e| e.snapshot()).collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    /// Breaker name for submit-class operations against a worker
    pub fn submit_name(worker_id: &str) -> String {
        format!("{worker_id}:submit")
    }

    /// Breaker name for stream-class operations against a worker
    pub fn stream_name(worker_id: &str) -> String {
        format!("{worker_id}:stream")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_config() -> BreakerConfig {
        BreakerConfig {
            failure_threshold: 3,
            success_threshold: 2,
            reset_timeout: Duration::from_millis(50),
            max_reset_timeout: Duration::from_millis(400),
            volume_threshold: 10,
            error_threshold_pct: 50,
            window: Duration::from_secs(60),
            call_timeout: Duration::from_secs(30),
        }
    }

    #[test]
    fn test_opens_after_consecutive_failures() {
        let breaker = CircuitBreaker::new("w1:submit", fast_config());
        assert_eq!(breaker.state(), BreakerState::Closed);

        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Closed);
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Open);
        assert!(breaker.try_acquire().is_err());
    }

    #[test]
    fn test_success_resets_consecutive_count() {
        let breaker = CircuitBreaker::new("w1:submit", fast_config());
        breaker.record_failure();
        breaker.record_failure();
        breaker.record_success();
        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn test_half_open_single_probe_then_close() {
        let breaker = CircuitBreaker::new("w1:submit", fast_config());
        for _ in 0..3 {
            breaker.record_failure();
        }
        assert_eq!(breaker.state(), BreakerState::Open);

        tokio::time::sleep(Duration::from_millis(80)).await;

        // First caller is admitted as the probe, second is rejected
        assert!(breaker.try_acquire().is_ok());
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
        assert!(breaker.try_acquire().is_err());

        breaker.record_success();
        assert_eq!(breaker.state(), BreakerState::HalfOpen);

        assert!(breaker.try_acquire().is_ok());
        breaker.record_success();
        assert_eq!(breaker.state(), BreakerState::Closed);

        // Reset timeout returned to its initial value
        assert_eq!(
            breaker.snapshot().current_reset_timeout_ms,
            fast_config().reset_timeout.as_millis() as u64
        );
    }

    #[tokio::test]
    async fn test_half_open_failure_reopens_with_grown_timeout() {
        let breaker = CircuitBreaker::new("w1:submit", fast_config());
        for _ in 0..3 {
            breaker.record_failure();
        }
        assert_eq!(breaker.snapshot().current_reset_timeout_ms, 50);

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(breaker.try_acquire().is_ok());
        breaker.record_failure();

        assert_eq!(breaker.state(), BreakerState::Open);
        assert_eq!(breaker.snapshot().current_reset_timeout_ms, 75);
    }

    #[test]
    fn test_error_rate_rule_needs_volume() {
        let mut config = fast_config();
        config.failure_threshold = 100; // only the rate rule can trip
        config.volume_threshold = 10;
        let breaker = CircuitBreaker::new("w1:submit", config);

        // 5 failures + 4 successes: under volume, stays closed
        for _ in 0..5 {
            breaker.record_failure();
        }
        for _ in 0..4 {
            breaker.record_success();
        }
        assert_eq!(breaker.state(), BreakerState::Closed);

        // Tenth sample pushes error rate to 60% over 10 samples
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Open);
    }

    #[test]
    fn test_forced_transitions() {
        let breaker = CircuitBreaker::new("w1:submit", fast_config());
        breaker.force_open();
        assert_eq!(breaker.state(), BreakerState::Open);
        assert!(breaker.try_acquire().is_err());

        breaker.force_close();
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert!(breaker.try_acquire().is_ok());
    }

    #[test]
    fn test_registry_reuses_instances() {
        let registry = BreakerRegistry::new(fast_config());
        let a = registry.breaker("w1:submit");
        let b = registry.breaker("w1:submit");
        assert!(Arc::ptr_eq(&a, &b));

        a.force_open();
        assert_eq!(registry.get("w1:submit").unwrap().state(), BreakerState::Open);
        assert!(registry.get("missing").is_none());
    }

    #[test]
    fn test_would_allow_does_not_consume_probe() {
        let breaker = CircuitBreaker::new("w1:submit", fast_config());
        for _ in 0..3 {
            breaker.record_failure();
        }
        std::thread::sleep(Duration::from_millis(80));

        // Checking twice must not admit anything
        assert!(breaker.would_allow());
        assert!(breaker.would_allow());
        assert_eq!(breaker.state(), BreakerState::Open);

        // The real acquire takes the probe slot
        assert!(breaker.try_acquire().is_ok());
        assert!(!breaker.would_allow());
    }
}
