//! Per-(baseURL, key) three-state circuit breaker.
//!
//! The breaker itself carries no time of its own — every entry point takes
//! `now` and, where relevant, a failure rate/sample count computed by the
//! caller from the owning `KeyMetrics`' `recentResults` window. This keeps
//! it a total function of `(state, now, failureRate, sampleCount)`, which is
//! what makes it straightforward to drive deterministically from tests with
//! a [`ManualClock`](clock::ManualClock).

pub mod clock;

use chrono::{DateTime, Duration, Utc};

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Copy)]
pub struct CircuitBreakerConfig {
    /// Failure rate (0..1) over `recentResults` that opens the breaker.
    pub failure_threshold: f64,
    /// Minimum sample count before a failure rate is trusted.
    pub min_request_threshold: usize,
    /// How long the breaker stays Open before allowing a probe.
    pub open_timeout: Duration,
    /// Probe success rate (0..1) required to close from HalfOpen.
    pub recovery_threshold: f64,
}

impl CircuitBreakerConfig {
    /// Default derived from a window size `w`, per spec: `max(3, w/2)`.
    pub fn from_window(w: usize) -> Self {
        Self {
            failure_threshold: 0.5,
            min_request_threshold: (w / 2).max(3),
            open_timeout: Duration::minutes(15),
            recovery_threshold: 0.8,
        }
    }
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self::from_window(20)
    }
}

/// Embedded state machine. Lives inside `KeyMetrics`, guarded by the same
/// lock as the rest of the metrics map — it has no internal synchronization
/// of its own.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: CircuitState,
    opened_at: Option<DateTime<Utc>>,
    probe_requests: usize,
    probe_successes: usize,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            state: CircuitState::Closed,
            opened_at: None,
            probe_requests: 0,
            probe_successes: 0,
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    /// Non-nil iff the breaker is Open or HalfOpen (invariant 2 / §8).
    pub fn circuit_broken_at(&self) -> Option<DateTime<Utc>> {
        match self.state {
            CircuitState::Closed => None,
            CircuitState::Open | CircuitState::HalfOpen => self.opened_at,
        }
    }

    /// Asks whether a request should be allowed at `now`, advancing
    /// Open -> HalfOpen in place if `openTimeout` has elapsed.
    pub fn should_allow(&mut self, now: DateTime<Utc>) -> bool {
        match self.state {
            CircuitState::Closed => true,
            CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let opened_at = *self.opened_at.get_or_insert(now);
                if now - opened_at >= self.config.open_timeout {
                    self.enter_half_open(opened_at);
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Records a success. In `Open`, forces an immediate transition into
    /// `HalfOpen` before counting the probe ("forced probe" rule). In
    /// `HalfOpen`, counts the probe and may close the breaker.
    pub fn record_success(&mut self, now: DateTime<Utc>) {
        if self.state == CircuitState::Open {
            let opened_at = self.opened_at.unwrap_or(now);
            self.enter_half_open(opened_at);
        }

        if self.state == CircuitState::HalfOpen {
            self.probe_requests += 1;
            self.probe_successes += 1;
            let rate = self.probe_successes as f64 / self.probe_requests as f64;
            if self.probe_requests >= self.config.min_request_threshold
                && rate >= self.config.recovery_threshold
            {
                self.state = CircuitState::Closed;
                self.opened_at = None;
                self.probe_requests = 0;
                self.probe_successes = 0;
            }
        }
    }

    /// Records a failure given the caller-computed failure rate and sample
    /// count over the current `recentResults` window.
    pub fn record_failure(&mut self, now: DateTime<Utc>, failure_rate: f64, sample_count: usize) {
        match self.state {
            CircuitState::Closed => {
                if sample_count >= self.config.min_request_threshold
                    && failure_rate >= self.config.failure_threshold
                {
                    self.state = CircuitState::Open;
                    self.opened_at = Some(now);
                }
            }
            CircuitState::HalfOpen => {
                self.state = CircuitState::Open;
                self.opened_at = Some(now);
                self.probe_requests = 0;
                self.probe_successes = 0;
            }
            CircuitState::Open => {}
        }
    }

    fn enter_half_open(&mut self, _previous_opened_at: DateTime<Utc>) {
        self.state = CircuitState::HalfOpen;
        self.probe_requests = 0;
        self.probe_successes = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: 0.5,
            min_request_threshold: 3,
            open_timeout: Duration::minutes(15),
            recovery_threshold: 0.8,
        }
    }

    #[test]
    fn closed_stays_closed_below_sample_threshold() {
        let mut cb = CircuitBreaker::new(cfg());
        let now = Utc::now();
        cb.record_failure(now, 1.0, 2);
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn closed_opens_once_threshold_met() {
        let mut cb = CircuitBreaker::new(cfg());
        let now = Utc::now();
        cb.record_failure(now, 0.6, 3);
        assert_eq!(cb.state(), CircuitState::Open);
        assert_eq!(cb.circuit_broken_at(), Some(now));
    }

    #[test]
    fn open_denies_until_timeout_elapses() {
        let mut cb = CircuitBreaker::new(cfg());
        let opened = Utc::now();
        cb.record_failure(opened, 0.6, 3);
        assert!(!cb.should_allow(opened + Duration::minutes(5)));
        assert!(cb.should_allow(opened + Duration::minutes(16)));
        assert_eq!(cb.state(), CircuitState::HalfOpen);
    }

    #[test]
    fn half_open_closes_after_enough_successful_probes() {
        let mut cb = CircuitBreaker::new(cfg());
        let opened = Utc::now();
        cb.record_failure(opened, 0.6, 3);
        cb.should_allow(opened + Duration::minutes(16));
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        cb.record_success(opened + Duration::minutes(16));
        cb.record_success(opened + Duration::minutes(16));
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        cb.record_success(opened + Duration::minutes(16));
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.circuit_broken_at(), None);
    }

    #[test]
    fn half_open_reopens_on_any_failure() {
        let mut cb = CircuitBreaker::new(cfg());
        let opened = Utc::now();
        cb.record_failure(opened, 0.6, 3);
        cb.should_allow(opened + Duration::minutes(16));
        cb.record_failure(opened + Duration::minutes(16), 1.0, 1);
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[test]
    fn forced_probe_success_while_open_enters_half_open() {
        let mut cb = CircuitBreaker::new(cfg());
        let opened = Utc::now();
        cb.record_failure(opened, 0.6, 3);
        assert_eq!(cb.state(), CircuitState::Open);

        // Even though openTimeout has not elapsed, a forced probe success
        // (dispatcher bypassed suspension) flips the breaker into HalfOpen.
        cb.record_success(opened + Duration::minutes(1));
        assert_eq!(cb.state(), CircuitState::HalfOpen);
    }
}
