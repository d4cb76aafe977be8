use std::collections::VecDeque;

use chrono::{DateTime, Duration, Utc};
use sha2::{Digest, Sha256};

use crate::circuit::{CircuitBreaker, CircuitBreakerConfig};
use crate::models::Usage;

/// Derives the metrics map key for a `(baseURL, apiKey)` pair:
/// `truncated-hex(sha256(baseURL|apiKey))`.
pub fn metrics_key(base_url: &str, api_key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(base_url.as_bytes());
    hasher.update(b"|");
    hasher.update(api_key.as_bytes());
    let digest = hasher.finalize();
    hex::encode(digest)[..16].to_string()
}

/// One in-memory outcome sample, retained 24h with a hard ceiling.
#[derive(Debug, Clone)]
pub struct RequestRecord {
    pub timestamp: DateTime<Utc>,
    pub success: bool,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub cache_creation_tokens: u32,
    pub cache_read_tokens: u32,
    pub model: String,
    pub cost_cents: u32,
}

const HISTORY_RETENTION: Duration = Duration::hours(24);
const HISTORY_HARD_CEILING: usize = 10_000;
const HISTORY_TRIM_TARGET_RATIO: f64 = 0.9;

/// The central per-(baseURL, apiKey) record.
#[derive(Debug, Clone)]
pub struct KeyMetrics {
    pub request_count: u64,
    pub success_count: u64,
    pub failure_count: u64,
    pub consecutive_failures: u64,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub recent_results: VecDeque<bool>,
    pub request_history: VecDeque<RequestRecord>,
    pub circuit_breaker: CircuitBreaker,
    window_size: usize,
}

impl KeyMetrics {
    pub fn new(window_size: usize, breaker_config: CircuitBreakerConfig) -> Self {
        Self {
            request_count: 0,
            success_count: 0,
            failure_count: 0,
            consecutive_failures: 0,
            last_success_at: None,
            last_failure_at: None,
            recent_results: VecDeque::with_capacity(window_size),
            request_history: VecDeque::new(),
            circuit_breaker: CircuitBreaker::new(breaker_config),
            window_size: window_size.max(3),
        }
    }

    pub fn circuit_broken_at(&self) -> Option<DateTime<Utc>> {
        self.circuit_breaker.circuit_broken_at()
    }

    pub fn failure_rate(&self) -> f64 {
        if self.recent_results.is_empty() {
            return 0.0;
        }
        let failures = self.recent_results.iter().filter(|ok| !**ok).count();
        failures as f64 / self.recent_results.len() as f64
    }

    pub fn sample_count(&self) -> usize {
        self.recent_results.len()
    }

    fn push_result(&mut self, outcome: bool) {
        self.recent_results.push_back(outcome);
        while self.recent_results.len() > self.window_size {
            self.recent_results.pop_front();
        }
    }

    fn push_history(&mut self, record: RequestRecord, now: DateTime<Utc>) {
        self.request_history.push_back(record);
        let cutoff = now - HISTORY_RETENTION;
        while matches!(self.request_history.front(), Some(r) if r.timestamp <= cutoff) {
            self.request_history.pop_front();
        }
        if self.request_history.len() > HISTORY_HARD_CEILING {
            let target = (HISTORY_HARD_CEILING as f64 * HISTORY_TRIM_TARGET_RATIO) as usize;
            let drop = self.request_history.len() - target;
            for _ in 0..drop {
                self.request_history.pop_front();
            }
        }
    }

    /// Records a success outcome. Returns the persisted-record shape the
    /// caller should enqueue for durable storage.
    pub fn record_success(
        &mut self,
        now: DateTime<Utc>,
        usage: Option<Usage>,
        model: &str,
        cost_cents: u32,
    ) -> RequestRecord {
        self.request_count += 1;
        self.success_count += 1;
        self.consecutive_failures = 0;
        self.last_success_at = Some(now);
        self.push_result(true);

        let usage = usage.unwrap_or_default();
        let record = RequestRecord {
            timestamp: now,
            success: true,
            input_tokens: usage.input_tokens,
            output_tokens: usage.output_tokens,
            cache_creation_tokens: usage.cache_creation_input_tokens,
            cache_read_tokens: usage.cache_read_input_tokens,
            model: model.to_string(),
            cost_cents,
        };
        self.push_history(record.clone(), now);

        self.circuit_breaker.record_success(now);
        // A success can still push the window over threshold when paired
        // with prior failures in the same window (spec §4.2).
        self.circuit_breaker
            .record_failure(now, self.failure_rate(), self.sample_count());

        record
    }

    /// Records a failure outcome. Returns the persisted-record shape the
    /// caller should enqueue for durable storage.
    pub fn record_failure(&mut self, now: DateTime<Utc>, model: &str) -> RequestRecord {
        self.request_count += 1;
        self.failure_count += 1;
        self.consecutive_failures += 1;
        self.last_failure_at = Some(now);
        self.push_result(false);

        let record = RequestRecord {
            timestamp: now,
            success: false,
            input_tokens: 0,
            output_tokens: 0,
            cache_creation_tokens: 0,
            cache_read_tokens: 0,
            model: model.to_string(),
            cost_cents: 0,
        };
        self.push_history(record.clone(), now);

        self.circuit_breaker
            .record_failure(now, self.failure_rate(), self.sample_count());

        record
    }

    pub fn last_activity(&self) -> Option<DateTime<Utc>> {
        match (self.last_success_at, self.last_failure_at) {
            (Some(s), Some(f)) => Some(s.max(f)),
            (Some(s), None) => Some(s),
            (None, Some(f)) => Some(f),
            (None, None) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metrics_key_is_stable_and_truncated() {
        let k1 = metrics_key("https://api.example.com", "sk-abc");
        let k2 = metrics_key("https://api.example.com", "sk-abc");
        assert_eq!(k1, k2);
        assert_eq!(k1.len(), 16);
    }

    #[test]
    fn request_count_equals_success_plus_failure() {
        let mut km = KeyMetrics::new(10, CircuitBreakerConfig::from_window(10));
        let now = Utc::now();
        km.record_success(now, None, "m", 0);
        km.record_failure(now, "m");
        km.record_success(now, None, "m", 0);
        assert_eq!(km.request_count, km.success_count + km.failure_count);
    }

    #[test]
    fn consecutive_failures_resets_on_success() {
        let mut km = KeyMetrics::new(10, CircuitBreakerConfig::from_window(10));
        let now = Utc::now();
        km.record_failure(now, "m");
        km.record_failure(now, "m");
        assert_eq!(km.consecutive_failures, 2);
        km.record_success(now, None, "m", 0);
        assert_eq!(km.consecutive_failures, 0);
    }

    #[test]
    fn recent_results_never_exceeds_window() {
        let mut km = KeyMetrics::new(3, CircuitBreakerConfig::from_window(3));
        let now = Utc::now();
        for _ in 0..10 {
            km.record_success(now, None, "m", 0);
        }
        assert!(km.recent_results.len() <= 3);
    }
}
