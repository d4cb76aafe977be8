use serde::{Deserialize, Serialize};

/// Canonical token accounting, independent of upstream dialect.
///
/// Every dialect's usage block is normalized into this shape before it
/// reaches the metrics engine (spec §4.6 "Usage extraction").
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub cache_creation_input_tokens: u32,
    pub cache_read_input_tokens: u32,
}

impl Usage {
    /// `cacheReadTokens / (cacheReadTokens + inputTokens)` as a percentage,
    /// or 0.0 when there is no read traffic to measure.
    pub fn cache_hit_rate_pct(&self) -> f64 {
        let denom = self.cache_read_input_tokens + self.input_tokens;
        if denom == 0 {
            0.0
        } else {
            (self.cache_read_input_tokens as f64 / denom as f64) * 100.0
        }
    }

    /// Reconciles a missing `cache_creation_input_tokens` aggregate from a
    /// TTL breakdown (`5m` + `1h` buckets) some upstreams report instead.
    pub fn with_cache_creation_breakdown(mut self, five_min: u32, one_hour: u32) -> Self {
        if self.cache_creation_input_tokens == 0 {
            self.cache_creation_input_tokens = five_min + one_hour;
        }
        self
    }
}
