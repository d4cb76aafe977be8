use sqlx::FromRow;

use super::usage::Usage;

/// One row in the request-records table: a single request outcome.
///
/// Retention is 3-30 days (clamped by [`crate::config::MetricsConfig::retention_days`]).
#[derive(Debug, Clone, FromRow)]
pub struct PersistedRecord {
    pub metrics_key: String,
    pub base_url: String,
    pub key_mask: String,
    pub timestamp_unix: i64,
    pub success: bool,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub cache_creation_tokens: i64,
    pub cache_read_tokens: i64,
    pub model: String,
    pub cost_cents: i64,
    pub api_type: String,
}

impl PersistedRecord {
    pub fn usage(&self) -> Usage {
        Usage {
            input_tokens: self.input_tokens.max(0) as u32,
            output_tokens: self.output_tokens.max(0) as u32,
            cache_creation_input_tokens: self.cache_creation_tokens.max(0) as u32,
            cache_read_input_tokens: self.cache_read_tokens.max(0) as u32,
        }
    }
}

/// One row in the daily rollup table, keyed on `(date, api_type, metrics_key)`.
#[derive(Debug, Clone, FromRow)]
pub struct DailyRollup {
    pub date: String,
    pub api_type: String,
    pub metrics_key: String,
    pub request_count: i64,
    pub success_count: i64,
    pub failure_count: i64,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub cache_creation_tokens: i64,
    pub cache_read_tokens: i64,
    pub cost_cents: i64,
}

/// One row in the request-log table (24h retention).
#[derive(Debug, Clone, FromRow)]
pub struct RequestLogEntry {
    pub request_id: String,
    pub channel_index: i64,
    pub channel_name: String,
    pub key_mask: String,
    pub timestamp_unix: i64,
    pub duration_ms: i64,
    pub status_code: i64,
    pub success: bool,
    pub model: String,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub cost_cents: i64,
    pub error_message: Option<String>,
    pub api_type: String,
}

/// Masks all but the last 4 characters of an API key for log/storage
/// purposes (`sk-...abcd`-style), matching the `key_mask` columns above.
pub fn mask_key(key: &str) -> String {
    let tail: String = key.chars().rev().take(4).collect::<Vec<_>>().into_iter().rev().collect();
    if key.len() <= 4 {
        "*".repeat(key.len())
    } else {
        format!("{}{}", "*".repeat(key.len() - 4), tail)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn masks_all_but_last_four() {
        assert_eq!(mask_key("sk-abcdefgh1234"), "***********1234");
    }

    #[test]
    fn masks_short_keys_entirely() {
        assert_eq!(mask_key("abc"), "***");
    }
}
