use serde_json::Value;

use crate::metrics::UsageEstimator;
use crate::models::Usage;

/// Usage as reported directly by the upstream, before reconciliation.
#[derive(Debug, Clone, Copy, Default)]
pub struct RawUsage {
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub cache_creation_input_tokens: i64,
    pub cache_read_input_tokens: i64,
}

/// Extracts canonical usage from a messages-style `usage` object,
/// reconciling a missing `cache_creation_input_tokens` aggregate from the
/// `5mInputTokens + 1hInputTokens` TTL breakdown some upstreams report
/// instead (spec §4.2).
pub fn extract_messages_style_usage(usage: &Value) -> RawUsage {
    let mut creation = usage.get("cache_creation_input_tokens").and_then(Value::as_i64).unwrap_or(0);
    if creation <= 0 {
        if let Some(breakdown) = usage.get("cache_creation").and_then(Value::as_object) {
            let five_min = breakdown.get("ephemeral_5m_input_tokens").and_then(Value::as_i64).unwrap_or(0);
            let one_hour = breakdown.get("ephemeral_1h_input_tokens").and_then(Value::as_i64).unwrap_or(0);
            creation = five_min + one_hour;
        }
    }
    RawUsage {
        input_tokens: usage.get("input_tokens").and_then(Value::as_i64).unwrap_or(0),
        output_tokens: usage.get("output_tokens").and_then(Value::as_i64).unwrap_or(0),
        cache_creation_input_tokens: creation,
        cache_read_input_tokens: usage.get("cache_read_input_tokens").and_then(Value::as_i64).unwrap_or(0),
    }
}

pub fn extract_openai_style_usage(usage: &Value) -> RawUsage {
    RawUsage {
        input_tokens: usage.get("prompt_tokens").and_then(Value::as_i64).unwrap_or(0),
        output_tokens: usage.get("completion_tokens").and_then(Value::as_i64).unwrap_or(0),
        cache_creation_input_tokens: 0,
        cache_read_input_tokens: 0,
    }
}

/// `inputTokens = promptTokenCount - cachedContentTokenCount` for gemini.
pub fn extract_gemini_style_usage(usage: &Value) -> RawUsage {
    let prompt = usage.get("promptTokenCount").and_then(Value::as_i64).unwrap_or(0);
    let cached = usage.get("cachedContentTokenCount").and_then(Value::as_i64).unwrap_or(0);
    RawUsage {
        input_tokens: prompt - cached,
        output_tokens: usage.get("candidatesTokenCount").and_then(Value::as_i64).unwrap_or(0),
        cache_creation_input_tokens: 0,
        cache_read_input_tokens: cached,
    }
}

/// Applies the `<=1`-token degenerate-usage fallback (spec §4.6/§9,
/// resolved in SPEC_FULL.md as the `estimate_low_usage` config flag): when
/// enabled and a reported count is `<=1` with no cache tokens present, an
/// estimate derived from the request/response text is substituted.
pub fn reconcile_usage(
    raw: RawUsage,
    estimate_low_usage: bool,
    estimator: &dyn UsageEstimator,
    model: &str,
    input_text: &str,
    output_text: &str,
) -> Usage {
    let has_cache = raw.cache_creation_input_tokens > 0 || raw.cache_read_input_tokens > 0;

    let input_tokens = if estimate_low_usage && raw.input_tokens <= 1 && !has_cache {
        estimator.estimate(model, input_text)
    } else {
        raw.input_tokens.max(0) as u32
    };

    let output_tokens = if estimate_low_usage && raw.output_tokens <= 1 && !has_cache {
        estimator.estimate(model, output_text)
    } else {
        raw.output_tokens.max(0) as u32
    };

    Usage {
        input_tokens,
        output_tokens,
        cache_creation_input_tokens: raw.cache_creation_input_tokens.max(0) as u32,
        cache_read_input_tokens: raw.cache_read_input_tokens.max(0) as u32,
    }
}
