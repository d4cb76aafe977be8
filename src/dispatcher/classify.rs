/// Classifies an upstream HTTP error as retryable/terminal and flags
/// quota-like failures for deprioritization (spec §4.5 `classifyError`).
///
/// `fuzzy_mode` controls how an ambiguous, non-quota 4xx that isn't 401/403
/// is treated: retried when fuzzy, terminal (forwarded verbatim) when
/// strict.
pub fn classify_error(status: u16, body: &str, fuzzy_mode: bool) -> (bool, bool) {
    debug_assert!(!(200..300).contains(&status), "success status never reaches classify_error");

    if (400..500).contains(&status) && is_quota_like(body) {
        return (true, true);
    }
    if status == 429 || status == 408 || (500..600).contains(&status) {
        return (true, false);
    }
    if status == 401 || status == 403 {
        return (true, false);
    }
    if (400..500).contains(&status) {
        return (fuzzy_mode, false);
    }
    (true, false)
}

fn is_quota_like(body: &str) -> bool {
    let lower = body.to_ascii_lowercase();
    const PATTERNS: &[&str] = &["insufficient_quota", "rate_limit", "quota exceeded", "limit reached", "429"];
    PATTERNS.iter().any(|p| lower.contains(p))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quota_body_on_4xx_is_retryable_and_quota_like() {
        let (retry, quota) = classify_error(400, r#"{"error":{"message":"quota exceeded"}}"#, true);
        assert!(retry);
        assert!(quota);
    }

    #[test]
    fn plain_5xx_is_retryable_not_quota_like() {
        let (retry, quota) = classify_error(502, "bad gateway", true);
        assert!(retry);
        assert!(!quota);
    }

    #[test]
    fn auth_errors_are_retryable_to_try_next_key() {
        let (retry, quota) = classify_error(401, "unauthorized", false);
        assert!(retry);
        assert!(!quota);
    }

    #[test]
    fn strict_mode_treats_deterministic_4xx_as_terminal() {
        let (retry, quota) = classify_error(422, "bad request body", false);
        assert!(!retry);
        assert!(!quota);
    }

    #[test]
    fn fuzzy_mode_retries_ambiguous_4xx() {
        let (retry, quota) = classify_error(422, "bad request body", true);
        assert!(retry);
        assert!(!quota);
    }
}
