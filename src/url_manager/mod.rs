//! URL Manager (C3): per-channel dynamic reordering of alternate baseURLs
//! based on recent success/failure and a cooldown window.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::RwLock;

use crate::circuit::clock::Clock;

#[derive(Debug, Clone)]
pub struct UrlState {
    pub url: String,
    pub original_idx: usize,
    pub fail_count: u32,
    pub last_fail_time: Option<DateTime<Utc>>,
    pub last_success_time: Option<DateTime<Utc>>,
    pub total_requests: u64,
    pub total_failures: u64,
}

impl UrlState {
    fn fresh(url: String, original_idx: usize) -> Self {
        Self {
            url,
            original_idx,
            fail_count: 0,
            last_fail_time: None,
            last_success_time: None,
            total_requests: 0,
            total_failures: 0,
        }
    }

    fn available(&self, now: DateTime<Utc>, cooldown: Duration) -> bool {
        self.fail_count == 0
            || self
                .last_fail_time
                .map(|t| now - t >= cooldown)
                .unwrap_or(true)
    }

    fn remaining_cooldown(&self, now: DateTime<Utc>, cooldown: Duration) -> Duration {
        match self.last_fail_time {
            Some(t) => (cooldown - (now - t)).max(Duration::zero()),
            None => Duration::zero(),
        }
    }
}

#[derive(Debug, Clone)]
struct ChannelUrlState {
    states: Vec<UrlState>,
}

#[derive(Debug, Clone, Copy)]
pub struct UrlManagerConfig {
    pub failure_cooldown: Duration,
}

impl Default for UrlManagerConfig {
    fn default() -> Self {
        Self {
            failure_cooldown: Duration::seconds(30),
        }
    }
}

/// One entry in a `getSortedURLs` result.
#[derive(Debug, Clone)]
pub struct SortedUrl {
    pub url: String,
    pub original_idx: usize,
    pub available: bool,
}

pub struct UrlManager {
    config: UrlManagerConfig,
    clock: Arc<dyn Clock>,
    channels: RwLock<HashMap<usize, ChannelUrlState>>,
}

impl UrlManager {
    pub fn new(config: UrlManagerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            channels: RwLock::new(HashMap::new()),
        }
    }

    pub async fn invalidate(&self, channel_index: usize) {
        self.channels.write().await.remove(&channel_index);
    }

    /// Returns the dynamically-sorted URL list for a channel, rebuilding
    /// (and resyncing `originalIdx`) if the configured URL set has drifted
    /// from what's stored.
    pub async fn get_sorted_urls(&self, channel_index: usize, urls: &[String]) -> Vec<SortedUrl> {
        let now = self.clock.now();
        let mut guard = self.channels.write().await;
        let entry = guard.entry(channel_index).or_insert_with(|| ChannelUrlState {
            states: urls
                .iter()
                .enumerate()
                .map(|(idx, u)| UrlState::fresh(u.clone(), idx))
                .collect(),
        });

        if !matches_configured(entry, urls) {
            rebuild(entry, urls);
        }

        let cooldown = self.config.failure_cooldown;
        let mut sorted: Vec<&UrlState> = entry.states.iter().collect();
        sorted.sort_by(|a, b| sort_key(a, now, cooldown).cmp(&sort_key(b, now, cooldown)));

        sorted
            .into_iter()
            .map(|s| SortedUrl {
                url: s.url.clone(),
                original_idx: s.original_idx,
                available: s.available(now, cooldown),
            })
            .collect()
    }

    pub async fn mark_success(&self, channel_index: usize, url: &str) {
        let now = self.clock.now();
        let mut guard = self.channels.write().await;
        if let Some(entry) = guard.get_mut(&channel_index) {
            if let Some(state) = entry.states.iter_mut().find(|s| s.url == url) {
                state.total_requests += 1;
                state.last_success_time = Some(now);
                state.fail_count = 0;
            }
        }
    }

    pub async fn mark_failure(&self, channel_index: usize, url: &str) {
        let now = self.clock.now();
        let mut guard = self.channels.write().await;
        if let Some(entry) = guard.get_mut(&channel_index) {
            if let Some(state) = entry.states.iter_mut().find(|s| s.url == url) {
                state.total_requests += 1;
                state.total_failures += 1;
                state.fail_count += 1;
                state.last_fail_time = Some(now);
            }
        }
    }
}

/// Sort key tuple ordered per spec §4.3: healthy-first, then cooldown
/// elapsed before still-cooling, with the documented tiebreakers.
fn sort_key(state: &UrlState, now: DateTime<Utc>, cooldown: Duration) -> (u8, i64, u32, usize) {
    if state.fail_count == 0 {
        return (0, 0, 0, state.original_idx);
    }
    let in_cooldown = state
        .last_fail_time
        .map(|t| now - t < cooldown)
        .unwrap_or(false);
    if !in_cooldown {
        (1, 0, state.fail_count, state.original_idx)
    } else {
        let remaining = state.remaining_cooldown(now, cooldown).num_milliseconds();
        (2, remaining, state.fail_count, state.original_idx)
    }
}

fn matches_configured(entry: &ChannelUrlState, urls: &[String]) -> bool {
    let mut stored: Vec<&str> = entry.states.iter().map(|s| s.url.as_str()).collect();
    let mut configured: Vec<&str> = urls.iter().map(String::as_str).collect();
    stored.sort_unstable();
    configured.sort_unstable();
    stored == configured
}

/// Rebuilds state for a drifted URL list. URLs present in both the old and
/// new configuration carry their accumulated state forward; `originalIdx`
/// is resynchronized to the URL's new position.
fn rebuild(entry: &mut ChannelUrlState, urls: &[String]) {
    let mut old_by_url: HashMap<String, UrlState> = entry
        .states
        .drain(..)
        .map(|s| (s.url.clone(), s))
        .collect();

    entry.states = urls
        .iter()
        .enumerate()
        .map(|(idx, url)| match old_by_url.remove(url) {
            Some(mut existing) => {
                existing.original_idx = idx;
                existing
            }
            None => UrlState::fresh(url.clone(), idx),
        })
        .collect();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit::clock::ManualClock;

    fn manager() -> UrlManager {
        UrlManager::new(UrlManagerConfig::default(), Arc::new(ManualClock::new(Utc::now())))
    }

    #[tokio::test]
    async fn healthy_urls_precede_failing_ones() {
        let mgr = manager();
        let urls = vec!["a".to_string(), "b".to_string()];
        mgr.mark_failure(0, "a").await;
        let sorted = mgr.get_sorted_urls(0, &urls).await;
        assert_eq!(sorted[0].url, "b");
    }

    #[tokio::test]
    async fn original_idx_resyncs_after_config_drift() {
        let mgr = manager();
        let urls = vec!["a".to_string(), "b".to_string()];
        let _ = mgr.get_sorted_urls(0, &urls).await;
        let new_urls = vec!["b".to_string(), "c".to_string(), "a".to_string()];
        let sorted = mgr.get_sorted_urls(0, &new_urls).await;
        let b = sorted.iter().find(|s| s.url == "b").unwrap();
        assert_eq!(b.original_idx, 0);
        let a = sorted.iter().find(|s| s.url == "a").unwrap();
        assert_eq!(a.original_idx, 2);
    }

    #[tokio::test]
    async fn cooled_down_url_becomes_available_again() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let mgr = UrlManager::new(UrlManagerConfig::default(), clock.clone());
        let urls = vec!["a".to_string()];
        mgr.mark_failure(0, "a").await;
        let sorted = mgr.get_sorted_urls(0, &urls).await;
        assert!(!sorted[0].available);
        clock.advance(Duration::seconds(31));
        let sorted = mgr.get_sorted_urls(0, &urls).await;
        assert!(sorted[0].available);
    }
}
