//! Scheduler (C4): channel selection, trace affinity, promotion, and
//! low-quality demotion. Stateless per request beyond the trace-affinity
//! map.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::RwLock;

use crate::circuit::clock::Clock;
use crate::models::channel::ChannelSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulingStrategy {
    Failover,
    Random,
    Weighted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionReason {
    Affinity,
    Promotion,
    Strategy,
}

#[derive(Debug, Clone)]
pub struct Selection {
    pub channel_index: usize,
    pub reason: SelectionReason,
}

#[derive(Debug, thiserror::Error, Clone)]
#[error("no channels available for api type {api_type}")]
pub struct NoChannelsAvailable {
    pub api_type: String,
}

#[derive(Debug, Clone)]
struct TraceAffinityEntry {
    channel_index: usize,
    expires_at: DateTime<Utc>,
}

pub struct Scheduler {
    strategy: SchedulingStrategy,
    affinity_ttl: Duration,
    clock: Arc<dyn Clock>,
    trace_affinity: RwLock<HashMap<String, TraceAffinityEntry>>,
}

impl Scheduler {
    pub fn new(strategy: SchedulingStrategy, affinity_ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            strategy,
            affinity_ttl,
            clock,
            trace_affinity: RwLock::new(HashMap::new()),
        }
    }

    pub async fn select_channel(
        &self,
        channels: &ChannelSet,
        user_id: &str,
        failed_channels: &[usize],
        api_type: &str,
    ) -> Result<Selection, NoChannelsAvailable> {
        let now = self.clock.now();
        let mut candidates = channels.active_candidates(failed_channels);
        if candidates.is_empty() {
            return Err(NoChannelsAvailable {
                api_type: api_type.to_string(),
            });
        }

        let promoted: Vec<usize> = candidates
            .iter()
            .copied()
            .filter(|&idx| channels.get(idx).map(|c| c.is_promoted(now)).unwrap_or(false))
            .collect();
        let promotion_active = !promoted.is_empty();
        if promotion_active {
            candidates = promoted;
        }

        if !promotion_active && !user_id.is_empty() {
            if let Some(channel_index) = self.affinity_target(user_id, &candidates).await {
                return Ok(Selection {
                    channel_index,
                    reason: SelectionReason::Affinity,
                });
            }
        }

        let channel_index = self.apply_strategy(channels, &candidates);
        Ok(Selection {
            channel_index,
            reason: if promotion_active {
                SelectionReason::Promotion
            } else {
                SelectionReason::Strategy
            },
        })
    }

    /// Returns the affinity target if it's still among `candidates`,
    /// discarding (but not extending) a stale entry otherwise.
    async fn affinity_target(&self, user_id: &str, candidates: &[usize]) -> Option<usize> {
        let now = self.clock.now();
        let mut guard = self.trace_affinity.write().await;
        match guard.get(user_id) {
            Some(entry) if entry.expires_at > now && candidates.contains(&entry.channel_index) => {
                Some(entry.channel_index)
            }
            Some(_) => {
                guard.remove(user_id);
                None
            }
            None => None,
        }
    }

    fn apply_strategy(&self, channels: &ChannelSet, candidates: &[usize]) -> usize {
        let (primary, low_quality): (Vec<usize>, Vec<usize>) = candidates
            .iter()
            .copied()
            .partition(|&idx| !channels.get(idx).map(|c| c.low_quality).unwrap_or(false));

        let pool = if !primary.is_empty() { &primary } else { &low_quality };
        self.pick(channels, pool)
    }

    fn pick(&self, channels: &ChannelSet, pool: &[usize]) -> usize {
        match self.strategy {
            SchedulingStrategy::Failover => *pool
                .iter()
                .min_by_key(|&&idx| channels.get(idx).map(|c| c.priority).unwrap_or(i64::MAX))
                .expect("pool is non-empty"),
            SchedulingStrategy::Random => {
                let i = fastrand::usize(..pool.len());
                pool[i]
            }
            SchedulingStrategy::Weighted => {
                let weights: Vec<i64> = pool
                    .iter()
                    .map(|&idx| channels.get(idx).map(|c| c.priority.max(1)).unwrap_or(1))
                    .collect();
                let total: i64 = weights.iter().sum();
                let mut roll = fastrand::i64(0..total.max(1));
                for (i, w) in weights.iter().enumerate() {
                    if roll < *w {
                        return pool[i];
                    }
                    roll -= w;
                }
                pool[pool.len() - 1]
            }
        }
    }

    /// No-op for an empty `user_id`; otherwise inserts or refreshes the
    /// affinity TTL entry.
    pub async fn set_trace_affinity(&self, user_id: &str, channel_index: usize) {
        if user_id.is_empty() {
            return;
        }
        let now = self.clock.now();
        self.trace_affinity.write().await.insert(
            user_id.to_string(),
            TraceAffinityEntry {
                channel_index,
                expires_at: now + self.affinity_ttl,
            },
        );
    }

    /// Removes expired trace-affinity entries. Intended to run as a
    /// periodic background sweep alongside the metrics sweepers.
    pub async fn sweep_expired_affinity(&self) {
        let now = self.clock.now();
        self.trace_affinity.write().await.retain(|_, e| e.expires_at > now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit::clock::ManualClock;
    use crate::models::channel::{Channel, ChannelStatus, ServiceType};
    use std::collections::HashMap as Map;

    fn chan(name: &str, priority: i64) -> Channel {
        Channel {
            name: name.to_string(),
            service_type: ServiceType::MessagesStyle,
            base_urls: vec!["https://x".to_string()],
            api_keys: vec!["k".to_string()],
            priority,
            status: ChannelStatus::Active,
            model_mapping: Map::new(),
            promotion_until: None,
            low_quality: false,
            insecure_skip_verify: false,
        }
    }

    #[tokio::test]
    async fn failover_picks_lowest_priority() {
        let scheduler = Scheduler::new(
            SchedulingStrategy::Failover,
            Duration::minutes(2),
            Arc::new(ManualClock::new(Utc::now())),
        );
        let set = ChannelSet {
            channels: vec![chan("a", 2), chan("b", 1)],
        };
        let sel = scheduler.select_channel(&set, "", &[], "messages").await.unwrap();
        assert_eq!(sel.channel_index, 1);
    }

    #[tokio::test]
    async fn trace_affinity_sticks_to_assigned_channel() {
        let scheduler = Scheduler::new(
            SchedulingStrategy::Failover,
            Duration::minutes(2),
            Arc::new(ManualClock::new(Utc::now())),
        );
        let set = ChannelSet {
            channels: vec![chan("a", 1), chan("b", 2)],
        };
        scheduler.set_trace_affinity("user-1", 1).await;
        let sel = scheduler
            .select_channel(&set, "user-1", &[], "messages")
            .await
            .unwrap();
        assert_eq!(sel.channel_index, 1);
        assert_eq!(sel.reason, SelectionReason::Affinity);
    }

    #[tokio::test]
    async fn low_quality_channels_deferred_until_others_exhausted() {
        let scheduler = Scheduler::new(
            SchedulingStrategy::Failover,
            Duration::minutes(2),
            Arc::new(ManualClock::new(Utc::now())),
        );
        let mut low = chan("low", 1);
        low.low_quality = true;
        let set = ChannelSet {
            channels: vec![low, chan("good", 2)],
        };
        let sel = scheduler.select_channel(&set, "", &[], "messages").await.unwrap();
        assert_eq!(sel.channel_index, 1);
    }

    #[tokio::test]
    async fn promotion_restricts_candidate_pool() {
        let scheduler = Scheduler::new(
            SchedulingStrategy::Failover,
            Duration::minutes(2),
            Arc::new(ManualClock::new(Utc::now())),
        );
        let mut promoted = chan("promoted", 5);
        promoted.promotion_until = Some(Utc::now() + Duration::minutes(5));
        let set = ChannelSet {
            channels: vec![chan("normal", 1), promoted],
        };
        let sel = scheduler.select_channel(&set, "", &[], "messages").await.unwrap();
        assert_eq!(sel.channel_index, 1);
        assert_eq!(sel.reason, SelectionReason::Promotion);
    }

    #[tokio::test]
    async fn no_active_candidates_errors() {
        let scheduler = Scheduler::new(
            SchedulingStrategy::Failover,
            Duration::minutes(2),
            Arc::new(ManualClock::new(Utc::now())),
        );
        let set = ChannelSet { channels: vec![] };
        assert!(scheduler.select_channel(&set, "", &[], "messages").await.is_err());
    }
}
