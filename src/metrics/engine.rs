use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use sqlx::SqlitePool;
use tokio::sync::{broadcast, OnceCell, RwLock};
use tokio::time::interval;
use tracing::{debug, info};

use crate::circuit::clock::Clock;
use crate::circuit::CircuitBreakerConfig;
use crate::models::{metrics_record::mask_key, PersistedRecord, Usage};

use super::history::{bucket_from_daily_rollup, bucket_from_raw_table, bucket_in_memory, HistoricalStats};
use super::key_metrics::{metrics_key, KeyMetrics};
use super::persistence::PersistenceBuffer;

#[derive(Debug, Clone)]
pub struct MetricsConfig {
    pub window_size: usize,
    pub breaker: CircuitBreakerConfig,
    pub retention_days: u32,
    pub flush_threshold: usize,
    /// Substitute an estimate for upstream-reported `<=1`-token usage
    /// fields with no cache tokens present (spec §9 open question).
    pub estimate_low_usage: bool,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            window_size: 20,
            breaker: CircuitBreakerConfig::from_window(20),
            retention_days: 14,
            flush_threshold: 100,
            estimate_low_usage: true,
        }
    }
}

/// Owns the concurrent `metricsKey -> KeyMetrics` map and drives the
/// embedded circuit breaker on every mutating operation (spec §4.2).
pub struct MetricsEngine {
    map: Arc<RwLock<HashMap<String, KeyMetrics>>>,
    config: MetricsConfig,
    clock: Arc<dyn Clock>,
    persistence: PersistenceBuffer,
    stop_tx: broadcast::Sender<()>,
    /// Set once from `spawn_background_workers`, giving the otherwise
    /// DB-free `MetricsEngine` lazy access to the pool for the >24h
    /// historical-stats tiers.
    pool: OnceCell<SqlitePool>,
}

impl MetricsEngine {
    pub fn new(config: MetricsConfig, clock: Arc<dyn Clock>) -> Self {
        let (stop_tx, _) = broadcast::channel(1);
        Self {
            map: Arc::new(RwLock::new(HashMap::new())),
            persistence: PersistenceBuffer::new(config.flush_threshold),
            config,
            clock,
            stop_tx,
            pool: OnceCell::new(),
        }
    }

    fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    async fn with_entry_mut<R>(&self, metrics_key: &str, f: impl FnOnce(&mut KeyMetrics) -> R) -> R {
        let mut guard = self.map.write().await;
        let entry = guard
            .entry(metrics_key.to_string())
            .or_insert_with(|| KeyMetrics::new(self.config.window_size, self.config.breaker.clone()));
        f(entry)
    }

    pub async fn record_success(
        &self,
        base_url: &str,
        api_key: &str,
        usage: Option<Usage>,
        model: &str,
        cost_cents: u32,
        api_type: &str,
    ) {
        let key = metrics_key(base_url, api_key);
        let now = self.now();
        let record = self
            .with_entry_mut(&key, |km| km.record_success(now, usage, model, cost_cents))
            .await;

        self.persistence
            .enqueue(PersistedRecord {
                metrics_key: key,
                base_url: base_url.to_string(),
                key_mask: mask_key(api_key),
                timestamp_unix: record.timestamp.timestamp(),
                success: record.success,
                input_tokens: record.input_tokens as i64,
                output_tokens: record.output_tokens as i64,
                cache_creation_tokens: record.cache_creation_tokens as i64,
                cache_read_tokens: record.cache_read_tokens as i64,
                model: record.model,
                cost_cents: record.cost_cents as i64,
                api_type: api_type.to_string(),
            })
            .await;
    }

    pub async fn record_failure(&self, base_url: &str, api_key: &str, model: &str, api_type: &str) {
        let key = metrics_key(base_url, api_key);
        let now = self.now();
        let record = self.with_entry_mut(&key, |km| km.record_failure(now, model)).await;

        self.persistence
            .enqueue(PersistedRecord {
                metrics_key: key,
                base_url: base_url.to_string(),
                key_mask: mask_key(api_key),
                timestamp_unix: record.timestamp.timestamp(),
                success: false,
                input_tokens: 0,
                output_tokens: 0,
                cache_creation_tokens: 0,
                cache_read_tokens: 0,
                model: record.model,
                cost_cents: 0,
                api_type: api_type.to_string(),
            })
            .await;
    }

    /// `true` iff the key should currently be skipped. Also advances
    /// Open -> HalfOpen in place when the timeout has elapsed.
    pub async fn should_suspend_key(&self, base_url: &str, api_key: &str) -> bool {
        let key = metrics_key(base_url, api_key);
        let now = self.now();
        !self
            .with_entry_mut(&key, |km| km.circuit_breaker.should_allow(now))
            .await
    }

    pub async fn are_all_keys_suspended(&self, base_url: &str, keys: &[String]) -> bool {
        for key in keys {
            if !self.should_suspend_key(base_url, key).await {
                return false;
            }
        }
        !keys.is_empty()
    }

    /// Aggregates `recentResults` across all listed keys. Below the sample
    /// threshold it defaults to healthy to avoid cold-start false
    /// positives.
    pub async fn is_channel_healthy_with_keys(&self, base_url: &str, keys: &[String]) -> bool {
        let guard = self.map.read().await;
        let mut total = 0usize;
        let mut failures = 0usize;
        for api_key in keys {
            let mk = metrics_key(base_url, api_key);
            if let Some(km) = guard.get(&mk) {
                total += km.sample_count();
                failures += (km.failure_rate() * km.sample_count() as f64).round() as usize;
            }
        }
        if total < self.config.breaker.min_request_threshold {
            return true;
        }
        (failures as f64 / total as f64) < self.config.breaker.failure_threshold
    }

    /// Routes by `duration` to the retention tier spec §4.2 assigns it:
    /// `<=24h` buckets the live in-memory history, `24h < duration <= 7d`
    /// queries the raw `request_records` table, and `>7d` queries the
    /// daily rollup (falling back to raw records for the still-open
    /// "today" bucket). The two persisted tiers need the SQLite pool set
    /// by `spawn_background_workers`; if it hasn't been (e.g. a unit test
    /// constructing the engine directly), they degrade to the in-memory
    /// view with a warning rather than erroring.
    pub async fn get_historical_stats(
        &self,
        base_url: &str,
        keys: &[String],
        duration: Duration,
        interval: Duration,
    ) -> HistoricalStats {
        if duration <= Duration::hours(24) {
            let guard = self.map.read().await;
            let selected: Vec<&KeyMetrics> = keys
                .iter()
                .filter_map(|api_key| guard.get(&metrics_key(base_url, api_key)))
                .collect();
            return bucket_in_memory(selected.into_iter(), self.now(), duration, interval);
        }

        let Some(pool) = self.pool.get() else {
            let guard = self.map.read().await;
            let selected: Vec<&KeyMetrics> = keys
                .iter()
                .filter_map(|api_key| guard.get(&metrics_key(base_url, api_key)))
                .collect();
            let mut stats = bucket_in_memory(selected.into_iter(), self.now(), duration, interval);
            stats.warning = Some(
                "no database pool configured; falling back to in-memory history, which may not cover the full requested range"
                    .to_string(),
            );
            return stats;
        };

        let metrics_keys: Vec<String> = keys.iter().map(|k| metrics_key(base_url, k)).collect();
        let result = if duration <= Duration::days(7) {
            bucket_from_raw_table(pool, &metrics_keys, self.now(), duration, interval).await
        } else {
            bucket_from_daily_rollup(pool, &metrics_keys, self.now(), duration).await
        };
        result.unwrap_or_else(|e| {
            tracing::error!(error = %e, "historical stats query failed");
            HistoricalStats {
                buckets: Vec::new(),
                warning: Some(format!("historical stats query failed: {e}")),
            }
        })
    }

    pub fn dropped_record_count(&self) -> u64 {
        self.persistence.dropped_count()
    }

    pub fn stop_signal(&self) -> broadcast::Sender<()> {
        self.stop_tx.clone()
    }

    /// Spawns the persistence flush loop, circuit sweeper, inactivity
    /// sweeper, retention sweeper, and daily-rollup aggregator as
    /// long-lived background tasks, mirroring the teacher's
    /// `tokio::select!`-over-`interval` scheduler shape. Also publishes
    /// `pool` so `get_historical_stats` can serve the >24h tiers.
    pub fn spawn_background_workers(self: &Arc<Self>, pool: SqlitePool) {
        let _ = self.pool.set(pool.clone());
        self.spawn_persistence_loop(pool.clone());
        self.spawn_circuit_sweeper();
        self.spawn_inactivity_sweeper();
        self.spawn_retention_sweeper(pool.clone());
        self.spawn_daily_aggregation_sweeper(pool);
    }

    fn spawn_persistence_loop(self: &Arc<Self>, pool: SqlitePool) {
        let engine = Arc::clone(self);
        let mut stop_rx = self.stop_tx.subscribe();
        tokio::spawn(async move {
            let mut ticker = interval(std::time::Duration::from_secs(30));
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if engine.persistence.should_flush().await || engine.persistence.len().await > 0 {
                            engine.persistence.flush(&pool).await;
                        }
                    }
                    _ = stop_rx.recv() => {
                        engine.persistence.flush_final(&pool).await;
                        break;
                    }
                }
            }
        });
    }

    fn spawn_circuit_sweeper(self: &Arc<Self>) {
        let engine = Arc::clone(self);
        let mut stop_rx = self.stop_tx.subscribe();
        tokio::spawn(async move {
            let mut ticker = interval(std::time::Duration::from_secs(60));
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let now = engine.now();
                        let mut guard = engine.map.write().await;
                        for km in guard.values_mut() {
                            km.circuit_breaker.should_allow(now);
                        }
                    }
                    _ = stop_rx.recv() => break,
                }
            }
        });
    }

    fn spawn_inactivity_sweeper(self: &Arc<Self>) {
        let engine = Arc::clone(self);
        let mut stop_rx = self.stop_tx.subscribe();
        tokio::spawn(async move {
            let mut ticker = interval(std::time::Duration::from_secs(3600));
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let now = engine.now();
                        let mut guard = engine.map.write().await;
                        let before = guard.len();
                        guard.retain(|_, km| {
                            km.last_activity()
                                .map(|t| now - t < Duration::hours(48))
                                .unwrap_or(true)
                        });
                        let removed = before - guard.len();
                        if removed > 0 {
                            debug!(removed, "swept inactive metrics keys");
                        }
                    }
                    _ = stop_rx.recv() => break,
                }
            }
        });
    }

    fn spawn_retention_sweeper(self: &Arc<Self>, pool: SqlitePool) {
        let engine = Arc::clone(self);
        let mut stop_rx = self.stop_tx.subscribe();
        let retention_days = self.config.retention_days.clamp(3, 30);
        tokio::spawn(async move {
            let mut ticker = interval(std::time::Duration::from_secs(3600));
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let cutoff = (engine.now() - Duration::days(retention_days as i64)).timestamp();
                        if let Err(e) = sqlx::query("DELETE FROM request_records WHERE timestamp_unix < ?")
                            .bind(cutoff)
                            .execute(&pool)
                            .await
                        {
                            tracing::error!(error = %e, "retention cleanup of request_records failed");
                        }
                        let log_cutoff = (engine.now() - Duration::hours(24)).timestamp();
                        if let Err(e) = sqlx::query("DELETE FROM request_log WHERE timestamp_unix < ?")
                            .bind(log_cutoff)
                            .execute(&pool)
                            .await
                        {
                            tracing::error!(error = %e, "retention cleanup of request_log failed");
                        }
                    }
                    _ = stop_rx.recv() => break,
                }
            }
        });
    }

    /// Rolls yesterday's `request_records` into `daily_rollup` once a day,
    /// populating the table the `>7d` historical-stats tier and spec §8's
    /// "Idempotent aggregation" law both depend on.
    fn spawn_daily_aggregation_sweeper(self: &Arc<Self>, pool: SqlitePool) {
        let engine = Arc::clone(self);
        let mut stop_rx = self.stop_tx.subscribe();
        tokio::spawn(async move {
            let mut ticker = interval(std::time::Duration::from_secs(3600));
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let yesterday = (engine.now() - Duration::days(1)).format("%Y-%m-%d").to_string();
                        if let Err(e) = aggregate_daily_stats(&pool, &yesterday).await {
                            tracing::error!(error = %e, day = %yesterday, "daily rollup aggregation failed");
                        }
                    }
                    _ = stop_rx.recv() => break,
                }
            }
        });
    }
}

/// Rolls a daily rollup forward for `day`, summing matching request
/// records. Applying this twice for the same day yields the same totals
/// (idempotent aggregation, spec §8): it recomputes from the source rows
/// rather than incrementing in place.
pub async fn aggregate_daily_stats(pool: &SqlitePool, day: &str) -> anyhow::Result<()> {
    sqlx::query(
        r#"
        INSERT INTO daily_rollup
            (date, api_type, metrics_key, request_count, success_count, failure_count,
             input_tokens, output_tokens, cache_creation_tokens, cache_read_tokens, cost_cents)
        SELECT
            date(timestamp_unix, 'unixepoch') AS date,
            api_type,
            metrics_key,
            COUNT(*) AS request_count,
            SUM(success) AS success_count,
            SUM(1 - success) AS failure_count,
            SUM(input_tokens) AS input_tokens,
            SUM(output_tokens) AS output_tokens,
            SUM(cache_creation_tokens) AS cache_creation_tokens,
            SUM(cache_read_tokens) AS cache_read_tokens,
            SUM(cost_cents) AS cost_cents
        FROM request_records
        WHERE date(timestamp_unix, 'unixepoch') = ?
        GROUP BY date, api_type, metrics_key
        ON CONFLICT(date, api_type, metrics_key) DO UPDATE SET
            request_count = excluded.request_count,
            success_count = excluded.success_count,
            failure_count = excluded.failure_count,
            input_tokens = excluded.input_tokens,
            output_tokens = excluded.output_tokens,
            cache_creation_tokens = excluded.cache_creation_tokens,
            cache_read_tokens = excluded.cache_read_tokens,
            cost_cents = excluded.cost_cents
        "#,
    )
    .bind(day)
    .execute(pool)
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit::clock::ManualClock;
    use crate::config::DatabaseConfig;
    use crate::database::Database;
    use sqlx::Row;

    fn engine() -> MetricsEngine {
        MetricsEngine::new(MetricsConfig::default(), Arc::new(ManualClock::new(Utc::now())))
    }

    async fn migrated_pool() -> SqlitePool {
        let db = Database::new(&DatabaseConfig {
            url: "sqlite::memory:".to_string(),
            max_connections: Some(1),
        })
        .await
        .expect("open in-memory db");
        db.migrate().await.expect("run migrations");
        db.pool().clone()
    }

    #[tokio::test]
    async fn aggregate_daily_stats_is_idempotent() {
        let pool = migrated_pool().await;
        let day = "2024-01-15";
        let ts = chrono::NaiveDate::from_ymd_opt(2024, 1, 15)
            .unwrap()
            .and_hms_opt(12, 0, 0)
            .unwrap()
            .and_utc()
            .timestamp();
        for success in [1, 1, 0] {
            sqlx::query(
                "INSERT INTO request_records \
                 (metrics_key, base_url, key_mask, timestamp_unix, success, input_tokens, \
                  output_tokens, cache_creation_tokens, cache_read_tokens, model, cost_cents, api_type) \
                 VALUES (?, 'https://x', 'k***', ?, ?, 10, 20, 0, 0, 'm', 5, 'messages')",
            )
            .bind("mk1")
            .bind(ts)
            .bind(success)
            .execute(&pool)
            .await
            .unwrap();
        }

        aggregate_daily_stats(&pool, day).await.unwrap();
        aggregate_daily_stats(&pool, day).await.unwrap();

        let row = sqlx::query("SELECT request_count, success_count, failure_count FROM daily_rollup WHERE date = ? AND metrics_key = ?")
            .bind(day)
            .bind("mk1")
            .fetch_one(&pool)
            .await
            .unwrap();
        let request_count: i64 = row.get("request_count");
        let success_count: i64 = row.get("success_count");
        let failure_count: i64 = row.get("failure_count");
        assert_eq!(request_count, 3);
        assert_eq!(success_count, 2);
        assert_eq!(failure_count, 1);
    }

    #[tokio::test]
    async fn historical_stats_without_pool_falls_back_with_warning() {
        let engine = engine();
        let stats = engine
            .get_historical_stats("https://x", &["k1".to_string()], Duration::days(10), Duration::days(1))
            .await;
        assert!(stats.warning.is_some());
    }

    #[tokio::test]
    async fn suspend_reflects_breaker_state() {
        let engine = engine();
        for _ in 0..10 {
            engine.record_failure("https://x", "k1", "m", "messages").await;
        }
        assert!(engine.should_suspend_key("https://x", "k1").await);
    }

    #[tokio::test]
    async fn channel_healthy_below_sample_threshold() {
        let engine = engine();
        engine.record_failure("https://x", "k1", "m", "messages").await;
        assert!(
            engine
                .is_channel_healthy_with_keys("https://x", &["k1".to_string()])
                .await
        );
    }

    #[tokio::test]
    async fn all_keys_suspended_requires_every_key_suspended() {
        let engine = engine();
        for _ in 0..10 {
            engine.record_failure("https://x", "k1", "m", "messages").await;
        }
        assert!(
            !engine
                .are_all_keys_suspended("https://x", &["k1".to_string(), "k2".to_string()])
                .await
        );
        for _ in 0..10 {
            engine.record_failure("https://x", "k2", "m", "messages").await;
        }
        assert!(
            engine
                .are_all_keys_suspended("https://x", &["k1".to_string(), "k2".to_string()])
                .await
        );
    }
}
