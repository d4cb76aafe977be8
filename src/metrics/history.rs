use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::Serialize;
use sqlx::{Row, SqlitePool};

use super::key_metrics::KeyMetrics;

/// One fixed-width time bucket in a historical stats response.
#[derive(Debug, Clone, Serialize)]
pub struct StatsBucket {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub request_count: u64,
    pub success_count: u64,
    pub success_rate: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct HistoricalStats {
    pub buckets: Vec<StatsBucket>,
    pub warning: Option<String>,
}

/// Buckets the given keys' in-memory `requestHistory` into
/// `ceil(duration/interval) + 1` fixed-width slots aligned to `interval`
/// boundaries over the half-open range `[start, end)`.
///
/// Only serves `duration <= 24h` queries — callers are responsible for
/// routing longer windows to the raw persistent table or daily rollup per
/// the retention tiers in spec §4.2.
pub fn bucket_in_memory<'a>(
    keys: impl Iterator<Item = &'a KeyMetrics>,
    now: DateTime<Utc>,
    duration: Duration,
    interval: Duration,
) -> HistoricalStats {
    let slots = (duration.num_milliseconds() as f64 / interval.num_milliseconds() as f64).ceil() as i64 + 1;
    let start_time = now - duration;

    let mut buckets: Vec<StatsBucket> = (0..slots)
        .map(|i| {
            let bucket_start = start_time + interval * i as i32;
            let bucket_end = bucket_start + interval;
            StatsBucket {
                start: bucket_start,
                end: bucket_end,
                request_count: 0,
                success_count: 0,
                success_rate: 0.0,
            }
        })
        .collect();

    for km in keys {
        for record in &km.request_history {
            if record.timestamp < start_time || record.timestamp >= start_time + interval * slots as i32 {
                continue;
            }
            let offset = record.timestamp - start_time;
            let idx = (offset.num_milliseconds() / interval.num_milliseconds()) as usize;
            if let Some(bucket) = buckets.get_mut(idx) {
                bucket.request_count += 1;
                if record.success {
                    bucket.success_count += 1;
                }
            }
        }
    }

    for bucket in &mut buckets {
        // Empty buckets stay at 0.0, not 100%, to avoid a misleading
        // "perfect success" signal (spec §4.2).
        if bucket.request_count > 0 {
            bucket.success_rate = bucket.success_count as f64 / bucket.request_count as f64 * 100.0;
        }
    }

    HistoricalStats {
        buckets,
        warning: None,
    }
}

fn placeholders(n: usize) -> String {
    std::iter::repeat("?").take(n).collect::<Vec<_>>().join(",")
}

/// Serves `24h < duration <= 7d` queries from the raw `request_records`
/// table (spec §4.2's second retention tier), bucketed the same way as
/// [`bucket_in_memory`] so callers see an identical shape regardless of
/// which tier answered the query.
pub async fn bucket_from_raw_table(
    pool: &SqlitePool,
    metrics_keys: &[String],
    now: DateTime<Utc>,
    duration: Duration,
    interval: Duration,
) -> anyhow::Result<HistoricalStats> {
    if metrics_keys.is_empty() {
        return Ok(HistoricalStats { buckets: Vec::new(), warning: None });
    }
    let slots = (duration.num_milliseconds() as f64 / interval.num_milliseconds() as f64).ceil() as i64 + 1;
    let start_time = now - duration;
    let end_time = start_time + interval * slots as i32;

    let mut buckets: Vec<StatsBucket> = (0..slots)
        .map(|i| {
            let bucket_start = start_time + interval * i as i32;
            let bucket_end = bucket_start + interval;
            StatsBucket {
                start: bucket_start,
                end: bucket_end,
                request_count: 0,
                success_count: 0,
                success_rate: 0.0,
            }
        })
        .collect();

    let query = format!(
        "SELECT timestamp_unix, success FROM request_records \
         WHERE metrics_key IN ({}) AND timestamp_unix >= ? AND timestamp_unix < ?",
        placeholders(metrics_keys.len())
    );
    let mut q = sqlx::query(&query);
    for key in metrics_keys {
        q = q.bind(key);
    }
    q = q.bind(start_time.timestamp()).bind(end_time.timestamp());
    let rows = q.fetch_all(pool).await?;

    let earliest_bucket_has_data = rows
        .iter()
        .any(|r| r.get::<i64, _>("timestamp_unix") < (start_time + interval).timestamp());

    for row in &rows {
        let ts: i64 = row.get("timestamp_unix");
        let success: i64 = row.get("success");
        let Some(record_time) = DateTime::from_timestamp(ts, 0) else { continue };
        let offset = record_time - start_time;
        if offset.num_milliseconds() < 0 {
            continue;
        }
        let idx = (offset.num_milliseconds() / interval.num_milliseconds()) as usize;
        if let Some(bucket) = buckets.get_mut(idx) {
            bucket.request_count += 1;
            if success != 0 {
                bucket.success_count += 1;
            }
        }
    }

    for bucket in &mut buckets {
        if bucket.request_count > 0 {
            bucket.success_rate = bucket.success_count as f64 / bucket.request_count as f64 * 100.0;
        }
    }

    let warning = if !rows.is_empty() && !earliest_bucket_has_data {
        Some("starting period has no raw request records; earliest buckets may undercount".to_string())
    } else {
        None
    };

    Ok(HistoricalStats { buckets, warning })
}

/// Serves `duration > 7d` queries from the `daily_rollup` table (spec
/// §4.2's third retention tier), one bucket per calendar day. The
/// current (not-yet-rolled-up) day is reconstructed live from
/// `request_records` instead of `daily_rollup`, since the daily sweeper
/// only aggregates completed days.
pub async fn bucket_from_daily_rollup(
    pool: &SqlitePool,
    metrics_keys: &[String],
    now: DateTime<Utc>,
    duration: Duration,
) -> anyhow::Result<HistoricalStats> {
    if metrics_keys.is_empty() {
        return Ok(HistoricalStats { buckets: Vec::new(), warning: None });
    }
    let today = now.date_naive();
    let start_day = (now - duration).date_naive();
    let num_days = (today - start_day).num_days() + 1;

    let mut buckets: Vec<StatsBucket> = Vec::with_capacity(num_days as usize);
    let mut missing_start_day = false;

    for i in 0..num_days {
        let day = start_day + Duration::days(i);
        let day_start = day.and_hms_opt(0, 0, 0).unwrap().and_utc();
        let day_end = day_start + Duration::days(1);

        let (request_count, success_count) = if day == today {
            fetch_raw_day_totals(pool, metrics_keys, day_start, day_end).await?
        } else {
            fetch_rollup_day_totals(pool, metrics_keys, day).await?
        };

        if i == 0 && day != today && request_count == 0 {
            missing_start_day = fetch_raw_day_totals(pool, metrics_keys, day_start, day_end)
                .await
                .map(|(c, _)| c > 0)
                .unwrap_or(false);
        }

        let success_rate = if request_count > 0 {
            success_count as f64 / request_count as f64 * 100.0
        } else {
            0.0
        };
        buckets.push(StatsBucket {
            start: day_start,
            end: day_end,
            request_count,
            success_count,
            success_rate,
        });
    }

    let warning = if missing_start_day {
        Some(format!(
            "no daily rollup recorded for {start_day}; raw request records for that day were used instead"
        ))
    } else {
        None
    };

    Ok(HistoricalStats { buckets, warning })
}

async fn fetch_rollup_day_totals(
    pool: &SqlitePool,
    metrics_keys: &[String],
    day: NaiveDate,
) -> anyhow::Result<(u64, u64)> {
    let query = format!(
        "SELECT COALESCE(SUM(request_count), 0) AS requests, COALESCE(SUM(success_count), 0) AS successes \
         FROM daily_rollup WHERE date = ? AND metrics_key IN ({})",
        placeholders(metrics_keys.len())
    );
    let mut q = sqlx::query(&query).bind(day.format("%Y-%m-%d").to_string());
    for key in metrics_keys {
        q = q.bind(key);
    }
    let row = q.fetch_one(pool).await?;
    let requests: i64 = row.get("requests");
    let successes: i64 = row.get("successes");
    Ok((requests.max(0) as u64, successes.max(0) as u64))
}

async fn fetch_raw_day_totals(
    pool: &SqlitePool,
    metrics_keys: &[String],
    day_start: DateTime<Utc>,
    day_end: DateTime<Utc>,
) -> anyhow::Result<(u64, u64)> {
    let query = format!(
        "SELECT COUNT(*) AS requests, COALESCE(SUM(success), 0) AS successes \
         FROM request_records WHERE metrics_key IN ({}) AND timestamp_unix >= ? AND timestamp_unix < ?",
        placeholders(metrics_keys.len())
    );
    let mut q = sqlx::query(&query);
    for key in metrics_keys {
        q = q.bind(key);
    }
    q = q.bind(day_start.timestamp()).bind(day_end.timestamp());
    let row = q.fetch_one(pool).await?;
    let requests: i64 = row.get("requests");
    let successes: i64 = row.get("successes");
    Ok((requests.max(0) as u64, successes.max(0) as u64))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit::CircuitBreakerConfig;

    #[test]
    fn empty_bucket_reports_zero_not_full_success() {
        let km = KeyMetrics::new(10, CircuitBreakerConfig::from_window(10));
        let now = Utc::now();
        let stats = bucket_in_memory(std::iter::once(&km), now, Duration::hours(1), Duration::minutes(10));
        assert!(stats.buckets.iter().all(|b| b.success_rate == 0.0));
    }

    #[test]
    fn records_land_in_correct_bucket() {
        let mut km = KeyMetrics::new(10, CircuitBreakerConfig::from_window(10));
        let now = Utc::now();
        km.record_success(now, None, "m", 0);
        let stats = bucket_in_memory(std::iter::once(&km), now, Duration::hours(1), Duration::minutes(10));
        let total: u64 = stats.buckets.iter().map(|b| b.request_count).sum();
        assert_eq!(total, 1);
    }
}
