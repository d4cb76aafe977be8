use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use sqlx::SqlitePool;
use tokio::sync::Mutex;
use tokio::time::{sleep, Duration as TokioDuration};
use tracing::{error, warn};

use crate::models::PersistedRecord;

const DEFAULT_FLUSH_THRESHOLD: usize = 100;
const DEFAULT_FLUSH_INTERVAL_SECS: u64 = 30;
const MAX_WRITE_ATTEMPTS: u32 = 3;

/// Buffers request records and flushes them to sqlite in batches.
///
/// Guarded by its own mutex, separate from the metrics map lock (spec §5:
/// "the metrics write buffer is guarded by a separate mutex").
#[derive(Clone)]
pub struct PersistenceBuffer {
    buffer: Arc<Mutex<VecDeque<PersistedRecord>>>,
    dropped: Arc<AtomicU64>,
    threshold: usize,
}

impl PersistenceBuffer {
    pub fn new(threshold: usize) -> Self {
        Self {
            buffer: Arc::new(Mutex::new(VecDeque::new())),
            dropped: Arc::new(AtomicU64::new(0)),
            threshold: threshold.max(1),
        }
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Enqueues a record. If the buffer would exceed `threshold * 50` new
    /// records are dropped instead, and the drop counter is incremented.
    pub async fn enqueue(&self, record: PersistedRecord) {
        let mut guard = self.buffer.lock().await;
        if guard.len() >= self.threshold * 50 {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            warn!(dropped_total = self.dropped_count(), "persistence buffer full, dropping record");
            return;
        }
        guard.push_back(record);
    }

    pub async fn should_flush(&self) -> bool {
        self.buffer.lock().await.len() >= self.threshold
    }

    pub async fn len(&self) -> usize {
        self.buffer.lock().await.len()
    }

    /// Swaps the whole buffer out and attempts to write it, retrying with
    /// exponential backoff. On exhausted retries the batch is requeued at
    /// the front of the buffer, trimmed to the newest records if the
    /// buffer would overflow its own capacity.
    pub async fn flush(&self, pool: &SqlitePool) {
        let batch: Vec<PersistedRecord> = {
            let mut guard = self.buffer.lock().await;
            guard.drain(..).collect()
        };
        if batch.is_empty() {
            return;
        }

        match write_batch(pool, &batch).await {
            Ok(()) => {}
            Err(e) => {
                error!(error = %e, batch_len = batch.len(), "persistence flush failed, requeuing");
                let mut guard = self.buffer.lock().await;
                for record in batch.into_iter().rev() {
                    guard.push_front(record);
                }
                let cap = self.threshold * 50;
                while guard.len() > cap {
                    guard.pop_back();
                }
            }
        }
    }

    /// Best-effort final flush, used on shutdown.
    pub async fn flush_final(&self, pool: &SqlitePool) {
        self.flush(pool).await;
    }
}

async fn write_batch(pool: &SqlitePool, batch: &[PersistedRecord]) -> anyhow::Result<()> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        match write_batch_once(pool, batch).await {
            Ok(()) => return Ok(()),
            Err(e) if attempt >= MAX_WRITE_ATTEMPTS => return Err(e),
            Err(e) => {
                warn!(attempt, error = %e, "retrying persistence write");
                sleep(TokioDuration::from_millis(200 * 2u64.pow(attempt))).await;
            }
        }
    }
}

async fn write_batch_once(pool: &SqlitePool, batch: &[PersistedRecord]) -> anyhow::Result<()> {
    let mut tx = pool.begin().await?;
    for record in batch {
        sqlx::query(
            r#"
            INSERT INTO request_records
                (metrics_key, base_url, key_mask, timestamp_unix, success, input_tokens,
                 output_tokens, cache_creation_tokens, cache_read_tokens, model, cost_cents, api_type)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.metrics_key)
        .bind(&record.base_url)
        .bind(&record.key_mask)
        .bind(record.timestamp_unix)
        .bind(record.success)
        .bind(record.input_tokens)
        .bind(record.output_tokens)
        .bind(record.cache_creation_tokens)
        .bind(record.cache_read_tokens)
        .bind(&record.model)
        .bind(record.cost_cents)
        .bind(&record.api_type)
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> PersistedRecord {
        PersistedRecord {
            metrics_key: "k".into(),
            base_url: "https://x".into(),
            key_mask: "****1234".into(),
            timestamp_unix: 0,
            success: true,
            input_tokens: 1,
            output_tokens: 1,
            cache_creation_tokens: 0,
            cache_read_tokens: 0,
            model: "m".into(),
            cost_cents: 0,
            api_type: "messages".into(),
        }
    }

    #[tokio::test]
    async fn enqueue_past_capacity_increments_drop_counter() {
        let buf = PersistenceBuffer::new(1);
        for _ in 0..60 {
            buf.enqueue(sample()).await;
        }
        assert!(buf.dropped_count() > 0);
    }

    #[tokio::test]
    async fn should_flush_once_threshold_reached() {
        let buf = PersistenceBuffer::new(2);
        buf.enqueue(sample()).await;
        assert!(!buf.should_flush().await);
        buf.enqueue(sample()).await;
        assert!(buf.should_flush().await);
    }
}
