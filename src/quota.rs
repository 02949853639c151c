//! Per-key daily call quota for the bibliographic lookup API.
//!
//! Trackers are shared between partitions as `Arc<dyn QuotaTracker>`; every
//! increment is a single atomic check-and-set so concurrent partitions can
//! never push a key past its ceiling.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::RwLock;
use tracing::{info, instrument};

#[async_trait]
pub trait QuotaTracker: Send + Sync {
    /// Take one call from `key`'s daily allowance. Returns false, without
    /// counting, once the ceiling is reached.
    async fn try_acquire(&self, key: &str) -> Result<bool>;

    /// Calls already taken from `key` today.
    async fn used(&self, key: &str) -> Result<u32>;

    /// Flag a key as confirmed exhausted (ceiling hit or upstream said so).
    fn mark_exhausted(&self, key: &str);

    /// True once any key has been confirmed exhausted during this run.
    fn is_exhausted(&self) -> bool;

    /// Clear counters and flags at the start of a run. Idempotent.
    async fn reset(&self) -> Result<()>;
}

/// Masks an API key for logs: keeps the first four characters.
pub fn mask_key(key: &str) -> String {
    let visible: String = key.chars().take(4).collect();
    format!("{visible}***")
}

/// Run-wide flag, set the first time any key is confirmed exhausted.
#[derive(Default)]
struct ExhaustedFlag(AtomicBool);

impl ExhaustedFlag {
    fn mark(&self, key: &str) {
        if !self.0.swap(true, Ordering::SeqCst) {
            info!(key = %mask_key(key), "lookup quota exhausted");
        }
    }

    fn get(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn clear(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// In-process tracker; counters live only as long as the process.
pub struct MemoryQuotaTracker {
    ceiling: u32,
    counters: RwLock<HashMap<String, AtomicU32>>,
    exhausted: ExhaustedFlag,
}

impl MemoryQuotaTracker {
    pub fn new(ceiling: u32) -> Self {
        Self {
            ceiling,
            counters: RwLock::new(HashMap::new()),
            exhausted: ExhaustedFlag::default(),
        }
    }

    fn with_counter<T>(&self, key: &str, f: impl Fn(&AtomicU32) -> T) -> T {
        if let Ok(counters) = self.counters.read() {
            if let Some(counter) = counters.get(key) {
                return f(counter);
            }
        }
        let mut counters = match self.counters.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let counter = counters
            .entry(key.to_string())
            .or_insert_with(|| AtomicU32::new(0));
        f(counter)
    }
}

#[async_trait]
impl QuotaTracker for MemoryQuotaTracker {
    async fn try_acquire(&self, key: &str) -> Result<bool> {
        let ceiling = self.ceiling;
        let acquired = self.with_counter(key, |counter| {
            counter
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |used| {
                    (used < ceiling).then_some(used + 1)
                })
                .is_ok()
        });
        Ok(acquired)
    }

    async fn used(&self, key: &str) -> Result<u32> {
        Ok(self.with_counter(key, |counter| counter.load(Ordering::SeqCst)))
    }

    fn mark_exhausted(&self, key: &str) {
        self.exhausted.mark(key);
    }

    fn is_exhausted(&self) -> bool {
        self.exhausted.get()
    }

    async fn reset(&self) -> Result<()> {
        if let Ok(mut counters) = self.counters.write() {
            counters.clear();
        }
        self.exhausted.clear();
        Ok(())
    }
}

/// Database-backed tracker. Counters are keyed by `(api_key, day)` so a
/// restart later the same UTC day resumes from the calls already spent.
pub struct SqliteQuotaTracker {
    pool: SqlitePool,
    ceiling: u32,
    exhausted: ExhaustedFlag,
    today: Box<dyn Fn() -> NaiveDate + Send + Sync>,
}

impl SqliteQuotaTracker {
    pub fn new(pool: SqlitePool, ceiling: u32) -> Self {
        Self::with_clock(pool, ceiling, || Utc::now().date_naive())
    }

    pub fn with_clock(
        pool: SqlitePool,
        ceiling: u32,
        today: impl Fn() -> NaiveDate + Send + Sync + 'static,
    ) -> Self {
        Self {
            pool,
            ceiling,
            exhausted: ExhaustedFlag::default(),
            today: Box::new(today),
        }
    }

    fn day(&self) -> String {
        (self.today)().format("%Y-%m-%d").to_string()
    }
}

#[async_trait]
impl QuotaTracker for SqliteQuotaTracker {
    #[instrument(skip_all)]
    async fn try_acquire(&self, key: &str) -> Result<bool> {
        let day = self.day();
        sqlx::query("INSERT OR IGNORE INTO api_quota (api_key, day, used) VALUES (?, ?, 0)")
            .bind(key)
            .bind(&day)
            .execute(&self.pool)
            .await
            .context("failed to seed quota counter")?;
        let res = sqlx::query(
            "UPDATE api_quota SET used = used + 1 WHERE api_key = ? AND day = ? AND used < ?",
        )
        .bind(key)
        .bind(&day)
        .bind(self.ceiling as i64)
        .execute(&self.pool)
        .await
        .context("failed to increment quota counter")?;
        Ok(res.rows_affected() == 1)
    }

    async fn used(&self, key: &str) -> Result<u32> {
        let used: Option<i64> =
            sqlx::query_scalar("SELECT used FROM api_quota WHERE api_key = ? AND day = ?")
                .bind(key)
                .bind(self.day())
                .fetch_optional(&self.pool)
                .await?;
        Ok(used.unwrap_or(0) as u32)
    }

    fn mark_exhausted(&self, key: &str) {
        self.exhausted.mark(key);
    }

    fn is_exhausted(&self) -> bool {
        self.exhausted.get()
    }

    /// Drops counters of previous days; today's counters are kept.
    async fn reset(&self) -> Result<()> {
        let purged = sqlx::query("DELETE FROM api_quota WHERE day < ?")
            .bind(self.day())
            .execute(&self.pool)
            .await
            .context("failed to purge stale quota counters")?
            .rows_affected();
        if purged > 0 {
            info!(purged, "purged quota counters of previous days");
        }
        self.exhausted.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    async fn setup_pool() -> SqlitePool {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        pool
    }

    #[tokio::test]
    async fn memory_tracker_stops_at_ceiling() {
        let tracker = MemoryQuotaTracker::new(2);
        assert!(tracker.try_acquire("k").await.unwrap());
        assert!(tracker.try_acquire("k").await.unwrap());
        assert!(!tracker.try_acquire("k").await.unwrap());
        assert_eq!(tracker.used("k").await.unwrap(), 2);
        // other keys have their own allowance
        assert!(tracker.try_acquire("other").await.unwrap());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn memory_tracker_is_monotonic_under_contention() {
        let tracker = Arc::new(MemoryQuotaTracker::new(50));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let tracker = tracker.clone();
            handles.push(tokio::spawn(async move {
                let mut granted = 0u32;
                for _ in 0..20 {
                    if tracker.try_acquire("shared").await.unwrap() {
                        granted += 1;
                    }
                }
                granted
            }));
        }
        let mut total = 0;
        for h in handles {
            total += h.await.unwrap();
        }
        assert_eq!(total, 50);
        assert_eq!(tracker.used("shared").await.unwrap(), 50);
    }

    #[tokio::test]
    async fn reset_clears_counters_and_flag() {
        let tracker = MemoryQuotaTracker::new(1);
        assert!(tracker.try_acquire("k").await.unwrap());
        tracker.mark_exhausted("k");
        assert!(tracker.is_exhausted());
        tracker.mark_exhausted("j");
        assert!(tracker.is_exhausted());

        tracker.reset().await.unwrap();
        tracker.reset().await.unwrap();
        assert!(!tracker.is_exhausted());
        assert!(tracker.try_acquire("k").await.unwrap());
    }

    #[tokio::test]
    async fn sqlite_tracker_survives_restart_same_day() {
        let pool = setup_pool().await;
        let day = NaiveDate::from_ymd_opt(2026, 3, 1).unwrap();

        let first = SqliteQuotaTracker::with_clock(pool.clone(), 3, move || day);
        first.reset().await.unwrap();
        assert!(first.try_acquire("k").await.unwrap());
        assert!(first.try_acquire("k").await.unwrap());

        let second = SqliteQuotaTracker::with_clock(pool.clone(), 3, move || day);
        second.reset().await.unwrap();
        assert_eq!(second.used("k").await.unwrap(), 2);
        assert!(second.try_acquire("k").await.unwrap());
        assert!(!second.try_acquire("k").await.unwrap());
        assert_eq!(second.used("k").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn sqlite_tracker_starts_fresh_next_day() {
        let pool = setup_pool().await;
        let monday = NaiveDate::from_ymd_opt(2026, 3, 2).unwrap();
        let tuesday = NaiveDate::from_ymd_opt(2026, 3, 3).unwrap();

        let tracker = SqliteQuotaTracker::with_clock(pool.clone(), 1, move || monday);
        assert!(tracker.try_acquire("k").await.unwrap());
        assert!(!tracker.try_acquire("k").await.unwrap());

        let next_day = SqliteQuotaTracker::with_clock(pool.clone(), 1, move || tuesday);
        next_day.reset().await.unwrap();
        assert!(next_day.try_acquire("k").await.unwrap());

        let rows: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM api_quota")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(rows, 1);
    }

    #[test]
    fn mask_key_hides_tail() {
        assert_eq!(mask_key("ttbsecret123"), "ttbs***");
        assert_eq!(mask_key("ab"), "ab***");
    }
}
