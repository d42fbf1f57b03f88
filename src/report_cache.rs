//! ReportCache (spec.md §4.5): a single-flight TTL cache of (token, query-id)
//! to document, so concurrent callers within one sync pass share one
//! outbound request instead of triggering a rate-limit storm on aggressive
//! report-pull brokers.
//!
//! Grounded on the in-module `RateLimiter` shape in the teacher's
//! `scrapers/polymarket_api.rs` (a small concurrency-aware struct owned by
//! the thing that calls it), generalized here to a `DashMap` + single-flight
//! `OnceCell` per key instead of a sliding window.

use crate::error::{AppError, AppResult};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::debug;

const TTL_SECONDS: i64 = 60;
const PURGE_AGE_SECONDS: i64 = 300;

type CacheKey = (String, String);
type SlotResult = Result<String, String>;

pub struct ReportCache {
    entries: DashMap<CacheKey, Arc<OnceCell<SlotResult>>>,
    inserted_at: DashMap<CacheKey, DateTime<Utc>>,
}

impl ReportCache {
    pub fn new() -> Self {
        Self { entries: DashMap::new(), inserted_at: DashMap::new() }
    }

    /// Returns the cached document if the entry is within the 60s TTL,
    /// otherwise runs `fetch` exactly once even under concurrent callers for
    /// the same key (spec.md §4.5).
    pub async fn get_or_fetch<F, Fut>(&self, key: CacheKey, fetch: F) -> AppResult<String>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = AppResult<String>>,
    {
        self.purge_opportunistically();

        let now = Utc::now();
        let fresh = self
            .inserted_at
            .get(&key)
            .map(|ts| now - *ts < ChronoDuration::seconds(TTL_SECONDS))
            .unwrap_or(false);

        if !fresh {
            self.entries.insert(key.clone(), Arc::new(OnceCell::new()));
            self.inserted_at.insert(key.clone(), now);
        }

        let cell = self
            .entries
            .entry(key.clone())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone();

        let result = cell
            .get_or_init(|| async { fetch().await.map_err(|e| e.to_string()) })
            .await;
        result.clone().map_err(AppError::upstream_unavailable)
    }

    /// Purges entries older than 5 minutes. Called opportunistically on
    /// every `get_or_fetch`, never on a timer (spec.md §4.5).
    fn purge_opportunistically(&self) {
        let now = Utc::now();
        let stale: Vec<CacheKey> = self
            .inserted_at
            .iter()
            .filter(|e| now - *e.value() > ChronoDuration::seconds(PURGE_AGE_SECONDS))
            .map(|e| e.key().clone())
            .collect();
        for key in stale {
            self.entries.remove(&key);
            self.inserted_at.remove(&key);
            debug!("purged stale report cache entry");
        }
    }
}

impl Default for ReportCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn concurrent_callers_for_the_same_key_trigger_one_fetch() {
        let cache = Arc::new(ReportCache::new());
        let calls = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_fetch(("tok".into(), "q1".into()), || async {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                        Ok("<doc/>".to_string())
                    })
                    .await
            }));
        }
        for h in handles {
            assert_eq!(h.await.unwrap().unwrap(), "<doc/>");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn different_keys_fetch_independently() {
        let cache = ReportCache::new();
        let a = cache.get_or_fetch(("t".into(), "a".into()), || async { Ok("A".to_string()) }).await.unwrap();
        let b = cache.get_or_fetch(("t".into(), "b".into()), || async { Ok("B".to_string()) }).await.unwrap();
        assert_eq!(a, "A");
        assert_eq!(b, "B");
    }

    #[tokio::test]
    async fn expired_entry_triggers_a_fresh_fetch() {
        let cache = ReportCache::new();
        let key = ("t".into(), "q".into());
        cache.get_or_fetch(key.clone(), || async { Ok("first".to_string()) }).await.unwrap();

        // Simulate TTL expiry by back-dating the insertion time directly.
        cache.inserted_at.insert(key.clone(), Utc::now() - ChronoDuration::seconds(TTL_SECONDS + 1));

        let second = cache.get_or_fetch(key, || async { Ok("second".to_string()) }).await.unwrap();
        assert_eq!(second, "second");
    }

    #[tokio::test]
    async fn fetch_error_is_surfaced_as_upstream_unavailable() {
        let cache = ReportCache::new();
        let result = cache
            .get_or_fetch(("t".into(), "q".into()), || async { Err(AppError::upstream_unavailable("down")) })
            .await;
        assert!(result.is_err());
        assert_eq!(result.unwrap_err().kind, crate::error::ErrorKind::UpstreamUnavailable);
    }
}
