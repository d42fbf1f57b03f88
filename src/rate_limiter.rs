//! RateLimiter (spec.md §4.7): per-(user, venue) cooldown backed by a
//! persistent 7-day audit log. Grounded on the sliding-window HashMap
//! pattern in the teacher's `middleware/rate_limit.rs`, keyed here by
//! (user, venue) instead of client IP, and backed by the repository
//! instead of an in-memory-only window since the cooldown must survive a
//! restart.

use crate::error::AppResult;
use crate::models::{RateLimitLog, UserId, VenueId};
use crate::repository::RateLimitRepository;
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;

const COOLDOWN_HOURS: i64 = 23;
const RETENTION_DAYS: i64 = 7;

#[derive(Debug, Clone)]
pub struct Admission {
    pub allowed: bool,
    pub reason: Option<String>,
    pub next_allowed_time: Option<DateTime<Utc>>,
}

pub struct RateLimiter {
    repository: Arc<dyn RateLimitRepository>,
}

impl RateLimiter {
    pub fn new(repository: Arc<dyn RateLimitRepository>) -> Self {
        Self { repository }
    }

    /// `check(user-id, venue-id)` — refuses if the last recorded sync is
    /// less than 23 hours old (spec.md §4.7, §8).
    pub async fn check(&self, user_id: UserId, venue_id: VenueId) -> AppResult<Admission> {
        let last = self.repository.last(user_id, venue_id).await?;
        match last {
            Some(log) if Utc::now() - log.last_sync_time < Duration::hours(COOLDOWN_HOURS) => {
                let next_allowed_time = log.last_sync_time + Duration::hours(COOLDOWN_HOURS);
                Ok(Admission {
                    allowed: false,
                    reason: Some(format!("last sync was {} ago, cooldown is {}h", Utc::now() - log.last_sync_time, COOLDOWN_HOURS)),
                    next_allowed_time: Some(next_allowed_time),
                })
            }
            _ => Ok(Admission { allowed: true, reason: None, next_allowed_time: None }),
        }
    }

    /// `record(user-id, venue-id)` — upserts the current time and
    /// increments the counter (spec.md §4.7).
    pub async fn record(&self, user_id: UserId, venue_id: VenueId) -> AppResult<()> {
        let previous_count = self.repository.last(user_id, venue_id).await?.map(|l| l.count).unwrap_or(0);
        self.repository
            .record(&RateLimitLog { user_id, venue_id, last_sync_time: Utc::now(), count: previous_count + 1 })
            .await
    }

    /// `cleanup()` — purges rows older than 7 days (spec.md §4.7), called
    /// opportunistically by the scheduler.
    pub async fn cleanup(&self) -> AppResult<u64> {
        self.repository.purge_older_than(Utc::now() - Duration::days(RETENTION_DAYS)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::sqlite::SqliteRepository;

    fn limiter() -> RateLimiter {
        RateLimiter::new(Arc::new(SqliteRepository::open_in_memory().unwrap()))
    }

    #[tokio::test]
    async fn first_check_for_a_user_venue_is_allowed() {
        let limiter = limiter();
        let admission = limiter.check(UserId(uuid::Uuid::new_v4()), VenueId::Binance).await.unwrap();
        assert!(admission.allowed);
    }

    #[tokio::test]
    async fn two_checks_within_23h_of_a_record_are_both_refused() {
        let limiter = limiter();
        let user_id = UserId(uuid::Uuid::new_v4());
        limiter.record(user_id, VenueId::Binance).await.unwrap();

        let first = limiter.check(user_id, VenueId::Binance).await.unwrap();
        let second = limiter.check(user_id, VenueId::Binance).await.unwrap();
        assert!(!first.allowed);
        assert!(!second.allowed);
        assert!(first.reason.is_some());
        assert!(second.reason.is_some());
    }

    #[tokio::test]
    async fn cleanup_purges_rows_older_than_seven_days() {
        let limiter = limiter();
        let user_id = UserId(uuid::Uuid::new_v4());
        limiter
            .repository
            .record(&RateLimitLog { user_id, venue_id: VenueId::Okx, last_sync_time: Utc::now() - Duration::days(10), count: 1 })
            .await
            .unwrap();

        let purged = limiter.cleanup().await.unwrap();
        assert_eq!(purged, 1);
    }
}
