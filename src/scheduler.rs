//! Scheduler (spec.md §4.8): one daily 00:00 UTC timer that fans the
//! aggregator out over every active connection. Grounded on the
//! `tokio::time::interval` tick loop the teacher's `main.rs` used to drive
//! its own background passes, generalized here with an `isRunning` guard
//! and a deterministic next-tick computation.

use crate::aggregator::SnapshotAggregator;
use crate::rate_limiter::RateLimiter;
use crate::repository::ConnectionRepository;
use chrono::{DateTime, Duration, TimeZone, Utc};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;
use tokio::time::sleep;
use tracing::{info, warn};

const INTER_CONNECTION_PAUSE: StdDuration = StdDuration::from_millis(250);

#[derive(Debug, Clone, Default)]
pub struct PassSummary {
    pub snapshots_created: u64,
    pub failed: u64,
    pub duration_sec: f64,
}

pub struct Scheduler {
    aggregator: Arc<SnapshotAggregator>,
    connections: Arc<dyn ConnectionRepository>,
    rate_limiter: Arc<RateLimiter>,
    running: AtomicBool,
    next_tick: Mutex<DateTime<Utc>>,
}

impl Scheduler {
    pub fn new(
        aggregator: Arc<SnapshotAggregator>,
        connections: Arc<dyn ConnectionRepository>,
        rate_limiter: Arc<RateLimiter>,
    ) -> Self {
        let next_tick = next_midnight_utc(Utc::now());
        Self { aggregator, connections, rate_limiter, running: AtomicBool::new(false), next_tick: Mutex::new(next_tick) }
    }

    pub fn next_tick(&self) -> DateTime<Utc> {
        *self.next_tick.lock()
    }

    /// Runs the daily timer loop until `shutdown` resolves. Intended to be
    /// spawned as its own task by the Bootstrapper.
    pub async fn run(&self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        loop {
            let wait = (self.next_tick() - Utc::now()).to_std().unwrap_or(StdDuration::ZERO);
            tokio::select! {
                _ = sleep(wait) => {
                    self.tick().await;
                    *self.next_tick.lock() = next_midnight_utc(Utc::now());
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    }

    /// One scheduler tick (spec.md §4.8 steps 1-5).
    pub async fn tick(&self) -> PassSummary {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("scheduler tick skipped: previous pass still running");
            return PassSummary::default();
        }

        let start = std::time::Instant::now();
        let mut summary = PassSummary::default();

        let connections = match self.connections.list_active().await {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, "scheduler tick aborted: could not list active connections");
                self.running.store(false, Ordering::SeqCst);
                return summary;
            }
        };

        let mut by_user: std::collections::BTreeMap<String, Vec<_>> = std::collections::BTreeMap::new();
        for c in connections {
            by_user.entry(c.user_id.to_string()).or_default().push(c);
        }

        for (_, user_connections) in by_user {
            let mut first = true;
            for connection in user_connections {
                if !first {
                    sleep(INTER_CONNECTION_PAUSE).await;
                }
                first = false;

                match self.aggregator.update_current(connection.user_id, connection.venue_id).await {
                    Ok(_) => summary.snapshots_created += 1,
                    Err(e) => {
                        warn!(error = %e, "scheduled sync failed for one connection");
                        summary.failed += 1;
                    }
                }
            }
        }

        summary.duration_sec = start.elapsed().as_secs_f64();
        info!(
            snapshots_created = summary.snapshots_created,
            failed = summary.failed,
            duration_sec = summary.duration_sec,
            "scheduler pass complete"
        );

        // Opportunistic RateLimitLog retention (spec.md §4.7: "cleanup()
        // ... is called opportunistically"); the daily pass is as good a
        // trigger as any and needs no separate timer.
        if let Err(e) = self.rate_limiter.cleanup().await {
            warn!(error = %e, "rate limit log cleanup failed");
        }

        self.running.store(false, Ordering::SeqCst);
        summary
    }
}

fn next_midnight_utc(now: DateTime<Utc>) -> DateTime<Utc> {
    let tomorrow = now.date_naive() + Duration::days(1);
    tomorrow.and_hms_opt(0, 0, 0).map(|naive| Utc.from_utc_datetime(&naive)).unwrap_or(now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone as _;

    #[test]
    fn next_midnight_is_always_tomorrow_00_00_utc() {
        let now = Utc.with_ymd_and_hms(2026, 7, 27, 23, 59, 59).unwrap();
        let next = next_midnight_utc(now);
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 7, 28, 0, 0, 0).unwrap());

        let just_after_midnight = Utc.with_ymd_and_hms(2026, 7, 28, 0, 0, 1).unwrap();
        let next2 = next_midnight_utc(just_after_midnight);
        assert_eq!(next2, Utc.with_ymd_and_hms(2026, 7, 29, 0, 0, 0).unwrap());
    }
}
