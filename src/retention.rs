//! Retention and roll-up job.
//!
//! Once a day (first run 60 s after startup) raw checks are compacted
//! into hourly and daily aggregates, then raw and aggregated rows past
//! their retention horizons are deleted in bounded batches. Every step
//! is idempotent; re-running over the same range rewrites the same
//! aggregate rows.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};

use crate::config::Config;
use crate::db::{Store, StoreError};

/// Delay before the first run after startup.
const INITIAL_DELAY: Duration = Duration::from_secs(60);

/// Cadence of scheduled runs.
const RUN_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

/// Pause between delete batches to keep lock pressure down.
const BATCH_PAUSE: Duration = Duration::from_millis(100);

/// What one retention cycle did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RetentionSummary {
    pub hourly_rows: u64,
    pub daily_rows: u64,
    pub detail_deleted: u64,
    pub hourly_deleted: u64,
    pub daily_deleted: u64,
    /// False when the run was skipped (disabled, or already active).
    pub ran: bool,
}

/// The scheduled job. Reentrancy-guarded: overlapping triggers are
/// skipped, not queued.
pub struct RetentionJob {
    store: Store,
    detail_retention_days: i64,
    hourly_retention_days: i64,
    daily_retention_days: i64,
    batch_size: i64,
    enabled: bool,
    running: AtomicBool,
    stop: tokio::sync::broadcast::Sender<()>,
}

impl RetentionJob {
    pub fn new(store: Store, config: &Config) -> Self {
        let (stop, _) = tokio::sync::broadcast::channel(1);
        Self {
            store,
            detail_retention_days: config.detail_retention_days,
            hourly_retention_days: config.hourly_retention_days,
            daily_retention_days: config.daily_retention_days,
            batch_size: config.cleanup_batch_size,
            enabled: config.cleanup_enabled,
            running: AtomicBool::new(false),
            stop,
        }
    }

    /// Start the background timer: first run after one minute, then one
    /// run per day.
    pub fn start(self: &Arc<Self>) {
        let job = self.clone();

        tokio::spawn(async move {
            let mut stop_rx = job.stop.subscribe();

            tokio::select! {
                _ = stop_rx.recv() => return,
                _ = tokio::time::sleep(INITIAL_DELAY) => {}
            }

            loop {
                if let Err(e) = job.run_once().await {
                    tracing::error!("RetentionJob: run failed: {}", e);
                }

                tokio::select! {
                    _ = stop_rx.recv() => break,
                    _ = tokio::time::sleep(RUN_INTERVAL) => {}
                }
            }
        });
    }

    pub fn stop(&self) {
        let _ = self.stop.send(());
    }

    /// Run one full cycle. Shared by the timer and the on-demand
    /// trigger; failures in the roll-up and delete steps abort the run
    /// and propagate, a vacuum failure only logs.
    pub async fn run_once(&self) -> Result<RetentionSummary, StoreError> {
        if !self.enabled {
            tracing::info!("RetentionJob: cleanup disabled, skipping");
            return Ok(RetentionSummary::default());
        }

        if self.running.swap(true, Ordering::SeqCst) {
            tracing::info!("RetentionJob: previous run still active, skipping");
            return Ok(RetentionSummary::default());
        }
        let _guard = RunningGuard(&self.running);

        let now = Utc::now();
        let mut summary = RetentionSummary {
            ran: true,
            ..Default::default()
        };

        // 1. Hourly roll-up over retained source rows, up to the last
        //    complete hour.
        let hourly_since = now - ChronoDuration::days(self.hourly_retention_days);
        summary.hourly_rows = self
            .store
            .upsert_hourly_aggregates(hourly_since, truncate_to_hour(now))
            .await?;

        // 2. Daily roll-up, up to the last complete day.
        let daily_since = now - ChronoDuration::days(self.daily_retention_days);
        summary.daily_rows = self
            .store
            .upsert_daily_aggregates(daily_since, truncate_to_day(now))
            .await?;

        // 3. Raw rows past the detail horizon, in bounded batches.
        let detail_cutoff = now - ChronoDuration::days(self.detail_retention_days);
        loop {
            let deleted = self
                .store
                .delete_checks_before(detail_cutoff, self.batch_size)
                .await?;
            if deleted == 0 {
                break;
            }
            summary.detail_deleted += deleted;
            tokio::time::sleep(BATCH_PAUSE).await;
        }

        // 4. Aggregates past their horizons.
        summary.hourly_deleted = self
            .store
            .delete_hourly_before(now - ChronoDuration::days(self.hourly_retention_days))
            .await?;
        summary.daily_deleted = self
            .store
            .delete_daily_before(
                (now - ChronoDuration::days(self.daily_retention_days)).date_naive(),
            )
            .await?;

        // 5. Best effort.
        if let Err(e) = self.store.vacuum_analyze().await {
            tracing::warn!("RetentionJob: vacuum/analyze failed: {}", e);
        }

        tracing::info!(
            "RetentionJob: {} hourly rows, {} daily rows, deleted {} raw / {} hourly / {} daily",
            summary.hourly_rows,
            summary.daily_rows,
            summary.detail_deleted,
            summary.hourly_deleted,
            summary.daily_deleted
        );
        Ok(summary)
    }
}

struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Truncate a timestamp to the start of its hour.
pub fn truncate_to_hour(dt: DateTime<Utc>) -> DateTime<Utc> {
    let ts = dt.timestamp();
    DateTime::from_timestamp(ts - ts.rem_euclid(3600), 0).unwrap_or(dt)
}

/// Truncate a timestamp to the start of its UTC day.
pub fn truncate_to_day(dt: DateTime<Utc>) -> DateTime<Utc> {
    let ts = dt.timestamp();
    DateTime::from_timestamp(ts - ts.rem_euclid(86_400), 0).unwrap_or(dt)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_truncate_to_hour() {
        let dt = Utc.with_ymd_and_hms(2024, 1, 1, 12, 34, 56).unwrap();
        assert_eq!(
            truncate_to_hour(dt),
            Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap()
        );

        let exact = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        assert_eq!(truncate_to_hour(exact), exact);
    }

    #[test]
    fn test_truncate_to_day() {
        let dt = Utc.with_ymd_and_hms(2024, 1, 1, 12, 34, 56).unwrap();
        assert_eq!(
            truncate_to_day(dt),
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
        );
    }
}
