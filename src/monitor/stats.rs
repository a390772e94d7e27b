//! Rolling uptime statistics.
//!
//! A pure read path over the store: 24-hour totals, mean response time,
//! and the recent-check tail, combined with the scheduler's
//! consecutive-failure counter.

use chrono::{Duration as ChronoDuration, Utc};
use uuid::Uuid;

use crate::db::{CheckStatus, Store, StoreError, UptimeStatistics};

/// Window the rolling statistics cover.
const WINDOW_HOURS: i64 = 24;

/// How many recent checks the view carries.
const RECENT_LIMIT: i64 = 10;

/// Compute the rolling view for one endpoint, or `None` when the
/// endpoint no longer exists.
pub async fn compute(
    store: &Store,
    endpoint_id: Uuid,
    consecutive_failures: u32,
) -> Result<Option<UptimeStatistics>, StoreError> {
    let Some(endpoint) = store.get_endpoint(endpoint_id).await? else {
        return Ok(None);
    };

    let since = Utc::now() - ChronoDuration::hours(WINDOW_HOURS);
    let (total, up) = store.count_checks_since(endpoint_id, since).await?;
    let avg = store
        .avg_response_time_since(endpoint_id, since)
        .await?
        .unwrap_or(0.0);
    let recent = store.recent_checks(endpoint_id, RECENT_LIMIT).await?;

    let uptime_percentage = if total == 0 {
        0.0
    } else {
        floor2(up as f64 * 100.0 / total as f64)
    };

    // An endpoint with no history yet reads as UP.
    let current_status = recent
        .first()
        .map(|c| c.status)
        .unwrap_or(CheckStatus::Up);
    let last_check = recent.first().map(|c| c.timestamp);

    Ok(Some(UptimeStatistics {
        endpoint_id,
        endpoint_name: endpoint.name,
        uptime_percentage,
        avg_response_time: floor2(avg),
        total_checks: total,
        successful_checks: up,
        failed_checks: total - up,
        last_check,
        current_status,
        recent_checks: recent,
        consecutive_failures,
    }))
}

/// Truncate to two decimals: `floor(x * 10000) / 100` applied to a ratio
/// already scaled to percent (or milliseconds).
pub fn floor2(value: f64) -> f64 {
    (value * 100.0).floor() / 100.0
}
