//! Live bus event payloads.
//!
//! Everything here serialises to camelCase JSON with millisecond
//! ISO-8601 timestamps, the wire format dashboards consume.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::db::{ts_milli, CheckStatus, UptimeCheck, UptimeStatistics};

/// Severity of an operational notice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NoticeKind {
    Info,
    Warning,
    Error,
}

/// An operational notice, delivered to the `global` room only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemNotice {
    pub message: String,
    #[serde(rename = "type")]
    pub kind: NoticeKind,
}

/// A raw check as broadcast to subscribers, with a synthetic broadcast id.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckBroadcast {
    /// `{endpoint_id}-{unix_ms}`.
    pub id: String,
    pub endpoint_id: Uuid,
    pub endpoint_name: String,
    pub status: CheckStatus,
    pub status_code: i32,
    pub response_time: f32,
    #[serde(with = "ts_milli")]
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_reason: Option<String>,
}

impl From<&UptimeCheck> for CheckBroadcast {
    fn from(check: &UptimeCheck) -> Self {
        Self {
            id: format!("{}-{}", check.endpoint_id, check.timestamp.timestamp_millis()),
            endpoint_id: check.endpoint_id,
            endpoint_name: check.endpoint_name.clone(),
            status: check.status,
            status_code: check.status_code,
            response_time: check.response_time,
            timestamp: check.timestamp,
            error_reason: check.error_reason.clone(),
        }
    }
}

/// One event as seen by a subscriber session.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum BusEvent {
    /// Updated rolling statistics, after every probe.
    UptimeUpdate(UptimeStatistics),
    /// The raw probe outcome, after every probe.
    NewCheck(CheckBroadcast),
    /// Operational notice.
    SystemStatus(SystemNotice),
    /// One chunk of a full-state snapshot.
    BulkUpdate(Vec<UptimeStatistics>),
}
