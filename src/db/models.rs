//! Database model types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Outcome of a single probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CheckStatus {
    Up,
    Down,
}

impl CheckStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckStatus::Up => "UP",
            CheckStatus::Down => "DOWN",
        }
    }
}

impl std::str::FromStr for CheckStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "UP" => Ok(CheckStatus::Up),
            "DOWN" => Ok(CheckStatus::Down),
            other => Err(format!("unknown check status '{other}'")),
        }
    }
}

/// Operator-assigned severity of an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Critical,
    High,
    Medium,
    Low,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Critical => "critical",
            Severity::High => "high",
            Severity::Medium => "medium",
            Severity::Low => "low",
        }
    }
}

impl std::str::FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "critical" => Ok(Severity::Critical),
            "high" => Ok(Severity::High),
            "medium" => Ok(Severity::Medium),
            "low" => Ok(Severity::Low),
            other => Err(format!("unknown severity '{other}'")),
        }
    }
}

/// A monitored HTTP endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Endpoint {
    pub id: Uuid,
    pub name: String,
    pub url: String,
    /// Probe cadence in seconds.
    pub check_interval: i32,
    /// Per-probe deadline in seconds. Always less than `check_interval`.
    pub timeout: i32,
    pub expected_status: i32,
    pub severity: Severity,
    pub enabled: bool,
    pub tags: Vec<String>,
    #[serde(with = "ts_milli")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "ts_milli")]
    pub updated_at: DateTime<Utc>,
}

/// Operator input for creating or replacing an endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewEndpoint {
    pub name: String,
    pub url: String,
    pub check_interval: i32,
    pub timeout: i32,
    pub expected_status: i32,
    pub severity: Severity,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub tags: Vec<String>,
}

fn default_enabled() -> bool {
    true
}

/// One probe outcome. Immutable after insert.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UptimeCheck {
    pub id: Uuid,
    pub endpoint_id: Uuid,
    /// Endpoint name at the time of the probe.
    pub endpoint_name: String,
    pub status: CheckStatus,
    /// Observed HTTP status, or 0 when the exchange did not complete.
    pub status_code: i32,
    /// Milliseconds. 0 when the probe was short-circuited.
    pub response_time: f32,
    #[serde(with = "ts_milli")]
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_reason: Option<String>,
}

/// A check row about to be inserted. Id and timestamp are assigned by the
/// store.
#[derive(Debug, Clone)]
pub struct NewCheck {
    pub endpoint_id: Uuid,
    pub endpoint_name: String,
    pub status: CheckStatus,
    pub status_code: i32,
    pub response_time: f32,
    pub error_reason: Option<String>,
}

/// Hourly roll-up row, unique per (endpoint, hour bucket).
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HourlyAggregate {
    pub endpoint_id: Uuid,
    pub endpoint_name: String,
    #[serde(with = "ts_milli")]
    pub hour_start: DateTime<Utc>,
    pub total_checks: i64,
    pub successful_checks: i64,
    pub failed_checks: i64,
    pub avg_response_time: f64,
    pub min_response_time: f64,
    pub max_response_time: f64,
}

/// Daily roll-up row, unique per (endpoint, day bucket).
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DailyAggregate {
    pub endpoint_id: Uuid,
    pub endpoint_name: String,
    pub day_start: chrono::NaiveDate,
    pub total_checks: i64,
    pub successful_checks: i64,
    pub failed_checks: i64,
    pub uptime_percentage: f64,
    pub avg_response_time: f64,
    pub min_response_time: f64,
    pub max_response_time: f64,
}

/// Derived 24-hour rolling view of an endpoint. Never stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UptimeStatistics {
    pub endpoint_id: Uuid,
    pub endpoint_name: String,
    /// Percentage over the window, two decimals, 0 when no checks exist.
    pub uptime_percentage: f64,
    /// Milliseconds, two decimals, 0 when no samples exist.
    pub avg_response_time: f64,
    pub total_checks: i64,
    pub successful_checks: i64,
    pub failed_checks: i64,
    #[serde(with = "ts_milli::option")]
    pub last_check: Option<DateTime<Utc>>,
    pub current_status: CheckStatus,
    /// The 10 most recent checks, newest first.
    pub recent_checks: Vec<UptimeCheck>,
    pub consecutive_failures: u32,
}

/// ISO-8601 UTC timestamps with millisecond precision, the wire format of
/// the live bus.
pub mod ts_milli {
    use chrono::{DateTime, SecondsFormat, Utc};
    use serde::{self, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(dt: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&dt.to_rfc3339_opts(SecondsFormat::Millis, true))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        DateTime::parse_from_rfc3339(&raw)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(serde::de::Error::custom)
    }

    pub mod option {
        use super::*;

        pub fn serialize<S>(dt: &Option<DateTime<Utc>>, serializer: S) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            match dt {
                Some(dt) => super::serialize(dt, serializer),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
        where
            D: Deserializer<'de>,
        {
            let raw = Option::<String>::deserialize(deserializer)?;
            raw.map(|s| {
                DateTime::parse_from_rfc3339(&s)
                    .map(|dt| dt.with_timezone(&Utc))
                    .map_err(serde::de::Error::custom)
            })
            .transpose()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_check_serializes_camel_case_with_milli_timestamp() {
        let check = UptimeCheck {
            id: Uuid::nil(),
            endpoint_id: Uuid::nil(),
            endpoint_name: "api".to_string(),
            status: CheckStatus::Down,
            status_code: 500,
            response_time: 12.5,
            timestamp: Utc.with_ymd_and_hms(2024, 3, 1, 8, 30, 15).unwrap(),
            error_reason: Some("Got 500, expected 200".to_string()),
        };

        let json = serde_json::to_value(&check).unwrap();
        assert_eq!(json["status"], "DOWN");
        assert_eq!(json["statusCode"], 500);
        assert_eq!(json["errorReason"], "Got 500, expected 200");
        assert_eq!(json["timestamp"], "2024-03-01T08:30:15.000Z");
    }

    #[test]
    fn test_error_reason_omitted_when_absent() {
        let check = UptimeCheck {
            id: Uuid::nil(),
            endpoint_id: Uuid::nil(),
            endpoint_name: "api".to_string(),
            status: CheckStatus::Up,
            status_code: 200,
            response_time: 42.0,
            timestamp: Utc::now(),
            error_reason: None,
        };

        let json = serde_json::to_value(&check).unwrap();
        assert!(json.get("errorReason").is_none());
    }

    #[test]
    fn test_severity_round_trip() {
        for s in [
            Severity::Critical,
            Severity::High,
            Severity::Medium,
            Severity::Low,
        ] {
            assert_eq!(s.as_str().parse::<Severity>().unwrap(), s);
        }
        assert!("urgent".parse::<Severity>().is_err());
    }
}
