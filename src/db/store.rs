//! Postgres store implementation.
//!
//! A thin typed wrapper over the SQL store: endpoint CRUD, append-only
//! check inserts, statistics reads, and set-based aggregate maintenance
//! for the retention job. All statements are parameterised.

use chrono::{DateTime, NaiveDate, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

use super::models::*;

/// Database error types.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("endpoint not found")]
    NotFound,
}

/// Bad operator input. Surfaced to the caller, never retried.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ValidationError {
    #[error("endpoint name '{0}' is already in use")]
    DuplicateName(String),
    #[error("url must use http or https: {0}")]
    InvalidUrlScheme(String),
    #[error("check interval must be between 5 and 3600 seconds, got {0}")]
    CheckIntervalOutOfRange(i32),
    #[error("timeout must be between 1 and 60 seconds, got {0}")]
    TimeoutOutOfRange(i32),
    #[error("timeout ({timeout}s) must be less than the check interval ({interval}s)")]
    TimeoutNotBelowInterval { timeout: i32, interval: i32 },
    #[error("expected status must be between 100 and 599, got {0}")]
    ExpectedStatusOutOfRange(i32),
    #[error("at most 10 tags are allowed, got {0}")]
    TooManyTags(usize),
    #[error("tag '{0}' exceeds 50 characters")]
    TagTooLong(String),
}

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

/// Pool-backed database store. Cheap to clone.
#[derive(Clone)]
pub struct Store {
    pool: PgPool,
}

impl Store {
    /// Connect to Postgres and run embedded migrations.
    ///
    /// The pool is bounded at 20 connections with acquire and idle
    /// timeouts so a probe tick can never deadlock on acquisition.
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(20)
            .acquire_timeout(Duration::from_secs(5))
            .idle_timeout(Duration::from_secs(600))
            .connect(database_url)
            .await?;

        MIGRATOR.run(&pool).await?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    // --- Endpoint CRUD ---

    /// Validate and insert a new endpoint.
    pub async fn create_endpoint(&self, input: &NewEndpoint) -> Result<Endpoint, StoreError> {
        validate_endpoint_input(input)?;

        if self.name_taken(&input.name, None).await? {
            return Err(ValidationError::DuplicateName(input.name.clone()).into());
        }

        let id = Uuid::new_v4();
        let now = Utc::now();

        let row = sqlx::query(
            "INSERT INTO endpoints \
             (id, name, url, check_interval, timeout, expected_status, severity, enabled, tags, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $10) \
             RETURNING *",
        )
        .bind(id)
        .bind(&input.name)
        .bind(&input.url)
        .bind(input.check_interval)
        .bind(input.timeout)
        .bind(input.expected_status)
        .bind(input.severity.as_str())
        .bind(input.enabled)
        .bind(&input.tags)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        endpoint_from_row(&row)
    }

    /// Validate and replace an existing endpoint's configuration.
    pub async fn update_endpoint(
        &self,
        id: Uuid,
        input: &NewEndpoint,
    ) -> Result<Endpoint, StoreError> {
        validate_endpoint_input(input)?;

        if self.name_taken(&input.name, Some(id)).await? {
            return Err(ValidationError::DuplicateName(input.name.clone()).into());
        }

        let row = sqlx::query(
            "UPDATE endpoints SET \
             name = $2, url = $3, check_interval = $4, timeout = $5, \
             expected_status = $6, severity = $7, enabled = $8, tags = $9, updated_at = now() \
             WHERE id = $1 \
             RETURNING *",
        )
        .bind(id)
        .bind(&input.name)
        .bind(&input.url)
        .bind(input.check_interval)
        .bind(input.timeout)
        .bind(input.expected_status)
        .bind(input.severity.as_str())
        .bind(input.enabled)
        .bind(&input.tags)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => endpoint_from_row(&row),
            None => Err(StoreError::NotFound),
        }
    }

    /// Delete an endpoint. Returns whether a row was actually removed so
    /// callers can distinguish 404 from success. Raw checks cascade.
    pub async fn delete_endpoint(&self, id: Uuid) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM endpoints WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Flip the enabled flag. Returns false when the endpoint is unknown.
    pub async fn set_enabled(&self, id: Uuid, enabled: bool) -> Result<bool, StoreError> {
        let result =
            sqlx::query("UPDATE endpoints SET enabled = $2, updated_at = now() WHERE id = $1")
                .bind(id)
                .bind(enabled)
                .execute(&self.pool)
                .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn get_endpoint(&self, id: Uuid) -> Result<Option<Endpoint>, StoreError> {
        let row = sqlx::query("SELECT * FROM endpoints WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(endpoint_from_row).transpose()
    }

    pub async fn list_endpoints(&self) -> Result<Vec<Endpoint>, StoreError> {
        let rows = sqlx::query("SELECT * FROM endpoints ORDER BY name")
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(endpoint_from_row).collect()
    }

    pub async fn list_enabled_endpoints(&self) -> Result<Vec<Endpoint>, StoreError> {
        let rows = sqlx::query("SELECT * FROM endpoints WHERE enabled ORDER BY name")
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(endpoint_from_row).collect()
    }

    async fn name_taken(&self, name: &str, exclude: Option<Uuid>) -> Result<bool, StoreError> {
        let taken: bool = sqlx::query_scalar(
            "SELECT EXISTS(\
             SELECT 1 FROM endpoints WHERE LOWER(name) = LOWER($1) AND ($2::uuid IS NULL OR id <> $2))",
        )
        .bind(name)
        .bind(exclude)
        .fetch_one(&self.pool)
        .await?;

        Ok(taken)
    }

    // --- Checks ---

    /// Append one check row. Id and timestamp are assigned here.
    pub async fn insert_check(&self, check: &NewCheck) -> Result<UptimeCheck, StoreError> {
        let id = Uuid::new_v4();
        let now = Utc::now();

        sqlx::query(
            "INSERT INTO uptime_checks \
             (id, endpoint_id, endpoint_name, status, status_code, response_time, timestamp, error_reason) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(id)
        .bind(check.endpoint_id)
        .bind(&check.endpoint_name)
        .bind(check.status.as_str())
        .bind(check.status_code)
        .bind(check.response_time)
        .bind(now)
        .bind(&check.error_reason)
        .execute(&self.pool)
        .await?;

        Ok(UptimeCheck {
            id,
            endpoint_id: check.endpoint_id,
            endpoint_name: check.endpoint_name.clone(),
            status: check.status,
            status_code: check.status_code,
            response_time: check.response_time,
            timestamp: now,
            error_reason: check.error_reason.clone(),
        })
    }

    /// Total and UP counts for an endpoint since `since`.
    pub async fn count_checks_since(
        &self,
        endpoint_id: Uuid,
        since: DateTime<Utc>,
    ) -> Result<(i64, i64), StoreError> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS total, COUNT(*) FILTER (WHERE status = 'UP') AS up \
             FROM uptime_checks WHERE endpoint_id = $1 AND timestamp >= $2",
        )
        .bind(endpoint_id)
        .bind(since)
        .fetch_one(&self.pool)
        .await?;

        Ok((row.try_get("total")?, row.try_get("up")?))
    }

    /// Mean response time for an endpoint since `since`, or None without
    /// samples.
    pub async fn avg_response_time_since(
        &self,
        endpoint_id: Uuid,
        since: DateTime<Utc>,
    ) -> Result<Option<f64>, StoreError> {
        let avg: Option<f64> = sqlx::query_scalar(
            "SELECT AVG(response_time) FROM uptime_checks \
             WHERE endpoint_id = $1 AND timestamp >= $2",
        )
        .bind(endpoint_id)
        .bind(since)
        .fetch_one(&self.pool)
        .await?;

        Ok(avg)
    }

    /// The most recent checks for an endpoint, newest first.
    pub async fn recent_checks(
        &self,
        endpoint_id: Uuid,
        limit: i64,
    ) -> Result<Vec<UptimeCheck>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM uptime_checks WHERE endpoint_id = $1 \
             ORDER BY timestamp DESC LIMIT $2",
        )
        .bind(endpoint_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(check_from_row).collect()
    }

    // --- Aggregates ---

    /// Roll raw checks in `[since, until)` up into hourly buckets.
    /// Re-running over the same range overwrites the same rows.
    pub async fn upsert_hourly_aggregates(
        &self,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "INSERT INTO uptime_checks_hourly \
             (endpoint_id, endpoint_name, hour_start, total_checks, successful_checks, failed_checks, \
              avg_response_time, min_response_time, max_response_time) \
             SELECT endpoint_id, MIN(endpoint_name), date_trunc('hour', timestamp), COUNT(*), \
                    COUNT(*) FILTER (WHERE status = 'UP'), \
                    COUNT(*) FILTER (WHERE status = 'DOWN'), \
                    COALESCE(AVG(response_time), 0), \
                    COALESCE(MIN(response_time), 0), \
                    COALESCE(MAX(response_time), 0) \
             FROM uptime_checks \
             WHERE timestamp >= $1 AND timestamp < $2 \
             GROUP BY endpoint_id, date_trunc('hour', timestamp) \
             ON CONFLICT (endpoint_id, hour_start) DO UPDATE SET \
                endpoint_name = EXCLUDED.endpoint_name, \
                total_checks = EXCLUDED.total_checks, \
                successful_checks = EXCLUDED.successful_checks, \
                failed_checks = EXCLUDED.failed_checks, \
                avg_response_time = EXCLUDED.avg_response_time, \
                min_response_time = EXCLUDED.min_response_time, \
                max_response_time = EXCLUDED.max_response_time",
        )
        .bind(since)
        .bind(until)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Roll raw checks in `[since, until)` up into daily buckets,
    /// including the day's uptime percentage.
    pub async fn upsert_daily_aggregates(
        &self,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "INSERT INTO uptime_checks_daily \
             (endpoint_id, endpoint_name, day_start, total_checks, successful_checks, failed_checks, \
              uptime_percentage, avg_response_time, min_response_time, max_response_time) \
             SELECT endpoint_id, MIN(endpoint_name), date_trunc('day', timestamp)::date, COUNT(*), \
                    COUNT(*) FILTER (WHERE status = 'UP'), \
                    COUNT(*) FILTER (WHERE status = 'DOWN'), \
                    ROUND(100.0 * COUNT(*) FILTER (WHERE status = 'UP') / COUNT(*), 2), \
                    COALESCE(AVG(response_time), 0), \
                    COALESCE(MIN(response_time), 0), \
                    COALESCE(MAX(response_time), 0) \
             FROM uptime_checks \
             WHERE timestamp >= $1 AND timestamp < $2 \
             GROUP BY endpoint_id, date_trunc('day', timestamp) \
             ON CONFLICT (endpoint_id, day_start) DO UPDATE SET \
                endpoint_name = EXCLUDED.endpoint_name, \
                total_checks = EXCLUDED.total_checks, \
                successful_checks = EXCLUDED.successful_checks, \
                failed_checks = EXCLUDED.failed_checks, \
                uptime_percentage = EXCLUDED.uptime_percentage, \
                avg_response_time = EXCLUDED.avg_response_time, \
                min_response_time = EXCLUDED.min_response_time, \
                max_response_time = EXCLUDED.max_response_time",
        )
        .bind(since)
        .bind(until)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Delete one batch of raw checks older than `cutoff`. Returns the
    /// number of rows removed; callers loop until this reaches zero.
    pub async fn delete_checks_before(
        &self,
        cutoff: DateTime<Utc>,
        batch_size: i64,
    ) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "DELETE FROM uptime_checks WHERE id IN \
             (SELECT id FROM uptime_checks WHERE timestamp < $1 LIMIT $2)",
        )
        .bind(cutoff)
        .bind(batch_size)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    pub async fn delete_hourly_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM uptime_checks_hourly WHERE hour_start < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    pub async fn delete_daily_before(&self, cutoff: NaiveDate) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM uptime_checks_daily WHERE day_start < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    /// Reclaim space and refresh planner statistics on the check tables.
    pub async fn vacuum_analyze(&self) -> Result<(), StoreError> {
        for table in [
            "uptime_checks",
            "uptime_checks_hourly",
            "uptime_checks_daily",
        ] {
            sqlx::query(&format!("VACUUM ANALYZE {table}"))
                .execute(&self.pool)
                .await?;
        }
        Ok(())
    }

    /// Hourly rows for one endpoint, oldest first.
    pub async fn hourly_aggregates(
        &self,
        endpoint_id: Uuid,
    ) -> Result<Vec<HourlyAggregate>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM uptime_checks_hourly WHERE endpoint_id = $1 ORDER BY hour_start",
        )
        .bind(endpoint_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(HourlyAggregate {
                    endpoint_id: row.try_get("endpoint_id")?,
                    endpoint_name: row.try_get("endpoint_name")?,
                    hour_start: row.try_get("hour_start")?,
                    total_checks: row.try_get("total_checks")?,
                    successful_checks: row.try_get("successful_checks")?,
                    failed_checks: row.try_get("failed_checks")?,
                    avg_response_time: row.try_get("avg_response_time")?,
                    min_response_time: row.try_get("min_response_time")?,
                    max_response_time: row.try_get("max_response_time")?,
                })
            })
            .collect()
    }

    /// Daily rows for one endpoint, oldest first.
    pub async fn daily_aggregates(
        &self,
        endpoint_id: Uuid,
    ) -> Result<Vec<DailyAggregate>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM uptime_checks_daily WHERE endpoint_id = $1 ORDER BY day_start",
        )
        .bind(endpoint_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(DailyAggregate {
                    endpoint_id: row.try_get("endpoint_id")?,
                    endpoint_name: row.try_get("endpoint_name")?,
                    day_start: row.try_get("day_start")?,
                    total_checks: row.try_get("total_checks")?,
                    successful_checks: row.try_get("successful_checks")?,
                    failed_checks: row.try_get("failed_checks")?,
                    uptime_percentage: row.try_get("uptime_percentage")?,
                    avg_response_time: row.try_get("avg_response_time")?,
                    min_response_time: row.try_get("min_response_time")?,
                    max_response_time: row.try_get("max_response_time")?,
                })
            })
            .collect()
    }
}

fn endpoint_from_row(row: &PgRow) -> Result<Endpoint, StoreError> {
    let severity: String = row.try_get("severity")?;
    let severity = severity
        .parse()
        .map_err(|e: String| sqlx::Error::Decode(e.into()))?;

    Ok(Endpoint {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        url: row.try_get("url")?,
        check_interval: row.try_get("check_interval")?,
        timeout: row.try_get("timeout")?,
        expected_status: row.try_get("expected_status")?,
        severity,
        enabled: row.try_get("enabled")?,
        tags: row.try_get("tags")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn check_from_row(row: &PgRow) -> Result<UptimeCheck, StoreError> {
    let status: String = row.try_get("status")?;
    let status = status
        .parse()
        .map_err(|e: String| sqlx::Error::Decode(e.into()))?;

    Ok(UptimeCheck {
        id: row.try_get("id")?,
        endpoint_id: row.try_get("endpoint_id")?,
        endpoint_name: row.try_get("endpoint_name")?,
        status,
        status_code: row.try_get("status_code")?,
        response_time: row.try_get("response_time")?,
        timestamp: row.try_get("timestamp")?,
        error_reason: row.try_get("error_reason")?,
    })
}

/// Range and shape checks on operator input. Name uniqueness is checked
/// separately against the store.
pub fn validate_endpoint_input(input: &NewEndpoint) -> Result<(), ValidationError> {
    let scheme_ok = input.url.starts_with("http://") || input.url.starts_with("https://");
    if !scheme_ok {
        return Err(ValidationError::InvalidUrlScheme(input.url.clone()));
    }

    if !(5..=3600).contains(&input.check_interval) {
        return Err(ValidationError::CheckIntervalOutOfRange(
            input.check_interval,
        ));
    }

    if !(1..=60).contains(&input.timeout) {
        return Err(ValidationError::TimeoutOutOfRange(input.timeout));
    }

    if input.timeout >= input.check_interval {
        return Err(ValidationError::TimeoutNotBelowInterval {
            timeout: input.timeout,
            interval: input.check_interval,
        });
    }

    if !(100..=599).contains(&input.expected_status) {
        return Err(ValidationError::ExpectedStatusOutOfRange(
            input.expected_status,
        ));
    }

    if input.tags.len() > 10 {
        return Err(ValidationError::TooManyTags(input.tags.len()));
    }
    if let Some(tag) = input.tags.iter().find(|t| t.chars().count() > 50) {
        return Err(ValidationError::TagTooLong(tag.clone()));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input() -> NewEndpoint {
        NewEndpoint {
            name: "API".to_string(),
            url: "https://example.com/health".to_string(),
            check_interval: 30,
            timeout: 5,
            expected_status: 200,
            severity: Severity::High,
            enabled: true,
            tags: vec!["prod".to_string()],
        }
    }

    #[test]
    fn test_valid_input_passes() {
        assert!(validate_endpoint_input(&input()).is_ok());
    }

    #[test]
    fn test_rejects_bad_scheme() {
        let mut bad = input();
        bad.url = "ftp://example.com".to_string();
        assert_eq!(
            validate_endpoint_input(&bad),
            Err(ValidationError::InvalidUrlScheme(bad.url.clone()))
        );
    }

    #[test]
    fn test_rejects_out_of_range_interval_and_timeout() {
        let mut bad = input();
        bad.check_interval = 4;
        assert!(matches!(
            validate_endpoint_input(&bad),
            Err(ValidationError::CheckIntervalOutOfRange(4))
        ));

        let mut bad = input();
        bad.timeout = 61;
        assert!(matches!(
            validate_endpoint_input(&bad),
            Err(ValidationError::TimeoutOutOfRange(61))
        ));
    }

    #[test]
    fn test_rejects_timeout_not_below_interval() {
        let mut bad = input();
        bad.check_interval = 10;
        bad.timeout = 10;
        assert!(matches!(
            validate_endpoint_input(&bad),
            Err(ValidationError::TimeoutNotBelowInterval { .. })
        ));
    }

    #[test]
    fn test_rejects_bad_tags() {
        let mut bad = input();
        bad.tags = (0..11).map(|i| format!("t{i}")).collect();
        assert!(matches!(
            validate_endpoint_input(&bad),
            Err(ValidationError::TooManyTags(11))
        ));

        let mut bad = input();
        bad.tags = vec!["x".repeat(51)];
        assert!(matches!(
            validate_endpoint_input(&bad),
            Err(ValidationError::TagTooLong(_))
        ));
    }
}
