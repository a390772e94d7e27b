//! End-to-end scenarios against a real Postgres instance.
//!
//! These tests need `DATABASE_URL` pointing at a disposable database and
//! are ignored by default:
//!
//! ```text
//! DATABASE_URL=postgres://... cargo test -- --ignored
//! ```
//!
//! Probed targets are local TCP stubs, so no external network is used.

use std::sync::atomic::{AtomicU16, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use uuid::Uuid;

use watchtower::breaker::{BreakerRegistry, CircuitState};
use watchtower::bus::{BusEvent, LiveBus};
use watchtower::config::Config;
use watchtower::db::{CheckStatus, Endpoint, NewEndpoint, Severity, Store};
use watchtower::engine::Engine;
use watchtower::monitor::{AgentRegistry, Prober};
use watchtower::retention::truncate_to_day;

async fn connect_store() -> Store {
    let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set for this test");
    Store::connect(&url).await.expect("store should connect")
}

fn unique(name: &str) -> String {
    format!("{name}-{}", Uuid::new_v4())
}

fn endpoint_input(name: String, url: String, interval: i32, timeout: i32) -> NewEndpoint {
    NewEndpoint {
        name,
        url,
        check_interval: interval,
        timeout,
        expected_status: 200,
        severity: Severity::Medium,
        enabled: true,
        tags: vec!["test".to_string()],
    }
}

/// Local HTTP stub. Responds to every connection with the current value
/// of the returned status atomic, after `delay`, and counts requests.
async fn spawn_stub(status: u16, delay: Duration) -> (String, Arc<AtomicU16>, Arc<AtomicUsize>) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let status = Arc::new(AtomicU16::new(status));
    let hits = Arc::new(AtomicUsize::new(0));

    let stub_status = status.clone();
    let stub_hits = hits.clone();
    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                break;
            };
            stub_hits.fetch_add(1, Ordering::SeqCst);
            let code = stub_status.load(Ordering::SeqCst);
            tokio::spawn(async move {
                let mut buf = vec![0u8; 2048];
                let _ = socket.read(&mut buf).await;
                tokio::time::sleep(delay).await;
                let response = format!(
                    "HTTP/1.1 {code} X\r\ncontent-length: 0\r\nconnection: close\r\n\r\n"
                );
                let _ = socket.write_all(response.as_bytes()).await;
            });
        }
    });

    (format!("http://{addr}"), status, hits)
}

fn drain_events(session: &mut watchtower::bus::SessionHandle) -> Vec<BusEvent> {
    let mut events = Vec::new();
    while let Ok(event) = session.events.try_recv() {
        events.push(event);
    }
    events
}

async fn seed_check(
    store: &Store,
    endpoint: &Endpoint,
    status: &str,
    response_time: f32,
    timestamp: DateTime<Utc>,
) {
    sqlx::query(
        "INSERT INTO uptime_checks \
         (id, endpoint_id, endpoint_name, status, status_code, response_time, timestamp) \
         VALUES ($1, $2, $3, $4, $5, $6, $7)",
    )
    .bind(Uuid::new_v4())
    .bind(endpoint.id)
    .bind(&endpoint.name)
    .bind(status)
    .bind(if status == "UP" { 200 } else { 0 })
    .bind(response_time)
    .bind(timestamp)
    .execute(store.pool())
    .await
    .expect("seeding a check row should work");
}

#[tokio::test]
#[ignore = "requires DATABASE_URL"]
async fn test_basic_up_probe() {
    let store = connect_store().await;
    let engine = Engine::new(store, &Config::default());
    let mut session = engine.bus().connect().await.unwrap();

    let (url, _status, _hits) = spawn_stub(200, Duration::ZERO).await;
    let endpoint = engine
        .add_endpoint(endpoint_input(unique("up"), url, 5, 2))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(1500)).await;

    let checks = engine.store().recent_checks(endpoint.id, 10).await.unwrap();
    assert_eq!(checks.len(), 1);
    assert_eq!(checks[0].status, CheckStatus::Up);
    assert_eq!(checks[0].status_code, 200);
    assert!(checks[0].response_time >= 0.0);

    // newCheck precedes the uptimeUpdate derived from it.
    let events = drain_events(&mut session);
    let check_pos = events
        .iter()
        .position(|e| matches!(e, BusEvent::NewCheck(c) if c.endpoint_id == endpoint.id))
        .expect("newCheck was broadcast");
    let update_pos = events
        .iter()
        .position(|e| matches!(e, BusEvent::UptimeUpdate(s) if s.endpoint_id == endpoint.id))
        .expect("uptimeUpdate was broadcast");
    assert!(check_pos < update_pos);

    match &events[update_pos] {
        BusEvent::UptimeUpdate(stats) => {
            assert_eq!(stats.uptime_percentage, 100.0);
            assert_eq!(stats.total_checks, 1);
            assert_eq!(stats.current_status, CheckStatus::Up);
        }
        _ => unreachable!(),
    }

    engine.shutdown().await;
    engine.delete_endpoint(endpoint.id).await.unwrap();
}

#[tokio::test]
#[ignore = "requires DATABASE_URL"]
async fn test_status_mismatch_records_down() {
    let store = connect_store().await;
    let engine = Engine::new(store, &Config::default());

    let (url, _status, _hits) = spawn_stub(500, Duration::ZERO).await;
    let endpoint = engine
        .add_endpoint(endpoint_input(unique("mismatch"), url, 5, 2))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(1500)).await;

    let checks = engine.store().recent_checks(endpoint.id, 10).await.unwrap();
    assert_eq!(checks.len(), 1);
    assert_eq!(checks[0].status, CheckStatus::Down);
    assert_eq!(checks[0].status_code, 500);
    assert_eq!(
        checks[0].error_reason.as_deref(),
        Some("Got 500, expected 200")
    );

    let stats = engine
        .get_uptime_statistics(endpoint.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stats.consecutive_failures, 1);
    assert_eq!(stats.current_status, CheckStatus::Down);
    assert_eq!(stats.uptime_percentage, 0.0);

    engine.shutdown().await;
    engine.delete_endpoint(endpoint.id).await.unwrap();
}

#[tokio::test]
#[ignore = "requires DATABASE_URL"]
async fn test_slow_target_records_timeout() {
    let store = connect_store().await;
    let engine = Engine::new(store, &Config::default());

    let (url, _status, _hits) = spawn_stub(200, Duration::from_secs(3)).await;
    let endpoint = engine
        .add_endpoint(endpoint_input(unique("slow"), url, 5, 1))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(2500)).await;

    let checks = engine.store().recent_checks(endpoint.id, 10).await.unwrap();
    assert_eq!(checks.len(), 1);
    assert_eq!(checks[0].status, CheckStatus::Down);
    assert_eq!(checks[0].status_code, 0);
    assert_eq!(checks[0].error_reason.as_deref(), Some("Timeout after 1s"));
    // The deadline fired around one second, with some jitter.
    assert!(checks[0].response_time >= 800.0 && checks[0].response_time < 2000.0);

    let stats = engine
        .get_uptime_statistics(endpoint.id)
        .await
        .unwrap()
        .unwrap();
    assert!(stats.consecutive_failures >= 1);

    engine.shutdown().await;
    engine.delete_endpoint(endpoint.id).await.unwrap();
}

#[tokio::test]
#[ignore = "requires DATABASE_URL"]
async fn test_probe_cadence_and_single_flight() {
    let store = connect_store().await;
    let engine = Engine::new(store, &Config::default());

    let (url, _status, hits) = spawn_stub(200, Duration::ZERO).await;
    let endpoint = engine
        .add_endpoint(endpoint_input(unique("cadence"), url, 5, 2))
        .await
        .unwrap();

    // Immediate probe plus ticks at ~5s and ~10s.
    tokio::time::sleep(Duration::from_millis(11_500)).await;
    let seen = hits.load(Ordering::SeqCst);
    assert!((2..=3).contains(&seen), "expected 2-3 probes, saw {seen}");

    let checks = engine.store().recent_checks(endpoint.id, 10).await.unwrap();
    assert_eq!(checks.len(), seen);

    engine.shutdown().await;
    engine.delete_endpoint(endpoint.id).await.unwrap();
}

/// Three failures open the circuit, the next probe short-circuits
/// without touching the failure counter, and after the reset timeout a
/// run of successes closes it again.
#[tokio::test]
#[ignore = "requires DATABASE_URL (slow: waits out the breaker reset timeout)"]
async fn test_breaker_opens_and_recovers() {
    let store = connect_store().await;
    let cfg = Config::default();
    let bus = Arc::new(LiveBus::new(&cfg));
    let breakers = Arc::new(BreakerRegistry::new(&cfg));
    let agents = AgentRegistry::default();
    let prober = Prober::new(store.clone(), bus.clone(), breakers.clone(), agents.clone());

    let (url, status, _hits) = spawn_stub(500, Duration::ZERO).await;
    let endpoint = store
        .create_endpoint(&endpoint_input(unique("breaker"), url, 5, 2))
        .await
        .unwrap();
    let _stop_rx = agents.register(endpoint.id).await.unwrap();

    for _ in 0..3 {
        prober.run(&endpoint).await;
    }
    let breaker = breakers.for_endpoint(&endpoint);
    assert_eq!(breaker.state(), CircuitState::Open);

    assert_eq!(agents.failures(endpoint.id).await, 3);

    // The short-circuit row leaves the counter at 3.
    prober.run(&endpoint).await;
    let checks = store.recent_checks(endpoint.id, 10).await.unwrap();
    assert_eq!(checks[0].status, CheckStatus::Down);
    assert_eq!(checks[0].status_code, 0);
    assert_eq!(checks[0].response_time, 0.0);
    assert_eq!(checks[0].error_reason.as_deref(), Some("Circuit breaker open"));
    assert_eq!(agents.failures(endpoint.id).await, 3);

    // The reset timeout is 3 x 5s; afterwards successes close the circuit.
    status.store(200, Ordering::SeqCst);
    tokio::time::sleep(Duration::from_secs(16)).await;

    prober.run(&endpoint).await;
    assert_eq!(breaker.state(), CircuitState::HalfOpen);
    // The first success already clears the failure streak.
    assert_eq!(agents.failures(endpoint.id).await, 0);

    prober.run(&endpoint).await;
    prober.run(&endpoint).await;
    assert_eq!(breaker.state(), CircuitState::Closed);

    let checks = store.recent_checks(endpoint.id, 10).await.unwrap();
    assert_eq!(checks[0].status, CheckStatus::Up);

    store.delete_endpoint(endpoint.id).await.unwrap();
}

#[tokio::test]
#[ignore = "requires DATABASE_URL"]
async fn test_retention_rollup_and_delete() {
    let store = connect_store().await;
    let cfg = Config {
        cleanup_batch_size: 10,
        ..Config::default()
    };
    let engine = Engine::new(store.clone(), &cfg);

    let mut recent = endpoint_input(unique("rollup"), "http://127.0.0.1:1".to_string(), 30, 5);
    recent.enabled = false;
    let recent = store.create_endpoint(&recent).await.unwrap();

    let mut stale = endpoint_input(unique("stale"), "http://127.0.0.1:1".to_string(), 30, 5);
    stale.enabled = false;
    let stale = store.create_endpoint(&stale).await.unwrap();

    // 100 rows across two complete hours yesterday: 60 (40 UP at 100ms,
    // 20 DOWN at 50ms) then 40 (30 UP, 10 DOWN).
    let yesterday = truncate_to_day(Utc::now()) - ChronoDuration::days(1);
    let hour_one = yesterday + ChronoDuration::hours(6);
    let hour_two = yesterday + ChronoDuration::hours(7);
    for i in 0..60 {
        let status = if i < 40 { "UP" } else { "DOWN" };
        let rt = if i < 40 { 100.0 } else { 50.0 };
        seed_check(&store, &recent, status, rt, hour_one + ChronoDuration::seconds(i)).await;
    }
    for i in 0..40 {
        let status = if i < 30 { "UP" } else { "DOWN" };
        let rt = if i < 30 { 100.0 } else { 50.0 };
        seed_check(&store, &recent, status, rt, hour_two + ChronoDuration::seconds(i)).await;
    }

    // 25 rows past the 7-day detail horizon.
    let old = Utc::now() - ChronoDuration::days(8);
    for i in 0..25 {
        seed_check(&store, &stale, "UP", 10.0, old + ChronoDuration::seconds(i)).await;
    }

    let summary = engine.trigger_retention().await.unwrap();
    assert!(summary.ran);
    assert!(summary.detail_deleted >= 25);

    // Two hourly buckets with exact totals and response-time stats.
    let hourly = store.hourly_aggregates(recent.id).await.unwrap();
    assert_eq!(hourly.len(), 2);
    assert_eq!(hourly[0].hour_start, hour_one);
    assert_eq!(hourly[0].total_checks, 60);
    assert_eq!(hourly[0].successful_checks, 40);
    assert_eq!(hourly[0].failed_checks, 20);
    assert_eq!(hourly[0].min_response_time, 50.0);
    assert_eq!(hourly[0].max_response_time, 100.0);
    assert!((hourly[0].avg_response_time - 83.3333).abs() < 0.01);
    assert_eq!(hourly[1].total_checks, 40);

    // One daily bucket with the day's uptime percentage.
    let daily = store.daily_aggregates(recent.id).await.unwrap();
    assert_eq!(daily.len(), 1);
    assert_eq!(daily[0].total_checks, 100);
    assert_eq!(daily[0].successful_checks, 70);
    assert!((daily[0].uptime_percentage - 70.0).abs() < 0.001);

    // The stale endpoint's raw rows are gone.
    let since = Utc::now() - ChronoDuration::days(30);
    assert_eq!(store.count_checks_since(stale.id, since).await.unwrap(), (0, 0));

    // Idempotence: a second run rewrites identical aggregates and leaves
    // the raw table untouched.
    let raw_before = store.count_checks_since(recent.id, since).await.unwrap();
    let summary2 = engine.trigger_retention().await.unwrap();
    assert!(summary2.ran);
    assert_eq!(store.hourly_aggregates(recent.id).await.unwrap(), hourly);
    assert_eq!(store.daily_aggregates(recent.id).await.unwrap(), daily);
    assert_eq!(store.count_checks_since(recent.id, since).await.unwrap(), raw_before);

    store.delete_endpoint(recent.id).await.unwrap();
    store.delete_endpoint(stale.id).await.unwrap();
}
