//! HTTP probe execution.
//!
//! One probe is a breaker-guarded GET against the endpoint's URL with
//! the endpoint's own deadline. Every path through a probe ends in a
//! recorded check row (or a logged store failure); errors never
//! propagate out of the loop.

use std::sync::Arc;
use std::time::{Duration, Instant};

use reqwest::header;
use thiserror::Error;

use super::{stats, AgentRegistry};
use crate::breaker::BreakerRegistry;
use crate::bus::{CheckBroadcast, LiveBus, NoticeKind};
use crate::db::{CheckStatus, Endpoint, NewCheck, Store};

/// Sent with every probe request.
pub const PROBE_USER_AGENT: &str = "Watchtower-Monitor/1.0";

/// Expected, normal business outcomes of a failed probe.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProbeError {
    #[error("Timeout after {0}s")]
    Timeout(i32),
    #[error("Got {got}, expected {expected}")]
    UnexpectedStatus { got: i32, expected: i32 },
    #[error("Connection failed: {0}")]
    Transport(String),
}

/// A completed exchange whose status matched.
#[derive(Debug, Clone)]
pub struct ProbeSuccess {
    pub status_code: i32,
    /// Milliseconds.
    pub response_time: f32,
}

/// A classified failure, still carrying the measured elapsed time.
#[derive(Debug, Clone)]
pub struct ProbeFailure {
    pub kind: ProbeError,
    /// Milliseconds spent before the failure was observed.
    pub response_time: f32,
}

impl ProbeFailure {
    /// The status code recorded on the DOWN row: the observed status for
    /// a mismatch, 0 when the exchange did not complete.
    pub fn status_code(&self) -> i32 {
        match self.kind {
            ProbeError::UnexpectedStatus { got, .. } => got,
            _ => 0,
        }
    }
}

/// Issue one GET and classify the outcome. Does not touch the store.
pub async fn check_endpoint(
    client: &reqwest::Client,
    endpoint: &Endpoint,
) -> Result<ProbeSuccess, ProbeFailure> {
    let start = Instant::now();
    let result = client
        .get(&endpoint.url)
        .header(header::USER_AGENT, PROBE_USER_AGENT)
        .timeout(Duration::from_secs(endpoint.timeout as u64))
        .send()
        .await;
    let response_time = start.elapsed().as_secs_f32() * 1000.0;

    match result {
        Ok(response) => {
            let got = response.status().as_u16() as i32;
            if got == endpoint.expected_status {
                Ok(ProbeSuccess {
                    status_code: got,
                    response_time,
                })
            } else {
                Err(ProbeFailure {
                    kind: ProbeError::UnexpectedStatus {
                        got,
                        expected: endpoint.expected_status,
                    },
                    response_time,
                })
            }
        }
        Err(e) if e.is_timeout() => Err(ProbeFailure {
            kind: ProbeError::Timeout(endpoint.timeout),
            response_time,
        }),
        Err(e) => Err(ProbeFailure {
            kind: ProbeError::Transport(e.to_string()),
            response_time,
        }),
    }
}

/// Runs breaker-guarded probes and owns the write/emit tail of each one.
pub struct Prober {
    client: reqwest::Client,
    store: Store,
    bus: Arc<LiveBus>,
    breakers: Arc<BreakerRegistry>,
    agents: AgentRegistry,
}

impl Prober {
    pub fn new(
        store: Store,
        bus: Arc<LiveBus>,
        breakers: Arc<BreakerRegistry>,
        agents: AgentRegistry,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            store,
            bus,
            breakers,
            agents,
        }
    }

    /// Perform one probe for `endpoint` and record its outcome.
    pub async fn run(&self, endpoint: &Endpoint) {
        let breaker = self.breakers.for_endpoint(endpoint);

        match breaker.execute(check_endpoint(&self.client, endpoint)).await {
            // Short-circuit: record the DOWN row but leave the
            // consecutive-failure counter untouched.
            Err(open) => {
                tracing::debug!("Prober: {} short-circuited", endpoint.name);
                self.finish(
                    endpoint,
                    NewCheck {
                        endpoint_id: endpoint.id,
                        endpoint_name: endpoint.name.clone(),
                        status: CheckStatus::Down,
                        status_code: 0,
                        response_time: 0.0,
                        error_reason: Some(open.to_string()),
                    },
                )
                .await;
            }
            Ok(Ok(success)) => {
                let prior_failures = self.agents.reset_failures(endpoint.id).await;
                if prior_failures >= 1 {
                    self.bus
                        .publish_system(
                            NoticeKind::Info,
                            format!(
                                "{} is back online after {} failures",
                                endpoint.name, prior_failures
                            ),
                        )
                        .await;
                }
                self.finish(
                    endpoint,
                    NewCheck {
                        endpoint_id: endpoint.id,
                        endpoint_name: endpoint.name.clone(),
                        status: CheckStatus::Up,
                        status_code: success.status_code,
                        response_time: success.response_time,
                        error_reason: None,
                    },
                )
                .await;
            }
            Ok(Err(failure)) => {
                let failures = self.agents.bump_failures(endpoint.id).await;
                tracing::warn!(
                    "Prober: {} is down ({}), {} consecutive failures",
                    endpoint.name,
                    failure.kind,
                    failures
                );
                if failures > 0 && failures % 3 == 0 {
                    self.bus
                        .publish_system(
                            NoticeKind::Error,
                            format!("{} has {} consecutive failures", endpoint.name, failures),
                        )
                        .await;
                }
                self.finish(
                    endpoint,
                    NewCheck {
                        endpoint_id: endpoint.id,
                        endpoint_name: endpoint.name.clone(),
                        status: CheckStatus::Down,
                        status_code: failure.status_code(),
                        response_time: failure.response_time,
                        error_reason: Some(failure.kind.to_string()),
                    },
                )
                .await;
            }
        }
    }

    /// The tail shared by every probe path: insert the row, read the
    /// rolling statistics, then emit `newCheck` followed by
    /// `uptimeUpdate`. A bad write must not kill the loop.
    async fn finish(&self, endpoint: &Endpoint, new_check: NewCheck) {
        let check = match self.store.insert_check(&new_check).await {
            Ok(check) => check,
            Err(e) => {
                tracing::error!(
                    "Prober: failed to store check for {}: {}",
                    endpoint.name,
                    e
                );
                self.bus
                    .publish_system(NoticeKind::Error, "Failed to store check result")
                    .await;
                return;
            }
        };

        let failures = self.agents.failures(endpoint.id).await;
        let statistics = match stats::compute(&self.store, endpoint.id, failures).await {
            Ok(statistics) => statistics,
            Err(e) => {
                tracing::error!(
                    "Prober: failed to read statistics for {}: {}",
                    endpoint.name,
                    e
                );
                None
            }
        };

        self.bus
            .publish_check(endpoint.id, CheckBroadcast::from(&check))
            .await;

        // Vanishes when the endpoint was deleted between insert and read.
        if let Some(statistics) = statistics {
            self.agents
                .cache_stats(endpoint.id, statistics.clone())
                .await;
            self.bus.publish_stats(endpoint.id, statistics).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use uuid::Uuid;

    fn endpoint(url: String, expected_status: i32, timeout: i32) -> Endpoint {
        Endpoint {
            id: Uuid::new_v4(),
            name: "stub".to_string(),
            url,
            check_interval: 30,
            timeout,
            expected_status,
            severity: crate::db::Severity::Medium,
            enabled: true,
            tags: Vec::new(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    /// Minimal HTTP stub: answers every connection with `status` after
    /// `delay`, and reports the first request's bytes.
    async fn spawn_stub(
        status: u16,
        delay: Duration,
    ) -> (String, tokio::sync::oneshot::Receiver<String>) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (seen_tx, seen_rx) = tokio::sync::oneshot::channel();

        tokio::spawn(async move {
            let mut seen_tx = Some(seen_tx);
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    break;
                };
                let mut buf = vec![0u8; 2048];
                let n = socket.read(&mut buf).await.unwrap_or(0);
                if let Some(tx) = seen_tx.take() {
                    let _ = tx.send(String::from_utf8_lossy(&buf[..n]).to_string());
                }
                tokio::time::sleep(delay).await;
                let response = format!(
                    "HTTP/1.1 {status} X\r\ncontent-length: 0\r\nconnection: close\r\n\r\n"
                );
                let _ = socket.write_all(response.as_bytes()).await;
            }
        });

        (format!("http://{addr}"), seen_rx)
    }

    #[tokio::test]
    async fn test_matching_status_is_up() {
        let (url, seen) = spawn_stub(200, Duration::ZERO).await;
        let client = reqwest::Client::new();

        let success = check_endpoint(&client, &endpoint(url, 200, 2))
            .await
            .expect("probe should succeed");
        assert_eq!(success.status_code, 200);
        assert!(success.response_time >= 0.0);

        let request = seen.await.unwrap();
        assert!(
            request.contains("user-agent: Watchtower-Monitor/1.0")
                || request.contains("User-Agent: Watchtower-Monitor/1.0"),
            "probe request carried no user agent: {request}"
        );
    }

    #[tokio::test]
    async fn test_status_mismatch_is_classified() {
        let (url, _seen) = spawn_stub(500, Duration::ZERO).await;
        let client = reqwest::Client::new();

        let failure = check_endpoint(&client, &endpoint(url, 200, 2))
            .await
            .expect_err("probe should fail");
        assert_eq!(failure.status_code(), 500);
        assert_eq!(failure.kind.to_string(), "Got 500, expected 200");
    }

    #[tokio::test]
    async fn test_slow_response_times_out() {
        let (url, _seen) = spawn_stub(200, Duration::from_secs(5)).await;
        let client = reqwest::Client::new();

        let failure = check_endpoint(&client, &endpoint(url, 200, 1))
            .await
            .expect_err("probe should time out");
        assert_eq!(failure.kind, ProbeError::Timeout(1));
        assert_eq!(failure.status_code(), 0);
        assert_eq!(failure.kind.to_string(), "Timeout after 1s");
        // The deadline fired near the configured second.
        assert!(failure.response_time >= 900.0 && failure.response_time < 2000.0);
    }

    #[tokio::test]
    async fn test_refused_connection_is_transport_error() {
        // Bind then drop to find a port nothing listens on.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = reqwest::Client::new();
        let failure = check_endpoint(&client, &endpoint(format!("http://{addr}"), 200, 2))
            .await
            .expect_err("probe should fail");
        assert!(matches!(failure.kind, ProbeError::Transport(_)));
        assert_eq!(failure.status_code(), 0);
        assert!(failure.kind.to_string().starts_with("Connection failed: "));
    }
}
