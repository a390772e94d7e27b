//! Per-endpoint circuit breaker.
//!
//! A CLOSED/OPEN/HALF_OPEN state machine that short-circuits probes
//! during sustained failure. One instance per endpoint, lazily created
//! through [`BreakerRegistry`]. Samples live in a sliding window and are
//! pruned on every evaluation; an OPEN rejection is not a sample.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;
use uuid::Uuid;

use crate::config::Config;
use crate::db::Endpoint;

/// Rejection issued while the circuit is open.
#[derive(Error, Debug, PartialEq, Eq)]
#[error("Circuit breaker open")]
pub struct OpenCircuit;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "CLOSED",
            CircuitState::Open => "OPEN",
            CircuitState::HalfOpen => "HALF_OPEN",
        }
    }
}

/// Per-instance breaker configuration.
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Failure percentage (0-100) at which the circuit opens.
    pub failure_threshold: u8,
    /// How long an open circuit waits before admitting a trial call.
    pub reset_timeout: Duration,
    /// Sliding window for sample retention.
    pub monitoring_period: Duration,
    /// Samples required before the failure rate is evaluated, and
    /// successes required to close a half-open circuit.
    pub minimum_requests: usize,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 70,
            reset_timeout: Duration::from_secs(60),
            monitoring_period: Duration::from_secs(300),
            minimum_requests: 3,
        }
    }
}

/// Hook fired exactly once per state transition with (from, to).
pub type TransitionObserver = Box<dyn Fn(CircuitState, CircuitState) + Send + Sync>;

struct BreakerInner {
    state: CircuitState,
    /// (observed at, was success), oldest first, bounded by the window.
    samples: VecDeque<(Instant, bool)>,
    half_open_successes: usize,
    next_attempt: Option<Instant>,
}

/// Circuit breaker guarding one endpoint's probes.
///
/// The state lock is never held across the wrapped operation.
pub struct CircuitBreaker {
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
    observer: Option<TransitionObserver>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                samples: VecDeque::new(),
                half_open_successes: 0,
                next_attempt: None,
            }),
            observer: None,
        }
    }

    pub fn with_observer(config: BreakerConfig, observer: TransitionObserver) -> Self {
        Self {
            observer: Some(observer),
            ..Self::new(config)
        }
    }

    /// Run `op` under the breaker.
    ///
    /// `Err(OpenCircuit)` means the call was rejected without touching
    /// the network and without recording a sample. Otherwise the inner
    /// result is `op`'s own outcome, already recorded as a sample.
    pub async fn execute<T, E, Fut>(&self, op: Fut) -> Result<Result<T, E>, OpenCircuit>
    where
        Fut: Future<Output = Result<T, E>>,
    {
        self.acquire()?;
        let outcome = op.await;
        self.record(outcome.is_ok());
        Ok(outcome)
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().unwrap().state
    }

    /// (requests, failures) currently inside the sliding window.
    pub fn window_counts(&self) -> (usize, usize) {
        let mut inner = self.inner.lock().unwrap();
        prune(&mut inner.samples, Instant::now(), self.config.monitoring_period);
        let failures = inner.samples.iter().filter(|(_, ok)| !ok).count();
        (inner.samples.len(), failures)
    }

    fn acquire(&self) -> Result<(), OpenCircuit> {
        let mut transition = None;
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.state == CircuitState::Open {
                let due = inner.next_attempt.is_some_and(|at| Instant::now() >= at);
                if !due {
                    return Err(OpenCircuit);
                }
                inner.state = CircuitState::HalfOpen;
                inner.half_open_successes = 0;
                transition = Some((CircuitState::Open, CircuitState::HalfOpen));
            }
        }
        self.notify(transition);
        Ok(())
    }

    fn record(&self, success: bool) {
        let now = Instant::now();
        let mut transition = None;
        {
            let mut inner = self.inner.lock().unwrap();
            prune(&mut inner.samples, now, self.config.monitoring_period);

            match inner.state {
                CircuitState::Closed => {
                    inner.samples.push_back((now, success));
                    if !success && self.failure_rate_exceeded(&inner.samples) {
                        inner.state = CircuitState::Open;
                        inner.next_attempt = Some(now + self.config.reset_timeout);
                        transition = Some((CircuitState::Closed, CircuitState::Open));
                    }
                }
                CircuitState::HalfOpen => {
                    if success {
                        inner.half_open_successes += 1;
                        if inner.half_open_successes >= self.config.minimum_requests {
                            inner.state = CircuitState::Closed;
                            inner.samples.clear();
                            inner.half_open_successes = 0;
                            inner.next_attempt = None;
                            transition = Some((CircuitState::HalfOpen, CircuitState::Closed));
                        }
                    } else {
                        inner.state = CircuitState::Open;
                        inner.next_attempt = Some(now + self.config.reset_timeout);
                        inner.half_open_successes = 0;
                        transition = Some((CircuitState::HalfOpen, CircuitState::Open));
                    }
                }
                // A call admitted just before another opened the circuit.
                CircuitState::Open => {}
            }
        }
        self.notify(transition);
    }

    fn failure_rate_exceeded(&self, samples: &VecDeque<(Instant, bool)>) -> bool {
        if samples.len() < self.config.minimum_requests {
            return false;
        }
        let failures = samples.iter().filter(|(_, ok)| !ok).count();
        failures * 100 >= self.config.failure_threshold as usize * samples.len()
    }

    fn notify(&self, transition: Option<(CircuitState, CircuitState)>) {
        if let (Some(observer), Some((from, to))) = (self.observer.as_ref(), transition) {
            observer(from, to);
        }
    }
}

fn prune(samples: &mut VecDeque<(Instant, bool)>, now: Instant, window: Duration) {
    while let Some((at, _)) = samples.front() {
        if now.duration_since(*at) > window {
            samples.pop_front();
        } else {
            break;
        }
    }
}

/// Lazily populated map of endpoint id to breaker.
pub struct BreakerRegistry {
    failure_threshold: u8,
    monitoring_period: Duration,
    minimum_requests: usize,
    breakers: Mutex<HashMap<Uuid, Arc<CircuitBreaker>>>,
}

impl BreakerRegistry {
    pub fn new(config: &Config) -> Self {
        Self {
            failure_threshold: config.breaker_failure_threshold,
            monitoring_period: config.breaker_monitoring_period,
            minimum_requests: config.breaker_minimum_requests,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    /// Fetch or create the breaker for an endpoint. The reset timeout is
    /// derived from the endpoint's cadence: three missed intervals.
    pub fn for_endpoint(&self, endpoint: &Endpoint) -> Arc<CircuitBreaker> {
        let mut breakers = self.breakers.lock().unwrap();
        breakers
            .entry(endpoint.id)
            .or_insert_with(|| {
                let config = BreakerConfig {
                    failure_threshold: self.failure_threshold,
                    reset_timeout: Duration::from_secs(3 * endpoint.check_interval as u64),
                    monitoring_period: self.monitoring_period,
                    minimum_requests: self.minimum_requests,
                };
                let name = endpoint.name.clone();
                Arc::new(CircuitBreaker::with_observer(
                    config,
                    Box::new(move |from, to| {
                        tracing::info!(
                            "Breaker: {} transitioned {} -> {}",
                            name,
                            from.as_str(),
                            to.as_str()
                        );
                    }),
                ))
            })
            .clone()
    }

    /// Drop the breaker for a deleted or reconfigured endpoint so the
    /// next probe rebuilds it with fresh settings.
    pub fn remove(&self, id: Uuid) {
        self.breakers.lock().unwrap().remove(&id);
    }
}
