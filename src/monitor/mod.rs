//! Monitoring engine: scheduler and prober.
//!
//! The scheduler owns one probe loop per enabled endpoint. All
//! per-endpoint runtime state (stop channel, consecutive-failure
//! counter, last statistics) lives in a single agent record so that
//! reconfiguration can never leave the pieces disagreeing.

mod prober;
pub mod stats;

pub use prober::{check_endpoint, ProbeError, ProbeFailure, Prober, ProbeSuccess, PROBE_USER_AGENT};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use crate::breaker::BreakerRegistry;
use crate::bus::{LiveBus, NoticeKind};
use crate::db::{Endpoint, Store, StoreError, UptimeStatistics};

/// Runtime state for one monitored endpoint.
struct EndpointAgent {
    stop: broadcast::Sender<()>,
    consecutive_failures: u32,
    last_statistics: Option<UptimeStatistics>,
}

/// Shared map of endpoint id to agent. The statistics cache is bounded
/// by construction: an entry exists only while a probe loop does.
#[derive(Clone, Default)]
pub struct AgentRegistry {
    inner: Arc<RwLock<HashMap<Uuid, EndpointAgent>>>,
}

impl AgentRegistry {
    /// Create the agent for an endpoint and hand back its stop signal.
    /// Returns `None` when a loop is already registered, which is the
    /// duplicate-loop guard for concurrent `start` calls.
    pub async fn register(&self, id: Uuid) -> Option<broadcast::Receiver<()>> {
        let mut agents = self.inner.write().await;
        if agents.contains_key(&id) {
            return None;
        }

        let (stop, stop_rx) = broadcast::channel(1);
        agents.insert(
            id,
            EndpointAgent {
                stop,
                consecutive_failures: 0,
                last_statistics: None,
            },
        );
        Some(stop_rx)
    }

    /// Cancel the loop and drop all agent state. Returns whether an
    /// agent existed.
    pub async fn cancel(&self, id: Uuid) -> bool {
        match self.inner.write().await.remove(&id) {
            Some(agent) => {
                let _ = agent.stop.send(());
                true
            }
            None => false,
        }
    }

    pub async fn cancel_all(&self) {
        let mut agents = self.inner.write().await;
        for (_, agent) in agents.drain() {
            let _ = agent.stop.send(());
        }
    }

    /// Zero the failure counter, returning the prior value.
    pub(crate) async fn reset_failures(&self, id: Uuid) -> u32 {
        match self.inner.write().await.get_mut(&id) {
            Some(agent) => std::mem::take(&mut agent.consecutive_failures),
            None => 0,
        }
    }

    /// Increment the failure counter, returning the new value.
    pub(crate) async fn bump_failures(&self, id: Uuid) -> u32 {
        match self.inner.write().await.get_mut(&id) {
            Some(agent) => {
                agent.consecutive_failures += 1;
                agent.consecutive_failures
            }
            None => 0,
        }
    }

    pub async fn failures(&self, id: Uuid) -> u32 {
        self.inner
            .read()
            .await
            .get(&id)
            .map(|agent| agent.consecutive_failures)
            .unwrap_or(0)
    }

    pub(crate) async fn cache_stats(&self, id: Uuid, statistics: UptimeStatistics) {
        if let Some(agent) = self.inner.write().await.get_mut(&id) {
            agent.last_statistics = Some(statistics);
        }
    }

    pub(crate) async fn cached_stats(&self, id: Uuid) -> Option<UptimeStatistics> {
        self.inner
            .read()
            .await
            .get(&id)
            .and_then(|agent| agent.last_statistics.clone())
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }
}

/// The scheduler: one probe loop per enabled endpoint, reacting to
/// operator mutations through `restart_endpoint` and `drop_endpoint`.
pub struct Scheduler {
    store: Store,
    bus: Arc<LiveBus>,
    prober: Arc<Prober>,
    breakers: Arc<BreakerRegistry>,
    agents: AgentRegistry,
}

impl Scheduler {
    pub fn new(
        store: Store,
        bus: Arc<LiveBus>,
        prober: Arc<Prober>,
        breakers: Arc<BreakerRegistry>,
        agents: AgentRegistry,
    ) -> Self {
        Self {
            store,
            bus,
            prober,
            breakers,
            agents,
        }
    }

    /// Start monitoring every enabled endpoint. Idempotent: existing
    /// loops are torn down first.
    pub async fn start(&self) -> Result<(), StoreError> {
        self.agents.cancel_all().await;

        let endpoints = self.store.list_enabled_endpoints().await?;
        if endpoints.is_empty() {
            tracing::warn!("Scheduler: no enabled endpoints to monitor");
            self.bus
                .publish_system(NoticeKind::Warning, "No enabled endpoints to monitor")
                .await;
            return Ok(());
        }

        let count = endpoints.len();
        for endpoint in endpoints {
            self.spawn_loop(endpoint).await;
        }

        tracing::info!("Scheduler: monitoring {} endpoints", count);
        self.bus
            .publish_system(
                NoticeKind::Info,
                format!("Monitoring started for {count} endpoints"),
            )
            .await;
        Ok(())
    }

    /// Cancel every loop and clear all per-endpoint runtime state.
    pub async fn stop(&self) {
        self.agents.cancel_all().await;
        tracing::info!("Scheduler: stopped");
        self.bus
            .publish_system(NoticeKind::Info, "Monitoring engine stopped")
            .await;
    }

    /// Reload one endpoint: cancel its loop, then start a fresh one when
    /// it still exists and is enabled. The breaker is rebuilt so new
    /// cadence settings take effect.
    pub async fn restart_endpoint(&self, id: Uuid) -> Result<(), StoreError> {
        self.agents.cancel(id).await;
        self.breakers.remove(id);

        if let Some(endpoint) = self.store.get_endpoint(id).await? {
            if endpoint.enabled {
                self.spawn_loop(endpoint).await;
            }
        }
        Ok(())
    }

    /// Deletion path: cancel the loop and drop the agent and breaker.
    /// No reload is attempted.
    pub async fn drop_endpoint(&self, id: Uuid) {
        if self.agents.cancel(id).await {
            tracing::info!("Scheduler: dropped endpoint {}", id);
        }
        self.breakers.remove(id);
    }

    /// Number of live probe loops.
    pub async fn active_loops(&self) -> usize {
        self.agents.len().await
    }

    pub async fn consecutive_failures(&self, id: Uuid) -> u32 {
        self.agents.failures(id).await
    }

    /// Last statistics pushed for an endpoint, if its loop is alive.
    pub async fn cached_statistics(&self, id: Uuid) -> Option<UptimeStatistics> {
        self.agents.cached_stats(id).await
    }

    async fn spawn_loop(&self, endpoint: Endpoint) {
        let Some(stop_rx) = self.agents.register(endpoint.id).await else {
            return;
        };

        tracing::info!(
            "Scheduler: monitoring {} every {}s",
            endpoint.name,
            endpoint.check_interval
        );

        let prober = self.prober.clone();
        tokio::spawn(run_probe_loop(endpoint, prober, stop_rx));
    }
}

/// The per-endpoint loop: one probe immediately, then one per interval.
/// The probe runs inline so probes for one endpoint can never overlap;
/// ticks that fire while a probe is still in flight are skipped.
async fn run_probe_loop(
    endpoint: Endpoint,
    prober: Arc<Prober>,
    mut stop_rx: broadcast::Receiver<()>,
) {
    let mut interval =
        tokio::time::interval(Duration::from_secs(endpoint.check_interval.max(1) as u64));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = stop_rx.recv() => {
                tracing::debug!("Scheduler: loop for {} cancelled", endpoint.name);
                break;
            }
            _ = interval.tick() => {
                prober.run(&endpoint).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_register_guards_against_duplicates() {
        let agents = AgentRegistry::default();
        let id = Uuid::new_v4();

        assert!(agents.register(id).await.is_some());
        assert!(agents.register(id).await.is_none());

        assert!(agents.cancel(id).await);
        assert!(agents.register(id).await.is_some());
    }

    #[tokio::test]
    async fn test_failure_counter_bookkeeping() {
        let agents = AgentRegistry::default();
        let id = Uuid::new_v4();
        let _rx = agents.register(id).await.unwrap();

        assert_eq!(agents.bump_failures(id).await, 1);
        assert_eq!(agents.bump_failures(id).await, 2);
        assert_eq!(agents.failures(id).await, 2);

        // Reset reports the prior streak and zeroes the counter.
        assert_eq!(agents.reset_failures(id).await, 2);
        assert_eq!(agents.failures(id).await, 0);
    }

    #[tokio::test]
    async fn test_counters_ignore_unknown_endpoints() {
        let agents = AgentRegistry::default();
        let id = Uuid::new_v4();

        assert_eq!(agents.bump_failures(id).await, 0);
        assert_eq!(agents.reset_failures(id).await, 0);
        assert_eq!(agents.failures(id).await, 0);
    }

    #[tokio::test]
    async fn test_cancel_drops_cached_statistics() {
        let agents = AgentRegistry::default();
        let id = Uuid::new_v4();
        let _rx = agents.register(id).await.unwrap();

        let statistics = UptimeStatistics {
            endpoint_id: id,
            endpoint_name: "api".to_string(),
            uptime_percentage: 100.0,
            avg_response_time: 5.0,
            total_checks: 1,
            successful_checks: 1,
            failed_checks: 0,
            last_check: None,
            current_status: crate::db::CheckStatus::Up,
            recent_checks: Vec::new(),
            consecutive_failures: 0,
        };
        agents.cache_stats(id, statistics).await;
        assert!(agents.cached_stats(id).await.is_some());

        agents.cancel(id).await;
        assert!(agents.cached_stats(id).await.is_none());
    }

    #[tokio::test]
    async fn test_stop_signal_reaches_loop_holder() {
        let agents = AgentRegistry::default();
        let id = Uuid::new_v4();
        let mut rx = agents.register(id).await.unwrap();

        agents.cancel(id).await;
        assert!(rx.recv().await.is_ok());
    }
}
