//! Engine: composition root and inbound control surface.
//!
//! Wires the store, scheduler, live bus, and retention job together and
//! exposes the operations the (out-of-scope) REST layer calls. Nothing
//! starts until [`Engine::run`] is invoked.

use std::sync::Arc;

use uuid::Uuid;

use crate::breaker::BreakerRegistry;
use crate::bus::{BusError, LiveBus, NoticeKind};
use crate::config::Config;
use crate::db::{Endpoint, NewEndpoint, Store, StoreError, UptimeStatistics};
use crate::monitor::{stats, AgentRegistry, Prober, Scheduler};
use crate::retention::{RetentionJob, RetentionSummary};

pub struct Engine {
    store: Store,
    bus: Arc<LiveBus>,
    scheduler: Arc<Scheduler>,
    retention: Arc<RetentionJob>,
}

impl Engine {
    pub fn new(store: Store, config: &Config) -> Self {
        let bus = Arc::new(LiveBus::new(config));
        let breakers = Arc::new(BreakerRegistry::new(config));
        let agents = AgentRegistry::default();
        let prober = Arc::new(Prober::new(
            store.clone(),
            bus.clone(),
            breakers.clone(),
            agents.clone(),
        ));
        let scheduler = Arc::new(Scheduler::new(
            store.clone(),
            bus.clone(),
            prober,
            breakers,
            agents,
        ));
        let retention = Arc::new(RetentionJob::new(store.clone(), config));

        Self {
            store,
            bus,
            scheduler,
            retention,
        }
    }

    /// The live bus, for the transport layer to open sessions against.
    pub fn bus(&self) -> Arc<LiveBus> {
        self.bus.clone()
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Start all background work: probe loops, the retention timer, and
    /// the bus idle sweeper.
    pub async fn run(&self) -> Result<(), StoreError> {
        self.scheduler.start().await?;
        self.retention.start();
        self.bus.start_sweeper();
        Ok(())
    }

    pub async fn shutdown(&self) {
        self.scheduler.stop().await;
        self.retention.stop();
    }

    // --- Inbound controls ---

    pub async fn add_endpoint(&self, input: NewEndpoint) -> Result<Endpoint, StoreError> {
        let endpoint = self.store.create_endpoint(&input).await?;
        if endpoint.enabled {
            self.scheduler.restart_endpoint(endpoint.id).await?;
        }
        self.bus
            .publish_system(
                NoticeKind::Info,
                format!("Endpoint {} added", endpoint.name),
            )
            .await;
        Ok(endpoint)
    }

    pub async fn update_endpoint(
        &self,
        id: Uuid,
        input: NewEndpoint,
    ) -> Result<Endpoint, StoreError> {
        let endpoint = self.store.update_endpoint(id, &input).await?;
        self.scheduler.restart_endpoint(id).await?;
        Ok(endpoint)
    }

    /// Delete an endpoint: cancel its loop, drop its runtime state, then
    /// remove the row (checks cascade). Returns false for unknown ids.
    pub async fn delete_endpoint(&self, id: Uuid) -> Result<bool, StoreError> {
        let name = self
            .store
            .get_endpoint(id)
            .await?
            .map(|endpoint| endpoint.name);

        self.scheduler.drop_endpoint(id).await;
        let deleted = self.store.delete_endpoint(id).await?;
        if deleted {
            self.bus
                .publish_system(
                    NoticeKind::Info,
                    format!("Endpoint {} deleted", name.as_deref().unwrap_or("unknown")),
                )
                .await;
        }
        Ok(deleted)
    }

    /// Enable or disable probing. Returns false for unknown ids.
    pub async fn toggle_endpoint(&self, id: Uuid, enabled: bool) -> Result<bool, StoreError> {
        let changed = self.store.set_enabled(id, enabled).await?;
        if !changed {
            return Ok(false);
        }

        if enabled {
            self.scheduler.restart_endpoint(id).await?;
        } else {
            self.scheduler.drop_endpoint(id).await;
        }

        self.bus
            .publish_system(
                NoticeKind::Info,
                format!(
                    "Endpoint {} {}",
                    id,
                    if enabled { "enabled" } else { "disabled" }
                ),
            )
            .await;
        Ok(true)
    }

    pub async fn get_endpoint(&self, id: Uuid) -> Result<Option<Endpoint>, StoreError> {
        self.store.get_endpoint(id).await
    }

    pub async fn list_endpoints(&self) -> Result<Vec<Endpoint>, StoreError> {
        self.store.list_endpoints().await
    }

    pub async fn list_enabled_endpoints(&self) -> Result<Vec<Endpoint>, StoreError> {
        self.store.list_enabled_endpoints().await
    }

    /// Fresh rolling statistics for one endpoint, or `None` when it does
    /// not exist.
    pub async fn get_uptime_statistics(
        &self,
        id: Uuid,
    ) -> Result<Option<UptimeStatistics>, StoreError> {
        let failures = self.scheduler.consecutive_failures(id).await;
        stats::compute(&self.store, id, failures).await
    }

    /// Statistics for the whole fleet. Prefers what the probe loops last
    /// pushed; endpoints without a live loop are computed on demand. A
    /// failed read skips that endpoint and logs.
    pub async fn get_all_uptime_statuses(&self) -> Result<Vec<UptimeStatistics>, StoreError> {
        let endpoints = self.store.list_endpoints().await?;
        let mut all = Vec::with_capacity(endpoints.len());

        for endpoint in endpoints {
            if let Some(cached) = self.scheduler.cached_statistics(endpoint.id).await {
                all.push(cached);
                continue;
            }
            let failures = self.scheduler.consecutive_failures(endpoint.id).await;
            match stats::compute(&self.store, endpoint.id, failures).await {
                Ok(Some(statistics)) => all.push(statistics),
                Ok(None) => {}
                Err(e) => {
                    tracing::error!(
                        "Engine: failed to read statistics for {}: {}",
                        endpoint.name,
                        e
                    );
                }
            }
        }
        Ok(all)
    }

    /// Answer a subscriber's `requestFullUpdate` with a chunked
    /// snapshot. A failed snapshot read degrades to an empty one.
    pub async fn request_full_update(&self, session_id: Uuid) -> Result<(), BusError> {
        self.bus.touch(session_id).await;
        let snapshot = match self.get_all_uptime_statuses().await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                tracing::error!("Engine: full update snapshot failed: {}", e);
                Vec::new()
            }
        };
        self.bus.send_bulk(session_id, snapshot).await
    }

    /// Run one retention cycle on demand, through the same reentrancy
    /// guard as the timer.
    pub async fn trigger_retention(&self) -> Result<RetentionSummary, StoreError> {
        self.retention.run_once().await
    }
}
