//! Live event bus.
//!
//! An in-process publish/subscribe layer that fans probe results,
//! updated statistics, and operational notices out to dashboard
//! sessions. Sessions are transport-agnostic: the (out-of-scope) wire
//! layer opens a session, joins rooms on the subscriber's behalf,
//! forwards inbound activity via [`LiveBus::touch`], and drains
//! [`SessionHandle::events`].
//!
//! Delivery is best-effort, at-most-once, in-order per session. A slow
//! or dead subscriber never blocks or crashes a publisher.

mod events;

pub use events::*;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, RwLock};
use tokio::time::Instant;
use uuid::Uuid;

use crate::config::Config;
use crate::db::UptimeStatistics;

/// Room receiving fleet-wide events and operational notices.
pub const GLOBAL_ROOM: &str = "global";

/// Per-session outbound buffer. Events beyond this are dropped for that
/// session, not queued.
const SESSION_BUFFER: usize = 64;

/// Statistics per bulk-update chunk.
const BULK_CHUNK_SIZE: usize = 20;

/// Pause between bulk-update chunks.
const BULK_CHUNK_PAUSE: Duration = Duration::from_millis(100);

/// How often the idle sweeper runs.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Error, Debug, PartialEq, Eq)]
pub enum BusError {
    #[error("connection limit of {0} clients reached")]
    AtCapacity(usize),
    #[error("room limit of {0} rooms reached")]
    RoomLimit(usize),
    #[error("unknown session")]
    UnknownSession,
}

/// The name of an endpoint-specific room.
pub fn endpoint_room(id: Uuid) -> String {
    format!("endpoint:{id}")
}

struct Session {
    tx: mpsc::Sender<BusEvent>,
    rooms: HashSet<String>,
    last_seen: Instant,
}

/// A connected subscriber as seen by the transport layer.
pub struct SessionHandle {
    pub id: Uuid,
    pub events: mpsc::Receiver<BusEvent>,
}

/// The bus itself. Shared via `Arc`.
pub struct LiveBus {
    max_clients: usize,
    max_rooms_per_client: usize,
    client_timeout: Duration,
    sessions: RwLock<HashMap<Uuid, Session>>,
}

impl LiveBus {
    pub fn new(config: &Config) -> Self {
        Self {
            max_clients: config.max_clients,
            max_rooms_per_client: config.max_rooms_per_client,
            client_timeout: config.client_timeout,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Open a session. Rejected before establishment once the client cap
    /// is reached. New sessions start in the global room.
    pub async fn connect(&self) -> Result<SessionHandle, BusError> {
        let mut sessions = self.sessions.write().await;
        if sessions.len() >= self.max_clients {
            return Err(BusError::AtCapacity(self.max_clients));
        }

        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(SESSION_BUFFER);
        sessions.insert(
            id,
            Session {
                tx,
                rooms: HashSet::from([GLOBAL_ROOM.to_string()]),
                last_seen: Instant::now(),
            },
        );

        tracing::debug!(
            "LiveBus: session {} connected ({} active)",
            id,
            sessions.len()
        );
        Ok(SessionHandle { id, events: rx })
    }

    /// Close a session and drop its room memberships.
    pub async fn disconnect(&self, id: Uuid) {
        if self.sessions.write().await.remove(&id).is_some() {
            tracing::debug!("LiveBus: session {} disconnected", id);
        }
    }

    /// Record inbound activity so the idle sweeper spares this session.
    pub async fn touch(&self, id: Uuid) {
        if let Some(session) = self.sessions.write().await.get_mut(&id) {
            session.last_seen = Instant::now();
        }
    }

    /// Join a room. The global membership from `connect` is free;
    /// endpoint rooms count against the per-session cap, and an excess
    /// join is refused with an error notice to that session.
    pub async fn subscribe(&self, id: Uuid, room: &str) -> Result<(), BusError> {
        let mut sessions = self.sessions.write().await;
        let session = sessions.get_mut(&id).ok_or(BusError::UnknownSession)?;
        session.last_seen = Instant::now();

        if session.rooms.contains(room) {
            return Ok(());
        }
        if room == GLOBAL_ROOM {
            session.rooms.insert(GLOBAL_ROOM.to_string());
            return Ok(());
        }

        // The global membership does not count against the cap.
        let endpoint_rooms = session.rooms.iter().filter(|r| *r != GLOBAL_ROOM).count();
        if endpoint_rooms >= self.max_rooms_per_client {
            let notice = BusEvent::SystemStatus(SystemNotice {
                message: format!("Room limit of {} reached", self.max_rooms_per_client),
                kind: NoticeKind::Error,
            });
            let _ = session.tx.try_send(notice);
            return Err(BusError::RoomLimit(self.max_rooms_per_client));
        }

        session.rooms.insert(room.to_string());
        Ok(())
    }

    /// Leave a room.
    pub async fn unsubscribe(&self, id: Uuid, room: &str) -> Result<(), BusError> {
        let mut sessions = self.sessions.write().await;
        let session = sessions.get_mut(&id).ok_or(BusError::UnknownSession)?;
        session.last_seen = Instant::now();
        session.rooms.remove(room);
        Ok(())
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Publish a raw check to `global` and the endpoint's room.
    pub async fn publish_check(&self, endpoint_id: Uuid, check: CheckBroadcast) {
        let rooms = [GLOBAL_ROOM.to_string(), endpoint_room(endpoint_id)];
        self.fan_out(&rooms, BusEvent::NewCheck(check)).await;
    }

    /// Publish updated statistics to `global` and the endpoint's room.
    pub async fn publish_stats(&self, endpoint_id: Uuid, stats: UptimeStatistics) {
        let rooms = [GLOBAL_ROOM.to_string(), endpoint_room(endpoint_id)];
        self.fan_out(&rooms, BusEvent::UptimeUpdate(stats)).await;
    }

    /// Publish an operational notice to `global` only.
    pub async fn publish_system(&self, kind: NoticeKind, message: impl Into<String>) {
        let message = message.into();
        match kind {
            NoticeKind::Error => tracing::error!("LiveBus: {}", message),
            NoticeKind::Warning => tracing::warn!("LiveBus: {}", message),
            NoticeKind::Info => tracing::info!("LiveBus: {}", message),
        }
        let rooms = [GLOBAL_ROOM.to_string()];
        self.fan_out(&rooms, BusEvent::SystemStatus(SystemNotice { message, kind }))
            .await;
    }

    /// Answer a `requestFullUpdate`: stream the snapshot to one session
    /// in chunks of 20 with a pause between chunks, preserving order.
    pub async fn send_bulk(&self, id: Uuid, stats: Vec<UptimeStatistics>) -> Result<(), BusError> {
        let tx = {
            let mut sessions = self.sessions.write().await;
            let session = sessions.get_mut(&id).ok_or(BusError::UnknownSession)?;
            session.last_seen = Instant::now();
            session.tx.clone()
        };

        tokio::spawn(async move {
            let mut chunks = stats.chunks(BULK_CHUNK_SIZE).peekable();
            while let Some(chunk) = chunks.next() {
                if tx.send(BusEvent::BulkUpdate(chunk.to_vec())).await.is_err() {
                    tracing::debug!("LiveBus: session {} vanished mid bulk update", id);
                    return;
                }
                if chunks.peek().is_some() {
                    tokio::time::sleep(BULK_CHUNK_PAUSE).await;
                }
            }
        });

        Ok(())
    }

    /// Every-minute sweeper that disconnects sessions idle past the
    /// client timeout. Stops once the bus is dropped.
    pub fn start_sweeper(self: &Arc<Self>) {
        let bus = Arc::downgrade(self);

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(SWEEP_INTERVAL);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                interval.tick().await;
                let Some(bus) = bus.upgrade() else { break };
                bus.sweep_idle().await;
            }
        });
    }

    /// One sweep pass; also exposed for tests.
    pub async fn sweep_idle(&self) {
        let timeout = self.client_timeout;
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        sessions.retain(|_, session| session.last_seen.elapsed() <= timeout);
        let evicted = before - sessions.len();
        if evicted > 0 {
            tracing::info!("LiveBus: evicted {} idle session(s)", evicted);
        }
    }

    /// Deliver one copy to every session that is in any of `rooms`.
    /// Failed sends are logged and dropped for that session only; closed
    /// sessions are reaped afterwards.
    async fn fan_out(&self, rooms: &[String], event: BusEvent) {
        let mut dead = Vec::new();
        {
            let sessions = self.sessions.read().await;
            for (id, session) in sessions.iter() {
                if !rooms.iter().any(|room| session.rooms.contains(room)) {
                    continue;
                }
                match session.tx.try_send(event.clone()) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        tracing::warn!("LiveBus: dropping event for slow session {}", id);
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        dead.push(*id);
                    }
                }
            }
        }

        if !dead.is_empty() {
            let mut sessions = self.sessions.write().await;
            for id in dead {
                sessions.remove(&id);
            }
        }
    }
}
