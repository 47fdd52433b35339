//! Room-partitioned realtime broadcast hub.
//!
//! Owns every live client connection and the mapping from room name to
//! member set. An instance is passed by reference to whatever accepts
//! transport connections; there is no process-wide registry. Each
//! connection gets a bounded delivery channel whose receiver the transport
//! layer drains; a connection that cannot keep up is skipped per-send, not
//! retried.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use parking_lot::RwLock;
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::mpsc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{PipelineError, Result};
use crate::models::{rooms, WireEvent};

pub type ConnectionId = Uuid;

/// Connection lifecycle: `Disconnected` is terminal and clears all room
/// memberships.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Disconnected,
}

/// Lightweight reference to a registered connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionHandle {
    id: ConnectionId,
}

impl ConnectionHandle {
    pub fn id(&self) -> ConnectionId {
        self.id
    }
}

struct Connection {
    id: ConnectionId,
    user_id: Option<Uuid>,
    tx: mpsc::Sender<WireEvent>,
    status: RwLock<ConnectionStatus>,
    #[allow(dead_code)]
    connected_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Per-connection delivery buffer; a full buffer marks the client slow.
    pub channel_capacity: usize,
    /// Per-send patience before a slow connection is skipped.
    pub send_timeout: Duration,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 64,
            send_timeout: Duration::from_millis(250),
        }
    }
}

/// Result of one broadcast fan-out. Delivery is at-most-once; skipped
/// connections are expected and never retried.
#[derive(Debug, Clone, Copy, Default)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub skipped: usize,
}

pub struct RealtimeHub {
    config: HubConfig,
    connections: RwLock<FxHashMap<ConnectionId, Arc<Connection>>>,
    rooms: RwLock<FxHashMap<String, FxHashSet<ConnectionId>>>,
}

impl RealtimeHub {
    pub fn new(config: HubConfig) -> Self {
        Self {
            config,
            connections: RwLock::new(FxHashMap::default()),
            rooms: RwLock::new(FxHashMap::default()),
        }
    }

    /// Register a connection for `user_id` (None for anonymous browsing).
    /// The returned receiver is drained by the transport session; dropping
    /// it makes every subsequent send fail, which broadcast treats as a
    /// skip.
    pub fn connect(&self, user_id: Option<Uuid>) -> (ConnectionHandle, mpsc::Receiver<WireEvent>) {
        let (tx, rx) = mpsc::channel(self.config.channel_capacity.max(1));
        let connection = Arc::new(Connection {
            id: Uuid::new_v4(),
            user_id,
            tx,
            status: RwLock::new(ConnectionStatus::Connecting),
            connected_at: Utc::now(),
        });

        let id = connection.id;
        self.connections.write().insert(id, connection.clone());
        *connection.status.write() = ConnectionStatus::Connected;

        info!("connection {} registered (user={:?})", id, user_id);
        (ConnectionHandle { id }, rx)
    }

    /// Join a room. User rooms are only joinable by their owner; global
    /// rooms accept any connected identity. Idempotent.
    pub fn join(&self, handle: ConnectionHandle, room: &str) -> Result<()> {
        let connection = self.live_connection(handle)?;

        if let Some(owner) = room.strip_prefix(rooms::USER_PREFIX) {
            let owner: Uuid = owner
                .parse()
                .map_err(|_| PipelineError::Forbidden(format!("malformed user room: {room}")))?;
            if connection.user_id != Some(owner) {
                return Err(PipelineError::Forbidden(format!(
                    "connection {} may not join {room}",
                    connection.id
                )));
            }
        }

        self.rooms
            .write()
            .entry(room.to_string())
            .or_default()
            .insert(connection.id);
        debug!("connection {} joined {}", connection.id, room);
        Ok(())
    }

    /// Leave a room. No-op when not a member.
    pub fn leave(&self, handle: ConnectionHandle, room: &str) -> Result<()> {
        let connection = self.live_connection(handle)?;

        let mut rooms = self.rooms.write();
        if let Some(members) = rooms.get_mut(room) {
            members.remove(&connection.id);
            if members.is_empty() {
                rooms.remove(room);
            }
        }
        debug!("connection {} left {}", connection.id, room);
        Ok(())
    }

    /// Deliver `event` to every connection currently joined to `room`.
    /// Fan-out is per-connection and parallel; a slow or closed connection
    /// is skipped after the configured per-send timeout and never blocks
    /// its siblings.
    pub async fn broadcast(&self, room: &str, event: &WireEvent) -> BroadcastReport {
        let members: Vec<Arc<Connection>> = {
            let rooms = self.rooms.read();
            match rooms.get(room) {
                Some(ids) => {
                    let connections = self.connections.read();
                    ids.iter()
                        .filter_map(|id| connections.get(id).cloned())
                        .collect()
                }
                None => Vec::new(),
            }
        };

        if members.is_empty() {
            return BroadcastReport::default();
        }

        let send_timeout = self.config.send_timeout;
        let sends = members.into_iter().map(|connection| {
            let event = event.clone();
            async move {
                if *connection.status.read() != ConnectionStatus::Connected {
                    return false;
                }
                match tokio::time::timeout(send_timeout, connection.tx.send(event)).await {
                    Ok(Ok(())) => true,
                    Ok(Err(_)) => {
                        debug!("connection {} closed mid-broadcast", connection.id);
                        false
                    }
                    Err(_) => {
                        debug!("connection {} too slow, skipping", connection.id);
                        false
                    }
                }
            }
        });

        let results = join_all(sends).await;
        let delivered = results.iter().filter(|sent| **sent).count();
        BroadcastReport {
            delivered,
            skipped: results.len() - delivered,
        }
    }

    /// Remove the connection from every room atomically and release it.
    /// Idempotent.
    pub fn disconnect(&self, handle: ConnectionHandle) {
        let connection = self.connections.write().remove(&handle.id);
        let Some(connection) = connection else {
            return;
        };

        *connection.status.write() = ConnectionStatus::Disconnected;
        {
            // One write lock over all rooms so no broadcast can observe a
            // half-removed membership.
            let mut rooms = self.rooms.write();
            rooms.retain(|_, members| {
                members.remove(&connection.id);
                !members.is_empty()
            });
        }
        info!("connection {} disconnected", connection.id);
    }

    pub fn is_connected(&self, handle: ConnectionHandle) -> bool {
        self.connections
            .read()
            .get(&handle.id)
            .map(|c| *c.status.read() == ConnectionStatus::Connected)
            .unwrap_or(false)
    }

    pub fn connection_count(&self) -> usize {
        self.connections.read().len()
    }

    pub fn room_size(&self, room: &str) -> usize {
        self.rooms.read().get(room).map(|m| m.len()).unwrap_or(0)
    }

    fn live_connection(&self, handle: ConnectionHandle) -> Result<Arc<Connection>> {
        self.connections
            .read()
            .get(&handle.id)
            .cloned()
            .ok_or_else(|| PipelineError::NotFound(format!("connection {}", handle.id)))
    }
}

impl Default for RealtimeHub {
    fn default() -> Self {
        Self::new(HubConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::NotificationKind;

    fn event() -> WireEvent {
        WireEvent {
            event_type: NotificationKind::NewListing,
            data: serde_json::json!({"listingId": "l-1"}),
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_join_broadcast_leave() {
        let hub = RealtimeHub::default();
        let (handle, mut rx) = hub.connect(None);

        hub.join(handle, rooms::MARKETPLACE).unwrap();
        let report = hub.broadcast(rooms::MARKETPLACE, &event()).await;
        assert_eq!(report.delivered, 1);
        assert!(rx.try_recv().is_ok());

        hub.leave(handle, rooms::MARKETPLACE).unwrap();
        let report = hub.broadcast(rooms::MARKETPLACE, &event()).await;
        assert_eq!(report.delivered, 0);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_broadcast_reaches_only_joined_connections() {
        let hub = RealtimeHub::default();
        let (a, mut rx_a) = hub.connect(None);
        let (b, mut rx_b) = hub.connect(None);
        let (_c, mut rx_c) = hub.connect(None);

        hub.join(a, rooms::MARKETPLACE).unwrap();
        hub.join(b, rooms::MARKETPLACE).unwrap();

        let report = hub.broadcast(rooms::MARKETPLACE, &event()).await;
        assert_eq!(report.delivered, 2);
        assert!(rx_a.try_recv().is_ok());
        assert!(rx_b.try_recv().is_ok());
        assert!(rx_c.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_join_is_idempotent() {
        let hub = RealtimeHub::default();
        let (handle, mut rx) = hub.connect(None);

        hub.join(handle, rooms::MARKETPLACE).unwrap();
        hub.join(handle, rooms::MARKETPLACE).unwrap();
        assert_eq!(hub.room_size(rooms::MARKETPLACE), 1);

        hub.broadcast(rooms::MARKETPLACE, &event()).await;
        assert!(rx.try_recv().is_ok());
        // Membership is a set, so a double join never double-delivers.
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_user_room_authorization() {
        let hub = RealtimeHub::default();
        let owner = Uuid::new_v4();
        let (own, _rx_own) = hub.connect(Some(owner));
        let (other, _rx_other) = hub.connect(Some(Uuid::new_v4()));
        let (anon, _rx_anon) = hub.connect(None);

        let room = rooms::user(owner);
        hub.join(own, &room).unwrap();
        assert!(matches!(
            hub.join(other, &room),
            Err(PipelineError::Forbidden(_))
        ));
        assert!(matches!(
            hub.join(anon, &room),
            Err(PipelineError::Forbidden(_))
        ));
        assert!(matches!(
            hub.join(anon, "user:not-a-uuid"),
            Err(PipelineError::Forbidden(_))
        ));

        // Global rooms accept anyone.
        hub.join(anon, rooms::MARKETPLACE).unwrap();
    }

    #[tokio::test]
    async fn test_disconnect_clears_all_memberships() {
        let hub = RealtimeHub::default();
        let user = Uuid::new_v4();
        let (handle, _rx) = hub.connect(Some(user));

        hub.join(handle, rooms::MARKETPLACE).unwrap();
        hub.join(handle, &rooms::user(user)).unwrap();
        assert!(hub.is_connected(handle));

        hub.disconnect(handle);
        assert!(!hub.is_connected(handle));
        assert_eq!(hub.room_size(rooms::MARKETPLACE), 0);
        assert_eq!(hub.room_size(&rooms::user(user)), 0);
        assert_eq!(hub.connection_count(), 0);

        // Further membership calls fail cleanly; disconnect stays idempotent.
        assert!(matches!(
            hub.join(handle, rooms::MARKETPLACE),
            Err(PipelineError::NotFound(_))
        ));
        hub.disconnect(handle);
    }

    #[tokio::test]
    async fn test_slow_connection_does_not_block_siblings() {
        let hub = RealtimeHub::new(HubConfig {
            channel_capacity: 1,
            send_timeout: Duration::from_millis(50),
        });
        let (slow, _rx_slow) = hub.connect(None);
        let (fast, mut rx_fast) = hub.connect(None);

        hub.join(slow, rooms::MARKETPLACE).unwrap();
        hub.join(fast, rooms::MARKETPLACE).unwrap();

        // Fill the slow connection's buffer; it never drains.
        hub.broadcast(rooms::MARKETPLACE, &event()).await;
        let _ = rx_fast.try_recv();

        let started = std::time::Instant::now();
        let report = hub.broadcast(rooms::MARKETPLACE, &event()).await;
        assert_eq!(report.delivered, 1);
        assert_eq!(report.skipped, 1);
        assert!(started.elapsed() < Duration::from_millis(500));
        assert!(rx_fast.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_dropped_receiver_counts_as_skip() {
        let hub = RealtimeHub::default();
        let (gone, rx) = hub.connect(None);
        hub.join(gone, rooms::MARKETPLACE).unwrap();
        drop(rx);

        let report = hub.broadcast(rooms::MARKETPLACE, &event()).await;
        assert_eq!(report.delivered, 0);
        assert_eq!(report.skipped, 1);
    }
}
