//! Notification Fan-out.
//!
//! Routes typed events to live driver connections by topic. Every connection
//! owns a bounded mpsc queue; publishing uses `try_send`, so a slow or gone
//! subscriber loses the event instead of stalling the publisher. There is no
//! replay: a client that reconnects re-reads state over HTTP.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use blk_schemas::{
    BlockId, ClaimId, DriverId, Envelope, Event, EventSink, GeoLocation, Topic,
};
use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::debug;
use uuid::Uuid;

pub type ConnId = Uuid;

pub const DEFAULT_SUBSCRIBER_BUFFER: usize = 256;

/// Receiving half of one connection.
#[derive(Debug)]
pub struct Subscription {
    pub conn_id: ConnId,
    pub driver_id: DriverId,
    pub rx: mpsc::Receiver<Envelope>,
}

#[derive(Debug)]
struct Connection {
    driver_id: DriverId,
    tx: mpsc::Sender<Envelope>,
    topics: HashSet<Topic>,
}

#[derive(Debug)]
pub struct Fanout {
    buffer: usize,
    connections: DashMap<ConnId, Connection>,
    by_driver: DashMap<DriverId, HashSet<ConnId>>,
    by_topic: DashMap<Topic, HashSet<ConnId>>,
    dropped: AtomicU64,
}

impl Default for Fanout {
    fn default() -> Self {
        Self::new(DEFAULT_SUBSCRIBER_BUFFER)
    }
}

impl Fanout {
    pub fn new(buffer: usize) -> Self {
        Self {
            buffer: buffer.max(1),
            connections: DashMap::new(),
            by_driver: DashMap::new(),
            by_topic: DashMap::new(),
            dropped: AtomicU64::new(0),
        }
    }

    /// Register a connection for `driver_id`, subscribed to the global
    /// available-blocks feed and the driver's personal and schedule topics.
    pub fn connect(&self, driver_id: DriverId) -> Subscription {
        let (tx, rx) = mpsc::channel(self.buffer);
        let conn_id = Uuid::new_v4();
        let topics: HashSet<Topic> = [
            Topic::AvailableBlocks,
            Topic::Personal(driver_id),
            Topic::Schedule(driver_id),
        ]
        .into_iter()
        .collect();

        // Connection first: `publish` prunes topic members it cannot find.
        self.connections.insert(
            conn_id,
            Connection {
                driver_id,
                tx,
                topics: topics.clone(),
            },
        );
        self.by_driver.entry(driver_id).or_default().insert(conn_id);
        for t in topics {
            self.by_topic.entry(t).or_default().insert(conn_id);
        }

        debug!(conn_id = %conn_id, driver_id = %driver_id, "connection registered");
        Subscription {
            conn_id,
            driver_id,
            rx,
        }
    }

    /// Drop the connection and every topic membership it had. Returns false
    /// if it was already gone.
    pub fn disconnect(&self, conn_id: ConnId) -> bool {
        let Some((_, conn)) = self.connections.remove(&conn_id) else {
            return false;
        };
        for t in &conn.topics {
            self.leave_topic(*t, conn_id);
        }
        if let Some(mut set) = self.by_driver.get_mut(&conn.driver_id) {
            set.remove(&conn_id);
        }
        self.by_driver.remove_if(&conn.driver_id, |_, set| set.is_empty());

        debug!(conn_id = %conn_id, driver_id = %conn.driver_id, "connection removed");
        true
    }

    /// Subscribe the connection to location updates for `block_id`.
    ///
    /// The topic index is updated while the connection entry is held, so a
    /// concurrent `disconnect` sees the new topic and removes it.
    pub fn track(&self, conn_id: ConnId, block_id: BlockId) -> bool {
        let topic = Topic::Tracking(block_id);
        let Some(mut conn) = self.connections.get_mut(&conn_id) else {
            return false;
        };
        conn.topics.insert(topic);
        self.by_topic.entry(topic).or_default().insert(conn_id);
        true
    }

    pub fn untrack(&self, conn_id: ConnId, block_id: BlockId) -> bool {
        let topic = Topic::Tracking(block_id);
        let Some(mut conn) = self.connections.get_mut(&conn_id) else {
            return false;
        };
        if conn.topics.remove(&topic) {
            self.leave_topic(topic, conn_id);
        }
        true
    }

    /// Hand `event` to every connection on `topic`, at most once each.
    /// Returns how many queues accepted it.
    pub fn publish(&self, topic: Topic, event: Event) -> usize {
        let targets: Vec<ConnId> = match self.by_topic.get(&topic) {
            Some(set) => set.iter().copied().collect(),
            None => return 0,
        };

        let mut delivered = 0;
        let mut closed = Vec::new();
        let mut orphaned = Vec::new();
        for conn_id in targets {
            let Some(conn) = self.connections.get(&conn_id) else {
                orphaned.push(conn_id);
                continue;
            };
            let env = Envelope {
                topic,
                event: event.clone(),
            };
            match conn.tx.try_send(env) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    debug!(conn_id = %conn_id, topic = %topic, "subscriber queue full; event dropped");
                }
                Err(TrySendError::Closed(_)) => closed.push(conn_id),
            }
        }

        for conn_id in closed {
            self.disconnect(conn_id);
        }
        for conn_id in orphaned {
            self.leave_topic(topic, conn_id);
        }
        debug!(topic = %topic, event = event.name(), delivered, "published");
        delivered
    }

    /// Forward a driver's position to everyone tracking `block_id`.
    /// `None` when `conn_id` is not a live connection.
    pub fn relay_location(
        &self,
        conn_id: ConnId,
        claim_id: ClaimId,
        block_id: BlockId,
        location: GeoLocation,
    ) -> Option<usize> {
        let driver_id = self.connections.get(&conn_id)?.driver_id;
        Some(self.publish(
            Topic::Tracking(block_id),
            Event::DriverLocation {
                driver_id,
                claim_id,
                block_id,
                location,
            },
        ))
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn driver_connection_count(&self, driver_id: DriverId) -> usize {
        self.by_driver.get(&driver_id).map_or(0, |s| s.len())
    }

    pub fn subscriber_count(&self, topic: Topic) -> usize {
        self.by_topic.get(&topic).map_or(0, |s| s.len())
    }

    /// Events lost to full queues since start.
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn leave_topic(&self, topic: Topic, conn_id: ConnId) {
        if let Some(mut set) = self.by_topic.get_mut(&topic) {
            set.remove(&conn_id);
        }
        self.by_topic.remove_if(&topic, |_, set| set.is_empty());
    }
}

/// Unregisters a connection when dropped, however its session ends.
#[derive(Debug)]
pub struct ConnectionGuard {
    fanout: Arc<Fanout>,
    conn_id: ConnId,
}

impl ConnectionGuard {
    pub fn new(fanout: Arc<Fanout>, conn_id: ConnId) -> Self {
        Self { fanout, conn_id }
    }

    pub fn conn_id(&self) -> ConnId {
        self.conn_id
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.fanout.disconnect(self.conn_id);
    }
}

impl EventSink for Fanout {
    fn publish(&self, topic: Topic, event: Event) -> usize {
        Fanout::publish(self, topic, event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_joins_default_topics() {
        let f = Fanout::new(4);
        let sub = f.connect(DriverId(7));
        assert_eq!(f.subscriber_count(Topic::AvailableBlocks), 1);
        assert_eq!(f.subscriber_count(Topic::Personal(DriverId(7))), 1);
        assert_eq!(f.subscriber_count(Topic::Schedule(DriverId(7))), 1);
        assert_eq!(f.subscriber_count(Topic::Schedule(DriverId(8))), 0);
        assert_eq!(f.driver_connection_count(DriverId(7)), 1);

        assert!(f.disconnect(sub.conn_id));
        assert!(!f.disconnect(sub.conn_id));
        assert_eq!(f.subscriber_count(Topic::AvailableBlocks), 0);
        assert_eq!(f.driver_connection_count(DriverId(7)), 0);
    }

    #[test]
    fn publish_prunes_members_without_a_connection() {
        let f = Fanout::new(4);
        let ghost = Uuid::new_v4();
        let topic = Topic::Tracking(BlockId(3));
        f.by_topic.entry(topic).or_default().insert(ghost);
        assert_eq!(f.subscriber_count(topic), 1);

        let delivered = f.publish(topic, Event::BlockReleased { block_id: BlockId(3) });
        assert_eq!(delivered, 0);
        assert_eq!(f.subscriber_count(topic), 0);
    }

    #[test]
    fn disconnect_after_track_leaves_no_tracking_member() {
        let f = Fanout::new(4);
        let sub = f.connect(DriverId(7));
        assert!(f.track(sub.conn_id, BlockId(3)));
        assert!(f.disconnect(sub.conn_id));
        assert_eq!(f.subscriber_count(Topic::Tracking(BlockId(3))), 0);
        assert!(!f.track(sub.conn_id, BlockId(4)));
        assert_eq!(f.subscriber_count(Topic::Tracking(BlockId(4))), 0);
    }

    #[test]
    fn guard_disconnects_on_drop() {
        let f = Arc::new(Fanout::new(4));
        let sub = f.connect(DriverId(7));
        let guard = ConnectionGuard::new(f.clone(), sub.conn_id);
        assert_eq!(f.connection_count(), 1);
        drop(guard);
        assert_eq!(f.connection_count(), 0);
        assert_eq!(f.subscriber_count(Topic::AvailableBlocks), 0);
    }

    #[test]
    fn track_unknown_connection_is_refused() {
        let f = Fanout::default();
        assert!(!f.track(Uuid::new_v4(), BlockId(1)));
        assert_eq!(f.subscriber_count(Topic::Tracking(BlockId(1))), 0);
    }
}
