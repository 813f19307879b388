//! Broadcast fabric: per-auction subscriber sets with ordered fan-out.
//!
//! Uses lock-free DashMap registries for high-throughput concurrent access.
//! Every event is serialized once and pushed to each subscriber's unbounded
//! channel; delivery is best-effort — a subscriber whose channel is gone is
//! pruned, the publisher never blocks.

use crate::events::AuctionEvent;
use dashmap::{DashMap, DashSet};
use metrics::counter;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

/// Unique connection identifier.
pub type ConnectionId = Uuid;

/// Pre-serialized event frames delivered to subscribers.
pub type EventFrame = String;

struct ConnectionEntry {
    user_id: i64,
    username: String,
    tx: mpsc::UnboundedSender<EventFrame>,
    /// Auctions this connection has joined.
    joined: DashSet<i64>,
}

#[derive(Default)]
struct AuctionChannel {
    /// Monotone per-auction sequence, starting at 1 for the first event.
    seq: AtomicU64,
    subscribers: DashSet<ConnectionId>,
}

#[derive(Default)]
struct HubInner {
    connections: DashMap<ConnectionId, ConnectionEntry>,
    by_user: DashMap<i64, DashSet<ConnectionId>>,
    channels: DashMap<i64, AuctionChannel>,
}

/// What a detached connection was subscribed to, so the caller can announce
/// the departures.
#[derive(Debug)]
pub struct DetachedConnection {
    pub user_id: i64,
    pub username: String,
    pub joined: Vec<i64>,
}

/// Connection registry plus per-auction subscriber sets. Cheap to clone.
#[derive(Clone, Default)]
pub struct BroadcastHub {
    inner: Arc<HubInner>,
}

impl BroadcastHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection at handshake time. The sender receives every
    /// event frame destined for this connection.
    pub fn attach(
        &self,
        user_id: i64,
        username: &str,
        tx: mpsc::UnboundedSender<EventFrame>,
    ) -> ConnectionId {
        let id = Uuid::new_v4();
        self.inner.connections.insert(
            id,
            ConnectionEntry {
                user_id,
                username: username.to_string(),
                tx,
                joined: DashSet::new(),
            },
        );
        self.inner.by_user.entry(user_id).or_default().insert(id);
        debug!("connection {} attached for user {}", id, user_id);
        id
    }

    /// Remove a connection and all of its subscriptions.
    pub fn detach(&self, connection_id: &ConnectionId) -> Option<DetachedConnection> {
        let (_, entry) = self.inner.connections.remove(connection_id)?;
        if let Some(conns) = self.inner.by_user.get(&entry.user_id) {
            conns.remove(connection_id);
        }
        let joined: Vec<i64> = entry.joined.iter().map(|a| *a).collect();
        for auction_id in &joined {
            if let Some(channel) = self.inner.channels.get(auction_id) {
                channel.subscribers.remove(connection_id);
            }
        }
        debug!("connection {} detached", connection_id);
        Some(DetachedConnection {
            user_id: entry.user_id,
            username: entry.username,
            joined,
        })
    }

    /// Subscribe a connection to an auction's event stream. Returns the
    /// auction's current sequence number, or `None` for an unknown
    /// connection.
    pub fn join(&self, connection_id: &ConnectionId, auction_id: i64) -> Option<u64> {
        let entry = self.inner.connections.get(connection_id)?;
        entry.joined.insert(auction_id);
        let channel = self.inner.channels.entry(auction_id).or_default();
        channel.subscribers.insert(*connection_id);
        Some(channel.seq.load(Ordering::Acquire))
    }

    /// Unsubscribe; reports whether the connection was actually subscribed.
    pub fn leave(&self, connection_id: &ConnectionId, auction_id: i64) -> bool {
        if let Some(entry) = self.inner.connections.get(connection_id) {
            entry.joined.remove(&auction_id);
        }
        match self.inner.channels.get(&auction_id) {
            Some(channel) => channel.subscribers.remove(connection_id).is_some(),
            None => false,
        }
    }

    /// Stamp the next sequence number on `event` and fan it out to every
    /// subscriber of the auction, in publish order. Returns the stamped
    /// sequence.
    pub fn publish(&self, auction_id: i64, mut event: AuctionEvent) -> u64 {
        let channel = self.inner.channels.entry(auction_id).or_default();
        let seq = channel.seq.fetch_add(1, Ordering::AcqRel) + 1;
        event.set_seq(seq);

        let frame = match serde_json::to_string(&event) {
            Ok(json) => json,
            Err(e) => {
                warn!("failed to serialize event for auction {}: {}", auction_id, e);
                return seq;
            }
        };

        let mut dead = Vec::new();
        for connection_id in channel.subscribers.iter() {
            match self.inner.connections.get(&*connection_id) {
                Some(entry) => {
                    if entry.tx.send(frame.clone()).is_err() {
                        dead.push(*connection_id);
                    }
                }
                None => dead.push(*connection_id),
            }
        }
        for connection_id in dead {
            debug!(
                "dropping dead subscriber {} from auction {}",
                connection_id, auction_id
            );
            channel.subscribers.remove(&connection_id);
        }

        counter!("broadcast_events_total").increment(1);
        seq
    }

    /// Deliver a user-directed event to every active connection of `user_id`,
    /// subscribed or not.
    pub fn notify_user(&self, user_id: i64, event: AuctionEvent) {
        let connections = match self.inner.by_user.get(&user_id) {
            Some(conns) => conns,
            None => return,
        };
        let frame = match serde_json::to_string(&event) {
            Ok(json) => json,
            Err(e) => {
                warn!("failed to serialize event for user {}: {}", user_id, e);
                return;
            }
        };
        for connection_id in connections.iter() {
            if let Some(entry) = self.inner.connections.get(&*connection_id) {
                if entry.tx.send(frame.clone()).is_err() {
                    debug!("failed to notify connection {}", *connection_id);
                }
            }
        }
    }

    /// Last sequence number published for an auction (0 if none yet).
    pub fn last_seq(&self, auction_id: i64) -> u64 {
        self.inner
            .channels
            .get(&auction_id)
            .map(|c| c.seq.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    /// Drop an auction's channel after its terminal event has gone out.
    pub fn drop_channel(&self, auction_id: i64) {
        if let Some((_, channel)) = self.inner.channels.remove(&auction_id) {
            for connection_id in channel.subscribers.iter() {
                if let Some(entry) = self.inner.connections.get(&*connection_id) {
                    entry.joined.remove(&auction_id);
                }
            }
        }
    }

    pub fn connection_count(&self) -> usize {
        self.inner.connections.len()
    }

    pub fn subscription_count(&self) -> usize {
        self.inner
            .channels
            .iter()
            .map(|c| c.subscribers.len())
            .sum()
    }
}
