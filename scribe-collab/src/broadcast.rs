//! Fan-out from the hub to every open connection.
//!
//! Each connection owns an unbounded outbound channel drained by its socket
//! task. Sending never blocks, so one slow or dead peer cannot stall the
//! others; a send to a closed channel is counted as a drop.
//!
//! Frames are encoded once and shared as `Arc<str>` across all receivers.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc::UnboundedSender;
use uuid::Uuid;

use crate::auth::Identity;

/// Hub-side handle for one socket.
pub type ConnectionId = Uuid;

/// Outbound frame, already JSON-encoded.
pub type Frame = Arc<str>;

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub active_peers: usize,
}

#[derive(Debug)]
struct Peer {
    identity: Identity,
    sender: UnboundedSender<Frame>,
}

/// The set of connections attached to one document.
#[derive(Debug, Default)]
pub struct BroadcastGroup {
    peers: HashMap<ConnectionId, Peer>,
    messages_sent: u64,
    messages_dropped: u64,
}

impl BroadcastGroup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_peer(&mut self, id: ConnectionId, identity: Identity, sender: UnboundedSender<Frame>) {
        self.peers.insert(id, Peer { identity, sender });
    }

    /// Remove a peer, returning who it was.
    pub fn remove_peer(&mut self, id: &ConnectionId) -> Option<Identity> {
        self.peers.remove(id).map(|peer| peer.identity)
    }

    pub fn identity(&self, id: &ConnectionId) -> Option<&Identity> {
        self.peers.get(id).map(|peer| &peer.identity)
    }

    /// Send to a single peer. Returns `false` if it is gone.
    pub fn send_to(&mut self, id: &ConnectionId, frame: Frame) -> bool {
        let delivered = self
            .peers
            .get(id)
            .is_some_and(|peer| peer.sender.send(frame).is_ok());
        self.record(delivered);
        delivered
    }

    /// Send to every peer except `exclude`. Returns how many accepted the frame.
    pub fn broadcast_except(&mut self, exclude: Option<&ConnectionId>, frame: &Frame) -> usize {
        let mut delivered = 0;
        let mut dropped = 0;
        for (id, peer) in &self.peers {
            if Some(id) == exclude {
                continue;
            }
            if peer.sender.send(Arc::clone(frame)).is_ok() {
                delivered += 1;
            } else {
                log::debug!("peer {id} outbound channel closed, dropping frame");
                dropped += 1;
            }
        }
        self.messages_sent += delivered as u64;
        self.messages_dropped += dropped;
        delivered
    }

    fn record(&mut self, delivered: bool) {
        if delivered {
            self.messages_sent += 1;
        } else {
            self.messages_dropped += 1;
        }
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn has_peer(&self, id: &ConnectionId) -> bool {
        self.peers.contains_key(id)
    }

    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.messages_sent,
            messages_dropped: self.messages_dropped,
            active_peers: self.peers.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn frame(text: &str) -> Frame {
        Arc::from(text)
    }

    #[test]
    fn test_add_remove_peer() {
        let mut group = BroadcastGroup::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let id = Uuid::new_v4();

        group.add_peer(id, Identity::new("alice", "Alice"), tx);
        assert_eq!(group.peer_count(), 1);
        assert!(group.has_peer(&id));
        assert_eq!(group.identity(&id).unwrap().user_id, "alice");

        assert_eq!(group.remove_peer(&id).unwrap().name, "Alice");
        assert_eq!(group.peer_count(), 0);
        assert!(group.remove_peer(&id).is_none());
    }

    #[test]
    fn test_broadcast_skips_sender() {
        let mut group = BroadcastGroup::new();
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        let (tx_c, mut rx_c) = mpsc::unbounded_channel();
        let a = Uuid::new_v4();
        group.add_peer(a, Identity::new("a", "A"), tx_a);
        group.add_peer(Uuid::new_v4(), Identity::new("b", "B"), tx_b);
        group.add_peer(Uuid::new_v4(), Identity::new("c", "C"), tx_c);

        let delivered = group.broadcast_except(Some(&a), &frame("hello"));
        assert_eq!(delivered, 2);
        assert!(rx_a.try_recv().is_err());
        assert_eq!(&*rx_b.try_recv().unwrap(), "hello");
        assert_eq!(&*rx_c.try_recv().unwrap(), "hello");
    }

    #[test]
    fn test_closed_peer_counts_as_drop() {
        let mut group = BroadcastGroup::new();
        let (tx_live, mut rx_live) = mpsc::unbounded_channel();
        let (tx_dead, rx_dead) = mpsc::unbounded_channel();
        drop(rx_dead);
        let dead = Uuid::new_v4();
        group.add_peer(Uuid::new_v4(), Identity::new("live", "Live"), tx_live);
        group.add_peer(dead, Identity::new("dead", "Dead"), tx_dead);

        assert_eq!(group.broadcast_except(None, &frame("x")), 1);
        assert_eq!(&*rx_live.try_recv().unwrap(), "x");
        assert!(!group.send_to(&dead, frame("y")));

        let stats = group.stats();
        assert_eq!(stats.messages_sent, 1);
        assert_eq!(stats.messages_dropped, 2);
        assert_eq!(stats.active_peers, 2);
    }

    #[test]
    fn test_fan_out_many_peers() {
        let mut group = BroadcastGroup::new();
        let mut receivers = Vec::new();
        for i in 0..100 {
            let (tx, rx) = mpsc::unbounded_channel();
            group.add_peer(Uuid::new_v4(), Identity::new(format!("u{i}"), "U"), tx);
            receivers.push(rx);
        }
        let shared = frame("payload");
        for _ in 0..10 {
            group.broadcast_except(None, &shared);
        }
        for rx in &mut receivers {
            let mut count = 0;
            while rx.try_recv().is_ok() {
                count += 1;
            }
            assert_eq!(count, 10);
        }
        assert_eq!(group.stats().messages_sent, 1000);
    }
}
