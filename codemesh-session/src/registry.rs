//! Session registry: which peers this session has an open channel to.
//!
//! At most one [`PeerConnection`] per peer id. A newer connection replaces the
//! entry in place (keeping its display position); close events for the
//! replaced connection are recognised by id and ignored.

use std::collections::HashMap;

use crate::protocol::{ConnectionId, PeerId};
use crate::transport::Direction;

/// An open data channel to one remote peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerConnection {
    pub peer: PeerId,
    pub id: ConnectionId,
    pub direction: Direction,
}

impl PeerConnection {
    pub fn new(peer: PeerId, id: ConnectionId, direction: Direction) -> Self {
        Self { peer, id, direction }
    }
}

/// Insertion-ordered map of peer id → open connection.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    entries: HashMap<PeerId, PeerConnection>,
    order: Vec<PeerId>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace. Returns the connection that was replaced, if any.
    pub fn register(&mut self, conn: PeerConnection) -> Option<PeerConnection> {
        let peer = conn.peer.clone();
        let previous = self.entries.insert(peer.clone(), conn);
        if previous.is_none() {
            self.order.push(peer);
        }
        previous
    }

    /// Remove a peer. No-op when absent.
    pub fn unregister(&mut self, peer: &PeerId) -> Option<PeerConnection> {
        let removed = self.entries.remove(peer);
        if removed.is_some() {
            self.order.retain(|p| p != peer);
        }
        removed
    }

    /// Remove `peer` only if `conn` is still its current connection.
    pub fn remove_connection(&mut self, peer: &PeerId, conn: ConnectionId) -> Option<PeerConnection> {
        match self.entries.get(peer) {
            Some(current) if current.id == conn => self.unregister(peer),
            _ => None,
        }
    }

    /// Peer ids in insertion order (display only).
    pub fn list_peers(&self) -> Vec<PeerId> {
        self.order.clone()
    }

    /// Snapshot of the open connections in insertion order.
    pub fn connections(&self) -> Vec<PeerConnection> {
        self.order
            .iter()
            .filter_map(|peer| self.entries.get(peer).cloned())
            .collect()
    }

    pub fn get(&self, peer: &PeerId) -> Option<&PeerConnection> {
        self.entries.get(peer)
    }

    pub fn contains(&self, peer: &PeerId) -> bool {
        self.entries.contains_key(peer)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Remove everything, returning what was open.
    pub fn clear(&mut self) -> Vec<PeerConnection> {
        let drained = self.connections();
        self.entries.clear();
        self.order.clear();
        drained
    }
}
