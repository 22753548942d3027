//! In-process mesh: a shared "signaling server" plus direct channels between
//! transports created from the same [`MemoryNetwork`].
//!
//! Events are delivered synchronously into each endpoint's unbounded queue,
//! so per-link order is preserved. Fault injection hooks cover the failure
//! modes the session must survive: failing sends, unreachable peers, lost
//! signaling links and broken discovery.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::{Direction, Transport, TransportEvent};
use crate::error::{SendError, TransportError};
use crate::media::{MediaStream, Modality};
use crate::protocol::{CallId, ConnectionId, PeerId};

/// Delivery counters for assertions.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NetworkStats {
    pub messages_delivered: u64,
    pub messages_failed: u64,
    pub reconnects: u64,
}

struct Endpoint {
    events: mpsc::UnboundedSender<TransportEvent>,
    online: bool,
}

struct Link {
    a: PeerId,
    b: PeerId,
}

impl Link {
    fn joins(&self, x: &PeerId, y: &PeerId) -> bool {
        (&self.a == x && &self.b == y) || (&self.a == y && &self.b == x)
    }

    fn other(&self, me: &PeerId) -> &PeerId {
        if &self.a == me { &self.b } else { &self.a }
    }
}

struct CallLink {
    caller: PeerId,
    callee: PeerId,
    offered: MediaStream,
}

#[derive(Default)]
struct NetworkState {
    endpoints: HashMap<PeerId, Endpoint>,
    join_order: Vec<PeerId>,
    links: HashMap<ConnectionId, Link>,
    calls: HashMap<CallId, CallLink>,
    failing_sends: HashSet<PeerId>,
    unreachable: HashSet<PeerId>,
    discovery_down: bool,
    signaling_down: bool,
    stats: NetworkStats,
}

impl NetworkState {
    fn emit(&self, peer: &PeerId, event: TransportEvent) -> bool {
        match self.endpoints.get(peer) {
            Some(endpoint) => endpoint.events.send(event).is_ok(),
            None => false,
        }
    }
}

/// Shared in-process signaling server and mesh.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    inner: Arc<Mutex<NetworkState>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a transport attached to this network, plus its event receiver.
    pub fn transport(&self) -> (MemoryTransport, mpsc::UnboundedReceiver<TransportEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let transport = MemoryTransport {
            network: self.clone(),
            local: None,
            events,
        };
        (transport, rx)
    }

    /// Every send addressed to `peer` fails from now on.
    pub fn fail_sends_to(&self, peer: impl Into<PeerId>) {
        self.inner.lock().failing_sends.insert(peer.into());
    }

    /// Outbound connects to `peer` are never acknowledged.
    pub fn set_unreachable(&self, peer: impl Into<PeerId>) {
        self.inner.lock().unreachable.insert(peer.into());
    }

    pub fn set_discovery_down(&self, down: bool) {
        self.inner.lock().discovery_down = down;
    }

    /// While down, `open` and `reconnect` fail.
    pub fn set_signaling_down(&self, down: bool) {
        self.inner.lock().signaling_down = down;
    }

    /// Drop `peer`'s signaling link; its data channels stay up.
    pub fn drop_signaling(&self, peer: &PeerId) {
        let mut state = self.inner.lock();
        if let Some(endpoint) = state.endpoints.get_mut(peer) {
            endpoint.online = false;
            let _ = endpoint.events.send(TransportEvent::Disconnected);
        }
    }

    /// Peers currently registered with the signaling server, in join order.
    pub fn peers(&self) -> Vec<PeerId> {
        let state = self.inner.lock();
        state
            .join_order
            .iter()
            .filter(|id| state.endpoints.get(*id).is_some_and(|e| e.online))
            .cloned()
            .collect()
    }

    pub fn open_links(&self) -> usize {
        self.inner.lock().links.len()
    }

    pub fn active_calls(&self) -> usize {
        self.inner.lock().calls.len()
    }

    pub fn stats(&self) -> NetworkStats {
        self.inner.lock().stats.clone()
    }
}

/// One endpoint of a [`MemoryNetwork`].
pub struct MemoryTransport {
    network: MemoryNetwork,
    local: Option<PeerId>,
    events: mpsc::UnboundedSender<TransportEvent>,
}

impl MemoryTransport {
    fn require_local(&self) -> Result<PeerId, TransportError> {
        self.local.clone().ok_or(TransportError::NotOpen)
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn open(&mut self, hint: Option<PeerId>) -> Result<PeerId, TransportError> {
        let mut state = self.network.inner.lock();
        if state.signaling_down {
            return Err(TransportError::Handshake("signaling server unreachable".into()));
        }

        let id = hint
            .filter(|h| !h.as_str().is_empty() && !state.endpoints.contains_key(h))
            .unwrap_or_else(PeerId::random);

        state.endpoints.insert(
            id.clone(),
            Endpoint {
                events: self.events.clone(),
                online: true,
            },
        );
        state.join_order.push(id.clone());
        self.local = Some(id.clone());
        log::debug!("Memory transport opened as {id}");
        Ok(id)
    }

    fn local_id(&self) -> Option<&PeerId> {
        self.local.as_ref()
    }

    fn connect(&mut self, peer: &PeerId) -> Result<ConnectionId, TransportError> {
        let local = self.require_local()?;
        let conn = ConnectionId::new();
        let mut state = self.network.inner.lock();

        let reachable = peer != &local
            && state.endpoints.contains_key(peer)
            && !state.unreachable.contains(peer);
        if !reachable {
            state.emit(
                &local,
                TransportEvent::ConnectFailed {
                    peer: peer.clone(),
                    error: TransportError::PeerUnreachable(peer.clone()),
                },
            );
            return Ok(conn);
        }

        state.links.insert(
            conn,
            Link {
                a: local.clone(),
                b: peer.clone(),
            },
        );
        state.emit(
            &local,
            TransportEvent::ConnectionOpened {
                peer: peer.clone(),
                conn,
                direction: Direction::Outbound,
            },
        );
        state.emit(
            peer,
            TransportEvent::ConnectionOpened {
                peer: local,
                conn,
                direction: Direction::Inbound,
            },
        );
        Ok(conn)
    }

    fn send(&mut self, peer: &PeerId, conn: ConnectionId, payload: Vec<u8>) -> Result<(), SendError> {
        let local = self.local.clone().ok_or_else(|| SendError::NotOpen(peer.clone()))?;
        let mut state = self.network.inner.lock();

        if state.failing_sends.contains(peer) {
            state.stats.messages_failed += 1;
            return Err(SendError::ChannelClosed(peer.clone()));
        }
        if !state.links.get(&conn).is_some_and(|l| l.joins(&local, peer)) {
            state.stats.messages_failed += 1;
            return Err(SendError::NotOpen(peer.clone()));
        }

        let delivered = state.emit(
            peer,
            TransportEvent::Data {
                peer: local,
                conn,
                payload,
            },
        );
        if !delivered {
            state.stats.messages_failed += 1;
            return Err(SendError::ChannelClosed(peer.clone()));
        }
        state.stats.messages_delivered += 1;
        Ok(())
    }

    fn close(&mut self, peer: &PeerId, conn: ConnectionId) {
        let Some(local) = self.local.clone() else { return };
        let mut state = self.network.inner.lock();
        if state.links.remove(&conn).is_some() {
            state.emit(&local, TransportEvent::ConnectionClosed { peer: peer.clone(), conn });
            state.emit(peer, TransportEvent::ConnectionClosed { peer: local, conn });
        }
    }

    fn list_all_peers(&mut self) -> Result<(), TransportError> {
        let local = self.require_local()?;
        let state = self.network.inner.lock();
        if !state.endpoints.get(&local).is_some_and(|e| e.online) {
            return Err(TransportError::Closed);
        }

        let event = if state.discovery_down {
            TransportEvent::PeerListFailed("discovery disabled".into())
        } else {
            let peers = state
                .join_order
                .iter()
                .filter(|id| state.endpoints.get(*id).is_some_and(|e| e.online))
                .cloned()
                .collect();
            TransportEvent::PeerList(peers)
        };
        state.emit(&local, event);
        Ok(())
    }

    fn call(&mut self, peer: &PeerId, modality: Modality, stream: &MediaStream) -> Result<CallId, TransportError> {
        let local = self.require_local()?;
        let mut state = self.network.inner.lock();
        if !state.endpoints.contains_key(peer) {
            return Err(TransportError::PeerUnreachable(peer.clone()));
        }

        let call = CallId::new();
        state.calls.insert(
            call,
            CallLink {
                caller: local.clone(),
                callee: peer.clone(),
                offered: stream.clone(),
            },
        );
        state.emit(
            peer,
            TransportEvent::IncomingCall {
                peer: local,
                call,
                modality,
            },
        );
        Ok(call)
    }

    fn answer(&mut self, call: CallId, stream: &MediaStream) -> Result<(), TransportError> {
        let state = self.network.inner.lock();
        let link = state.calls.get(&call).ok_or(TransportError::UnknownCall(call))?;

        state.emit(
            &link.caller,
            TransportEvent::CallStream {
                call,
                stream: stream.clone(),
            },
        );
        state.emit(
            &link.callee,
            TransportEvent::CallStream {
                call,
                stream: link.offered.clone(),
            },
        );
        Ok(())
    }

    fn hang_up(&mut self, call: CallId) {
        let Some(local) = self.local.clone() else { return };
        let mut state = self.network.inner.lock();
        if let Some(link) = state.calls.remove(&call) {
            let other = if link.caller == local { &link.callee } else { &link.caller };
            state.emit(other, TransportEvent::CallClosed { call });
        }
    }

    fn reconnect(&mut self) -> Result<(), TransportError> {
        let local = self.require_local()?;
        let mut state = self.network.inner.lock();
        state.stats.reconnects += 1;

        if state.signaling_down {
            state.emit(&local, TransportEvent::Disconnected);
            return Ok(());
        }
        if let Some(endpoint) = state.endpoints.get_mut(&local) {
            endpoint.online = true;
        }
        state.emit(&local, TransportEvent::Open(local.clone()));
        Ok(())
    }

    fn destroy(&mut self) {
        let Some(local) = self.local.take() else { return };
        let mut state = self.network.inner.lock();

        state.endpoints.remove(&local);
        state.join_order.retain(|id| id != &local);

        let dead_links: Vec<ConnectionId> = state
            .links
            .iter()
            .filter(|(_, l)| l.a == local || l.b == local)
            .map(|(conn, _)| *conn)
            .collect();
        for conn in dead_links {
            if let Some(link) = state.links.remove(&conn) {
                let other = link.other(&local).clone();
                state.emit(&other, TransportEvent::ConnectionClosed { peer: local.clone(), conn });
            }
        }

        let dead_calls: Vec<CallId> = state
            .calls
            .iter()
            .filter(|(_, c)| c.caller == local || c.callee == local)
            .map(|(call, _)| *call)
            .collect();
        for call in dead_calls {
            if let Some(link) = state.calls.remove(&call) {
                let other = if link.caller == local { link.callee } else { link.caller };
                state.emit(&other, TransportEvent::CallClosed { call });
            }
        }
        log::debug!("Memory transport {local} destroyed");
    }
}
