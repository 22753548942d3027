//! Per-peer, per-modality media call state.
//!
//! Each `(peer, modality)` pair moves `Idle → Requesting → Active → Idle`.
//! One local capture per modality is shared by every call of that modality
//! through `Arc<CaptureGuard>`; when the toggle goes off and the last call
//! session lets go, the device is released.
//!
//! Capture acquisition is asynchronous and may finish after the user has
//! already toggled the modality off. Every acquisition carries a generation
//! number, and a result whose generation is no longer current is dropped,
//! which releases it on the spot.
//!
//! The manager never touches the event loop itself. Each method returns the
//! [`CallOutcome`]s the session must act on (spawn an acquisition, surface a
//! stream, report a failure).

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::MediaError;
use crate::media::{CaptureGuard, MediaConstraints, MediaDevices, MediaStream, Modality};
use crate::protocol::{CallId, PeerId};
use crate::transport::{Direction, Transport};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    Idle,
    /// Waiting for a local capture or for the remote stream.
    Requesting,
    Active,
}

/// Something the session has to do or report after a call transition.
#[derive(Debug, Clone, PartialEq)]
pub enum CallOutcome {
    /// Spawn a capture acquisition and feed the result back with this generation.
    Acquire {
        modality: Modality,
        generation: u64,
        constraints: MediaConstraints,
    },
    /// Local capture is live.
    Started(Modality),
    /// Local capture released by the user.
    Stopped(Modality),
    Denied {
        modality: Modality,
        error: MediaError,
    },
    RemoteStream {
        peer: PeerId,
        modality: Modality,
        stream: MediaStream,
    },
    Ended {
        peer: PeerId,
        modality: Modality,
    },
    Failed {
        peer: PeerId,
        modality: Modality,
        reason: String,
    },
}

type CallKey = (PeerId, Modality);

#[derive(Debug)]
struct CallSession {
    call: Option<CallId>,
    direction: Direction,
    state: CallState,
    capture: Option<Arc<CaptureGuard>>,
    remote: Option<MediaStream>,
}

impl CallSession {
    fn waiting(direction: Direction, call: Option<CallId>) -> Self {
        Self {
            call,
            direction,
            state: CallState::Requesting,
            capture: None,
            remote: None,
        }
    }
}

#[derive(Debug)]
enum LocalCapture {
    Acquiring { generation: u64, call_all: bool },
    Ready(Arc<CaptureGuard>),
}

pub struct CallManager {
    media: Arc<dyn MediaDevices>,
    locals: HashMap<Modality, LocalCapture>,
    sessions: HashMap<CallKey, CallSession>,
    by_call: HashMap<CallId, CallKey>,
    next_generation: u64,
}

impl CallManager {
    pub fn new(media: Arc<dyn MediaDevices>) -> Self {
        Self {
            media,
            locals: HashMap::new(),
            sessions: HashMap::new(),
            by_call: HashMap::new(),
            next_generation: 0,
        }
    }

    pub fn media(&self) -> Arc<dyn MediaDevices> {
        self.media.clone()
    }

    pub fn state(&self, peer: &PeerId, modality: Modality) -> CallState {
        self.sessions
            .get(&(peer.clone(), modality))
            .map_or(CallState::Idle, |s| s.state)
    }

    /// The modality is toggled on (capturing or about to).
    pub fn is_active(&self, modality: Modality) -> bool {
        self.locals.contains_key(&modality)
    }

    /// A local capture for `modality` is held.
    pub fn has_capture(&self, modality: Modality) -> bool {
        matches!(self.locals.get(&modality), Some(LocalCapture::Ready(_)))
    }

    pub fn remote_stream(&self, peer: &PeerId, modality: Modality) -> Option<&MediaStream> {
        self.sessions
            .get(&(peer.clone(), modality))
            .and_then(|s| s.remote.as_ref())
    }

    /// Number of non-idle call sessions.
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Flip a modality. On: acquire a capture, then call every peer in
    /// `peers`. Off: hang up every call of that modality and release.
    pub fn toggle(&mut self, modality: Modality, peers: &[PeerId], transport: &mut dyn Transport) -> Vec<CallOutcome> {
        if self.is_active(modality) {
            return self.stop(modality, transport);
        }
        for peer in peers {
            self.sessions
                .entry((peer.clone(), modality))
                .or_insert_with(|| CallSession::waiting(Direction::Outbound, None));
        }
        vec![self.begin_acquire(modality, true)]
    }

    /// Call a single peer, acquiring the capture first if needed.
    /// A peer that already has a session for `modality` is left alone.
    pub fn call_peer(&mut self, peer: &PeerId, modality: Modality, transport: &mut dyn Transport) -> Vec<CallOutcome> {
        let key = (peer.clone(), modality);
        if self.sessions.contains_key(&key) {
            return Vec::new();
        }

        match self.locals.get(&modality) {
            Some(LocalCapture::Ready(guard)) => {
                let guard = guard.clone();
                self.place_call(peer, modality, guard, transport).into_iter().collect()
            }
            Some(LocalCapture::Acquiring { .. }) => {
                self.sessions.insert(key, CallSession::waiting(Direction::Outbound, None));
                Vec::new()
            }
            None => {
                self.sessions.insert(key, CallSession::waiting(Direction::Outbound, None));
                vec![self.begin_acquire(modality, false)]
            }
        }
    }

    /// Tear down every call of `modality` and drop the local capture.
    pub fn stop(&mut self, modality: Modality, transport: &mut dyn Transport) -> Vec<CallOutcome> {
        let mut outcomes = self.end_where(|_, m| m == modality, transport);
        if self.locals.remove(&modality).is_some() {
            outcomes.push(CallOutcome::Stopped(modality));
        }
        outcomes
    }

    /// Result of an acquisition spawned for an [`CallOutcome::Acquire`].
    pub fn on_capture_ready(
        &mut self,
        modality: Modality,
        generation: u64,
        result: Result<MediaStream, MediaError>,
        peers: &[PeerId],
        transport: &mut dyn Transport,
    ) -> Vec<CallOutcome> {
        let call_all = match self.locals.get(&modality) {
            Some(LocalCapture::Acquiring { generation: current, call_all }) if *current == generation => *call_all,
            _ => {
                if let Ok(stream) = result {
                    log::debug!("Discarding stale {modality} capture {}", stream.id);
                    drop(CaptureGuard::new(stream, self.media.clone()));
                }
                return Vec::new();
            }
        };

        let stream = match result {
            Ok(stream) => stream,
            Err(error) => {
                log::error!("Error accessing {}: {error}", modality.device_label());
                self.locals.remove(&modality);
                let mut outcomes = self.end_where(|_, m| m == modality, transport);
                outcomes.push(CallOutcome::Denied { modality, error });
                return outcomes;
            }
        };

        let guard = Arc::new(CaptureGuard::new(stream, self.media.clone()));
        self.locals.insert(modality, LocalCapture::Ready(guard.clone()));
        let mut outcomes = vec![CallOutcome::Started(modality)];

        if call_all {
            for peer in peers {
                self.sessions
                    .entry((peer.clone(), modality))
                    .or_insert_with(|| CallSession::waiting(Direction::Outbound, None));
            }
        }

        let waiting: Vec<(CallKey, Direction, Option<CallId>)> = self
            .sessions
            .iter()
            .filter(|((_, m), s)| *m == modality && s.capture.is_none())
            .map(|(key, s)| (key.clone(), s.direction, s.call))
            .collect();

        for (key, direction, call) in waiting {
            let (peer, _) = &key;
            match (direction, call) {
                (Direction::Inbound, Some(call)) => {
                    if let Some(outcome) = self.answer(&key, call, guard.clone(), transport) {
                        outcomes.push(outcome);
                    }
                }
                _ => {
                    if let Some(outcome) = self.place_call(peer, modality, guard.clone(), transport) {
                        outcomes.push(outcome);
                    }
                }
            }
        }
        outcomes
    }

    /// A remote peer is calling. Answered with the existing capture, or
    /// after acquiring one (which turns the modality on locally).
    pub fn on_incoming(
        &mut self,
        peer: &PeerId,
        call: CallId,
        modality: Modality,
        transport: &mut dyn Transport,
    ) -> Vec<CallOutcome> {
        let key = (peer.clone(), modality);
        let mut outcomes = Vec::new();

        if let Some(previous) = self.sessions.remove(&key) {
            if let Some(old) = previous.call {
                self.by_call.remove(&old);
                transport.hang_up(old);
            }
            outcomes.push(CallOutcome::Ended {
                peer: peer.clone(),
                modality,
            });
        }

        self.by_call.insert(call, key.clone());
        self.sessions.insert(key.clone(), CallSession::waiting(Direction::Inbound, Some(call)));

        match self.locals.get(&modality) {
            Some(LocalCapture::Ready(guard)) => {
                let guard = guard.clone();
                outcomes.extend(self.answer(&key, call, guard, transport));
            }
            Some(LocalCapture::Acquiring { .. }) => {}
            None => outcomes.push(self.begin_acquire(modality, false)),
        }
        outcomes
    }

    pub fn on_stream(&mut self, call: CallId, stream: MediaStream) -> Option<CallOutcome> {
        let key = self.by_call.get(&call)?.clone();
        let session = self.sessions.get_mut(&key)?;
        session.state = CallState::Active;
        session.remote = Some(stream.clone());
        let (peer, modality) = key;
        Some(CallOutcome::RemoteStream { peer, modality, stream })
    }

    /// The other side hung up.
    pub fn on_closed(&mut self, call: CallId) -> Option<CallOutcome> {
        let (peer, modality) = self.release_call(call)?;
        Some(CallOutcome::Ended { peer, modality })
    }

    pub fn on_failed(&mut self, call: CallId, reason: String) -> Option<CallOutcome> {
        let (peer, modality) = self.release_call(call)?;
        Some(CallOutcome::Failed { peer, modality, reason })
    }

    /// The peer's data channel is gone; drop its calls too.
    pub fn on_peer_gone(&mut self, peer: &PeerId, transport: &mut dyn Transport) -> Vec<CallOutcome> {
        self.end_where(|p, _| p == peer, transport)
    }

    /// Hang up everything and release every capture.
    pub fn stop_all(&mut self, transport: &mut dyn Transport) -> Vec<CallOutcome> {
        let mut outcomes = self.end_where(|_, _| true, transport);
        for modality in Modality::ALL {
            if self.locals.remove(&modality).is_some() {
                outcomes.push(CallOutcome::Stopped(modality));
            }
        }
        outcomes
    }

    fn begin_acquire(&mut self, modality: Modality, call_all: bool) -> CallOutcome {
        self.next_generation += 1;
        let generation = self.next_generation;
        self.locals.insert(modality, LocalCapture::Acquiring { generation, call_all });
        CallOutcome::Acquire {
            modality,
            generation,
            constraints: modality.constraints(),
        }
    }

    fn place_call(
        &mut self,
        peer: &PeerId,
        modality: Modality,
        guard: Arc<CaptureGuard>,
        transport: &mut dyn Transport,
    ) -> Option<CallOutcome> {
        let key = (peer.clone(), modality);
        match transport.call(peer, modality, guard.stream()) {
            Ok(call) => {
                log::debug!("Calling {peer} ({modality})");
                self.by_call.insert(call, key.clone());
                self.sessions.insert(
                    key,
                    CallSession {
                        call: Some(call),
                        direction: Direction::Outbound,
                        state: CallState::Requesting,
                        capture: Some(guard),
                        remote: None,
                    },
                );
                None
            }
            Err(e) => {
                self.sessions.remove(&key);
                Some(CallOutcome::Failed {
                    peer: peer.clone(),
                    modality,
                    reason: e.to_string(),
                })
            }
        }
    }

    fn answer(
        &mut self,
        key: &CallKey,
        call: CallId,
        guard: Arc<CaptureGuard>,
        transport: &mut dyn Transport,
    ) -> Option<CallOutcome> {
        match transport.answer(call, guard.stream()) {
            Ok(()) => {
                if let Some(session) = self.sessions.get_mut(key) {
                    session.capture = Some(guard);
                }
                None
            }
            Err(e) => {
                self.sessions.remove(key);
                self.by_call.remove(&call);
                transport.hang_up(call);
                let (peer, modality) = key.clone();
                Some(CallOutcome::Failed {
                    peer,
                    modality,
                    reason: e.to_string(),
                })
            }
        }
    }

    fn release_call(&mut self, call: CallId) -> Option<CallKey> {
        let key = self.by_call.remove(&call)?;
        match self.sessions.get(&key) {
            Some(session) if session.call == Some(call) => {
                self.sessions.remove(&key);
                Some(key)
            }
            _ => None,
        }
    }

    fn end_where(
        &mut self,
        matches: impl Fn(&PeerId, Modality) -> bool,
        transport: &mut dyn Transport,
    ) -> Vec<CallOutcome> {
        let keys: Vec<CallKey> = self
            .sessions
            .keys()
            .filter(|(peer, modality)| matches(peer, *modality))
            .cloned()
            .collect();

        let mut outcomes = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(session) = self.sessions.remove(&key) {
                if let Some(call) = session.call {
                    self.by_call.remove(&call);
                    transport.hang_up(call);
                }
                let (peer, modality) = key;
                outcomes.push(CallOutcome::Ended { peer, modality });
            }
        }
        outcomes
    }
}
