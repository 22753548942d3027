//! The session context and its event loop.
//!
//! A [`Session`] owns everything one client needs: identity, current room,
//! registry, broadcaster, call manager, supervisor, transport and editor.
//! All state changes happen inside [`Session::dispatch`], one event at a time.
//! Work that has to wait (capture acquisition, the reconnect delay) runs in a
//! spawned task that posts its result back as a [`SessionEvent`].
//!
//! ```text
//!   TransportEvent ──┐
//!   LocalAction ─────┼──► Session::dispatch ──► SessionNotice ──► UI
//!   CaptureReady ────┤            │
//!   ReconnectDue ────┘            └──► Transport (connect / send / call)
//! ```

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::broadcast::{BroadcastStats, ChangeBroadcaster, Editor};
use crate::call::{CallManager, CallOutcome, CallState};
use crate::config::SessionConfig;
use crate::error::{MediaError, SessionError};
use crate::media::{MediaDevices, MediaStream, Modality};
use crate::protocol::{ChangeEvent, PeerId};
use crate::registry::{PeerConnection, SessionRegistry};
use crate::supervisor::{ConnectionSupervisor, StatusSnapshot};
use crate::transport::{Transport, TransportEvent};

/// Everything the event loop reacts to.
#[derive(Debug)]
pub enum SessionEvent {
    Transport(TransportEvent),
    Local(LocalAction),
    CaptureReady {
        modality: Modality,
        generation: u64,
        result: Result<MediaStream, MediaError>,
    },
    ReconnectDue {
        generation: u64,
    },
}

/// User-initiated actions.
#[derive(Debug, Clone, PartialEq)]
pub enum LocalAction {
    CreateRoom(String),
    JoinRoom(String),
    /// An edit from the local widget.
    Edit(ChangeEvent),
    ToggleVoice,
    ToggleVideo,
    CallPeer(PeerId, Modality),
    ConnectPeer(PeerId),
    Teardown,
}

/// What the UI is told.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionNotice {
    Status(StatusSnapshot),
    /// Connected peers, in connection order.
    PeerList(Vec<PeerId>),
    RoomChanged(String),
    RemoteStream {
        peer: PeerId,
        modality: Modality,
        stream: MediaStream,
    },
    CallEnded {
        peer: PeerId,
        modality: Modality,
    },
    /// The signaling link came back; these links were not re-established.
    PeersStale(Vec<PeerId>),
    ModalityChanged {
        modality: Modality,
        active: bool,
    },
}

/// Cloneable sender of local actions into a running session.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    inbox: mpsc::UnboundedSender<SessionEvent>,
}

impl SessionHandle {
    pub fn send(&self, action: LocalAction) -> Result<(), SessionError> {
        self.inbox
            .send(SessionEvent::Local(action))
            .map_err(|_| SessionError::Closed)
    }

    pub fn create_room(&self, name: impl Into<String>) -> Result<(), SessionError> {
        self.send(LocalAction::CreateRoom(name.into()))
    }

    pub fn join_room(&self, name: impl Into<String>) -> Result<(), SessionError> {
        self.send(LocalAction::JoinRoom(name.into()))
    }

    pub fn edit(&self, change: ChangeEvent) -> Result<(), SessionError> {
        self.send(LocalAction::Edit(change))
    }

    pub fn toggle(&self, modality: Modality) -> Result<(), SessionError> {
        match modality {
            Modality::Voice => self.send(LocalAction::ToggleVoice),
            Modality::Video => self.send(LocalAction::ToggleVideo),
        }
    }

    pub fn teardown(&self) -> Result<(), SessionError> {
        self.send(LocalAction::Teardown)
    }
}

pub struct Session {
    identity: PeerId,
    room: Option<String>,
    registry: SessionRegistry,
    broadcaster: ChangeBroadcaster,
    calls: CallManager,
    supervisor: ConnectionSupervisor,
    transport: Box<dyn Transport>,
    transport_events: mpsc::UnboundedReceiver<TransportEvent>,
    editor: Box<dyn Editor>,
    pending_connects: HashSet<PeerId>,
    inbox_tx: mpsc::UnboundedSender<SessionEvent>,
    inbox: mpsc::UnboundedReceiver<SessionEvent>,
    notices: mpsc::Sender<SessionNotice>,
    closed: bool,
}

impl Session {
    /// Open the transport and build the session.
    ///
    /// Fails when the signaling handshake does not complete; there is no
    /// retry at this stage.
    pub async fn start(
        config: SessionConfig,
        mut transport: Box<dyn Transport>,
        transport_events: mpsc::UnboundedReceiver<TransportEvent>,
        editor: Box<dyn Editor>,
        media: Arc<dyn MediaDevices>,
    ) -> Result<(Session, mpsc::Receiver<SessionNotice>), SessionError> {
        let mut supervisor = ConnectionSupervisor::new(config.reconnect_delay());
        supervisor.connecting();

        let hint = config
            .id_hint
            .as_deref()
            .map(str::trim)
            .filter(|h| !h.is_empty())
            .map(PeerId::from);
        let identity = match transport.open(hint).await {
            Ok(id) => id,
            Err(e) => {
                log::error!("Connection error: {e}");
                return Err(SessionError::Transport(e));
            }
        };
        log::info!("My peer ID is: {identity}");

        let (notices, notice_rx) = mpsc::channel(config.event_capacity.max(1));
        let (inbox_tx, inbox) = mpsc::unbounded_channel();
        let status = supervisor.link_opened();

        let session = Session {
            identity,
            room: None,
            registry: SessionRegistry::new(),
            broadcaster: ChangeBroadcaster::new(),
            calls: CallManager::new(media),
            supervisor,
            transport,
            transport_events,
            editor,
            pending_connects: HashSet::new(),
            inbox_tx,
            inbox,
            notices,
            closed: false,
        };
        session.notify(SessionNotice::Status(status));
        Ok((session, notice_rx))
    }

    pub fn handle(&self) -> SessionHandle {
        SessionHandle {
            inbox: self.inbox_tx.clone(),
        }
    }

    pub fn identity(&self) -> &PeerId {
        &self.identity
    }

    pub fn room(&self) -> Option<&str> {
        self.room.as_deref()
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn status(&self) -> StatusSnapshot {
        self.supervisor.snapshot()
    }

    pub fn supervisor(&self) -> &ConnectionSupervisor {
        &self.supervisor
    }

    pub fn call_state(&self, peer: &PeerId, modality: Modality) -> CallState {
        self.calls.state(peer, modality)
    }

    pub fn is_modality_active(&self, modality: Modality) -> bool {
        self.calls.is_active(modality)
    }

    pub fn broadcast_stats(&self) -> &BroadcastStats {
        self.broadcaster.stats()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Drive the session until teardown or until every event source is gone.
    pub async fn run(mut self) {
        while !self.closed {
            let event = tokio::select! {
                Some(event) = self.transport_events.recv() => SessionEvent::Transport(event),
                Some(event) = self.inbox.recv() => event,
                else => break,
            };
            self.dispatch(event);
        }
        log::info!("Session {} stopped", self.identity);
    }

    /// Handle every event that is already queued, without waiting.
    /// Returns how many were handled.
    pub fn poll_pending(&mut self) -> usize {
        let mut handled = 0;
        loop {
            let event = match self.transport_events.try_recv() {
                Ok(event) => SessionEvent::Transport(event),
                Err(_) => match self.inbox.try_recv() {
                    Ok(event) => event,
                    Err(_) => break,
                },
            };
            self.dispatch(event);
            handled += 1;
        }
        handled
    }

    /// Process one event to completion.
    pub fn dispatch(&mut self, event: SessionEvent) {
        if self.closed {
            // Late captures still have to be released.
            if let SessionEvent::CaptureReady { modality, generation, result } = event {
                self.calls
                    .on_capture_ready(modality, generation, result, &[], self.transport.as_mut());
            }
            return;
        }

        match event {
            SessionEvent::Transport(event) => self.on_transport(event),
            SessionEvent::Local(action) => self.on_local(action),
            SessionEvent::CaptureReady { modality, generation, result } => {
                let peers = self.registry.list_peers();
                let outcomes = self
                    .calls
                    .on_capture_ready(modality, generation, result, &peers, self.transport.as_mut());
                self.apply_outcomes(outcomes);
            }
            SessionEvent::ReconnectDue { generation } => self.on_reconnect_due(generation),
        }
    }

    /// Stop calls, close every link, destroy the transport. Idempotent.
    pub fn teardown(&mut self) {
        if self.closed {
            return;
        }
        let outcomes = self.calls.stop_all(self.transport.as_mut());
        self.apply_outcomes(outcomes);

        for conn in self.registry.clear() {
            self.transport.close(&conn.peer, conn.id);
        }
        self.pending_connects.clear();
        self.transport.destroy();
        self.closed = true;

        let status = self.supervisor.teardown();
        self.notify(SessionNotice::Status(status));
        log::info!("Session {} torn down", self.identity);
    }

    fn on_transport(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Open(id) => {
                if id != self.identity {
                    log::warn!("Signaling link reopened as {id}, expected {}", self.identity);
                }
                log::info!("Signaling link restored");
                let status = self.supervisor.link_opened();
                self.notify(SessionNotice::Status(status));

                let stale = self.registry.list_peers();
                if !stale.is_empty() {
                    self.notify(SessionNotice::PeersStale(stale));
                }
            }
            TransportEvent::Disconnected => self.on_disconnected(),
            TransportEvent::Error(e) => {
                log::error!("Connection error: {e}");
                self.report(SessionError::Transport(e));
            }
            TransportEvent::ConnectionOpened { peer, conn, direction } => {
                self.pending_connects.remove(&peer);
                log::info!("Connected to peer {peer} ({direction:?})");
                if self.registry.register(PeerConnection::new(peer, conn, direction)).is_some() {
                    log::debug!("Replaced existing connection");
                }
                self.notify_peer_list();
            }
            TransportEvent::ConnectionClosed { peer, conn } => {
                if self.registry.remove_connection(&peer, conn).is_some() {
                    log::info!("Connection closed with peer {peer}");
                    self.peer_gone(&peer);
                    let status = self.supervisor.note("Peer disconnected");
                    self.notify(SessionNotice::Status(status));
                }
            }
            TransportEvent::ConnectionError { peer, conn, reason } => {
                log::error!("Connection error with {peer}: {reason}");
                if self.registry.remove_connection(&peer, conn).is_some() {
                    self.peer_gone(&peer);
                }
                self.report(SessionError::PeerConnection { peer, reason });
            }
            TransportEvent::ConnectFailed { peer, error } => {
                self.pending_connects.remove(&peer);
                log::error!("Connection to {peer} failed: {error}");
                self.report(SessionError::PeerUnreachable(peer));
            }
            TransportEvent::Data { peer, conn, payload } => {
                if self.registry.get(&peer).map(|c| c.id) != Some(conn) {
                    log::debug!("Ignoring frame from unregistered {peer} on {conn}");
                    return;
                }
                if let Err(e) = self
                    .broadcaster
                    .apply_remote(&peer, &payload, self.editor.as_mut())
                {
                    log::warn!("Dropping undecodable frame from {peer}: {e}");
                }
            }
            TransportEvent::PeerList(peers) => {
                for peer in peers {
                    self.connect_to(peer);
                }
            }
            TransportEvent::PeerListFailed(reason) => {
                log::warn!("{}", SessionError::Discovery(reason));
            }
            TransportEvent::IncomingCall { peer, call, modality } => {
                log::info!("Incoming {modality} call from {peer}");
                let outcomes = self
                    .calls
                    .on_incoming(&peer, call, modality, self.transport.as_mut());
                self.apply_outcomes(outcomes);
            }
            TransportEvent::CallStream { call, stream } => {
                let outcome = self.calls.on_stream(call, stream);
                self.apply_outcomes(outcome.into_iter().collect());
            }
            TransportEvent::CallClosed { call } => {
                let outcome = self.calls.on_closed(call);
                self.apply_outcomes(outcome.into_iter().collect());
            }
            TransportEvent::CallFailed { call, reason } => {
                let outcome = self.calls.on_failed(call, reason);
                self.apply_outcomes(outcome.into_iter().collect());
            }
        }
    }

    fn on_local(&mut self, action: LocalAction) {
        match action {
            LocalAction::CreateRoom(name) => {
                let Some(name) = self.enter_room(&name) else { return };
                let status = self.supervisor.note(format!("Created room: {name}"));
                self.notify(SessionNotice::Status(status));
            }
            LocalAction::JoinRoom(name) => {
                let Some(name) = self.enter_room(&name) else { return };
                let status = self.supervisor.note(format!("Joined room: {name}"));
                self.notify(SessionNotice::Status(status));
                if let Err(e) = self.transport.list_all_peers() {
                    log::warn!("{}", SessionError::Discovery(e.to_string()));
                }
            }
            LocalAction::Edit(change) => {
                let result = self
                    .broadcaster
                    .broadcast_local(&change, &mut self.registry, self.transport.as_mut());
                match result {
                    Ok(report) => {
                        for peer in &report.dropped {
                            self.peer_gone(peer);
                        }
                    }
                    Err(e) => log::error!("Error encoding code change: {e}"),
                }
            }
            LocalAction::ToggleVoice => self.toggle(Modality::Voice),
            LocalAction::ToggleVideo => self.toggle(Modality::Video),
            LocalAction::CallPeer(peer, modality) => {
                let outcomes = self.calls.call_peer(&peer, modality, self.transport.as_mut());
                self.apply_outcomes(outcomes);
            }
            LocalAction::ConnectPeer(peer) => self.connect_to(peer),
            LocalAction::Teardown => self.teardown(),
        }
    }

    fn enter_room(&mut self, name: &str) -> Option<String> {
        let name = name.trim();
        if name.is_empty() {
            self.report(SessionError::RoomNameEmpty);
            return None;
        }
        self.room = Some(name.to_string());
        self.notify(SessionNotice::RoomChanged(name.to_string()));
        Some(name.to_string())
    }

    fn toggle(&mut self, modality: Modality) {
        let peers = self.registry.list_peers();
        let outcomes = self.calls.toggle(modality, &peers, self.transport.as_mut());
        self.apply_outcomes(outcomes);
    }

    /// Open a channel unless one is open or being opened already.
    fn connect_to(&mut self, peer: PeerId) {
        if peer == self.identity || self.registry.contains(&peer) || self.pending_connects.contains(&peer) {
            return;
        }
        match self.transport.connect(&peer) {
            Ok(_) => {
                log::debug!("Connecting to {peer}");
                self.pending_connects.insert(peer);
            }
            Err(e) => {
                log::error!("Connection to {peer} failed: {e}");
                self.report(SessionError::PeerUnreachable(peer));
            }
        }
    }

    fn peer_gone(&mut self, peer: &PeerId) {
        let outcomes = self.calls.on_peer_gone(peer, self.transport.as_mut());
        self.apply_outcomes(outcomes);
        self.notify_peer_list();
    }

    fn on_disconnected(&mut self) {
        let (status, ticket) = self.supervisor.on_disconnected();
        self.notify(SessionNotice::Status(status));
        let Some(ticket) = ticket else { return };

        let inbox = self.inbox_tx.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(ticket.delay).await;
            let _ = inbox.send(SessionEvent::ReconnectDue {
                generation: ticket.generation,
            });
        });
        self.supervisor.arm(ticket.generation, timer);
    }

    fn on_reconnect_due(&mut self, generation: u64) {
        if !self.supervisor.on_reconnect_due(generation) {
            return;
        }
        log::info!("Attempting to reconnect...");
        self.notify(SessionNotice::Status(self.supervisor.snapshot()));
        if let Err(e) = self.transport.reconnect() {
            log::error!("Reconnect failed: {e}");
            self.report(SessionError::Transport(e));
        }
    }

    fn apply_outcomes(&mut self, outcomes: Vec<CallOutcome>) {
        for outcome in outcomes {
            match outcome {
                CallOutcome::Acquire { modality, generation, constraints } => {
                    let media = self.calls.media();
                    let inbox = self.inbox_tx.clone();
                    tokio::spawn(async move {
                        let result = media.acquire(constraints).await;
                        let event = SessionEvent::CaptureReady { modality, generation, result };
                        if let Err(mpsc::error::SendError(SessionEvent::CaptureReady { result: Ok(stream), .. })) =
                            inbox.send(event)
                        {
                            media.release(&stream);
                        }
                    });
                }
                CallOutcome::Started(modality) => {
                    log::info!("{modality} chat active");
                    self.notify(SessionNotice::ModalityChanged { modality, active: true });
                    let status = self.supervisor.note(format!("{modality} chat active"));
                    self.notify(SessionNotice::Status(status));
                }
                CallOutcome::Stopped(modality) => {
                    log::info!("{modality} chat stopped");
                    self.notify(SessionNotice::ModalityChanged { modality, active: false });
                    let status = self.supervisor.note(format!("{modality} chat stopped"));
                    self.notify(SessionNotice::Status(status));
                }
                CallOutcome::Denied { modality, error } => {
                    self.notify(SessionNotice::ModalityChanged { modality, active: false });
                    self.report(SessionError::MediaAccessDenied { modality, source: error });
                }
                CallOutcome::RemoteStream { peer, modality, stream } => {
                    log::debug!("Receiving {modality} from {peer}");
                    self.notify(SessionNotice::RemoteStream { peer, modality, stream });
                }
                CallOutcome::Ended { peer, modality } => {
                    self.notify(SessionNotice::CallEnded { peer, modality });
                }
                CallOutcome::Failed { peer, modality, reason } => {
                    log::error!("{modality} call error with {peer}: {reason}");
                    self.notify(SessionNotice::CallEnded { peer, modality });
                    self.report(SessionError::Call { modality, reason });
                }
            }
        }
    }

    fn report(&mut self, error: SessionError) {
        let status = self.supervisor.error(error.to_string());
        self.notify(SessionNotice::Status(status));
    }

    fn notify_peer_list(&self) {
        self.notify(SessionNotice::PeerList(self.registry.list_peers()));
    }

    fn notify(&self, notice: SessionNotice) {
        match self.notices.try_send(notice) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(notice)) => {
                log::warn!("Notice queue full, dropping {notice:?}");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if !self.closed {
            self.transport.destroy();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EditorError;
    use crate::media::HeadlessDevices;
    use crate::protocol::{ConnectionId, PeerMessage, Position, Provenance};
    use crate::supervisor::ConnectionStatus;
    use crate::transport::MemoryNetwork;

    struct NullEditor;

    impl Editor for NullEditor {
        fn apply_edit(&mut self, _: Position, _: Position, _: &[String], _: Provenance) -> Result<(), EditorError> {
            Ok(())
        }
    }

    async fn start(network: &MemoryNetwork, id: &str) -> (Session, mpsc::Receiver<SessionNotice>) {
        let (transport, events) = network.transport();
        let config = SessionConfig {
            id_hint: Some(id.to_string()),
            ..SessionConfig::default()
        };
        Session::start(
            config,
            Box::new(transport),
            events,
            Box::new(NullEditor),
            Arc::new(HeadlessDevices::granting()),
        )
        .await
        .unwrap()
    }

    fn drain(rx: &mut mpsc::Receiver<SessionNotice>) -> Vec<SessionNotice> {
        let mut notices = Vec::new();
        while let Ok(notice) = rx.try_recv() {
            notices.push(notice);
        }
        notices
    }

    #[tokio::test]
    async fn test_start_reports_connected() {
        let network = MemoryNetwork::new();
        let (session, mut rx) = start(&network, "p1").await;

        assert_eq!(session.identity(), &PeerId::from("p1"));
        assert_eq!(session.status().status, ConnectionStatus::Connected);
        match rx.try_recv().unwrap() {
            SessionNotice::Status(snapshot) => assert_eq!(snapshot.detail, "Connected"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_start_fails_without_signaling() {
        let network = MemoryNetwork::new();
        network.set_signaling_down(true);
        let (transport, events) = network.transport();

        let result = Session::start(
            SessionConfig::default(),
            Box::new(transport),
            events,
            Box::new(NullEditor),
            Arc::new(HeadlessDevices::granting()),
        )
        .await;
        assert!(matches!(result, Err(SessionError::Transport(_))));
    }

    #[tokio::test]
    async fn test_frames_only_from_current_connection_are_applied() {
        let network = MemoryNetwork::new();
        let (mut p1, _rx1) = start(&network, "p1").await;
        let (_p2, _rx2) = start(&network, "p2").await;
        let p2_id = PeerId::from("p2");
        let payload = PeerMessage::code_change(ChangeEvent::local(Position::new(0, 0), Position::new(0, 0), "x"))
            .encode()
            .unwrap();
        let frame = |conn| {
            SessionEvent::Transport(TransportEvent::Data {
                peer: PeerId::from("p2"),
                conn,
                payload: payload.clone(),
            })
        };

        p1.dispatch(frame(ConnectionId::new()));
        assert_eq!(p1.broadcast_stats().remote_applied, 0);

        p1.dispatch(SessionEvent::Local(LocalAction::ConnectPeer(p2_id.clone())));
        p1.poll_pending();
        let current = p1.registry().get(&p2_id).map(|c| c.id).unwrap();

        p1.dispatch(frame(current));
        assert_eq!(p1.broadcast_stats().remote_applied, 1);

        // A stale channel id from the same peer is not trusted either.
        p1.dispatch(frame(ConnectionId::new()));
        assert_eq!(p1.broadcast_stats().remote_applied, 1);
    }

    #[tokio::test]
    async fn test_empty_room_name_rejected() {
        let network = MemoryNetwork::new();
        let (mut session, mut rx) = start(&network, "p1").await;
        drain(&mut rx);

        session.dispatch(SessionEvent::Local(LocalAction::CreateRoom("   ".into())));

        assert!(session.room().is_none());
        assert_eq!(
            session.status().status,
            ConnectionStatus::Error("Please enter a room name".into())
        );
    }

    #[tokio::test]
    async fn test_create_room_trims_name() {
        let network = MemoryNetwork::new();
        let (mut session, mut rx) = start(&network, "p1").await;
        drain(&mut rx);

        session.dispatch(SessionEvent::Local(LocalAction::CreateRoom("  alpha ".into())));

        assert_eq!(session.room(), Some("alpha"));
        assert_eq!(session.status().detail, "Created room: alpha");
        let notices = drain(&mut rx);
        assert!(notices.contains(&SessionNotice::RoomChanged("alpha".into())));
    }

    #[tokio::test]
    async fn test_connect_peer_skips_self_and_duplicates() {
        let network = MemoryNetwork::new();
        let (mut session, _rx) = start(&network, "p1").await;
        let (mut other, _other_rx) = start(&network, "p2").await;

        session.dispatch(SessionEvent::Local(LocalAction::ConnectPeer(PeerId::from("p1"))));
        session.dispatch(SessionEvent::Local(LocalAction::ConnectPeer(PeerId::from("p2"))));
        session.dispatch(SessionEvent::Local(LocalAction::ConnectPeer(PeerId::from("p2"))));
        session.poll_pending();
        other.poll_pending();

        assert_eq!(session.registry().list_peers(), vec![PeerId::from("p2")]);
        assert_eq!(network.open_links(), 1);
    }

    #[tokio::test]
    async fn test_teardown_is_idempotent() {
        let network = MemoryNetwork::new();
        let (mut session, _rx) = start(&network, "p1").await;

        session.teardown();
        session.teardown();

        assert!(session.is_closed());
        assert!(network.peers().is_empty());
        assert_eq!(session.status().status, ConnectionStatus::Disconnected);
    }
}
