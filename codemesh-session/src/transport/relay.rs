//! WebSocket transport against the codemesh signaling server.
//!
//! Handshakes and, since NAT traversal is delegated, channel frames travel
//! through the server as [`SignalPayload`]s addressed by peer id:
//! ```text
//! RelayTransport ── ClientMessage ──► signal server ── ServerMessage ──► RelayTransport
//!     writer task ◄── mpsc ── Transport::send          reader task ──► TransportEvent
//! ```
//! A relayed channel is keyed by its [`ConnectionId`] and lives only as long
//! as the signaling socket: losing the socket closes every channel and call,
//! and a reconnect starts with none.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use super::{Direction, Transport, TransportEvent};
use crate::config::SessionConfig;
use crate::error::{SendError, TransportError};
use crate::media::{MediaStream, Modality};
use crate::protocol::{CallId, ClientMessage, ConnectionId, PeerId, ServerMessage, SignalPayload};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsWriter = SplitSink<WsStream, Message>;
type WsReader = SplitStream<WsStream>;

struct RelayCall {
    peer: PeerId,
    /// The caller's stream, kept until we answer
    offered: Option<MediaStream>,
}

#[derive(Default)]
struct RelayState {
    /// Outbound connects awaiting `Accept`
    pending: HashMap<ConnectionId, PeerId>,
    links: HashMap<ConnectionId, PeerId>,
    calls: HashMap<CallId, RelayCall>,
}

/// State shared between the transport handle and its background tasks.
struct Shared {
    state: Mutex<RelayState>,
    outgoing: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    reader: Mutex<Option<JoinHandle<()>>>,
    events: mpsc::UnboundedSender<TransportEvent>,
    destroyed: AtomicBool,
}

impl Shared {
    fn emit(&self, event: TransportEvent) {
        if !self.destroyed.load(Ordering::SeqCst) {
            let _ = self.events.send(event);
        }
    }

    fn send(&self, msg: &ClientMessage) -> Result<(), TransportError> {
        let bytes = msg.encode()?;
        let outgoing = self.outgoing.lock();
        let tx = outgoing.as_ref().ok_or(TransportError::Closed)?;
        tx.send(bytes).map_err(|_| TransportError::Closed)
    }

    fn signal(&self, to: &PeerId, payload: SignalPayload) -> Result<(), TransportError> {
        self.send(&ClientMessage::Signal {
            to: to.clone(),
            payload,
        })
    }

    fn dispatch(&self, msg: ServerMessage) {
        match msg {
            ServerMessage::PeerList { peers } => self.emit(TransportEvent::PeerList(peers)),
            ServerMessage::PeerListDenied { reason } => self.emit(TransportEvent::PeerListFailed(reason)),
            ServerMessage::Signal { from, payload } => self.on_signal(from, payload),
            ServerMessage::SignalFailed { to, reason } => self.on_peer_lost(&to, Some(reason)),
            ServerMessage::PeerGone { id } => self.on_peer_lost(&id, None),
            ServerMessage::Error { reason } => self.emit(TransportEvent::Error(TransportError::Server(reason))),
            ServerMessage::IdAssigned { id } => log::debug!("Ignoring late id assignment {id}"),
        }
    }

    fn on_signal(&self, from: PeerId, payload: SignalPayload) {
        match payload {
            SignalPayload::Connect { conn } => {
                self.state.lock().links.insert(conn, from.clone());
                if let Err(e) = self.signal(&from, SignalPayload::Accept { conn }) {
                    log::warn!("Failed to accept connection from {from}: {e}");
                }
                self.emit(TransportEvent::ConnectionOpened {
                    peer: from,
                    conn,
                    direction: Direction::Inbound,
                });
            }
            SignalPayload::Accept { conn } => {
                let accepted = {
                    let mut state = self.state.lock();
                    match state.pending.remove(&conn) {
                        Some(peer) if peer == from => {
                            state.links.insert(conn, from.clone());
                            true
                        }
                        Some(peer) => {
                            state.pending.insert(conn, peer);
                            false
                        }
                        None => false,
                    }
                };
                if accepted {
                    self.emit(TransportEvent::ConnectionOpened {
                        peer: from,
                        conn,
                        direction: Direction::Outbound,
                    });
                } else {
                    log::debug!("Ignoring stray accept for {conn} from {from}");
                }
            }
            SignalPayload::Data { conn, bytes } => {
                let known = self.state.lock().links.get(&conn) == Some(&from);
                if known {
                    self.emit(TransportEvent::Data {
                        peer: from,
                        conn,
                        payload: bytes,
                    });
                }
            }
            SignalPayload::Close { conn } => {
                let removed = self.state.lock().links.remove(&conn).is_some();
                if removed {
                    self.emit(TransportEvent::ConnectionClosed { peer: from, conn });
                }
            }
            SignalPayload::CallOffer { call, modality, stream } => {
                self.state.lock().calls.insert(
                    call,
                    RelayCall {
                        peer: from.clone(),
                        offered: Some(stream),
                    },
                );
                self.emit(TransportEvent::IncomingCall {
                    peer: from,
                    call,
                    modality,
                });
            }
            SignalPayload::CallAnswer { call, stream } => {
                let known = self.state.lock().calls.contains_key(&call);
                if known {
                    self.emit(TransportEvent::CallStream { call, stream });
                }
            }
            SignalPayload::CallClose { call } => {
                let removed = self.state.lock().calls.remove(&call).is_some();
                if removed {
                    self.emit(TransportEvent::CallClosed { call });
                }
            }
        }
    }

    /// The signaling socket is gone, and with it every relayed channel.
    fn on_link_lost(&self) {
        self.outgoing.lock().take();
        if self.destroyed.load(Ordering::SeqCst) {
            return;
        }
        let (pending, links, calls) = {
            let mut state = self.state.lock();
            let mut pending: Vec<PeerId> = state.pending.drain().map(|(_, p)| p).collect();
            pending.sort();
            pending.dedup();
            let links: Vec<(ConnectionId, PeerId)> = state.links.drain().collect();
            let calls: Vec<CallId> = state.calls.drain().map(|(id, _)| id).collect();
            (pending, links, calls)
        };

        log::info!(
            "Signaling link lost ({} channels, {} calls dropped)",
            links.len(),
            calls.len()
        );
        for peer in pending {
            self.emit(TransportEvent::ConnectFailed {
                peer: peer.clone(),
                error: TransportError::PeerUnreachable(peer),
            });
        }
        for (conn, peer) in links {
            self.emit(TransportEvent::ConnectionClosed { peer, conn });
        }
        for call in calls {
            self.emit(TransportEvent::CallClosed { call });
        }
        self.emit(TransportEvent::Disconnected);
    }

    /// The server says `peer` is gone (`reason` None) or unroutable.
    fn on_peer_lost(&self, peer: &PeerId, reason: Option<String>) {
        let (pending, links, calls) = {
            let mut state = self.state.lock();
            let pending: Vec<ConnectionId> = state
                .pending
                .iter()
                .filter(|(_, p)| *p == peer)
                .map(|(c, _)| *c)
                .collect();
            let links: Vec<ConnectionId> = state
                .links
                .iter()
                .filter(|(_, p)| *p == peer)
                .map(|(c, _)| *c)
                .collect();
            let calls: Vec<CallId> = state
                .calls
                .iter()
                .filter(|(_, c)| &c.peer == peer)
                .map(|(id, _)| *id)
                .collect();
            for conn in pending.iter().chain(links.iter()) {
                state.pending.remove(conn);
                state.links.remove(conn);
            }
            for call in &calls {
                state.calls.remove(call);
            }
            (pending, links, calls)
        };

        if !pending.is_empty() {
            self.emit(TransportEvent::ConnectFailed {
                peer: peer.clone(),
                error: TransportError::PeerUnreachable(peer.clone()),
            });
        }
        for conn in links {
            let event = match &reason {
                Some(reason) => TransportEvent::ConnectionError {
                    peer: peer.clone(),
                    conn,
                    reason: reason.clone(),
                },
                None => TransportEvent::ConnectionClosed { peer: peer.clone(), conn },
            };
            self.emit(event);
        }
        for call in calls {
            let event = match &reason {
                Some(reason) => TransportEvent::CallFailed { call, reason: reason.clone() },
                None => TransportEvent::CallClosed { call },
            };
            self.emit(event);
        }
    }
}

/// Connect, send `Open`, and wait for the assigned identity.
async fn dial(url: &str, hint: Option<PeerId>, timeout: Duration) -> Result<(PeerId, WsWriter, WsReader), TransportError> {
    let (ws_stream, _) = tokio_tungstenite::connect_async(url)
        .await
        .map_err(|e| TransportError::Handshake(e.to_string()))?;
    let (mut writer, mut reader) = ws_stream.split();

    let open = ClientMessage::Open { hint }.encode()?;
    writer
        .send(Message::Binary(open.into()))
        .await
        .map_err(|e| TransportError::Handshake(e.to_string()))?;

    let id = tokio::time::timeout(timeout, await_identity(&mut reader))
        .await
        .map_err(|_| TransportError::Handshake("timed out waiting for id".into()))??;
    Ok((id, writer, reader))
}

async fn await_identity(reader: &mut WsReader) -> Result<PeerId, TransportError> {
    while let Some(msg) = reader.next().await {
        match msg {
            Ok(Message::Binary(data)) => {
                let bytes: Vec<u8> = data.into();
                match ServerMessage::decode(&bytes)? {
                    ServerMessage::IdAssigned { id } => return Ok(id),
                    ServerMessage::Error { reason } => return Err(TransportError::Handshake(reason)),
                    other => log::debug!("Ignoring {other:?} before id assignment"),
                }
            }
            Ok(Message::Close(_)) => break,
            Err(e) => return Err(TransportError::Handshake(e.to_string())),
            _ => {}
        }
    }
    Err(TransportError::Handshake("signaling closed before id assignment".into()))
}

/// Spawn writer and reader tasks for a freshly dialed link.
fn attach(shared: &Arc<Shared>, mut writer: WsWriter, mut reader: WsReader) {
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Vec<u8>>();
    *shared.outgoing.lock() = Some(out_tx);

    // Writer: ends when the sender is dropped (destroy or link loss).
    tokio::spawn(async move {
        while let Some(data) = out_rx.recv().await {
            if writer.send(Message::Binary(data.into())).await.is_err() {
                break;
            }
        }
        let _ = writer.close().await;
    });

    let task_shared = shared.clone();
    let reader_task = tokio::spawn(async move {
        while let Some(msg) = reader.next().await {
            match msg {
                Ok(Message::Binary(data)) => {
                    let bytes: Vec<u8> = data.into();
                    match ServerMessage::decode(&bytes) {
                        Ok(server_msg) => task_shared.dispatch(server_msg),
                        Err(e) => log::warn!("Failed to decode signaling message: {e}"),
                    }
                }
                Ok(Message::Close(_)) | Err(_) => break,
                _ => {}
            }
        }

        task_shared.on_link_lost();
    });

    if let Some(previous) = shared.reader.lock().replace(reader_task) {
        previous.abort();
    }
}

/// Transport that relays everything through the signaling server.
pub struct RelayTransport {
    config: SessionConfig,
    local: Option<PeerId>,
    shared: Arc<Shared>,
}

impl RelayTransport {
    pub fn new(config: SessionConfig) -> (Self, mpsc::UnboundedReceiver<TransportEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            state: Mutex::new(RelayState::default()),
            outgoing: Mutex::new(None),
            reader: Mutex::new(None),
            events,
            destroyed: AtomicBool::new(false),
        });
        let transport = Self {
            config,
            local: None,
            shared,
        };
        (transport, rx)
    }

    fn require_local(&self) -> Result<PeerId, TransportError> {
        self.local.clone().ok_or(TransportError::NotOpen)
    }

    /// Number of relayed channels currently open.
    pub fn open_links(&self) -> usize {
        self.shared.state.lock().links.len()
    }
}

#[async_trait]
impl Transport for RelayTransport {
    async fn open(&mut self, hint: Option<PeerId>) -> Result<PeerId, TransportError> {
        let url = self.config.signaling_url();
        let (id, writer, reader) = dial(&url, hint, self.config.connect_timeout()).await?;
        attach(&self.shared, writer, reader);
        log::info!("Connected to {url} with peer ID: {id}");
        self.local = Some(id.clone());
        Ok(id)
    }

    fn local_id(&self) -> Option<&PeerId> {
        self.local.as_ref()
    }

    fn connect(&mut self, peer: &PeerId) -> Result<ConnectionId, TransportError> {
        self.require_local()?;
        let conn = ConnectionId::new();
        self.shared.state.lock().pending.insert(conn, peer.clone());

        if let Err(e) = self.shared.signal(peer, SignalPayload::Connect { conn }) {
            self.shared.state.lock().pending.remove(&conn);
            return Err(e);
        }

        let shared = self.shared.clone();
        let peer = peer.clone();
        let timeout = self.config.connect_timeout();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let expired = shared.state.lock().pending.remove(&conn).is_some();
            if expired {
                log::warn!("Connect to {peer} timed out after {timeout:?}");
                shared.emit(TransportEvent::ConnectFailed {
                    peer: peer.clone(),
                    error: TransportError::PeerUnreachable(peer),
                });
            }
        });
        Ok(conn)
    }

    fn send(&mut self, peer: &PeerId, conn: ConnectionId, payload: Vec<u8>) -> Result<(), SendError> {
        let open = self.shared.state.lock().links.get(&conn) == Some(peer);
        if !open {
            return Err(SendError::NotOpen(peer.clone()));
        }
        self.shared
            .signal(peer, SignalPayload::Data { conn, bytes: payload })
            .map_err(|_| SendError::ChannelClosed(peer.clone()))
    }

    fn close(&mut self, peer: &PeerId, conn: ConnectionId) {
        let removed = self.shared.state.lock().links.remove(&conn).is_some();
        if removed {
            let _ = self.shared.signal(peer, SignalPayload::Close { conn });
            self.shared.emit(TransportEvent::ConnectionClosed {
                peer: peer.clone(),
                conn,
            });
        }
    }

    fn list_all_peers(&mut self) -> Result<(), TransportError> {
        self.require_local()?;
        self.shared.send(&ClientMessage::ListPeers)
    }

    fn call(&mut self, peer: &PeerId, modality: Modality, stream: &MediaStream) -> Result<CallId, TransportError> {
        self.require_local()?;
        let call = CallId::new();
        self.shared.state.lock().calls.insert(
            call,
            RelayCall {
                peer: peer.clone(),
                offered: None,
            },
        );

        let offer = SignalPayload::CallOffer {
            call,
            modality,
            stream: stream.clone(),
        };
        if let Err(e) = self.shared.signal(peer, offer) {
            self.shared.state.lock().calls.remove(&call);
            return Err(e);
        }
        Ok(call)
    }

    fn answer(&mut self, call: CallId, stream: &MediaStream) -> Result<(), TransportError> {
        let (peer, offered) = {
            let mut state = self.shared.state.lock();
            let entry = state.calls.get_mut(&call).ok_or(TransportError::UnknownCall(call))?;
            (entry.peer.clone(), entry.offered.take())
        };

        self.shared.signal(
            &peer,
            SignalPayload::CallAnswer {
                call,
                stream: stream.clone(),
            },
        )?;
        if let Some(remote) = offered {
            self.shared.emit(TransportEvent::CallStream { call, stream: remote });
        }
        Ok(())
    }

    fn hang_up(&mut self, call: CallId) {
        let removed = self.shared.state.lock().calls.remove(&call);
        if let Some(entry) = removed {
            let _ = self.shared.signal(&entry.peer, SignalPayload::CallClose { call });
        }
    }

    fn reconnect(&mut self) -> Result<(), TransportError> {
        let local = self.require_local()?;
        let shared = self.shared.clone();
        let url = self.config.signaling_url();
        let timeout = self.config.connect_timeout();

        tokio::spawn(async move {
            match dial(&url, Some(local.clone()), timeout).await {
                Ok((id, writer, reader)) => {
                    if id != local {
                        log::warn!("Server reassigned identity {local} -> {id}");
                    }
                    attach(&shared, writer, reader);
                    log::info!("Reconnected to {url}");
                    shared.emit(TransportEvent::Open(id));
                }
                Err(e) => {
                    log::warn!("Reconnect to {url} failed: {e}");
                    shared.emit(TransportEvent::Error(e));
                    shared.emit(TransportEvent::Disconnected);
                }
            }
        });
        Ok(())
    }

    fn destroy(&mut self) {
        self.shared.destroyed.store(true, Ordering::SeqCst);
        self.shared.outgoing.lock().take();
        if let Some(reader) = self.shared.reader.lock().take() {
            reader.abort();
        }
        let mut state = self.shared.state.lock();
        state.pending.clear();
        state.links.clear();
        state.calls.clear();
        if let Some(local) = self.local.take() {
            log::info!("Relay transport {local} destroyed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn closed_port() -> u16 {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    #[tokio::test]
    async fn test_open_fails_without_server() {
        let config = SessionConfig {
            port: closed_port().await,
            connect_timeout_ms: 500,
            ..SessionConfig::default()
        };
        let (mut transport, _rx) = RelayTransport::new(config);

        let result = transport.open(None).await;
        assert!(matches!(result, Err(TransportError::Handshake(_))));
        assert!(transport.local_id().is_none());
    }

    #[test]
    fn test_operations_require_open() {
        let (mut transport, _rx) = RelayTransport::new(SessionConfig::default());
        assert_eq!(transport.connect(&PeerId::from("p2")), Err(TransportError::NotOpen));
        assert_eq!(transport.list_all_peers(), Err(TransportError::NotOpen));
        assert_eq!(transport.reconnect(), Err(TransportError::NotOpen));
        assert_eq!(
            transport.send(&PeerId::from("p2"), ConnectionId::new(), vec![1]),
            Err(SendError::NotOpen(PeerId::from("p2")))
        );
    }

    #[test]
    fn test_signal_connect_and_data() {
        let (transport, mut rx) = RelayTransport::new(SessionConfig::default());
        let conn = ConnectionId::new();
        let p2 = PeerId::from("p2");

        // No writer attached: the accept reply is dropped, the channel still opens.
        transport.shared.on_signal(p2.clone(), SignalPayload::Connect { conn });
        assert_eq!(
            rx.try_recv().unwrap(),
            TransportEvent::ConnectionOpened { peer: p2.clone(), conn, direction: Direction::Inbound }
        );

        transport.shared.on_signal(p2.clone(), SignalPayload::Data { conn, bytes: vec![7] });
        assert_eq!(
            rx.try_recv().unwrap(),
            TransportEvent::Data { peer: p2.clone(), conn, payload: vec![7] }
        );

        // Frames from another peer on the same id are ignored.
        transport.shared.on_signal(PeerId::from("p3"), SignalPayload::Data { conn, bytes: vec![8] });
        assert!(rx.try_recv().is_err());
        assert_eq!(transport.open_links(), 1);
    }

    #[test]
    fn test_peer_gone_closes_links_and_calls() {
        let (transport, mut rx) = RelayTransport::new(SessionConfig::default());
        let conn = ConnectionId::new();
        let call = CallId::new();
        let p2 = PeerId::from("p2");

        transport.shared.on_signal(p2.clone(), SignalPayload::Connect { conn });
        transport.shared.on_signal(
            p2.clone(),
            SignalPayload::CallOffer { call, modality: Modality::Voice, stream: MediaStream::new(true, false) },
        );
        let _ = rx.try_recv();
        let _ = rx.try_recv();

        transport.shared.dispatch(ServerMessage::PeerGone { id: p2.clone() });
        assert_eq!(rx.try_recv().unwrap(), TransportEvent::ConnectionClosed { peer: p2, conn });
        assert_eq!(rx.try_recv().unwrap(), TransportEvent::CallClosed { call });
        assert_eq!(transport.open_links(), 0);
    }

    #[test]
    fn test_link_loss_closes_every_channel() {
        let (transport, mut rx) = RelayTransport::new(SessionConfig::default());
        let conn = ConnectionId::new();
        let call = CallId::new();
        let p2 = PeerId::from("p2");
        let p3 = PeerId::from("p3");

        transport.shared.on_signal(p2.clone(), SignalPayload::Connect { conn });
        transport.shared.on_signal(
            p2.clone(),
            SignalPayload::CallOffer { call, modality: Modality::Video, stream: MediaStream::new(true, true) },
        );
        transport.shared.state.lock().pending.insert(ConnectionId::new(), p3.clone());
        let _ = rx.try_recv();
        let _ = rx.try_recv();

        transport.shared.on_link_lost();
        assert_eq!(
            rx.try_recv().unwrap(),
            TransportEvent::ConnectFailed { peer: p3.clone(), error: TransportError::PeerUnreachable(p3) }
        );
        assert_eq!(rx.try_recv().unwrap(), TransportEvent::ConnectionClosed { peer: p2, conn });
        assert_eq!(rx.try_recv().unwrap(), TransportEvent::CallClosed { call });
        assert_eq!(rx.try_recv().unwrap(), TransportEvent::Disconnected);
        assert_eq!(transport.open_links(), 0);
    }

    #[test]
    fn test_link_loss_after_destroy_is_silent() {
        let (mut transport, mut rx) = RelayTransport::new(SessionConfig::default());
        transport.shared.on_signal(PeerId::from("p2"), SignalPayload::Connect { conn: ConnectionId::new() });
        let _ = rx.try_recv();

        transport.destroy();
        transport.shared.on_link_lost();
        assert!(rx.try_recv().is_err());
    }
}
