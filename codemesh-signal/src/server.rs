//! WebSocket signaling server.
//!
//! ```text
//! Client A ──┐                      ┌── Client B
//!            ├── Directory (id → tx)┤
//! Client C ──┘    contacts          └── ...
//! ```
//!
//! Each client opens with `Open` and gets an id (its hint when free). After
//! that it may list peers and address `Signal` payloads to any registered id;
//! the server forwards them verbatim, tagged with the sender. It never looks
//! inside payloads. When a client leaves, every peer it exchanged signals
//! with gets `PeerGone`.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;

use codemesh_session::protocol::{ClientMessage, PeerId, ServerMessage};
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message;

use crate::config::SignalConfig;
use crate::error::SignalError;

/// Server statistics.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SignalStats {
    pub total_connections: u64,
    pub active_clients: usize,
    pub messages_relayed: u64,
    pub bytes_relayed: u64,
    pub relay_failures: u64,
    pub rejected_handshakes: u64,
}

type ClientTx = mpsc::UnboundedSender<Vec<u8>>;

/// Registered clients and who talked to whom.
#[derive(Default)]
struct Directory {
    clients: HashMap<PeerId, ClientTx>,
    /// Registration order, for `PeerList`
    order: Vec<PeerId>,
    contacts: HashMap<PeerId, HashSet<PeerId>>,
}

impl Directory {
    /// The hint when it is non-empty and free, otherwise a fresh UUID.
    fn assign(&self, hint: Option<PeerId>) -> PeerId {
        if let Some(hint) = hint {
            if !hint.as_str().trim().is_empty() && !self.clients.contains_key(&hint) {
                return hint;
            }
        }
        loop {
            let id = PeerId::random();
            if !self.clients.contains_key(&id) {
                return id;
            }
        }
    }

    fn register(&mut self, id: PeerId, tx: ClientTx) {
        self.clients.insert(id.clone(), tx);
        self.order.push(id);
    }

    fn link(&mut self, a: &PeerId, b: &PeerId) {
        self.contacts.entry(a.clone()).or_default().insert(b.clone());
        self.contacts.entry(b.clone()).or_default().insert(a.clone());
    }

    /// Unregister `id`; returns the senders of its contacts.
    fn remove(&mut self, id: &PeerId) -> Vec<ClientTx> {
        self.clients.remove(id);
        self.order.retain(|p| p != id);

        let contacts = self.contacts.remove(id).unwrap_or_default();
        let mut notify = Vec::with_capacity(contacts.len());
        for contact in contacts {
            if let Some(set) = self.contacts.get_mut(&contact) {
                set.remove(id);
            }
            if let Some(tx) = self.clients.get(&contact) {
                notify.push(tx.clone());
            }
        }
        notify
    }
}

/// The signaling server.
pub struct SignalServer {
    config: SignalConfig,
    directory: Arc<RwLock<Directory>>,
    stats: Arc<RwLock<SignalStats>>,
}

impl SignalServer {
    pub fn new(config: SignalConfig) -> Self {
        Self {
            config,
            directory: Arc::new(RwLock::new(Directory::default())),
            stats: Arc::new(RwLock::new(SignalStats::default())),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(SignalConfig::default())
    }

    pub fn config(&self) -> &SignalConfig {
        &self.config
    }

    pub async fn stats(&self) -> SignalStats {
        self.stats.read().await.clone()
    }

    /// Registered peer ids in registration order.
    pub async fn peers(&self) -> Vec<PeerId> {
        self.directory.read().await.order.clone()
    }

    /// Bind `bind_addr` and serve until the listener fails.
    pub async fn run(&self) -> Result<(), SignalError> {
        self.config.validate()?;
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!(
            "Signal server listening on {}{}",
            self.config.bind_addr,
            self.config.path
        );
        self.serve(listener).await
    }

    /// Accept loop over an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), SignalError> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let directory = self.directory.clone();
            let stats = self.stats.clone();
            let config = self.config.clone();

            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, directory, stats, config).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        directory: Arc<RwLock<Directory>>,
        stats: Arc<RwLock<SignalStats>>,
        config: SignalConfig,
    ) -> Result<(), SignalError> {
        let path = config.path.clone();
        let check_path = move |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
            if req.uri().path() == path {
                return Ok(resp);
            }
            let mut err = ErrorResponse::new(Some(format!("no signaling endpoint at {}", req.uri().path())));
            *err.status_mut() = StatusCode::NOT_FOUND;
            Err(err)
        };

        let ws_stream = match tokio_tungstenite::accept_hdr_async(stream, check_path).await {
            Ok(ws) => ws,
            Err(e) => {
                stats.write().await.rejected_handshakes += 1;
                return Err(e.into());
            }
        };
        stats.write().await.total_connections += 1;
        log::debug!("WebSocket connection established from {addr}");

        let (tx, rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let mut peer_id: Option<PeerId> = None;
        let result = Self::serve_client(ws_stream, tx, rx, &mut peer_id, &directory, &stats, &config).await;

        if let Some(id) = peer_id {
            let (notify, remaining) = {
                let mut dir = directory.write().await;
                let notify = dir.remove(&id);
                (notify, dir.clients.len())
            };
            let gone = ServerMessage::PeerGone { id: id.clone() }.encode()?;
            for contact in notify {
                let _ = contact.send(gone.clone());
            }
            stats.write().await.active_clients = remaining;
            log::info!("Client disconnected: {id}");
        }
        result
    }

    async fn serve_client(
        ws_stream: tokio_tungstenite::WebSocketStream<TcpStream>,
        tx: ClientTx,
        mut rx: mpsc::UnboundedReceiver<Vec<u8>>,
        peer_id: &mut Option<PeerId>,
        directory: &RwLock<Directory>,
        stats: &RwLock<SignalStats>,
        config: &SignalConfig,
    ) -> Result<(), SignalError> {
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        loop {
            tokio::select! {
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Binary(data))) => {
                            let bytes: Vec<u8> = data.into();
                            match ClientMessage::decode(&bytes) {
                                Ok(client_msg) => {
                                    Self::on_message(client_msg, peer_id, &tx, directory, stats, config).await?;
                                }
                                Err(e) => {
                                    log::warn!("Undecodable message: {e}");
                                    reply(&tx, ServerMessage::Error { reason: e.to_string() })?;
                                }
                            }
                        }
                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                        }
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Err(e)) => {
                            log::warn!("WebSocket receive error: {e}");
                            break;
                        }
                        _ => {}
                    }
                }
                Some(frame) = rx.recv() => {
                    ws_sender.send(Message::Binary(frame.into())).await?;
                }
            }
        }
        Ok(())
    }

    async fn on_message(
        msg: ClientMessage,
        peer_id: &mut Option<PeerId>,
        tx: &ClientTx,
        directory: &RwLock<Directory>,
        stats: &RwLock<SignalStats>,
        config: &SignalConfig,
    ) -> Result<(), SignalError> {
        match msg {
            ClientMessage::Open { hint } => {
                if let Some(id) = peer_id {
                    return reply(tx, ServerMessage::Error { reason: format!("already open as {id}") });
                }
                let registered = {
                    let mut dir = directory.write().await;
                    if dir.clients.len() >= config.client_capacity {
                        None
                    } else {
                        let id = dir.assign(hint);
                        dir.register(id.clone(), tx.clone());
                        Some((id, dir.clients.len()))
                    }
                };
                let Some((id, active)) = registered else {
                    log::warn!("Rejecting client: server full");
                    return reply(tx, ServerMessage::Error { reason: "server full".into() });
                };

                stats.write().await.active_clients = active;
                log::info!("Client connected: {id}");
                *peer_id = Some(id.clone());
                reply(tx, ServerMessage::IdAssigned { id })
            }
            ClientMessage::ListPeers => {
                if peer_id.is_none() {
                    return reply(tx, ServerMessage::Error { reason: "open first".into() });
                }
                if !config.allow_discovery {
                    return reply(tx, ServerMessage::PeerListDenied { reason: "peer discovery disabled".into() });
                }
                let peers = directory.read().await.order.clone();
                reply(tx, ServerMessage::PeerList { peers })
            }
            ClientMessage::Signal { to, payload } => {
                let Some(from) = peer_id.clone() else {
                    return reply(tx, ServerMessage::Error { reason: "open first".into() });
                };

                let frame = ServerMessage::Signal { from: from.clone(), payload }.encode()?;
                let len = frame.len() as u64;
                let target = {
                    let mut dir = directory.write().await;
                    let target = dir.clients.get(&to).cloned();
                    if target.is_some() {
                        dir.link(&from, &to);
                    }
                    target
                };

                let delivered = target.is_some_and(|t| t.send(frame).is_ok());
                let mut s = stats.write().await;
                if delivered {
                    s.messages_relayed += 1;
                    s.bytes_relayed += len;
                    Ok(())
                } else {
                    s.relay_failures += 1;
                    drop(s);
                    log::debug!("Cannot relay from {from}: {to} is not connected");
                    reply(tx, ServerMessage::SignalFailed { to, reason: "peer not connected".into() })
                }
            }
        }
    }
}

fn reply(tx: &ClientTx, msg: ServerMessage) -> Result<(), SignalError> {
    let bytes = msg.encode()?;
    let _ = tx.send(bytes);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sender() -> (ClientTx, mpsc::UnboundedReceiver<Vec<u8>>) {
        mpsc::unbounded_channel()
    }

    #[test]
    fn test_assign_honours_free_hint() {
        let mut dir = Directory::default();
        let id = dir.assign(Some(PeerId::from("alice")));
        assert_eq!(id, PeerId::from("alice"));
        dir.register(id, sender().0);

        let taken = dir.assign(Some(PeerId::from("alice")));
        assert_ne!(taken, PeerId::from("alice"));
        let blank = dir.assign(Some(PeerId::from("  ")));
        assert_ne!(blank, PeerId::from("  "));
    }

    #[test]
    fn test_remove_returns_contacts_only() {
        let mut dir = Directory::default();
        let (a_tx, _a) = sender();
        let (b_tx, mut b_rx) = sender();
        let (c_tx, mut c_rx) = sender();
        dir.register(PeerId::from("a"), a_tx);
        dir.register(PeerId::from("b"), b_tx);
        dir.register(PeerId::from("c"), c_tx);
        dir.link(&PeerId::from("a"), &PeerId::from("b"));

        let notify = dir.remove(&PeerId::from("a"));
        assert_eq!(notify.len(), 1);
        notify[0].send(vec![1]).unwrap();
        assert_eq!(b_rx.try_recv().unwrap(), vec![1]);
        assert!(c_rx.try_recv().is_err());

        assert_eq!(dir.order, vec![PeerId::from("b"), PeerId::from("c")]);
        assert!(dir.contacts.get(&PeerId::from("b")).is_some_and(|s| s.is_empty()));
    }
}
