//! Transport adapter: the signaling/connection capability the session drives.
//!
//! Operations only *initiate* work. Everything the network answers with
//! (inbound connections, data, call progress, link loss) comes back as a
//! [`TransportEvent`] on the receiver returned alongside the transport, in the
//! order the underlying link delivered it.
//!
//! - [`memory`]: in-process mesh with fault injection
//! - [`relay`]: WebSocket client of the codemesh signaling server

pub mod memory;
pub mod relay;

use async_trait::async_trait;

use crate::error::{SendError, TransportError};
use crate::media::{MediaStream, Modality};
use crate::protocol::{CallId, ConnectionId, PeerId};

pub use memory::{MemoryNetwork, MemoryTransport};
pub use relay::RelayTransport;

/// Which side opened a data channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

/// Events emitted by a transport.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// A reconnect attempt re-established the signaling link.
    Open(PeerId),
    /// The local signaling link dropped.
    Disconnected,
    /// Signaling-level failure.
    Error(TransportError),
    /// A data channel to `peer` is open (either direction).
    ConnectionOpened {
        peer: PeerId,
        conn: ConnectionId,
        direction: Direction,
    },
    ConnectionClosed {
        peer: PeerId,
        conn: ConnectionId,
    },
    ConnectionError {
        peer: PeerId,
        conn: ConnectionId,
        reason: String,
    },
    /// An outbound connect was never acknowledged.
    ConnectFailed {
        peer: PeerId,
        error: TransportError,
    },
    Data {
        peer: PeerId,
        conn: ConnectionId,
        payload: Vec<u8>,
    },
    /// Result of `list_all_peers`; includes the local id.
    PeerList(Vec<PeerId>),
    PeerListFailed(String),
    IncomingCall {
        peer: PeerId,
        call: CallId,
        modality: Modality,
    },
    /// The remote side answered and its stream is flowing.
    CallStream {
        call: CallId,
        stream: MediaStream,
    },
    CallClosed {
        call: CallId,
    },
    CallFailed {
        call: CallId,
        reason: String,
    },
}

/// Signaling and peer-connection primitive.
///
/// All calls are non-blocking except `open`, which waits for the
/// signaling handshake. Sends are fire-and-forget: no ack, no retry.
#[async_trait]
pub trait Transport: Send {
    /// Complete the signaling handshake and obtain the local identity.
    async fn open(&mut self, hint: Option<PeerId>) -> Result<PeerId, TransportError>;

    fn local_id(&self) -> Option<&PeerId>;

    /// Start an outbound channel; answered by `ConnectionOpened` or `ConnectFailed`.
    fn connect(&mut self, peer: &PeerId) -> Result<ConnectionId, TransportError>;

    /// Hand one message to an open channel.
    fn send(&mut self, peer: &PeerId, conn: ConnectionId, payload: Vec<u8>) -> Result<(), SendError>;

    fn close(&mut self, peer: &PeerId, conn: ConnectionId);

    /// Ask the signaling server for every known peer; answered by `PeerList`.
    fn list_all_peers(&mut self) -> Result<(), TransportError>;

    /// Offer a media call carrying `stream`; answered by `CallStream`.
    fn call(&mut self, peer: &PeerId, modality: Modality, stream: &MediaStream) -> Result<CallId, TransportError>;

    /// Accept an incoming call with the local stream.
    fn answer(&mut self, call: CallId, stream: &MediaStream) -> Result<(), TransportError>;

    fn hang_up(&mut self, call: CallId);

    /// Re-establish the signaling link, keeping the local id; answered by `Open`.
    fn reconnect(&mut self) -> Result<(), TransportError>;

    /// Tear everything down. No events are emitted afterwards.
    fn destroy(&mut self);
}
