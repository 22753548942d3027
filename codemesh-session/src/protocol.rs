//! Wire protocol for peer data channels and the signaling link.
//!
//! Everything is bincode-encoded (serde), one message per frame:
//! ```text
//! peer ──► peer       PeerMessage::CodeChange { change }
//! client ──► server   ClientMessage  (Open / ListPeers / Signal)
//! server ──► client   ServerMessage  (IdAssigned / PeerList / Signal / ...)
//! ```
//!
//! Change events carry only the edited span and its replacement, never the
//! document, so a message is O(edit) in size.

use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::media::{MediaStream, Modality};

/// Opaque peer identifier assigned by the signaling server.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Fresh random identifier (used by the signaling server).
    pub fn random() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short display label for peer lists: first six characters + "...".
    pub fn short_label(&self) -> String {
        let head: String = self.0.chars().take(6).collect();
        format!("{head}...")
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for PeerId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Identifies one data channel between two peers. Both ends share the id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionId(pub Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0.simple())
    }
}

/// Identifies one media call. Chosen by the caller, echoed by the callee.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CallId(pub Uuid);

impl CallId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for CallId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "call-{}", self.0.simple())
    }
}

/// Line/column position in the shared document (both zero-based).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct Position {
    pub line: u32,
    pub ch: u32,
}

impl Position {
    pub fn new(line: u32, ch: u32) -> Self {
        Self { line, ch }
    }
}

/// Where an edit came from. Remote edits are never re-broadcast.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Provenance {
    Local,
    Remote,
}

/// A single replace-range edit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub from: Position,
    pub to: Position,
    /// Replacement text, one entry per line.
    pub text: Vec<String>,
    pub provenance: Provenance,
}

impl ChangeEvent {
    /// An edit typed by the local user.
    pub fn local(from: Position, to: Position, text: &str) -> Self {
        Self {
            from,
            to,
            text: text.split('\n').map(str::to_string).collect(),
            provenance: Provenance::Local,
        }
    }

    /// Same span and text, tagged as received from a peer.
    pub fn into_remote(self) -> Self {
        Self {
            provenance: Provenance::Remote,
            ..self
        }
    }

    pub fn is_local(&self) -> bool {
        self.provenance == Provenance::Local
    }

    /// Replacement text joined back into one string.
    pub fn joined_text(&self) -> String {
        self.text.join("\n")
    }
}

/// Messages exchanged over a peer data channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PeerMessage {
    CodeChange { change: ChangeEvent },
}

impl PeerMessage {
    pub fn code_change(change: ChangeEvent) -> Self {
        Self::CodeChange { change }
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode(bytes)
    }
}

/// Handshake and relay payloads addressed to one peer via the signaling server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SignalPayload {
    Connect { conn: ConnectionId },
    Accept { conn: ConnectionId },
    Data { conn: ConnectionId, bytes: Vec<u8> },
    Close { conn: ConnectionId },
    CallOffer { call: CallId, modality: Modality, stream: MediaStream },
    CallAnswer { call: CallId, stream: MediaStream },
    CallClose { call: CallId },
}

/// Client → signaling server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ClientMessage {
    /// Ask for an identity; the hint is honoured when not taken.
    Open { hint: Option<PeerId> },
    ListPeers,
    Signal { to: PeerId, payload: SignalPayload },
}

impl ClientMessage {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode(bytes)
    }
}

/// Signaling server → client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ServerMessage {
    IdAssigned { id: PeerId },
    PeerList { peers: Vec<PeerId> },
    PeerListDenied { reason: String },
    Signal { from: PeerId, payload: SignalPayload },
    SignalFailed { to: PeerId, reason: String },
    PeerGone { id: PeerId },
    Error { reason: String },
}

impl ServerMessage {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode(bytes)
    }
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, ProtocolError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| ProtocolError::Serialization(e.to_string()))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, ProtocolError> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
    Ok(value)
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
}
