//! Error taxonomy for the session layer.
//!
//! Nothing here escapes the event loop: handlers turn every error into a
//! status update. Only [`SessionError`] from `Session::start` reaches the caller.

use thiserror::Error;

use crate::media::Modality;
use crate::protocol::{CallId, PeerId, ProtocolError};

/// Failures of the signaling link or of connection setup.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransportError {
    #[error("signaling handshake failed: {0}")]
    Handshake(String),
    #[error("peer {0} unreachable")]
    PeerUnreachable(PeerId),
    #[error("transport not open")]
    NotOpen,
    #[error("signaling link closed")]
    Closed,
    #[error("peer discovery failed: {0}")]
    Discovery(String),
    #[error("unknown call {0}")]
    UnknownCall(CallId),
    #[error("signaling server error: {0}")]
    Server(String),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// A single message could not be handed to a peer's channel.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SendError {
    #[error("no open channel to {0}")]
    NotOpen(PeerId),
    #[error("channel to {0} closed")]
    ChannelClosed(PeerId),
    #[error(transparent)]
    Encode(#[from] ProtocolError),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum MediaError {
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("device unavailable: {0}")]
    Unavailable(String),
}

/// The text widget refused an edit.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("edit rejected: {0}")]
pub struct EditorError(pub String);

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid config: {0}")]
    Json(#[from] serde_json::Error),
    #[error("signaling path must start with '/': {0:?}")]
    InvalidPath(String),
}

/// Session-level outcomes, rendered as status text by the supervisor.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SessionError {
    #[error("Connection Error: {0}")]
    Transport(#[from] TransportError),
    #[error("Connection failed: peer {0} unreachable")]
    PeerUnreachable(PeerId),
    #[error("Send to {peer} failed: {source}")]
    Send { peer: PeerId, source: SendError },
    #[error("{} access denied", .modality.device_label())]
    MediaAccessDenied { modality: Modality, source: MediaError },
    #[error("Disconnected")]
    UnexpectedDisconnect,
    #[error("Please enter a room name")]
    RoomNameEmpty,
    #[error("Connection error: {reason}")]
    PeerConnection { peer: PeerId, reason: String },
    #[error("{modality} call error: {reason}")]
    Call { modality: Modality, reason: String },
    #[error("Peer discovery failed: {0}")]
    Discovery(String),
    #[error(transparent)]
    Editor(#[from] EditorError),
    #[error("session closed")]
    Closed,
}
