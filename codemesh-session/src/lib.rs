//! # codemesh-session: Peer-mesh session layer for live code editing
//!
//! Connects a text editor to every other participant of a room over direct
//! peer channels, broadcasts edits, and sets up voice/video calls.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐  signaling (ws)   ┌─────────────────┐
//! │  Session A  │ ◄───────────────► │ codemesh-signal │
//! └──────┬──────┘                   └────────┬────────┘
//!        │      peer channel (CodeChange)    │
//!        ▼                                   ▼
//! ┌─────────────┐ ◄───────────────► ┌─────────────┐
//! │  Registry   │    media call     │  Session B  │
//! │  Broadcast  │ ◄───────────────► │             │
//! │  Calls      │                   └─────────────┘
//! │  Supervisor │
//! └─────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`transport`]: Transport contract plus in-memory and relay implementations
//! - [`registry`]: Open peer connections, one per peer id
//! - [`broadcast`]: Edit fan-out and echo-free remote application
//! - [`call`]: Per-peer voice/video call state
//! - [`supervisor`]: Status line and automatic reconnect
//! - [`session`]: Session context and event loop
//! - [`protocol`]: Binary wire protocol (bincode-encoded)

pub mod broadcast;
pub mod call;
pub mod config;
pub mod error;
pub mod media;
pub mod protocol;
pub mod registry;
pub mod session;
pub mod supervisor;
pub mod transport;

// Re-exports for convenience
pub use broadcast::{BroadcastReport, BroadcastStats, ChangeBroadcaster, Editor};
pub use call::{CallManager, CallOutcome, CallState};
pub use config::{IceServer, SessionConfig, DEFAULT_SIGNAL_PATH};
pub use error::{ConfigError, EditorError, MediaError, SendError, SessionError, TransportError};
pub use media::{CaptureGuard, HeadlessDevices, MediaConstraints, MediaDevices, MediaStream, Modality};
pub use protocol::{
    CallId, ChangeEvent, ClientMessage, ConnectionId, PeerId, PeerMessage, Position,
    ProtocolError, Provenance, ServerMessage, SignalPayload,
};
pub use registry::{PeerConnection, SessionRegistry};
pub use session::{LocalAction, Session, SessionEvent, SessionHandle, SessionNotice};
pub use supervisor::{ConnectionStatus, ConnectionSupervisor, StatusSnapshot};
pub use transport::{Direction, MemoryNetwork, MemoryTransport, RelayTransport, Transport, TransportEvent};
