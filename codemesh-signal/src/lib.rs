//! # codemesh-signal: Signaling server for codemesh sessions
//!
//! Assigns peer ids, answers peer discovery, and relays handshake and
//! channel frames between sessions connected with `RelayTransport`.
//!
//! ## Modules
//!
//! - [`server`]: WebSocket accept loop and per-client relay
//! - [`config`]: Bind address, endpoint path, discovery switch

pub mod config;
pub mod error;
pub mod server;

pub use config::{SignalConfig, DEFAULT_PORT};
pub use error::SignalError;
pub use server::{SignalServer, SignalStats};
