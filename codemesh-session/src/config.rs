//! Session configuration.
//!
//! Defaults match the stock deployment: signaling on port 3000 under
//! `/peerjs`, two public STUN servers, and a 3 second reconnect delay.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Default signaling endpoint path, shared with the signaling server.
pub const DEFAULT_SIGNAL_PATH: &str = "/peerjs";

/// One ICE server entry for transports that negotiate direct channels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IceServer {
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Signaling host
    pub host: String,
    /// Signaling port
    pub port: u16,
    /// Signaling endpoint path; must match the server's
    pub path: String,
    /// Use wss:// instead of ws://
    pub secure: bool,
    /// Preferred local id, honoured by the server when free
    pub id_hint: Option<String>,
    /// STUN/TURN servers for a host-provided transport that opens direct
    /// channels. The relay and in-memory transports ignore them.
    pub ice_servers: Vec<IceServer>,
    /// Delay before the single reconnect attempt
    pub reconnect_delay_ms: u64,
    /// Outbound connects not acknowledged within this window fail
    pub connect_timeout_ms: u64,
    /// Capacity of the notice channel towards the UI
    pub event_capacity: usize,
    /// Verbosity for a host-provided transport (0 = silent, 3 = all).
    /// The bundled transports log through `log` and ignore it.
    pub debug: u8,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3000,
            path: DEFAULT_SIGNAL_PATH.to_string(),
            secure: false,
            id_hint: None,
            ice_servers: vec![
                IceServer { url: "stun:stun.l.google.com:19302".to_string() },
                IceServer { url: "stun:stun1.l.google.com:19302".to_string() },
            ],
            reconnect_delay_ms: 3000,
            connect_timeout_ms: 10_000,
            event_capacity: 256,
            debug: 3,
        }
    }
}

impl SessionConfig {
    /// Parse a JSON config; missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: SessionConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.path.starts_with('/') {
            return Err(ConfigError::InvalidPath(self.path.clone()));
        }
        Ok(())
    }

    /// Full WebSocket URL of the signaling endpoint.
    pub fn signaling_url(&self) -> String {
        let scheme = if self.secure { "wss" } else { "ws" };
        format!("{scheme}://{}:{}{}", self.host, self.port, self.path)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}
