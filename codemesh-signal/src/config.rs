//! Signaling server configuration.

use codemesh_session::config::DEFAULT_SIGNAL_PATH;

use crate::error::SignalError;

/// Port used when `PORT` is not set.
pub const DEFAULT_PORT: u16 = 3000;

#[derive(Debug, Clone, PartialEq)]
pub struct SignalConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// WebSocket upgrade path; other paths get a 404
    pub path: String,
    /// Answer `ListPeers` requests
    pub allow_discovery: bool,
    /// Maximum simultaneously registered clients
    pub client_capacity: usize,
}

impl Default for SignalConfig {
    fn default() -> Self {
        Self {
            bind_addr: format!("0.0.0.0:{DEFAULT_PORT}"),
            path: DEFAULT_SIGNAL_PATH.to_string(),
            allow_discovery: true,
            client_capacity: 1024,
        }
    }
}

impl SignalConfig {
    /// Defaults, with the port taken from `PORT` when set.
    pub fn from_env() -> Result<Self, SignalError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`SignalConfig::from_env`] with an injectable variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, SignalError> {
        let mut config = Self::default();
        if let Some(raw) = lookup("PORT") {
            let port: u16 = raw
                .trim()
                .parse()
                .map_err(|_| SignalError::Config(format!("PORT is not a valid port: {raw:?}")))?;
            config.bind_addr = format!("0.0.0.0:{port}");
        }
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), SignalError> {
        if !self.path.starts_with('/') {
            return Err(SignalError::Config(format!("path must start with '/': {:?}", self.path)));
        }
        if self.client_capacity == 0 {
            return Err(SignalError::Config("client_capacity must be at least 1".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SignalConfig::default();
        assert_eq!(config.bind_addr, "0.0.0.0:3000");
        assert_eq!(config.path, "/peerjs");
        assert!(config.allow_discovery);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_port_from_lookup() {
        let config = SignalConfig::from_lookup(|key| (key == "PORT").then(|| "8080".to_string())).unwrap();
        assert_eq!(config.bind_addr, "0.0.0.0:8080");

        let config = SignalConfig::from_lookup(|_| None).unwrap();
        assert_eq!(config.bind_addr, "0.0.0.0:3000");
    }

    #[test]
    fn test_bad_port_rejected() {
        let err = SignalConfig::from_lookup(|_| Some("eighty".to_string())).unwrap_err();
        assert!(matches!(err, SignalError::Config(_)));
    }

    #[test]
    fn test_validate_path() {
        let config = SignalConfig {
            path: "peerjs".into(),
            ..SignalConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
