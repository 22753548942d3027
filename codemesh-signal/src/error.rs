use codemesh_session::protocol::ProtocolError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SignalError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("invalid configuration: {0}")]
    Config(String),
}
