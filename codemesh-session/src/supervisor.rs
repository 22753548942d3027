//! Connection supervisor: user-visible status and automatic reconnect.
//!
//! When the signaling link drops and the session was not torn down, one
//! reconnect attempt is scheduled after a fixed delay. Attempts never
//! overlap, and teardown cancels a pending one. Peer links are not restored;
//! the session reports them as stale and the user rejoins.

use std::fmt;
use std::time::Duration;

use tokio::task::JoinHandle;

/// Coarse connectivity shown to the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Error(String),
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionStatus::Disconnected => f.write_str("Disconnected"),
            ConnectionStatus::Connecting => f.write_str("Connecting..."),
            ConnectionStatus::Connected => f.write_str("Connected"),
            ConnectionStatus::Error(reason) => write!(f, "Error: {reason}"),
        }
    }
}

/// Status plus the one-line message the status bar shows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusSnapshot {
    pub status: ConnectionStatus,
    pub detail: String,
}

/// A reconnect the caller has to schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectTicket {
    pub generation: u64,
    pub delay: Duration,
}

pub struct ConnectionSupervisor {
    status: ConnectionStatus,
    detail: String,
    link_up: bool,
    destroyed: bool,
    reconnect_delay: Duration,
    generation: u64,
    pending: Option<(u64, JoinHandle<()>)>,
    attempts: u64,
}

impl ConnectionSupervisor {
    pub fn new(reconnect_delay: Duration) -> Self {
        Self {
            status: ConnectionStatus::Disconnected,
            detail: "Disconnected".to_string(),
            link_up: false,
            destroyed: false,
            reconnect_delay,
            generation: 0,
            pending: None,
            attempts: 0,
        }
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        StatusSnapshot {
            status: self.status.clone(),
            detail: self.detail.clone(),
        }
    }

    pub fn status(&self) -> &ConnectionStatus {
        &self.status
    }

    pub fn detail(&self) -> &str {
        &self.detail
    }

    pub fn is_link_up(&self) -> bool {
        self.link_up
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    /// Reconnect attempts started so far.
    pub fn attempts(&self) -> u64 {
        self.attempts
    }

    pub fn reconnect_pending(&self) -> bool {
        self.pending.is_some()
    }

    pub fn connecting(&mut self) -> StatusSnapshot {
        self.set(ConnectionStatus::Connecting, "Connecting...")
    }

    /// Signaling link is (back) up.
    pub fn link_opened(&mut self) -> StatusSnapshot {
        self.link_up = true;
        self.set(ConnectionStatus::Connected, "Connected")
    }

    /// Informational message; status follows the link.
    pub fn note(&mut self, detail: impl Into<String>) -> StatusSnapshot {
        let status = if self.link_up {
            ConnectionStatus::Connected
        } else {
            ConnectionStatus::Disconnected
        };
        self.set(status, detail)
    }

    pub fn error(&mut self, reason: impl Into<String>) -> StatusSnapshot {
        let reason = reason.into();
        self.set(ConnectionStatus::Error(reason.clone()), reason)
    }

    /// The signaling link dropped. Returns a ticket when a reconnect should
    /// be scheduled; `None` after teardown or while one is already pending.
    pub fn on_disconnected(&mut self) -> (StatusSnapshot, Option<ReconnectTicket>) {
        self.link_up = false;
        let snapshot = self.set(ConnectionStatus::Disconnected, "Disconnected");
        if self.destroyed || self.pending.is_some() {
            return (snapshot, None);
        }

        self.generation += 1;
        log::info!("Signaling link lost, reconnecting in {:?}", self.reconnect_delay);
        let ticket = ReconnectTicket {
            generation: self.generation,
            delay: self.reconnect_delay,
        };
        (snapshot, Some(ticket))
    }

    /// Keep the timer task for a ticket so teardown can abort it.
    pub fn arm(&mut self, generation: u64, timer: JoinHandle<()>) {
        if self.destroyed || generation != self.generation {
            timer.abort();
            return;
        }
        if let Some((_, previous)) = self.pending.replace((generation, timer)) {
            previous.abort();
        }
    }

    /// The delay for `generation` elapsed. Returns whether to call
    /// `Transport::reconnect` now.
    pub fn on_reconnect_due(&mut self, generation: u64) -> bool {
        match &self.pending {
            Some((pending, _)) if *pending == generation && !self.destroyed => {
                self.pending = None;
                self.attempts += 1;
                self.set(ConnectionStatus::Connecting, "Reconnecting...");
                true
            }
            _ => false,
        }
    }

    /// Cancel any pending reconnect and refuse future ones.
    pub fn teardown(&mut self) -> StatusSnapshot {
        self.destroyed = true;
        self.link_up = false;
        if let Some((_, timer)) = self.pending.take() {
            timer.abort();
        }
        self.set(ConnectionStatus::Disconnected, "Disconnected")
    }

    fn set(&mut self, status: ConnectionStatus, detail: impl Into<String>) -> StatusSnapshot {
        self.status = status;
        self.detail = detail.into();
        self.snapshot()
    }
}

impl Drop for ConnectionSupervisor {
    fn drop(&mut self) {
        if let Some((_, timer)) = self.pending.take() {
            timer.abort();
        }
    }
}
