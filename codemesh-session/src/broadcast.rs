//! Fan-out of local edits to every connected peer, and application of
//! remote edits without echo.
//!
//! The change is encoded once and handed to each channel independently. A
//! failing channel is dropped from the registry and closed at the transport,
//! and the loop carries on, so one dead peer never blocks the others. Remote edits are applied with
//! provenance `Remote`, and `Remote` edits are never broadcast, which breaks
//! the widget → broadcast → widget loop.
//!
//! There is no ordering beyond what each link gives: concurrent edits from
//! different peers land in arrival order, last write wins.

use crate::error::EditorError;
use crate::protocol::{ChangeEvent, PeerId, PeerMessage, Position, ProtocolError, Provenance};
use crate::registry::SessionRegistry;
use crate::transport::Transport;

/// Text-editing widget collaborator.
pub trait Editor: Send {
    /// Replace `from..to` with `text` (one entry per line).
    fn apply_edit(&mut self, from: Position, to: Position, text: &[String], provenance: Provenance) -> Result<(), EditorError>;
}

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub peers_dropped: u64,
    pub remote_applied: u64,
    pub echoes_suppressed: u64,
}

/// Outcome of one local broadcast.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BroadcastReport {
    pub delivered: Vec<PeerId>,
    /// Peers whose send failed; already unregistered and closed
    pub dropped: Vec<PeerId>,
    /// The change was remote-tagged and not sent anywhere
    pub suppressed: bool,
}

#[derive(Debug, Default)]
pub struct ChangeBroadcaster {
    stats: BroadcastStats,
}

impl ChangeBroadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Send a local edit to every registered peer.
    pub fn broadcast_local(
        &mut self,
        change: &ChangeEvent,
        registry: &mut SessionRegistry,
        transport: &mut dyn Transport,
    ) -> Result<BroadcastReport, ProtocolError> {
        let mut report = BroadcastReport::default();
        if change.provenance == Provenance::Remote {
            self.stats.echoes_suppressed += 1;
            report.suppressed = true;
            return Ok(report);
        }

        let encoded = PeerMessage::code_change(change.clone()).encode()?;

        for conn in registry.connections() {
            match transport.send(&conn.peer, conn.id, encoded.clone()) {
                Ok(()) => {
                    self.stats.messages_sent += 1;
                    report.delivered.push(conn.peer);
                }
                Err(e) => {
                    log::error!("Error broadcasting change to {}: {e}", conn.peer);
                    self.stats.messages_dropped += 1;
                    self.stats.peers_dropped += 1;
                    registry.unregister(&conn.peer);
                    transport.close(&conn.peer, conn.id);
                    report.dropped.push(conn.peer);
                }
            }
        }

        log::debug!(
            "Broadcast change to {} peers ({} dropped)",
            report.delivered.len(),
            report.dropped.len()
        );
        Ok(report)
    }

    /// Decode a peer frame and apply it to the local document as `Remote`.
    ///
    /// Editor failures are logged, not propagated.
    pub fn apply_remote(&mut self, from: &PeerId, payload: &[u8], editor: &mut dyn Editor) -> Result<(), ProtocolError> {
        match PeerMessage::decode(payload)? {
            PeerMessage::CodeChange { change } => {
                let change = change.into_remote();
                match editor.apply_edit(change.from, change.to, &change.text, change.provenance) {
                    Ok(()) => self.stats.remote_applied += 1,
                    Err(e) => log::error!("Error applying code change from {from}: {e}"),
                }
            }
        }
        Ok(())
    }

    pub fn stats(&self) -> &BroadcastStats {
        &self.stats
    }
}
