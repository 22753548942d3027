//! Media-capture collaborator: modalities, stream handles, and the capture
//! guard that releases a device exactly once.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::MediaError;

/// A media stream category tracked independently per peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Modality {
    Voice,
    Video,
}

impl Modality {
    pub const ALL: [Modality; 2] = [Modality::Voice, Modality::Video];

    /// Devices to capture: voice is audio only, video is camera plus microphone.
    pub fn constraints(self) -> MediaConstraints {
        match self {
            Modality::Voice => MediaConstraints { audio: true, video: false },
            Modality::Video => MediaConstraints { audio: true, video: true },
        }
    }

    /// Human name of the device the user is asked to grant.
    pub fn device_label(self) -> &'static str {
        match self {
            Modality::Voice => "Microphone",
            Modality::Video => "Camera",
        }
    }
}

impl fmt::Display for Modality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Modality::Voice => f.write_str("Voice"),
            Modality::Video => f.write_str("Video"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: bool,
}

/// Handle to a captured (local) or received (remote) stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MediaStream {
    pub id: Uuid,
    pub audio: bool,
    pub video: bool,
}

impl MediaStream {
    pub fn new(audio: bool, video: bool) -> Self {
        Self {
            id: Uuid::new_v4(),
            audio,
            video,
        }
    }

    pub fn with_constraints(constraints: MediaConstraints) -> Self {
        Self::new(constraints.audio, constraints.video)
    }
}

/// Host capture devices (getUserMedia and track teardown).
#[async_trait]
pub trait MediaDevices: Send + Sync {
    /// Acquire a local capture. May suspend on a permission prompt.
    async fn acquire(&self, constraints: MediaConstraints) -> Result<MediaStream, MediaError>;

    /// Stop every track of a stream previously returned by `acquire`.
    fn release(&self, stream: &MediaStream);
}

/// Owns one acquired capture; releases it when dropped.
///
/// Call sessions share a capture through `Arc<CaptureGuard>`, so the device
/// is stopped when the last holder goes away, on every exit path.
pub struct CaptureGuard {
    stream: MediaStream,
    devices: Arc<dyn MediaDevices>,
}

impl CaptureGuard {
    pub fn new(stream: MediaStream, devices: Arc<dyn MediaDevices>) -> Self {
        Self { stream, devices }
    }

    pub fn stream(&self) -> &MediaStream {
        &self.stream
    }
}

impl fmt::Debug for CaptureGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CaptureGuard").field("stream", &self.stream).finish()
    }
}

impl Drop for CaptureGuard {
    fn drop(&mut self) {
        log::debug!("Releasing local capture {}", self.stream.id);
        self.devices.release(&self.stream);
    }
}

/// Capture host without real devices: grants or denies on a switch and
/// tracks which streams are live.
#[derive(Debug, Default)]
pub struct HeadlessDevices {
    deny: Mutex<bool>,
    live: Mutex<HashSet<Uuid>>,
    acquired: Mutex<u64>,
}

impl HeadlessDevices {
    pub fn granting() -> Self {
        Self::default()
    }

    pub fn denying() -> Self {
        let devices = Self::default();
        devices.set_denied(true);
        devices
    }

    pub fn set_denied(&self, deny: bool) {
        *self.deny.lock() = deny;
    }

    /// Streams acquired and not yet released.
    pub fn live_count(&self) -> usize {
        self.live.lock().len()
    }

    pub fn acquired_count(&self) -> u64 {
        *self.acquired.lock()
    }
}

#[async_trait]
impl MediaDevices for HeadlessDevices {
    async fn acquire(&self, constraints: MediaConstraints) -> Result<MediaStream, MediaError> {
        if *self.deny.lock() {
            return Err(MediaError::PermissionDenied("capture not permitted".into()));
        }
        let stream = MediaStream::with_constraints(constraints);
        self.live.lock().insert(stream.id);
        *self.acquired.lock() += 1;
        Ok(stream)
    }

    fn release(&self, stream: &MediaStream) {
        self.live.lock().remove(&stream.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct CountingDevices {
        released: Mutex<Vec<Uuid>>,
    }

    #[async_trait]
    impl MediaDevices for CountingDevices {
        async fn acquire(&self, constraints: MediaConstraints) -> Result<MediaStream, MediaError> {
            Ok(MediaStream::with_constraints(constraints))
        }

        fn release(&self, stream: &MediaStream) {
            self.released.lock().push(stream.id);
        }
    }

    #[test]
    fn test_modality_constraints() {
        assert_eq!(Modality::Voice.constraints(), MediaConstraints { audio: true, video: false });
        assert_eq!(Modality::Video.constraints(), MediaConstraints { audio: true, video: true });
    }

    #[test]
    fn test_guard_releases_once_after_last_holder() {
        let devices = Arc::new(CountingDevices::default());
        let stream = MediaStream::new(true, false);
        let id = stream.id;

        let guard = Arc::new(CaptureGuard::new(stream, devices.clone()));
        let shared = guard.clone();
        drop(guard);
        assert!(devices.released.lock().is_empty());

        drop(shared);
        assert_eq!(*devices.released.lock(), vec![id]);
    }

    #[tokio::test]
    async fn test_headless_devices_track_live_streams() {
        let devices = Arc::new(HeadlessDevices::granting());
        let stream = devices.acquire(Modality::Voice.constraints()).await.unwrap();
        assert_eq!(devices.live_count(), 1);

        drop(CaptureGuard::new(stream, devices.clone()));
        assert_eq!(devices.live_count(), 0);
        assert_eq!(devices.acquired_count(), 1);

        devices.set_denied(true);
        let denied = devices.acquire(Modality::Video.constraints()).await;
        assert!(matches!(denied, Err(MediaError::PermissionDenied(_))));
    }

    #[tokio::test]
    async fn test_acquire_matches_constraints() {
        let devices = CountingDevices::default();
        let stream = devices.acquire(Modality::Video.constraints()).await.unwrap();
        assert!(stream.audio && stream.video);
    }
}
