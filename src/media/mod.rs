//! Local media capture.
//!
//! Capture itself is platform work behind [`MediaDevices`]. A call only needs
//! to own the resulting tracks, flip their enabled flags and release them.

pub mod simulated;

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use log::debug;
use lumicore::types::call::MediaKind;
use thiserror::Error;

pub use simulated::SimulatedMediaDevices;

#[derive(Debug, Error)]
pub enum MediaError {
    #[error("permission to capture {0} was denied")]
    PermissionDenied(MediaKind),

    #[error("capture device unavailable: {0}")]
    DeviceUnavailable(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    Audio,
    Video,
}

/// The device behind a track. Released once, when the track stops.
pub trait CaptureSource: Send + Sync {
    fn release(&self);
}

pub struct MediaTrack {
    id: String,
    kind: TrackKind,
    enabled: AtomicBool,
    live: AtomicBool,
    source: Option<Arc<dyn CaptureSource>>,
}

impl MediaTrack {
    pub fn new(kind: TrackKind, source: Option<Arc<dyn CaptureSource>>) -> Self {
        let id: [u8; 8] = rand::random();
        Self {
            id: hex::encode(id),
            kind,
            enabled: AtomicBool::new(true),
            live: AtomicBool::new(true),
            source,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    pub fn stop(&self) {
        if self.live.swap(false, Ordering::SeqCst) {
            debug!("Stopping {:?} track {}", self.kind, self.id);
            if let Some(source) = &self.source {
                source.release();
            }
        }
    }
}

impl fmt::Debug for MediaTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaTrack")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("enabled", &self.is_enabled())
            .field("live", &self.is_live())
            .finish()
    }
}

/// Tracks captured for one call. Stops them when dropped.
#[derive(Debug)]
pub struct LocalMedia {
    kind: MediaKind,
    tracks: Vec<Arc<MediaTrack>>,
}

impl LocalMedia {
    pub fn new(kind: MediaKind, tracks: Vec<Arc<MediaTrack>>) -> Self {
        Self { kind, tracks }
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    pub fn tracks(&self) -> &[Arc<MediaTrack>] {
        &self.tracks
    }

    fn tracks_of(&self, kind: TrackKind) -> impl Iterator<Item = &Arc<MediaTrack>> {
        self.tracks.iter().filter(move |t| t.kind() == kind)
    }

    pub fn set_audio_enabled(&self, enabled: bool) {
        self.tracks_of(TrackKind::Audio)
            .for_each(|t| t.set_enabled(enabled));
    }

    pub fn set_video_enabled(&self, enabled: bool) {
        self.tracks_of(TrackKind::Video)
            .for_each(|t| t.set_enabled(enabled));
    }

    pub fn is_audio_enabled(&self) -> bool {
        self.tracks_of(TrackKind::Audio).any(|t| t.is_enabled())
    }

    pub fn is_video_enabled(&self) -> bool {
        self.tracks_of(TrackKind::Video).any(|t| t.is_enabled())
    }

    pub fn has_video(&self) -> bool {
        self.tracks_of(TrackKind::Video).next().is_some()
    }

    pub fn stop(&self) {
        self.tracks.iter().for_each(|t| t.stop());
    }
}

impl Drop for LocalMedia {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Grants access to the microphone and camera.
#[async_trait]
pub trait MediaDevices: Send + Sync {
    /// Microphone for [`MediaKind::Audio`], microphone and camera for
    /// [`MediaKind::Video`].
    async fn acquire(&self, kind: MediaKind) -> Result<LocalMedia, MediaError>;
}
