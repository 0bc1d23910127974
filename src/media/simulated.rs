//! Capture devices that produce no samples. Used by tests and the demo CLI.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use lumicore::types::call::MediaKind;

use super::{CaptureSource, LocalMedia, MediaDevices, MediaError, MediaTrack, TrackKind};

#[derive(Default)]
struct DeviceCounters {
    acquired: AtomicUsize,
    released: AtomicUsize,
}

struct SimulatedDevice(Arc<DeviceCounters>);

impl CaptureSource for SimulatedDevice {
    fn release(&self) {
        self.0.released.fetch_add(1, Ordering::SeqCst);
    }
}

/// Hands out silent tracks and counts how many are still held.
#[derive(Clone, Default)]
pub struct SimulatedMediaDevices {
    deny: Arc<AtomicBool>,
    delay_ms: Arc<AtomicU64>,
    counters: Arc<DeviceCounters>,
}

impl SimulatedMediaDevices {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse every following acquisition, as if the user declined the prompt.
    pub fn deny_permission(&self, deny: bool) {
        self.deny.store(deny, Ordering::SeqCst);
    }

    /// Make acquisitions take this long, as a permission prompt would.
    pub fn set_acquire_delay(&self, delay: Duration) {
        self.delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Tracks handed out so far.
    pub fn acquired_tracks(&self) -> usize {
        self.counters.acquired.load(Ordering::SeqCst)
    }

    /// Tracks handed out and not yet stopped.
    pub fn live_tracks(&self) -> usize {
        self.acquired_tracks() - self.counters.released.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MediaDevices for SimulatedMediaDevices {
    async fn acquire(&self, kind: MediaKind) -> Result<LocalMedia, MediaError> {
        let delay = self.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.deny.load(Ordering::SeqCst) {
            return Err(MediaError::PermissionDenied(kind));
        }

        let mut kinds = vec![TrackKind::Audio];
        if kind.has_video() {
            kinds.push(TrackKind::Video);
        }
        let tracks = kinds
            .into_iter()
            .map(|track_kind| {
                self.counters.acquired.fetch_add(1, Ordering::SeqCst);
                let source: Arc<dyn CaptureSource> =
                    Arc::new(SimulatedDevice(self.counters.clone()));
                Arc::new(MediaTrack::new(track_kind, Some(source)))
            })
            .collect::<Vec<_>>();
        debug!("Acquired {} simulated tracks for {kind} call", tracks.len());
        Ok(LocalMedia::new(kind, tracks))
    }
}
