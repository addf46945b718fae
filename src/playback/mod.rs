/// Playback arbitration between the premium streaming device and preview clips
use crate::models::{AccountTier, Track};
use async_trait::async_trait;
use serde::Serialize;
use std::fmt;
use thiserror::Error;

pub mod audio_output;
pub mod controller;
pub mod preview;
pub mod privileged;
pub mod queue;
pub mod spotify_session;

pub use audio_output::{AudioError, AudioEvent, AudioOutput, RodioOutput, SourceEvent};
pub use controller::{ControllerConfig, PlaybackController};
pub use preview::PreviewAdapter;
pub use privileged::{DeviceError, DeviceEvent, DeviceState, PrivilegedAdapter, StreamingDevice};
pub use queue::Queue;
pub use spotify_session::LibrespotDevice;

/// Which adapter is producing audio
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Privileged,
    Preview,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Privileged => write!(f, "privileged"),
            BackendKind::Preview => write!(f, "preview"),
        }
    }
}

/// Premium accounts with a registered device stream full tracks; everyone else gets previews
pub fn select_backend(tier: AccountTier, device_ready: bool) -> BackendKind {
    if tier.is_premium() && device_ready {
        BackendKind::Privileged
    } else {
        BackendKind::Preview
    }
}

/// What an adapter currently reports about its media source
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BackendSnapshot {
    pub track_id: Option<String>,
    pub is_playing: bool,
    pub position_ms: u64,
    pub duration_ms: u64,
    pub volume: f32,
    pub device_ready: bool,
}

/// Asynchronous notifications from adapters to the controller
#[derive(Debug, Clone, PartialEq)]
pub enum BackendEvent {
    Snapshot {
        backend: BackendKind,
        snapshot: BackendSnapshot,
    },
    /// Privileged device registered or went away
    ReadinessChanged { ready: bool },
    /// Natural end of the loaded track
    TrackEnded {
        backend: BackendKind,
        track_id: String,
    },
    /// Non-fatal failure the UI may show as a hint
    TransportCommandFailed {
        backend: BackendKind,
        command: &'static str,
        reason: String,
    },
}

/// Result of asking an adapter to play a track
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlayOutcome {
    Started,
    /// Preview adapter: the track has no clip
    NoPreviewAvailable,
    /// Privileged adapter: no device registered
    NotReady,
    Failed(String),
}

/// A transport command that did not reach the media source
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{command} failed: {reason}")]
pub struct TransportCommandFailed {
    pub command: &'static str,
    pub reason: String,
}

impl TransportCommandFailed {
    pub fn new(command: &'static str, reason: impl fmt::Display) -> Self {
        Self {
            command,
            reason: reason.to_string(),
        }
    }
}

/// Command surface shared by both adapters
#[async_trait]
pub trait PlaybackBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Load and start `track`; `context` is the queue it was chosen from
    async fn play(&self, track: &Track, context: &[Track]) -> PlayOutcome;

    async fn toggle_play(&self) -> Result<(), TransportCommandFailed>;

    async fn pause(&self) -> Result<(), TransportCommandFailed>;

    async fn seek(&self, position_ms: u64) -> Result<(), TransportCommandFailed>;

    async fn set_volume(&self, volume: f32) -> Result<(), TransportCommandFailed>;

    fn snapshot(&self) -> BackendSnapshot;
}

/// The single view of playback published to the UI
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UnifiedPlaybackState {
    /// `None` while nothing is current
    pub active_backend: Option<BackendKind>,
    pub current_track: Option<Track>,
    pub is_playing: bool,
    pub position_ms: u64,
    pub duration_ms: u64,
    pub volume: f32,
    pub device_ready: bool,
    pub no_preview_available: bool,
    pub playback_unavailable: bool,
    /// Last transient transport failure, cleared by the next successful command
    pub transport_hint: Option<String>,
    pub queue_index: usize,
    pub queue_length: usize,
}

impl Default for UnifiedPlaybackState {
    fn default() -> Self {
        Self {
            active_backend: None,
            current_track: None,
            is_playing: false,
            position_ms: 0,
            duration_ms: 0,
            volume: 1.0,
            device_ready: false,
            no_preview_available: false,
            playback_unavailable: false,
            transport_hint: None,
            queue_index: 0,
            queue_length: 0,
        }
    }
}

/// Clamp a requested volume into [0, 1]; NaN becomes silence
pub fn clamp_volume(volume: f32) -> f32 {
    if volume.is_nan() {
        0.0
    } else {
        volume.clamp(0.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_select_backend_truth_table() {
        assert_eq!(
            select_backend(AccountTier::Premium, true),
            BackendKind::Privileged
        );
        assert_eq!(
            select_backend(AccountTier::Premium, false),
            BackendKind::Preview
        );
        assert_eq!(select_backend(AccountTier::Free, true), BackendKind::Preview);
        assert_eq!(select_backend(AccountTier::Free, false), BackendKind::Preview);
    }

    #[test]
    fn test_clamp_volume() {
        assert_eq!(clamp_volume(-0.5), 0.0);
        assert_eq!(clamp_volume(1.7), 1.0);
        assert_eq!(clamp_volume(0.25), 0.25);
        assert_eq!(clamp_volume(f32::NAN), 0.0);
    }
}
