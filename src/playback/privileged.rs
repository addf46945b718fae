/// Full-track streaming adapter around a vendor device session
use super::{
    BackendEvent, BackendKind, BackendSnapshot, PlayOutcome, PlaybackBackend,
    TransportCommandFailed,
};
use crate::models::{track_id_from_uri, Track};
use async_trait::async_trait;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("Device is not connected")]
    NotConnected,
    #[error("Device session failed: {0}")]
    Session(String),
    #[error("Invalid track uri: {0}")]
    InvalidUri(String),
    #[error("Device command failed: {0}")]
    Command(String),
}

/// Playback state pushed by the device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceState {
    pub track_uri: String,
    pub paused: bool,
    pub position_ms: u64,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    Ready { device_id: String },
    NotReady,
    /// `None` when the device has nothing loaded any more
    StateChanged(Option<DeviceState>),
    /// Carries the uri that finished so a late report cannot end its successor
    EndOfTrack { track_uri: String },
    Error(String),
}

/// Vendor device session. Owned exclusively by [`PrivilegedAdapter`].
#[async_trait]
pub trait StreamingDevice: Send + Sync {
    /// Register the device; returns its id
    async fn connect(&self, access_token: &str) -> Result<String, DeviceError>;

    async fn disconnect(&self);

    async fn load(&self, track_uri: &str, start_playing: bool) -> Result<(), DeviceError>;

    async fn resume(&self) -> Result<(), DeviceError>;

    async fn pause(&self) -> Result<(), DeviceError>;

    async fn seek(&self, position_ms: u32) -> Result<(), DeviceError>;

    async fn set_volume(&self, volume: f32) -> Result<(), DeviceError>;

    /// Event stream; yields `Some` once
    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<DeviceEvent>>;
}

/// Lifecycle of the device session as seen by the adapter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceStatus {
    Uninitialized,
    Connecting,
    Ready,
    Active,
    Idle,
    Disconnected,
}

impl DeviceStatus {
    pub fn is_ready(self) -> bool {
        matches!(
            self,
            DeviceStatus::Ready | DeviceStatus::Active | DeviceStatus::Idle
        )
    }
}

struct PrivilegedState {
    status: DeviceStatus,
    device_id: Option<String>,
    /// Track uris of the queue the current track was played from
    context: Vec<String>,
    current_uri: Option<String>,
    snapshot: BackendSnapshot,
}

impl PrivilegedState {
    /// Whether a device report concerns the track we last loaded
    fn is_current(&self, track_uri: &str) -> bool {
        self.current_uri.as_deref().map_or(true, |uri| uri == track_uri)
    }
}

pub struct PrivilegedAdapter {
    device: Arc<dyn StreamingDevice>,
    events: mpsc::UnboundedSender<BackendEvent>,
    state: Mutex<PrivilegedState>,
}

impl PrivilegedAdapter {
    pub fn new(device: Arc<dyn StreamingDevice>, events: mpsc::UnboundedSender<BackendEvent>) -> Self {
        Self {
            device,
            events,
            state: Mutex::new(PrivilegedState {
                status: DeviceStatus::Uninitialized,
                device_id: None,
                context: Vec::new(),
                current_uri: None,
                snapshot: BackendSnapshot {
                    volume: 1.0,
                    ..Default::default()
                },
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, PrivilegedState> {
        // State holds plain values; a panic mid-update cannot leave it torn
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn emit(&self, event: BackendEvent) {
        if self.events.send(event).is_err() {
            tracing::trace!("No listener for privileged backend events");
        }
    }

    fn emit_snapshot(&self, snapshot: BackendSnapshot) {
        self.emit(BackendEvent::Snapshot {
            backend: BackendKind::Privileged,
            snapshot,
        });
    }

    pub fn status(&self) -> DeviceStatus {
        self.state().status
    }

    pub fn device_id(&self) -> Option<String> {
        self.state().device_id.clone()
    }

    /// Register the device with an access token
    pub async fn connect(&self, access_token: &str) -> Result<(), DeviceError> {
        {
            let mut state = self.state();
            if state.status.is_ready() {
                return Ok(());
            }
            state.status = DeviceStatus::Connecting;
        }
        tracing::info!(token_len = access_token.len(), "Connecting streaming device");

        match self.device.connect(access_token).await {
            Ok(device_id) => {
                self.handle_device_event(DeviceEvent::Ready { device_id });
                Ok(())
            }
            Err(e) => {
                tracing::error!("Streaming device failed to connect: {}", e);
                self.state().status = DeviceStatus::Disconnected;
                Err(e)
            }
        }
    }

    pub async fn disconnect(&self) {
        self.device.disconnect().await;
        self.handle_device_event(DeviceEvent::NotReady);
    }

    /// Forward device events into [`handle_device_event`](Self::handle_device_event)
    pub fn spawn_event_pump(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        let mut rx = self.device.take_events()?;
        let adapter = Arc::clone(self);
        Some(tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                adapter.handle_device_event(event);
            }
            tracing::debug!("Streaming device event stream closed");
        }))
    }

    /// Apply one device notification and republish it as a backend event
    pub fn handle_device_event(&self, event: DeviceEvent) {
        match event {
            DeviceEvent::Ready { device_id } => {
                let became_ready = {
                    let mut state = self.state();
                    let was_ready = state.status.is_ready();
                    if !was_ready {
                        state.status = DeviceStatus::Ready;
                    }
                    state.device_id = Some(device_id.clone());
                    state.snapshot.device_ready = true;
                    !was_ready
                };
                if became_ready {
                    tracing::info!(device_id = %device_id, "Streaming device ready");
                    self.emit(BackendEvent::ReadinessChanged { ready: true });
                }
            }
            DeviceEvent::NotReady => {
                let was_ready = {
                    let mut state = self.state();
                    let was_ready = state.status.is_ready();
                    state.status = DeviceStatus::Disconnected;
                    state.snapshot.device_ready = false;
                    state.snapshot.is_playing = false;
                    was_ready
                };
                if was_ready {
                    tracing::warn!("Streaming device went away");
                    self.emit(BackendEvent::ReadinessChanged { ready: false });
                }
            }
            DeviceEvent::StateChanged(device_state) => {
                let snapshot = {
                    let mut state = self.state();
                    if !state.status.is_ready() {
                        return;
                    }
                    match device_state {
                        Some(ds) if !state.is_current(&ds.track_uri) => {
                            tracing::trace!(uri = %ds.track_uri, "Dropping state for a replaced track");
                            return;
                        }
                        Some(ds) => {
                            if matches!(state.status, DeviceStatus::Active | DeviceStatus::Idle) {
                                state.status = if ds.paused {
                                    DeviceStatus::Idle
                                } else {
                                    DeviceStatus::Active
                                };
                            }
                            state.snapshot.track_id =
                                Some(track_id_from_uri(&ds.track_uri).to_string());
                            state.current_uri = Some(ds.track_uri);
                            state.snapshot.is_playing = !ds.paused;
                            state.snapshot.position_ms = ds.position_ms;
                            if ds.duration_ms > 0 {
                                state.snapshot.duration_ms = ds.duration_ms;
                            }
                        }
                        None => {
                            if state.status == DeviceStatus::Active {
                                state.status = DeviceStatus::Idle;
                            }
                            state.snapshot.is_playing = false;
                        }
                    }
                    state.snapshot.clone()
                };
                self.emit_snapshot(snapshot);
            }
            DeviceEvent::EndOfTrack { track_uri } => {
                {
                    let mut state = self.state();
                    if !state.is_current(&track_uri) {
                        tracing::debug!(uri = %track_uri, "Dropping end of a replaced track");
                        return;
                    }
                    state.snapshot.is_playing = false;
                    if state.status == DeviceStatus::Active {
                        state.status = DeviceStatus::Idle;
                    }
                }
                tracing::debug!(uri = %track_uri, "Streaming device reached end of track");
                self.emit(BackendEvent::TrackEnded {
                    backend: BackendKind::Privileged,
                    track_id: track_id_from_uri(&track_uri).to_string(),
                });
            }
            DeviceEvent::Error(reason) => {
                tracing::warn!("Streaming device error: {}", reason);
                self.emit(BackendEvent::TransportCommandFailed {
                    backend: BackendKind::Privileged,
                    command: "device",
                    reason,
                });
            }
        }
    }

    fn ensure_ready(&self, command: &'static str) -> Result<(), TransportCommandFailed> {
        if self.state().status.is_ready() {
            Ok(())
        } else {
            Err(TransportCommandFailed::new(command, "device not ready"))
        }
    }

    async fn load_uri(&self, command: &'static str, uri: String) -> Result<(), TransportCommandFailed> {
        self.ensure_ready(command)?;
        self.device
            .load(&uri, true)
            .await
            .map_err(|e| TransportCommandFailed::new(command, e))?;

        let snapshot = {
            let mut state = self.state();
            state.status = DeviceStatus::Active;
            state.snapshot.track_id = Some(track_id_from_uri(&uri).to_string());
            state.current_uri = Some(uri);
            state.snapshot.is_playing = true;
            state.snapshot.position_ms = 0;
            state.snapshot.clone()
        };
        self.emit_snapshot(snapshot);
        Ok(())
    }

    /// Step within the remembered context, wrapping at either end
    async fn step(&self, command: &'static str, forward: bool) -> Result<(), TransportCommandFailed> {
        let uri = {
            let state = self.state();
            if state.context.is_empty() {
                return Err(TransportCommandFailed::new(command, "no playback context"));
            }
            let len = state.context.len();
            let current = state
                .current_uri
                .as_ref()
                .and_then(|uri| state.context.iter().position(|u| u == uri))
                .unwrap_or(0);
            let target = if forward {
                (current + 1) % len
            } else if current == 0 {
                len - 1
            } else {
                current - 1
            };
            state.context[target].clone()
        };
        self.load_uri(command, uri).await
    }

    pub async fn next(&self) -> Result<(), TransportCommandFailed> {
        self.step("next", true).await
    }

    pub async fn previous(&self) -> Result<(), TransportCommandFailed> {
        self.step("previous", false).await
    }
}

#[async_trait]
impl PlaybackBackend for PrivilegedAdapter {
    fn kind(&self) -> BackendKind {
        BackendKind::Privileged
    }

    async fn play(&self, track: &Track, context: &[Track]) -> PlayOutcome {
        if !self.state().status.is_ready() {
            return PlayOutcome::NotReady;
        }

        {
            let mut state = self.state();
            state.context = if context.iter().any(|t| t.id == track.id) {
                context.iter().map(Track::uri).collect()
            } else {
                vec![track.uri()]
            };
            state.snapshot.duration_ms = track.duration_ms;
        }

        tracing::info!(track = %track.name, id = %track.id, "Streaming track");
        match self.load_uri("play", track.uri()).await {
            Ok(()) => PlayOutcome::Started,
            Err(e) => {
                tracing::warn!("{}", e);
                PlayOutcome::Failed(e.reason)
            }
        }
    }

    async fn toggle_play(&self) -> Result<(), TransportCommandFailed> {
        self.ensure_ready("toggle_play")?;
        let playing = self.state().snapshot.is_playing;
        let result = if playing {
            self.device.pause().await
        } else {
            self.device.resume().await
        };
        result.map_err(|e| TransportCommandFailed::new("toggle_play", e))?;

        let mut state = self.state();
        state.snapshot.is_playing = !playing;
        state.status = if playing {
            DeviceStatus::Idle
        } else {
            DeviceStatus::Active
        };
        Ok(())
    }

    async fn pause(&self) -> Result<(), TransportCommandFailed> {
        self.ensure_ready("pause")?;
        self.device
            .pause()
            .await
            .map_err(|e| TransportCommandFailed::new("pause", e))?;
        let mut state = self.state();
        state.snapshot.is_playing = false;
        if state.status == DeviceStatus::Active {
            state.status = DeviceStatus::Idle;
        }
        Ok(())
    }

    async fn seek(&self, position_ms: u64) -> Result<(), TransportCommandFailed> {
        self.ensure_ready("seek")?;
        let position = u32::try_from(position_ms).unwrap_or(u32::MAX);
        self.device
            .seek(position)
            .await
            .map_err(|e| TransportCommandFailed::new("seek", e))?;
        self.state().snapshot.position_ms = position_ms;
        Ok(())
    }

    async fn set_volume(&self, volume: f32) -> Result<(), TransportCommandFailed> {
        self.ensure_ready("set_volume")?;
        self.device
            .set_volume(volume)
            .await
            .map_err(|e| TransportCommandFailed::new("set_volume", e))?;
        self.state().snapshot.volume = volume;
        Ok(())
    }

    fn snapshot(&self) -> BackendSnapshot {
        self.state().snapshot.clone()
    }
}
