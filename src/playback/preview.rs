/// Preview-clip adapter around the local audio output
use super::audio_output::{AudioEvent, AudioOutput, SourceEvent};
use super::{
    BackendEvent, BackendKind, BackendSnapshot, PlayOutcome, PlaybackBackend,
    TransportCommandFailed,
};
use crate::models::Track;
use async_trait::async_trait;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreviewStatus {
    Empty,
    Loaded,
    Playing,
    Paused,
    Ended,
}

struct PreviewState {
    status: PreviewStatus,
    source_id: Option<u64>,
    snapshot: BackendSnapshot,
}

pub struct PreviewAdapter {
    output: Arc<dyn AudioOutput>,
    events: mpsc::UnboundedSender<BackendEvent>,
    fallback_duration_ms: u64,
    state: Mutex<PreviewState>,
}

impl PreviewAdapter {
    pub fn new(
        output: Arc<dyn AudioOutput>,
        events: mpsc::UnboundedSender<BackendEvent>,
        fallback_duration_ms: u64,
    ) -> Self {
        Self {
            output,
            events,
            fallback_duration_ms,
            state: Mutex::new(PreviewState {
                status: PreviewStatus::Empty,
                source_id: None,
                snapshot: BackendSnapshot {
                    volume: 1.0,
                    // Local output is always available
                    device_ready: true,
                    ..Default::default()
                },
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, PreviewState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn emit(&self, event: BackendEvent) {
        if self.events.send(event).is_err() {
            tracing::trace!("No listener for preview backend events");
        }
    }

    fn emit_snapshot(&self, snapshot: BackendSnapshot) {
        self.emit(BackendEvent::Snapshot {
            backend: BackendKind::Preview,
            snapshot,
        });
    }

    pub fn status(&self) -> PreviewStatus {
        self.state().status
    }

    pub fn spawn_event_pump(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        let mut rx = self.output.take_events()?;
        let adapter = Arc::clone(self);
        Some(tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                adapter.handle_audio_event(event);
            }
            tracing::debug!("Preview output event stream closed");
        }))
    }

    /// Apply one output notification; events from a replaced source are dropped
    pub fn handle_audio_event(&self, notice: SourceEvent) {
        let mut state = self.state();
        if state.source_id != Some(notice.source_id) {
            tracing::trace!(source_id = notice.source_id, "Dropping stale preview event");
            return;
        }

        match notice.event {
            AudioEvent::Loaded { duration_ms } => {
                if let Some(duration) = duration_ms.filter(|d| *d > 0) {
                    state.snapshot.duration_ms = duration;
                }
                let snapshot = state.snapshot.clone();
                drop(state);
                self.emit_snapshot(snapshot);
            }
            AudioEvent::TimeUpdate { position_ms } => {
                state.snapshot.position_ms = position_ms.min(state.snapshot.duration_ms);
                let snapshot = state.snapshot.clone();
                drop(state);
                self.emit_snapshot(snapshot);
            }
            AudioEvent::Ended => {
                state.status = PreviewStatus::Ended;
                state.snapshot.is_playing = false;
                state.snapshot.position_ms = state.snapshot.duration_ms;
                let snapshot = state.snapshot.clone();
                drop(state);
                tracing::debug!("Preview clip ended");
                let track_id = snapshot.track_id.clone().unwrap_or_default();
                self.emit_snapshot(snapshot);
                self.emit(BackendEvent::TrackEnded {
                    backend: BackendKind::Preview,
                    track_id,
                });
            }
            AudioEvent::Error(reason) => {
                if state.status == PreviewStatus::Playing {
                    state.status = PreviewStatus::Paused;
                }
                state.snapshot.is_playing = false;
                let snapshot = state.snapshot.clone();
                drop(state);
                self.emit_snapshot(snapshot);
                self.emit(BackendEvent::TransportCommandFailed {
                    backend: BackendKind::Preview,
                    command: "audio",
                    reason,
                });
            }
        }
    }

    fn resume(&self) -> Result<(), TransportCommandFailed> {
        let status = self.status();
        if status == PreviewStatus::Ended {
            self.output
                .seek(0)
                .map_err(|e| TransportCommandFailed::new("play", e))?;
        }
        self.output
            .play()
            .map_err(|e| TransportCommandFailed::new("play", e))?;

        let mut state = self.state();
        if status == PreviewStatus::Ended {
            state.snapshot.position_ms = 0;
        }
        state.status = PreviewStatus::Playing;
        state.snapshot.is_playing = true;
        Ok(())
    }
}

#[async_trait]
impl PlaybackBackend for PreviewAdapter {
    fn kind(&self) -> BackendKind {
        BackendKind::Preview
    }

    async fn play(&self, track: &Track, _context: &[Track]) -> PlayOutcome {
        let url = match track.preview_url.as_deref() {
            Some(url) if !url.is_empty() => url,
            _ => {
                tracing::info!(track = %track.name, "No preview available");
                if let Err(e) = self.output.stop() {
                    tracing::warn!("Failed to stop preview output: {}", e);
                }
                let mut state = self.state();
                state.status = PreviewStatus::Empty;
                state.source_id = None;
                state.snapshot.track_id = Some(track.id.clone());
                state.snapshot.is_playing = false;
                state.snapshot.position_ms = 0;
                state.snapshot.duration_ms = 0;
                return PlayOutcome::NoPreviewAvailable;
            }
        };

        let source_id = match self.output.load(url) {
            Ok(id) => id,
            Err(e) => return PlayOutcome::Failed(e.to_string()),
        };
        {
            let mut state = self.state();
            state.status = PreviewStatus::Loaded;
            state.source_id = Some(source_id);
            state.snapshot.track_id = Some(track.id.clone());
            state.snapshot.is_playing = false;
            state.snapshot.position_ms = 0;
            state.snapshot.duration_ms = self.fallback_duration_ms;
        }

        if let Err(e) = self.output.play() {
            return PlayOutcome::Failed(e.to_string());
        }
        let mut state = self.state();
        state.status = PreviewStatus::Playing;
        state.snapshot.is_playing = true;
        tracing::info!(track = %track.name, id = %track.id, "Playing preview");
        PlayOutcome::Started
    }

    async fn toggle_play(&self) -> Result<(), TransportCommandFailed> {
        match self.status() {
            PreviewStatus::Empty => Err(TransportCommandFailed::new(
                "toggle_play",
                "no preview loaded",
            )),
            PreviewStatus::Playing => self.pause().await,
            PreviewStatus::Loaded | PreviewStatus::Paused | PreviewStatus::Ended => self.resume(),
        }
    }

    async fn pause(&self) -> Result<(), TransportCommandFailed> {
        if self.status() != PreviewStatus::Playing {
            return Ok(());
        }
        self.output
            .pause()
            .map_err(|e| TransportCommandFailed::new("pause", e))?;
        let mut state = self.state();
        state.status = PreviewStatus::Paused;
        state.snapshot.is_playing = false;
        Ok(())
    }

    async fn seek(&self, position_ms: u64) -> Result<(), TransportCommandFailed> {
        if self.status() == PreviewStatus::Empty {
            return Err(TransportCommandFailed::new("seek", "no preview loaded"));
        }
        self.output
            .seek(position_ms)
            .map_err(|e| TransportCommandFailed::new("seek", e))?;
        let mut state = self.state();
        state.snapshot.position_ms = position_ms;
        if state.status == PreviewStatus::Ended {
            state.status = PreviewStatus::Paused;
        }
        Ok(())
    }

    async fn set_volume(&self, volume: f32) -> Result<(), TransportCommandFailed> {
        self.output
            .set_volume(volume)
            .map_err(|e| TransportCommandFailed::new("set_volume", e))?;
        self.state().snapshot.volume = volume;
        Ok(())
    }

    fn snapshot(&self) -> BackendSnapshot {
        self.state().snapshot.clone()
    }
}
