//! Playback controller: picks the authoritative backend, owns the queue, and
//! publishes one [`UnifiedPlaybackState`] for the UI.
//!
//! Every operation and every backend event runs under a single async lock, so
//! a backend switch never interleaves with a transport command that is still
//! awaiting its backend.

use super::queue::Queue;
use super::{
    clamp_volume, select_backend, BackendEvent, BackendKind, PlayOutcome, PlaybackBackend,
    UnifiedPlaybackState,
};
use crate::config::PlaybackConfig;
use crate::models::{AccountTier, Track};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::{interval_at, Instant};

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Interval of the local position interpolation while streaming
    pub position_tick: Duration,
    pub initial_volume: f32,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            position_tick: Duration::from_millis(1000),
            initial_volume: 1.0,
        }
    }
}

impl From<&PlaybackConfig> for ControllerConfig {
    fn from(config: &PlaybackConfig) -> Self {
        Self {
            position_tick: Duration::from_millis(config.position_tick_ms.max(1)),
            initial_volume: clamp_volume(config.initial_volume),
        }
    }
}

struct Inner {
    tier: AccountTier,
    device_ready: bool,
    selected: BackendKind,
    /// Backend the current track was successfully started on
    loaded_on: Option<BackendKind>,
    queue: Queue,
    current_track: Option<Track>,
    is_playing: bool,
    position_ms: u64,
    duration_ms: u64,
    volume: f32,
    no_preview_available: bool,
    playback_unavailable: bool,
    transport_hint: Option<String>,
    ticker: Option<AbortHandle>,
    tick_generation: u64,
}

impl Inner {
    fn project(&self) -> UnifiedPlaybackState {
        UnifiedPlaybackState {
            active_backend: self.current_track.as_ref().map(|_| self.selected),
            current_track: self.current_track.clone(),
            is_playing: self.is_playing,
            position_ms: self.position_ms,
            duration_ms: self.duration_ms,
            volume: self.volume,
            device_ready: self.device_ready,
            no_preview_available: self.no_preview_available,
            playback_unavailable: self.playback_unavailable,
            transport_hint: self.transport_hint.clone(),
            queue_index: self.queue.current_index(),
            queue_length: self.queue.len(),
        }
    }

    fn clear_conditions(&mut self) {
        self.no_preview_available = false;
        self.playback_unavailable = false;
        self.transport_hint = None;
    }

    fn stop_ticker(&mut self) {
        self.tick_generation = self.tick_generation.wrapping_add(1);
        if let Some(ticker) = self.ticker.take() {
            ticker.abort();
        }
    }
}

struct Shared {
    inner: Mutex<Inner>,
    state_tx: watch::Sender<UnifiedPlaybackState>,
    privileged: Arc<dyn PlaybackBackend>,
    preview: Arc<dyn PlaybackBackend>,
    position_tick: Duration,
}

impl Shared {
    fn backend(&self, kind: BackendKind) -> &Arc<dyn PlaybackBackend> {
        match kind {
            BackendKind::Privileged => &self.privileged,
            BackendKind::Preview => &self.preview,
        }
    }

    fn publish(&self, inner: &Inner) {
        self.state_tx.send_replace(inner.project());
    }
}

/// Arbitrates between the two backends; cheap to clone
#[derive(Clone)]
pub struct PlaybackController {
    shared: Arc<Shared>,
}

impl PlaybackController {
    pub fn new(
        privileged: Arc<dyn PlaybackBackend>,
        preview: Arc<dyn PlaybackBackend>,
        config: ControllerConfig,
    ) -> Self {
        let device_ready = privileged.snapshot().device_ready;
        let inner = Inner {
            tier: AccountTier::Free,
            device_ready,
            selected: select_backend(AccountTier::Free, device_ready),
            loaded_on: None,
            queue: Queue::new(),
            current_track: None,
            is_playing: false,
            position_ms: 0,
            duration_ms: 0,
            volume: clamp_volume(config.initial_volume),
            no_preview_available: false,
            playback_unavailable: false,
            transport_hint: None,
            ticker: None,
            tick_generation: 0,
        };
        let (state_tx, _) = watch::channel(inner.project());

        Self {
            shared: Arc::new(Shared {
                inner: Mutex::new(inner),
                state_tx,
                privileged,
                preview,
                position_tick: config.position_tick,
            }),
        }
    }

    /// Latest published state
    pub fn state(&self) -> UnifiedPlaybackState {
        self.shared.state_tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<UnifiedPlaybackState> {
        self.shared.state_tx.subscribe()
    }

    /// Apply backend events in arrival order until the channel closes
    pub fn spawn_event_loop(&self, mut events: mpsc::UnboundedReceiver<BackendEvent>) -> JoinHandle<()> {
        let controller = self.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                controller.handle_event(event).await;
            }
            tracing::debug!("Backend event channel closed");
        })
    }

    pub async fn set_account_tier(&self, tier: AccountTier) {
        let mut inner = self.shared.inner.lock().await;
        if inner.tier != tier {
            tracing::info!(tier = %tier, "Account tier changed");
        }
        inner.tier = tier;
        reselect(&self.shared, &mut inner).await;
    }

    /// Play `track`, replacing the queue when one is given
    pub async fn play_track(&self, track: Track, queue: Option<Vec<Track>>) {
        let mut inner = self.shared.inner.lock().await;
        match queue {
            Some(tracks) => inner.queue.replace(tracks, &track.id),
            None => {
                if let Some(index) = inner.queue.position_of(&track.id) {
                    inner.queue.select(index);
                }
            }
        }
        load_track(&self.shared, &mut inner, track).await;
    }

    pub async fn toggle_play(&self) {
        let mut inner = self.shared.inner.lock().await;
        if inner.current_track.is_none() {
            return;
        }

        if inner.loaded_on != Some(inner.selected) {
            // Not started on this backend yet (fresh switch or earlier failure)
            start_current(&self.shared, &mut inner).await;
            self.shared.publish(&inner);
            return;
        }

        let kind = inner.selected;
        match self.shared.backend(kind).toggle_play().await {
            Ok(()) => {
                inner.is_playing = !inner.is_playing;
                inner.transport_hint = None;
                sync_ticker(&self.shared, &mut inner);
            }
            Err(e) => {
                tracing::warn!(backend = %kind, "{}", e);
                inner.transport_hint = Some(e.to_string());
            }
        }
        self.shared.publish(&inner);
    }

    pub async fn next(&self) {
        let mut inner = self.shared.inner.lock().await;
        step(&self.shared, &mut inner, true).await;
    }

    pub async fn previous(&self) {
        let mut inner = self.shared.inner.lock().await;
        step(&self.shared, &mut inner, false).await;
    }

    /// Seek within the current track, clamped to its duration
    pub async fn seek(&self, position_ms: u64) {
        let mut inner = self.shared.inner.lock().await;
        if inner.current_track.is_none() || inner.loaded_on != Some(inner.selected) {
            return;
        }
        let target = position_ms.min(inner.duration_ms);
        let kind = inner.selected;

        match self.shared.backend(kind).seek(target).await {
            Ok(()) => {
                inner.position_ms = target;
                inner.transport_hint = None;
                sync_ticker(&self.shared, &mut inner);
            }
            Err(e) => {
                tracing::warn!(backend = %kind, "{}", e);
                inner.transport_hint = Some(e.to_string());
            }
        }
        self.shared.publish(&inner);
    }

    /// Set output volume, clamped to [0, 1]
    pub async fn set_volume(&self, volume: f32) {
        let mut inner = self.shared.inner.lock().await;
        let volume = clamp_volume(volume);
        inner.volume = volume;

        let kind = inner.selected;
        if let Err(e) = self.shared.backend(kind).set_volume(volume).await {
            tracing::debug!(backend = %kind, "{}", e);
            if inner.loaded_on == Some(kind) {
                inner.transport_hint = Some(e.to_string());
            }
        }
        self.shared.publish(&inner);
    }

    /// Apply one backend notification
    pub async fn handle_event(&self, event: BackendEvent) {
        let mut inner = self.shared.inner.lock().await;
        match event {
            BackendEvent::Snapshot { backend, snapshot } => {
                if inner.selected != backend || inner.loaded_on != Some(backend) {
                    tracing::trace!(backend = %backend, "Ignoring snapshot from inactive backend");
                    return;
                }

                if let Some(ref reported) = snapshot.track_id {
                    // Queued before a newer load on the same backend
                    let live = self.shared.backend(backend).snapshot().track_id;
                    if live.as_deref() != Some(reported.as_str()) {
                        tracing::trace!(track_id = %reported, "Ignoring snapshot for a replaced track");
                        return;
                    }
                }

                if backend == BackendKind::Privileged {
                    let current_id = inner.current_track.as_ref().map(|t| t.id.clone());
                    if let Some(ref reported) = snapshot.track_id {
                        if current_id.as_deref() != Some(reported.as_str()) {
                            // Device moved on by itself or via its own next/previous
                            match inner.queue.position_of(reported) {
                                Some(index) => {
                                    inner.queue.select(index);
                                    inner.current_track = inner.queue.current_track().cloned();
                                    inner.clear_conditions();
                                    tracing::debug!(index, "Synced queue to device track");
                                }
                                None => {
                                    tracing::debug!(
                                        track_id = %reported,
                                        "Device reports a track outside the queue"
                                    );
                                    return;
                                }
                            }
                        }
                    }
                }

                if snapshot.duration_ms > 0 {
                    inner.duration_ms = snapshot.duration_ms;
                }
                inner.is_playing = snapshot.is_playing;
                inner.position_ms = snapshot.position_ms.min(inner.duration_ms);
                sync_ticker(&self.shared, &mut inner);
                self.shared.publish(&inner);
            }
            BackendEvent::ReadinessChanged { ready } => {
                tracing::info!(ready, "Streaming device readiness changed");
                inner.device_ready = ready;
                if !ready && inner.loaded_on == Some(BackendKind::Privileged) {
                    inner.stop_ticker();
                }
                reselect(&self.shared, &mut inner).await;
            }
            BackendEvent::TrackEnded { backend, track_id } => {
                if inner.selected != backend || inner.loaded_on != Some(backend) {
                    return;
                }
                if inner.current_track.as_ref().map(|t| t.id.as_str()) != Some(track_id.as_str()) {
                    tracing::debug!(track_id = %track_id, "Ignoring end of a replaced track");
                    return;
                }
                tracing::debug!(backend = %backend, "Track ended; advancing queue");
                inner.is_playing = false;
                inner.stop_ticker();
                if inner.queue.is_empty() {
                    inner.position_ms = inner.duration_ms;
                    self.shared.publish(&inner);
                } else {
                    step(&self.shared, &mut inner, true).await;
                }
            }
            BackendEvent::TransportCommandFailed {
                backend,
                command,
                reason,
            } => {
                tracing::warn!(backend = %backend, command, "Transport command failed: {}", reason);
                if inner.selected == backend {
                    inner.transport_hint = Some(format!("{} failed: {}", command, reason));
                    self.shared.publish(&inner);
                }
            }
        }
    }
}

/// Advance or retreat the queue with wraparound and play the result
async fn step(shared: &Arc<Shared>, inner: &mut Inner, forward: bool) {
    let track = if forward {
        inner.queue.advance().cloned()
    } else {
        inner.queue.retreat().cloned()
    };
    match track {
        Some(track) => load_track(shared, inner, track).await,
        None => tracing::debug!("Queue is empty; nothing to step to"),
    }
}

/// Make `track` current and start it on the selected backend
async fn load_track(shared: &Arc<Shared>, inner: &mut Inner, track: Track) {
    inner.stop_ticker();
    inner.duration_ms = track.duration_ms;
    inner.current_track = Some(track);
    start_current(shared, inner).await;
    shared.publish(inner);
}

/// Start the current track from 0 on the selected backend, falling back once
/// if the streaming device turns out not to be ready
async fn start_current(shared: &Arc<Shared>, inner: &mut Inner) {
    let track = match inner.current_track.clone() {
        Some(track) => track,
        None => return,
    };
    let context = inner.queue.tracks().to_vec();

    inner.stop_ticker();
    inner.loaded_on = None;
    inner.is_playing = false;
    inner.position_ms = 0;
    inner.clear_conditions();

    loop {
        let kind = inner.selected;
        let backend = Arc::clone(shared.backend(kind));

        if let Err(e) = backend.set_volume(inner.volume).await {
            tracing::debug!(backend = %kind, "{}", e);
        }

        match backend.play(&track, &context).await {
            PlayOutcome::Started => {
                inner.loaded_on = Some(kind);
                inner.is_playing = true;
                let snapshot = backend.snapshot();
                if snapshot.track_id.as_deref() == Some(track.id.as_str()) && snapshot.duration_ms > 0 {
                    inner.duration_ms = snapshot.duration_ms;
                }
                sync_ticker(shared, inner);
                tracing::info!(backend = %kind, track = %track.name, "Playback started");
            }
            PlayOutcome::NotReady => {
                inner.device_ready = false;
                inner.selected = select_backend(inner.tier, false);
                if inner.selected != kind {
                    tracing::warn!("Streaming device not ready; falling back to preview");
                    continue;
                }
                inner.playback_unavailable = true;
            }
            PlayOutcome::NoPreviewAvailable => {
                tracing::info!(track = %track.name, "Track cannot be played on any backend");
                inner.no_preview_available = true;
                inner.playback_unavailable = true;
            }
            PlayOutcome::Failed(reason) => {
                tracing::warn!(backend = %kind, "Play failed: {}", reason);
                inner.transport_hint = Some(format!("play failed: {}", reason));
            }
        }
        break;
    }
}

/// Re-evaluate the backend selection; a switch restarts the current track at 0
async fn reselect(shared: &Arc<Shared>, inner: &mut Inner) {
    let desired = select_backend(inner.tier, inner.device_ready);
    if desired == inner.selected {
        shared.publish(inner);
        return;
    }

    let previous = inner.selected;
    tracing::info!(from = %previous, to = %desired, "Switching playback backend");
    inner.stop_ticker();

    if inner.loaded_on == Some(previous) {
        if let Err(e) = shared.backend(previous).pause().await {
            tracing::debug!(backend = %previous, "{}", e);
        }
    }

    let was_playing = inner.is_playing;
    inner.selected = desired;
    inner.loaded_on = None;
    inner.is_playing = false;
    inner.position_ms = 0;
    inner.clear_conditions();
    if let Some(duration) = inner.current_track.as_ref().map(|t| t.duration_ms) {
        inner.duration_ms = duration;
    }

    if was_playing {
        start_current(shared, inner).await;
    }
    shared.publish(inner);
}

/// Run the interpolation ticker only while streaming is playing
fn sync_ticker(shared: &Arc<Shared>, inner: &mut Inner) {
    inner.stop_ticker();
    if inner.is_playing && inner.loaded_on == Some(BackendKind::Privileged) {
        let generation = inner.tick_generation;
        let handle = spawn_ticker(Arc::downgrade(shared), shared.position_tick, generation);
        inner.ticker = Some(handle);
    }
}

fn spawn_ticker(shared: Weak<Shared>, period: Duration, generation: u64) -> AbortHandle {
    let step_ms = period.as_millis() as u64;
    let task = tokio::spawn(async move {
        let mut interval = interval_at(Instant::now() + period, period);
        loop {
            interval.tick().await;
            let shared = match shared.upgrade() {
                Some(shared) => shared,
                None => break,
            };
            let mut inner = shared.inner.lock().await;
            if inner.tick_generation != generation || !inner.is_playing {
                break;
            }
            inner.position_ms = inner.position_ms.saturating_add(step_ms).min(inner.duration_ms);
            shared.publish(&inner);
        }
    });
    task.abort_handle()
}
