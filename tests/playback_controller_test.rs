use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use tandem_player::models::{Album, Artist};
use tandem_player::playback::{
    AudioError, AudioEvent, AudioOutput, BackendEvent, ControllerConfig, DeviceError, DeviceEvent,
    DeviceState, PreviewAdapter, PrivilegedAdapter, SourceEvent, StreamingDevice,
};
use tandem_player::{AccountTier, BackendKind, PlaybackController, Track};
use tokio::sync::mpsc;

#[derive(Default)]
struct FakeOutput {
    calls: Mutex<Vec<String>>,
    loads: Mutex<u64>,
}

impl FakeOutput {
    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: impl Into<String>) -> Result<(), AudioError> {
        self.calls.lock().unwrap().push(call.into());
        Ok(())
    }
}

impl AudioOutput for FakeOutput {
    fn load(&self, url: &str) -> Result<u64, AudioError> {
        self.record(format!("load {}", url))?;
        let mut loads = self.loads.lock().unwrap();
        *loads += 1;
        Ok(*loads)
    }

    fn play(&self) -> Result<(), AudioError> {
        self.record("play")
    }

    fn pause(&self) -> Result<(), AudioError> {
        self.record("pause")
    }

    fn seek(&self, position_ms: u64) -> Result<(), AudioError> {
        self.record(format!("seek {}", position_ms))
    }

    fn set_volume(&self, _volume: f32) -> Result<(), AudioError> {
        Ok(())
    }

    fn stop(&self) -> Result<(), AudioError> {
        self.record("stop")
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<SourceEvent>> {
        None
    }
}

#[derive(Default)]
struct FakeDevice {
    calls: Mutex<Vec<String>>,
}

impl FakeDevice {
    fn loads(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.starts_with("load"))
            .cloned()
            .collect()
    }

    fn record(&self, call: String) -> Result<(), DeviceError> {
        self.calls.lock().unwrap().push(call);
        Ok(())
    }
}

#[async_trait]
impl StreamingDevice for FakeDevice {
    async fn connect(&self, _access_token: &str) -> Result<String, DeviceError> {
        Ok("fake-device".to_string())
    }

    async fn disconnect(&self) {}

    async fn load(&self, track_uri: &str, _start_playing: bool) -> Result<(), DeviceError> {
        self.record(format!("load {}", track_uri))
    }

    async fn resume(&self) -> Result<(), DeviceError> {
        self.record("resume".into())
    }

    async fn pause(&self) -> Result<(), DeviceError> {
        self.record("pause".into())
    }

    async fn seek(&self, position_ms: u32) -> Result<(), DeviceError> {
        self.record(format!("seek {}", position_ms))
    }

    async fn set_volume(&self, _volume: f32) -> Result<(), DeviceError> {
        Ok(())
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<DeviceEvent>> {
        None
    }
}

struct Rig {
    controller: PlaybackController,
    privileged: Arc<PrivilegedAdapter>,
    preview: Arc<PreviewAdapter>,
    output: Arc<FakeOutput>,
    device: Arc<FakeDevice>,
    events: mpsc::UnboundedReceiver<BackendEvent>,
}

impl Rig {
    fn new() -> Self {
        let (tx, events) = mpsc::unbounded_channel();
        let output = Arc::new(FakeOutput::default());
        let device = Arc::new(FakeDevice::default());
        let privileged = Arc::new(PrivilegedAdapter::new(device.clone(), tx.clone()));
        let preview = Arc::new(PreviewAdapter::new(output.clone(), tx, 30_000));
        let controller = PlaybackController::new(
            privileged.clone(),
            preview.clone(),
            ControllerConfig::default(),
        );
        Self {
            controller,
            privileged,
            preview,
            output,
            device,
            events,
        }
    }

    /// Feed every pending backend event to the controller, including ones it causes
    async fn settle(&mut self) {
        while let Ok(event) = self.events.try_recv() {
            self.controller.handle_event(event).await;
        }
    }
}

fn track(id: &str, preview: bool) -> Track {
    Track {
        id: id.to_string(),
        name: format!("Song {}", id),
        duration_ms: 180_000,
        preview_url: preview.then(|| format!("https://p.scdn.co/mp3-preview/{}", id)),
        album: Album {
            id: "album".into(),
            name: "Album".into(),
            image_url: None,
        },
        artists: vec![Artist {
            id: "artist".into(),
            name: "Artist".into(),
        }],
    }
}

fn queue(n: usize) -> Vec<Track> {
    (0..n).map(|i| track(&format!("t{}", i), true)).collect()
}

#[tokio::test]
async fn next_wraps_around_after_queue_length_steps() {
    let mut rig = Rig::new();
    let tracks = queue(4);
    rig.controller
        .play_track(tracks[0].clone(), Some(tracks.clone()))
        .await;

    for expected in [1, 2, 3, 0] {
        rig.controller.next().await;
        rig.settle().await;
        let state = rig.controller.state();
        assert_eq!(state.queue_index, expected);
        assert_eq!(state.current_track.as_ref(), Some(&tracks[expected]));
    }
    assert_eq!(rig.controller.state().queue_length, 4);
}

#[tokio::test]
async fn previous_from_first_goes_to_last() {
    let mut rig = Rig::new();
    let tracks = queue(3);
    rig.controller
        .play_track(tracks[0].clone(), Some(tracks.clone()))
        .await;

    rig.controller.previous().await;
    rig.settle().await;
    let state = rig.controller.state();
    assert_eq!(state.queue_index, 2);
    assert_eq!(state.current_track.as_ref().map(|t| t.id.as_str()), Some("t2"));
    assert!(state.is_playing);
}

#[tokio::test]
async fn free_account_plays_preview_clip() {
    let mut rig = Rig::new();
    let a = track("a", true);
    rig.controller.play_track(a.clone(), Some(vec![a])).await;
    rig.settle().await;

    let state = rig.controller.state();
    assert_eq!(state.active_backend, Some(BackendKind::Preview));
    assert!(state.is_playing);
    assert!(!state.no_preview_available);
    assert!(!state.playback_unavailable);
    assert_eq!(state.duration_ms, 30_000);
    assert_eq!(
        rig.output.calls(),
        vec!["load https://p.scdn.co/mp3-preview/a".to_string(), "play".to_string()]
    );
    assert!(rig.device.loads().is_empty());
}

#[tokio::test]
async fn free_account_without_clip_reports_unavailable() {
    let mut rig = Rig::new();
    let b = track("b", false);
    rig.controller.play_track(b.clone(), Some(vec![b])).await;
    rig.settle().await;

    let state = rig.controller.state();
    assert_eq!(state.active_backend, Some(BackendKind::Preview));
    assert!(!state.is_playing);
    assert!(state.no_preview_available);
    assert!(state.playback_unavailable);
    assert!(!rig.output.calls().iter().any(|c| c.starts_with("load")));
}

#[tokio::test]
async fn premium_falls_back_to_preview_until_device_is_ready() {
    let mut rig = Rig::new();
    rig.controller.set_account_tier(AccountTier::Premium).await;
    let tracks = queue(2);
    rig.controller
        .play_track(tracks[0].clone(), Some(tracks.clone()))
        .await;
    rig.settle().await;
    assert_eq!(rig.controller.state().active_backend, Some(BackendKind::Preview));

    rig.preview.handle_audio_event(SourceEvent {
        source_id: 1,
        event: AudioEvent::TimeUpdate { position_ms: 12_000 },
    });
    rig.settle().await;
    assert_eq!(rig.controller.state().position_ms, 12_000);

    rig.privileged.connect("token").await.unwrap();
    rig.settle().await;

    let state = rig.controller.state();
    assert!(state.device_ready);
    assert_eq!(state.active_backend, Some(BackendKind::Privileged));
    assert_eq!(state.queue_index, 0);
    assert_eq!(state.position_ms, 0);
    assert!(state.is_playing);
    assert_eq!(rig.device.loads(), vec!["load spotify:track:t0".to_string()]);
    assert!(rig.output.calls().contains(&"pause".to_string()));

    // Late clip progress no longer moves the published position
    rig.preview.handle_audio_event(SourceEvent {
        source_id: 1,
        event: AudioEvent::TimeUpdate { position_ms: 13_000 },
    });
    rig.settle().await;
    assert_eq!(rig.controller.state().position_ms, 0);
}

#[tokio::test]
async fn losing_the_device_returns_to_preview() {
    let mut rig = Rig::new();
    rig.controller.set_account_tier(AccountTier::Premium).await;
    rig.privileged.connect("token").await.unwrap();
    rig.settle().await;

    let tracks = queue(3);
    rig.controller
        .play_track(tracks[1].clone(), Some(tracks.clone()))
        .await;
    rig.settle().await;
    assert_eq!(rig.controller.state().active_backend, Some(BackendKind::Privileged));

    rig.privileged.handle_device_event(DeviceEvent::NotReady);
    rig.settle().await;

    let state = rig.controller.state();
    assert!(!state.device_ready);
    assert_eq!(state.active_backend, Some(BackendKind::Preview));
    assert_eq!(state.queue_index, 1);
    assert_eq!(state.position_ms, 0);
    assert!(state.is_playing);
    assert!(rig
        .output
        .calls()
        .contains(&"load https://p.scdn.co/mp3-preview/t1".to_string()));
}

#[tokio::test]
async fn preview_end_advances_exactly_once() {
    let mut rig = Rig::new();
    let tracks = queue(3);
    rig.controller
        .play_track(tracks[0].clone(), Some(tracks.clone()))
        .await;
    rig.settle().await;

    rig.preview.handle_audio_event(SourceEvent {
        source_id: 1,
        event: AudioEvent::Ended,
    });
    rig.settle().await;
    let state = rig.controller.state();
    assert_eq!(state.queue_index, 1);
    assert!(state.is_playing);

    // A duplicate end from the replaced clip is ignored
    rig.preview.handle_audio_event(SourceEvent {
        source_id: 1,
        event: AudioEvent::Ended,
    });
    rig.settle().await;
    assert_eq!(rig.controller.state().queue_index, 1);
}

#[tokio::test]
async fn device_side_track_change_syncs_queue() {
    let mut rig = Rig::new();
    rig.controller.set_account_tier(AccountTier::Premium).await;
    rig.privileged.connect("token").await.unwrap();
    rig.settle().await;

    let tracks = queue(3);
    rig.controller
        .play_track(tracks[0].clone(), Some(tracks.clone()))
        .await;
    rig.settle().await;

    rig.privileged.previous().await.unwrap();
    rig.privileged
        .handle_device_event(DeviceEvent::StateChanged(Some(DeviceState {
            track_uri: "spotify:track:t2".into(),
            paused: false,
            position_ms: 500,
            duration_ms: 180_000,
        })));
    // Late progress from the track the device just left
    rig.privileged
        .handle_device_event(DeviceEvent::StateChanged(Some(DeviceState {
            track_uri: "spotify:track:t0".into(),
            paused: false,
            position_ms: 9_000,
            duration_ms: 180_000,
        })));
    rig.settle().await;

    let state = rig.controller.state();
    assert_eq!(state.queue_index, 2);
    assert_eq!(state.current_track.as_ref().map(|t| t.id.as_str()), Some("t2"));
    assert_eq!(state.position_ms, 500);
}

#[tokio::test]
async fn streaming_end_of_track_advances_queue() {
    let mut rig = Rig::new();
    rig.controller.set_account_tier(AccountTier::Premium).await;
    rig.privileged.connect("token").await.unwrap();
    rig.settle().await;

    let tracks = queue(2);
    rig.controller
        .play_track(tracks[1].clone(), Some(tracks.clone()))
        .await;
    rig.settle().await;

    rig.privileged.handle_device_event(DeviceEvent::EndOfTrack {
        track_uri: "spotify:track:t1".into(),
    });
    rig.settle().await;

    assert_eq!(rig.controller.state().queue_index, 0);
    assert_eq!(
        rig.device.loads(),
        vec![
            "load spotify:track:t1".to_string(),
            "load spotify:track:t0".to_string()
        ]
    );
}

#[tokio::test]
async fn end_of_track_queued_before_next_does_not_skip() {
    let mut rig = Rig::new();
    rig.controller.set_account_tier(AccountTier::Premium).await;
    rig.privileged.connect("token").await.unwrap();
    rig.settle().await;

    let tracks = queue(3);
    rig.controller
        .play_track(tracks[0].clone(), Some(tracks.clone()))
        .await;

    // The device finishes t0 while the user presses next; both land before the controller drains
    rig.privileged.handle_device_event(DeviceEvent::EndOfTrack {
        track_uri: "spotify:track:t0".into(),
    });
    rig.controller.next().await;
    rig.settle().await;

    // And the device repeats itself once t1 is already loaded
    rig.privileged.handle_device_event(DeviceEvent::EndOfTrack {
        track_uri: "spotify:track:t0".into(),
    });
    rig.privileged
        .handle_device_event(DeviceEvent::StateChanged(Some(DeviceState {
            track_uri: "spotify:track:t0".into(),
            paused: false,
            position_ms: 179_000,
            duration_ms: 180_000,
        })));
    rig.settle().await;

    let state = rig.controller.state();
    assert_eq!(state.queue_index, 1);
    assert_eq!(state.current_track.as_ref().map(|t| t.id.as_str()), Some("t1"));
    assert!(state.is_playing);
    assert_eq!(state.position_ms, 0);
    assert_eq!(
        rig.device.loads(),
        vec![
            "load spotify:track:t0".to_string(),
            "load spotify:track:t1".to_string()
        ]
    );
}

#[tokio::test]
async fn free_account_recovers_after_track_without_clip() {
    let mut rig = Rig::new();
    let a = track("a", false);
    let b = track("b", true);
    let tracks = vec![a.clone(), b.clone()];

    rig.controller.play_track(a, Some(tracks.clone())).await;
    rig.settle().await;
    let state = rig.controller.state();
    assert!(!state.is_playing);
    assert!(state.playback_unavailable);
    assert!(state.no_preview_available);

    rig.controller.play_track(b, Some(tracks)).await;
    rig.settle().await;
    let state = rig.controller.state();
    assert_eq!(state.queue_index, 1);
    assert_eq!(state.active_backend, Some(BackendKind::Preview));
    assert!(state.is_playing);
    assert!(!state.playback_unavailable);
    assert!(!state.no_preview_available);
    assert!(rig
        .output
        .calls()
        .ends_with(&["load https://p.scdn.co/mp3-preview/b".to_string(), "play".to_string()]));
}
