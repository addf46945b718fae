/// librespot-backed streaming device for premium accounts
use super::privileged::{DeviceError, DeviceEvent, DeviceState, StreamingDevice};
use crate::models::track_id_from_uri;
use async_trait::async_trait;
use rodio::{OutputStream, Sink};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::AbortHandle;

use librespot_core::authentication::Credentials;
use librespot_core::cache::Cache;
use librespot_core::config::SessionConfig;
use librespot_core::session::Session;
use librespot_core::spotify_id::SpotifyId;
use librespot_playback::audio_backend::{Sink as LibrespotSink, SinkResult};
use librespot_playback::config::PlayerConfig;
use librespot_playback::convert::Converter;
use librespot_playback::decoder::AudioPacket;
use librespot_playback::mixer::{self, Mixer, MixerConfig};
use librespot_playback::player::{Player, PlayerEvent};

// librespot always decodes to 44.1 kHz interleaved stereo
const SAMPLE_RATE: u32 = 44100;
const CHANNELS: u16 = 2;
// Decoded packets allowed to wait in the rodio queue before the player thread blocks
const MAX_QUEUED_PACKETS: usize = 32;

/// Writes librespot PCM into a rodio sink on the player thread
struct RodioSink {
    _stream: OutputStream,
    sink: Sink,
}

impl RodioSink {
    fn open() -> Result<Self, String> {
        let (stream, handle) = OutputStream::try_default()
            .map_err(|e| format!("Failed to open audio output: {}", e))?;
        let sink = Sink::try_new(&handle).map_err(|e| format!("Failed to create sink: {}", e))?;
        Ok(Self {
            _stream: stream,
            sink,
        })
    }
}

impl LibrespotSink for RodioSink {
    fn start(&mut self) -> SinkResult<()> {
        self.sink.play();
        Ok(())
    }

    fn stop(&mut self) -> SinkResult<()> {
        self.sink.pause();
        Ok(())
    }

    fn write(&mut self, packet: AudioPacket, _converter: &mut Converter) -> SinkResult<()> {
        if let AudioPacket::Samples(samples) = packet {
            while self.sink.len() > MAX_QUEUED_PACKETS && !self.sink.is_paused() {
                std::thread::sleep(Duration::from_millis(10));
            }
            let samples: Vec<f32> = samples.iter().map(|&s| s.clamp(-1.0, 1.0) as f32).collect();
            self.sink
                .append(rodio::buffer::SamplesBuffer::new(CHANNELS, SAMPLE_RATE, samples));
        }
        Ok(())
    }
}

/// Discards audio when no output device could be opened
struct SilentSink;

impl LibrespotSink for SilentSink {
    fn write(&mut self, _packet: AudioPacket, _converter: &mut Converter) -> SinkResult<()> {
        Ok(())
    }
}

fn build_sink() -> Box<dyn LibrespotSink> {
    match RodioSink::open() {
        Ok(sink) => Box::new(sink),
        Err(e) => {
            tracing::error!("{}; streaming without audio output", e);
            Box::new(SilentSink)
        }
    }
}

struct Connection {
    session: Session,
    player: Arc<Player>,
    mixer: Arc<dyn Mixer>,
    event_pump: AbortHandle,
}

/// A librespot session plus player registered as a playback device
pub struct LibrespotDevice {
    device_name: String,
    initial_volume: f32,
    connection: Mutex<Option<Connection>>,
    events_tx: mpsc::UnboundedSender<DeviceEvent>,
    events_rx: StdMutex<Option<mpsc::UnboundedReceiver<DeviceEvent>>>,
}

impl LibrespotDevice {
    pub fn new(device_name: impl Into<String>, initial_volume: f32) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            device_name: device_name.into(),
            initial_volume,
            connection: Mutex::new(None),
            events_tx,
            events_rx: StdMutex::new(Some(events_rx)),
        }
    }

    fn device_id(&self) -> String {
        let slug: String = self
            .device_name
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '-' })
            .collect();
        format!("{}-{:08x}", slug, rand::random::<u32>())
    }

    fn spawn_event_pump(&self, player: &Arc<Player>) -> AbortHandle {
        let mut channel = player.get_player_event_channel();
        let events = self.events_tx.clone();

        let task = tokio::spawn(async move {
            let mut track_uri = String::new();
            let mut duration_ms = 0u64;
            let mut paused = true;

            while let Some(event) = channel.recv().await {
                let state = |position_ms: u32, paused: bool, uri: &str, duration: u64| {
                    DeviceEvent::StateChanged(Some(DeviceState {
                        track_uri: uri.to_string(),
                        paused,
                        position_ms: u64::from(position_ms),
                        duration_ms: duration,
                    }))
                };

                let mapped = match event {
                    PlayerEvent::TrackChanged { audio_item } => {
                        track_uri = audio_item.track_id.to_uri().unwrap_or_default();
                        duration_ms = audio_item.duration_ms as u64;
                        tracing::info!(
                            track = %audio_item.name,
                            id = %track_id_from_uri(&track_uri),
                            duration_ms,
                            "Device track changed"
                        );
                        None
                    }
                    PlayerEvent::Playing { position_ms, .. } => {
                        paused = false;
                        Some(state(position_ms, paused, &track_uri, duration_ms))
                    }
                    PlayerEvent::Paused { position_ms, .. } => {
                        paused = true;
                        Some(state(position_ms, paused, &track_uri, duration_ms))
                    }
                    PlayerEvent::Loading { .. } => {
                        // track_uri still names the previous item until TrackChanged
                        paused = true;
                        None
                    }
                    PlayerEvent::PositionChanged { position_ms, .. }
                    | PlayerEvent::Seeked { position_ms, .. } => {
                        Some(state(position_ms, paused, &track_uri, duration_ms))
                    }
                    PlayerEvent::Stopped { .. } => {
                        paused = true;
                        Some(DeviceEvent::StateChanged(None))
                    }
                    PlayerEvent::EndOfTrack { .. } => {
                        paused = true;
                        Some(DeviceEvent::EndOfTrack {
                            track_uri: track_uri.clone(),
                        })
                    }
                    _ => {
                        tracing::trace!("Ignoring librespot player event");
                        None
                    }
                };

                if let Some(mapped) = mapped {
                    if events.send(mapped).is_err() {
                        break;
                    }
                }
            }

            tracing::warn!("librespot player event channel closed");
            let _ = events.send(DeviceEvent::NotReady);
        });
        task.abort_handle()
    }

    async fn with_connection<T>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T, DeviceError>,
    ) -> Result<T, DeviceError> {
        let connection = self.connection.lock().await;
        match connection.as_ref() {
            Some(c) => f(c),
            None => Err(DeviceError::NotConnected),
        }
    }
}

fn volume_to_u16(volume: f32) -> u16 {
    (volume.clamp(0.0, 1.0) * f32::from(u16::MAX)).round() as u16
}

#[async_trait]
impl StreamingDevice for LibrespotDevice {
    async fn connect(&self, access_token: &str) -> Result<String, DeviceError> {
        self.disconnect().await;

        let device_id = self.device_id();
        let session_config = SessionConfig {
            device_id: device_id.clone(),
            ..Default::default()
        };
        let cache = Cache::new::<&std::path::Path>(None, None, None, None)
            .map_err(|e| DeviceError::Session(format!("Failed to create librespot cache: {}", e)))?;
        let session = Session::new(session_config, Some(cache));

        session
            .connect(Credentials::with_access_token(access_token.to_string()), false)
            .await
            .map_err(|e| DeviceError::Session(format!("{:?}", e)))?;
        tracing::info!("librespot session connected");

        let mixer_builder = mixer::find(None)
            .ok_or_else(|| DeviceError::Session("no mixer available".to_string()))?;
        let mixer = mixer_builder(MixerConfig::default())
            .map_err(|e| DeviceError::Session(format!("Failed to open mixer: {:?}", e)))?;
        mixer.set_volume(volume_to_u16(self.initial_volume));

        let player = Player::new(
            PlayerConfig::default(),
            session.clone(),
            mixer.get_soft_volume(),
            build_sink,
        );
        let event_pump = self.spawn_event_pump(&player);

        *self.connection.lock().await = Some(Connection {
            session,
            player,
            mixer,
            event_pump,
        });

        tracing::info!(device = %self.device_name, "Streaming device registered");
        Ok(device_id)
    }

    async fn disconnect(&self) {
        if let Some(connection) = self.connection.lock().await.take() {
            connection.event_pump.abort();
            connection.player.stop();
            connection.session.shutdown();
            tracing::info!("librespot session closed");
        }
    }

    async fn load(&self, track_uri: &str, start_playing: bool) -> Result<(), DeviceError> {
        let id = track_id_from_uri(track_uri);
        let spotify_id = SpotifyId::from_base62(id)
            .map_err(|e| DeviceError::InvalidUri(format!("{}: {:?}", track_uri, e)))?;
        self.with_connection(|c| {
            c.player.load(
                librespot_core::SpotifyUri::Track { id: spotify_id },
                start_playing,
                0,
            );
            Ok(())
        })
        .await
    }

    async fn resume(&self) -> Result<(), DeviceError> {
        self.with_connection(|c| {
            c.player.play();
            Ok(())
        })
        .await
    }

    async fn pause(&self) -> Result<(), DeviceError> {
        self.with_connection(|c| {
            c.player.pause();
            Ok(())
        })
        .await
    }

    async fn seek(&self, position_ms: u32) -> Result<(), DeviceError> {
        self.with_connection(|c| {
            c.player.seek(position_ms);
            Ok(())
        })
        .await
    }

    async fn set_volume(&self, volume: f32) -> Result<(), DeviceError> {
        self.with_connection(|c| {
            c.mixer.set_volume(volume_to_u16(volume));
            Ok(())
        })
        .await
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<DeviceEvent>> {
        self.events_rx.lock().ok().and_then(|mut rx| rx.take())
    }
}
