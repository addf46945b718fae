/// Local audio output for preview clips
use rodio::{Decoder, OutputStream, OutputStreamHandle, Sink, Source};
use std::io::Cursor;
use std::sync::mpsc::{self as std_mpsc, RecvTimeoutError};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::mpsc;

const POLL_INTERVAL: Duration = Duration::from_millis(100);
const TIME_UPDATE_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Debug, Error)]
pub enum AudioError {
    #[error("Audio thread has stopped")]
    ThreadGone,
    #[error("Failed to fetch audio: {0}")]
    Fetch(String),
    #[error("Failed to decode audio: {0}")]
    Decode(String),
    #[error("Audio output unavailable: {0}")]
    Output(String),
}

/// Notifications from the output, in the order the media produced them
#[derive(Debug, Clone, PartialEq)]
pub enum AudioEvent {
    /// Media is decoded and ready; duration when the container reports one
    Loaded { duration_ms: Option<u64> },
    TimeUpdate { position_ms: u64 },
    Ended,
    Error(String),
}

/// An [`AudioEvent`] tagged with the load it belongs to
#[derive(Debug, Clone, PartialEq)]
pub struct SourceEvent {
    pub source_id: u64,
    pub event: AudioEvent,
}

/// A single local audio element. Owned exclusively by the preview adapter.
pub trait AudioOutput: Send + Sync {
    /// Replace the source; stays paused until [`play`](Self::play).
    ///
    /// Returns the id that tags every event of the new source.
    fn load(&self, url: &str) -> Result<u64, AudioError>;

    fn play(&self) -> Result<(), AudioError>;

    fn pause(&self) -> Result<(), AudioError>;

    fn seek(&self, position_ms: u64) -> Result<(), AudioError>;

    fn set_volume(&self, volume: f32) -> Result<(), AudioError>;

    /// Drop the current source
    fn stop(&self) -> Result<(), AudioError>;

    /// Event stream; yields `Some` once
    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<SourceEvent>>;
}

enum Command {
    Load(u64, String),
    Play,
    Pause,
    Seek(u64),
    SetVolume(f32),
    Stop,
}

/// rodio output driven from a dedicated thread that owns the stream
pub struct RodioOutput {
    commands: Mutex<std_mpsc::Sender<Command>>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<SourceEvent>>>,
    next_source_id: AtomicU64,
}

impl RodioOutput {
    pub fn new() -> Self {
        let (command_tx, command_rx) = std_mpsc::channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let spawned = thread::Builder::new()
            .name("preview-audio".to_string())
            .spawn(move || AudioThread::new(event_tx).run(command_rx));
        if let Err(e) = spawned {
            // Commands will report ThreadGone
            tracing::error!("Failed to spawn audio thread: {}", e);
        }

        Self {
            commands: Mutex::new(command_tx),
            events_rx: Mutex::new(Some(event_rx)),
            next_source_id: AtomicU64::new(1),
        }
    }

    fn send(&self, command: Command) -> Result<(), AudioError> {
        let sender = self.commands.lock().map_err(|_| AudioError::ThreadGone)?;
        sender.send(command).map_err(|_| AudioError::ThreadGone)
    }
}

impl Default for RodioOutput {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioOutput for RodioOutput {
    fn load(&self, url: &str) -> Result<u64, AudioError> {
        let source_id = self.next_source_id.fetch_add(1, Ordering::SeqCst);
        self.send(Command::Load(source_id, url.to_string()))?;
        Ok(source_id)
    }

    fn play(&self) -> Result<(), AudioError> {
        self.send(Command::Play)
    }

    fn pause(&self) -> Result<(), AudioError> {
        self.send(Command::Pause)
    }

    fn seek(&self, position_ms: u64) -> Result<(), AudioError> {
        self.send(Command::Seek(position_ms))
    }

    fn set_volume(&self, volume: f32) -> Result<(), AudioError> {
        self.send(Command::SetVolume(volume))
    }

    fn stop(&self) -> Result<(), AudioError> {
        self.send(Command::Stop)
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<SourceEvent>> {
        self.events_rx.lock().ok().and_then(|mut rx| rx.take())
    }
}

/// Playback position that only advances while playing
#[derive(Debug, Default)]
struct PlayClock {
    base_ms: u64,
    running_since: Option<Instant>,
}

impl PlayClock {
    fn position_ms(&self) -> u64 {
        let running = self
            .running_since
            .map(|since| since.elapsed().as_millis() as u64)
            .unwrap_or(0);
        self.base_ms.saturating_add(running)
    }

    fn start(&mut self) {
        if self.running_since.is_none() {
            self.running_since = Some(Instant::now());
        }
    }

    fn stop(&mut self) {
        self.base_ms = self.position_ms();
        self.running_since = None;
    }

    fn reset(&mut self, position_ms: u64) {
        let running = self.running_since.is_some();
        self.base_ms = position_ms;
        self.running_since = running.then(Instant::now);
    }
}

struct AudioThread {
    events: mpsc::UnboundedSender<SourceEvent>,
    source_id: u64,
    output: Option<(OutputStream, OutputStreamHandle)>,
    bytes: Option<Arc<[u8]>>,
    sink: Option<Sink>,
    clock: PlayClock,
    volume: f32,
    playing: bool,
    last_time_update: Instant,
}

impl AudioThread {
    fn new(events: mpsc::UnboundedSender<SourceEvent>) -> Self {
        Self {
            events,
            source_id: 0,
            output: None,
            bytes: None,
            sink: None,
            clock: PlayClock::default(),
            volume: 1.0,
            playing: false,
            last_time_update: Instant::now(),
        }
    }

    fn emit(&self, event: AudioEvent) {
        let _ = self.events.send(SourceEvent {
            source_id: self.source_id,
            event,
        });
    }

    fn run(mut self, commands: std_mpsc::Receiver<Command>) {
        loop {
            match commands.recv_timeout(POLL_INTERVAL) {
                Ok(command) => {
                    if let Err(e) = self.handle(command) {
                        tracing::warn!("Preview audio: {}", e);
                        self.emit(AudioEvent::Error(e.to_string()));
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
            self.tick();
        }
        tracing::debug!("Preview audio thread exiting");
    }

    fn handle(&mut self, command: Command) -> Result<(), AudioError> {
        match command {
            Command::Load(source_id, url) => {
                self.release();
                self.source_id = source_id;
                let bytes = fetch(&url)?;
                let duration_ms = decode(&bytes)?
                    .total_duration()
                    .map(|d| d.as_millis() as u64);
                self.bytes = Some(bytes);
                self.clock = PlayClock::default();
                self.rebuild_sink(0)?;
                tracing::info!(?duration_ms, "Preview loaded");
                self.emit(AudioEvent::Loaded { duration_ms });
            }
            Command::Play => {
                if let Some(sink) = self.sink.as_ref() {
                    sink.play();
                    self.playing = true;
                    self.clock.start();
                }
            }
            Command::Pause => {
                if let Some(sink) = self.sink.as_ref() {
                    sink.pause();
                }
                self.playing = false;
                self.clock.stop();
                self.emit_time_update();
            }
            Command::Seek(position_ms) => {
                if self.bytes.is_some() {
                    self.rebuild_sink(position_ms)?;
                    self.clock.reset(position_ms);
                    self.emit_time_update();
                }
            }
            Command::SetVolume(volume) => {
                self.volume = volume;
                if let Some(sink) = self.sink.as_ref() {
                    sink.set_volume(volume);
                }
            }
            Command::Stop => self.release(),
        }
        Ok(())
    }

    fn release(&mut self) {
        if let Some(sink) = self.sink.take() {
            sink.stop();
        }
        self.bytes = None;
        self.playing = false;
        self.clock = PlayClock::default();
    }

    /// Fresh sink over the loaded bytes, starting `position_ms` in
    fn rebuild_sink(&mut self, position_ms: u64) -> Result<(), AudioError> {
        let bytes = match self.bytes.as_ref() {
            Some(bytes) => Arc::clone(bytes),
            None => return Ok(()),
        };

        if self.output.is_none() {
            let output =
                OutputStream::try_default().map_err(|e| AudioError::Output(e.to_string()))?;
            self.output = Some(output);
        }
        let handle = match self.output.as_ref() {
            Some((_, handle)) => handle,
            None => return Err(AudioError::Output("no output stream".to_string())),
        };

        let sink = Sink::try_new(handle).map_err(|e| AudioError::Output(e.to_string()))?;
        sink.pause();
        sink.set_volume(self.volume);
        sink.append(
            decode(&bytes)?
                .convert_samples::<f32>()
                .skip_duration(Duration::from_millis(position_ms)),
        );
        if self.playing {
            sink.play();
        }

        if let Some(old) = self.sink.replace(sink) {
            old.stop();
        }
        Ok(())
    }

    fn emit_time_update(&mut self) {
        self.last_time_update = Instant::now();
        self.emit(AudioEvent::TimeUpdate {
            position_ms: self.clock.position_ms(),
        });
    }

    fn tick(&mut self) {
        if !self.playing {
            return;
        }
        let finished = self.sink.as_ref().map(|s| s.empty()).unwrap_or(true);
        if finished {
            tracing::debug!("Preview playback reached the end");
            self.playing = false;
            self.clock.stop();
            self.emit_time_update();
            self.emit(AudioEvent::Ended);
        } else if self.last_time_update.elapsed() >= TIME_UPDATE_INTERVAL {
            self.emit_time_update();
        }
    }
}

fn fetch(url: &str) -> Result<Arc<[u8]>, AudioError> {
    let response = reqwest::blocking::Client::new()
        .get(url)
        .send()
        .map_err(|e| AudioError::Fetch(e.to_string()))?;
    if !response.status().is_success() {
        return Err(AudioError::Fetch(format!("HTTP {}", response.status())));
    }
    let bytes = response
        .bytes()
        .map_err(|e| AudioError::Fetch(e.to_string()))?;
    Ok(Arc::from(bytes.as_ref()))
}

fn decode(bytes: &Arc<[u8]>) -> Result<Decoder<Cursor<Arc<[u8]>>>, AudioError> {
    Decoder::new(Cursor::new(Arc::clone(bytes))).map_err(|e| AudioError::Decode(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_play_clock_only_advances_while_running() {
        let mut clock = PlayClock::default();
        assert_eq!(clock.position_ms(), 0);

        clock.reset(5_000);
        assert_eq!(clock.position_ms(), 5_000);

        clock.start();
        thread::sleep(Duration::from_millis(20));
        clock.stop();
        let stopped_at = clock.position_ms();
        assert!(stopped_at >= 5_020);

        thread::sleep(Duration::from_millis(20));
        assert_eq!(clock.position_ms(), stopped_at);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        let bytes: Arc<[u8]> = Arc::from(&b"definitely not audio"[..]);
        assert!(matches!(decode(&bytes), Err(AudioError::Decode(_))));
    }

    #[tokio::test]
    async fn test_unreachable_url_reports_error_event() {
        let output = RodioOutput::new();
        let mut events = output.take_events().unwrap();
        assert!(output.take_events().is_none());

        let first = output.load("http://127.0.0.1:9/a.mp3").unwrap();
        let second = output.load("http://127.0.0.1:9/b.mp3").unwrap();
        assert_ne!(first, second);

        for expected in [first, second] {
            let notice = tokio::time::timeout(Duration::from_secs(10), events.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(notice.source_id, expected);
            assert!(matches!(notice.event, AudioEvent::Error(ref e) if e.contains("fetch")));
        }
    }
}
