/// Main entry point for the Tandem Player CLI
use anyhow::{bail, Context};
use clap::Parser;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{broadcast, mpsc};
use tracing::{info, warn};
use url::Url;

use tandem_player::auth::{callback, wait_for_callback};
use tandem_player::playback::{
    ControllerConfig, LibrespotDevice, PreviewAdapter, PrivilegedAdapter, RodioOutput,
};
use tandem_player::{
    logging, AccountTier, Config, PlaybackController, SessionEvent, SessionManager, Track,
    UnifiedPlaybackState, WebApi,
};

const LOGIN_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Parser, Debug)]
#[command(
    name = "tandem",
    version,
    about = "Spotify player that streams full tracks on premium and previews otherwise",
    long_about = None
)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error); overrides the config file
    #[arg(short, long)]
    log_level: Option<String>,
}

#[derive(Parser, Debug)]
enum Command {
    /// Authorize this device with your Spotify account
    Login,

    /// Forget stored credentials
    Logout,

    /// Show session status
    Status,

    /// Play a queue of tracks read from a JSON file
    Play {
        /// JSON array of track records
        queue: PathBuf,

        /// Queue position to start from
        #[arg(short, long, default_value_t = 0)]
        index: usize,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = match args.config {
        Some(ref path) => Config::load_from(path),
        None => Config::load(),
    }
    .context("Failed to load configuration")?;

    let level = args
        .log_level
        .clone()
        .unwrap_or_else(|| config.general.log_level.clone());
    logging::init(&level).map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;

    info!("Starting Tandem Player v{}", env!("CARGO_PKG_VERSION"));

    let session = Arc::new(SessionManager::from_config(&config)?);

    match args.command {
        Command::Login => handle_login_command(&config, session).await,
        Command::Logout => {
            session.logout()?;
            println!("Logged out");
            Ok(())
        }
        Command::Status => handle_status_command(&config, session).await,
        Command::Play { queue, index } => handle_play_command(&config, session, &queue, index).await,
    }
}

async fn handle_login_command(config: &Config, session: Arc<SessionManager>) -> anyhow::Result<()> {
    let redirect = Url::parse(session.redirect_uri()).context("Invalid redirect URI")?;
    let host = redirect.host_str().unwrap_or("127.0.0.1");
    let port = redirect
        .port_or_known_default()
        .context("Redirect URI has no port")?;
    let addr = tokio::net::lookup_host((host, port))
        .await?
        .next()
        .with_context(|| format!("Cannot resolve callback host {}", host))?;
    let path = callback::callback_path(session.redirect_uri());

    let auth_url = session.begin_authorization()?;
    println!("Open this URL in your browser to log in:\n\n  {}\n", auth_url);

    let params = tokio::time::timeout(LOGIN_TIMEOUT, wait_for_callback(addr, &path))
        .await
        .context("Timed out waiting for the authorization callback")??;
    session.complete_from_callback(params).await?;

    let api = WebApi::new(config.spotify.api_base_url.clone(), session);
    match api.account_tier().await {
        Ok(tier) => println!("Logged in ({} account)", tier),
        Err(e) => println!("Logged in, but the account tier is unknown: {}", e),
    }
    Ok(())
}

async fn handle_status_command(config: &Config, session: Arc<SessionManager>) -> anyhow::Result<()> {
    let credential = match session.credential()? {
        Some(credential) => credential,
        None => {
            println!("Not logged in. Run `tandem login`.");
            return Ok(());
        }
    };

    let expiry = chrono::DateTime::from_timestamp_millis(credential.expires_at_epoch_ms)
        .map(|t| t.with_timezone(&chrono::Local).to_rfc2822())
        .unwrap_or_else(|| "unknown".to_string());
    println!("Logged in");
    println!("  Access token expires: {}", expiry);
    println!(
        "  Refresh token: {}",
        if credential.refresh_token.is_some() { "present" } else { "missing" }
    );

    let api = WebApi::new(config.spotify.api_base_url.clone(), session);
    match api.account_tier().await {
        Ok(tier) => println!("  Account: {}", tier),
        Err(e) => println!("  Account: unavailable ({})", e),
    }
    Ok(())
}

async fn handle_play_command(
    config: &Config,
    session: Arc<SessionManager>,
    queue_path: &Path,
    index: usize,
) -> anyhow::Result<()> {
    let content = std::fs::read_to_string(queue_path)
        .with_context(|| format!("Failed to read {}", queue_path.display()))?;
    let tracks: Vec<Track> = serde_json::from_str(&content).context("Invalid queue file")?;
    let Some(start) = tracks.get(index).cloned() else {
        bail!("Queue has {} tracks; index {} is out of range", tracks.len(), index);
    };

    let mut session_events = session.subscribe();
    let api = WebApi::new(config.spotify.api_base_url.clone(), session.clone());

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let device = Arc::new(LibrespotDevice::new(
        config.playback.device_name.clone(),
        config.playback.initial_volume,
    ));
    let privileged = Arc::new(PrivilegedAdapter::new(device, events_tx.clone()));
    privileged.spawn_event_pump();
    let preview = Arc::new(PreviewAdapter::new(
        Arc::new(RodioOutput::new()),
        events_tx,
        config.playback.preview_fallback_duration_ms,
    ));
    preview.spawn_event_pump();

    let controller = PlaybackController::new(
        privileged.clone(),
        preview,
        ControllerConfig::from(&config.playback),
    );
    controller.spawn_event_loop(events_rx);

    let tier = if session.is_authenticated() {
        api.account_tier().await.unwrap_or_else(|e| {
            warn!("Could not determine account tier: {}", e);
            AccountTier::Free
        })
    } else {
        println!("Not logged in; playing previews only.");
        AccountTier::Free
    };

    if tier.is_premium() {
        match session.get_valid_access_token().await {
            Ok(Some(token)) => {
                if let Err(e) = privileged.connect(&token).await {
                    warn!("Streaming device unavailable, using previews: {}", e);
                }
            }
            Ok(None) => warn!("Session ended before the streaming device could connect"),
            Err(e) => warn!("Could not obtain an access token: {}", e),
        }
    }

    controller.set_account_tier(tier).await;
    controller.play_track(start, Some(tracks)).await;

    println!("Commands: p (play/pause), n (next), b (previous), s <secs> (seek), v <0..1> (volume), q (quit)");

    let mut state_rx = controller.subscribe();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut last_line = String::new();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let line = match line? {
                    Some(line) => line,
                    None => break,
                };
                if !run_command(&controller, line.trim()).await {
                    break;
                }
            }
            changed = state_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let summary = describe_state(&state_rx.borrow_and_update());
                if summary != last_line {
                    println!("{}", summary);
                    last_line = summary;
                }
            }
            event = session_events.recv() => {
                match event {
                    Ok(SessionEvent::ForcedLogout) => {
                        println!("Your session was revoked. Run `tandem login` to sign in again.");
                        break;
                    }
                    Ok(other) => info!("Session event: {:?}", other),
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }

    privileged.disconnect().await;
    Ok(())
}

/// Apply one stdin command; false means quit
async fn run_command(controller: &PlaybackController, line: &str) -> bool {
    let mut parts = line.split_whitespace();
    match (parts.next(), parts.next()) {
        (Some("p"), _) => controller.toggle_play().await,
        (Some("n"), _) => controller.next().await,
        (Some("b"), _) => controller.previous().await,
        (Some("s"), Some(secs)) => match secs.parse::<f64>() {
            Ok(secs) if secs >= 0.0 => controller.seek((secs * 1000.0) as u64).await,
            _ => println!("Usage: s <seconds>"),
        },
        (Some("v"), Some(volume)) => match volume.parse::<f32>() {
            Ok(volume) => controller.set_volume(volume).await,
            Err(_) => println!("Usage: v <0..1>"),
        },
        (Some("q"), _) => return false,
        (None, _) => {}
        _ => println!("Unknown command: {}", line),
    }
    true
}

fn describe_state(state: &UnifiedPlaybackState) -> String {
    let track = match state.current_track {
        Some(ref track) => format!("{} - {}", track.artist_names(), track.name),
        None => return "Nothing playing".to_string(),
    };
    let backend = state
        .active_backend
        .map(|b| b.to_string())
        .unwrap_or_else(|| "-".to_string());

    let mut line = format!(
        "[{}/{}] {} {} {}/{} [{}] vol {:.0}%",
        state.queue_index + 1,
        state.queue_length,
        if state.is_playing { ">" } else { "||" },
        track,
        format_ms(state.position_ms),
        format_ms(state.duration_ms),
        backend,
        state.volume * 100.0,
    );
    if state.no_preview_available {
        line.push_str(" (no preview available)");
    } else if state.playback_unavailable {
        line.push_str(" (playback unavailable)");
    }
    if let Some(ref hint) = state.transport_hint {
        line.push_str(&format!(" ! {}", hint));
    }
    line
}

fn format_ms(ms: u64) -> String {
    let secs = ms / 1000;
    format!("{}:{:02}", secs / 60, secs % 60)
}
