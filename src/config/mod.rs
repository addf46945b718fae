/// Configuration management
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

const APP_DIR: &str = "tandem-player";
const CONFIG_FILE: &str = "config.toml";
const CREDENTIALS_FILE: &str = "credentials.json";

/// Public client id registered for the PKCE flow
pub const DEFAULT_CLIENT_ID: &str = "8d96909a05274a2ba7125f32fd907f7e";
/// Loopback redirect served by the callback listener
pub const DEFAULT_REDIRECT_URI: &str = "http://127.0.0.1:8989/callback";

pub const DEFAULT_SCOPES: &[&str] = &[
    "user-read-private",
    "user-read-email",
    "user-library-read",
    "user-library-modify",
    "user-read-playback-state",
    "user-modify-playback-state",
    "user-read-currently-playing",
    "user-read-recently-played",
    "user-top-read",
    "playlist-read-private",
    "playlist-read-collaborative",
    "playlist-modify-public",
    "playlist-modify-private",
    "streaming",
];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Unable to determine {0} directory")]
    NoDirectory(&'static str),
    #[error("Config I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// Application configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub spotify: SpotifyConfig,
    #[serde(default)]
    pub playback: PlaybackConfig,
}

/// General application settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Log level (error, warn, info, debug, trace)
    pub log_level: String,
    /// Overrides where credentials are persisted
    pub data_dir: Option<String>,
}

/// Authorization and Web API endpoints
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SpotifyConfig {
    pub client_id: String,
    pub redirect_uri: String,
    pub scopes: Vec<String>,
    pub authorize_url: String,
    pub token_url: String,
    pub api_base_url: String,
    /// Seconds before expiry at which the access token is refreshed
    pub refresh_skew_secs: u64,
}

/// Playback tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybackConfig {
    /// Starting volume in [0, 1]
    pub initial_volume: f32,
    /// Interval of the UI position interpolation while streaming
    pub position_tick_ms: u64,
    /// Name the premium device registers under
    pub device_name: String,
    /// Duration assumed for a preview clip until the output reports one
    pub preview_fallback_duration_ms: u64,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            data_dir: None,
        }
    }
}

impl Default for SpotifyConfig {
    fn default() -> Self {
        Self {
            client_id: DEFAULT_CLIENT_ID.to_string(),
            redirect_uri: DEFAULT_REDIRECT_URI.to_string(),
            scopes: DEFAULT_SCOPES.iter().map(|s| s.to_string()).collect(),
            authorize_url: "https://accounts.spotify.com/authorize".to_string(),
            token_url: "https://accounts.spotify.com/api/token".to_string(),
            api_base_url: "https://api.spotify.com/v1".to_string(),
            refresh_skew_secs: 60,
        }
    }
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            initial_volume: 0.5,
            position_tick_ms: 1000,
            device_name: "Tandem Player".to_string(),
            preview_fallback_duration_ms: 30_000,
        }
    }
}

impl Config {
    /// Load configuration from the default location, creating it on first run
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&Self::config_dir()?.join(CONFIG_FILE))
    }

    /// Load configuration from an explicit path, creating it with defaults if absent
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            let content = fs::read_to_string(path)?;
            Ok(toml::from_str(&content)?)
        } else {
            let config = Self::default();
            config.save_to(path)?;
            tracing::info!("Wrote default configuration to {:?}", path);
            Ok(config)
        }
    }

    /// Save configuration to the default location
    pub fn save(&self) -> Result<(), ConfigError> {
        self.save_to(&Self::config_dir()?.join(CONFIG_FILE))
    }

    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    /// Get configuration directory path
    pub fn config_dir() -> Result<PathBuf, ConfigError> {
        Ok(dirs::config_dir()
            .ok_or(ConfigError::NoDirectory("config"))?
            .join(APP_DIR))
    }

    /// Directory holding persisted session state
    pub fn data_dir(&self) -> Result<PathBuf, ConfigError> {
        match self.general.data_dir {
            Some(ref custom_dir) => Ok(PathBuf::from(custom_dir)),
            None => Ok(dirs::data_dir()
                .ok_or(ConfigError::NoDirectory("data"))?
                .join(APP_DIR)),
        }
    }

    /// File backing the credential store
    pub fn credentials_path(&self) -> Result<PathBuf, ConfigError> {
        Ok(self.data_dir()?.join(CREDENTIALS_FILE))
    }
}
