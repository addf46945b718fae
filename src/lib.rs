//! Tandem Player - Spotify playback core arbitrating full-track streaming and preview clips
pub mod api;
pub mod auth;
pub mod config;
pub mod logging;
pub mod models;
pub mod playback;

pub use api::{ApiError, WebApi};
pub use auth::{AuthError, SessionEvent, SessionManager};
pub use config::Config;
pub use models::{AccountTier, Track};
pub use playback::{BackendKind, PlaybackController, UnifiedPlaybackState};
