//! Session management: PKCE authorization, token persistence, and silent refresh.
//!
//! Every authorized request in the crate obtains its bearer token through
//! [`SessionManager::get_valid_access_token`], which refreshes ahead of expiry and
//! collapses concurrent refreshes into a single token endpoint call.

pub mod callback;
pub mod pkce;
pub mod store;
pub mod token_endpoint;

pub use callback::{wait_for_callback, CallbackParams};
pub use pkce::PkceVerifier;
pub use store::{
    Credential, CredentialStore, FileStore, KeyValueStore, MemoryStore, PendingAuthorization,
    StoreError,
};
pub use token_endpoint::{HttpTokenEndpoint, TokenEndpoint, TokenEndpointError, TokenResponse};

use crate::config::{Config, SpotifyConfig};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, Mutex};
use url::Url;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Authorization state mismatch; restart login")]
    StateMismatch,
    #[error("Authorization denied: {0}")]
    AuthorizationDenied(String),
    #[error("Token exchange failed: {0}")]
    TokenExchangeFailed(String),
    #[error("Refresh token rejected: {0}")]
    RefreshRejected(String),
    #[error("Not authenticated")]
    NotAuthenticated,
    #[error("Network error: {0}")]
    Network(String),
    #[error("Invalid auth configuration: {0}")]
    InvalidConfig(String),
    #[error("Credential storage failed: {0}")]
    Storage(#[from] StoreError),
}

/// Session lifecycle notifications
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    LoggedIn,
    TokenRefreshed,
    LoggedOut,
    /// The server revoked the session; the UI must return to login
    ForcedLogout,
}

/// The subset of [`SpotifyConfig`] the session needs
#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub client_id: String,
    pub redirect_uri: String,
    pub scopes: Vec<String>,
    pub authorize_url: String,
    pub refresh_skew_ms: i64,
}

impl From<&SpotifyConfig> for AuthConfig {
    fn from(config: &SpotifyConfig) -> Self {
        Self {
            client_id: config.client_id.clone(),
            redirect_uri: config.redirect_uri.clone(),
            scopes: config.scopes.clone(),
            authorize_url: config.authorize_url.clone(),
            refresh_skew_ms: i64::try_from(config.refresh_skew_secs.saturating_mul(1000))
                .unwrap_or(i64::MAX),
        }
    }
}

pub struct SessionManager {
    config: AuthConfig,
    store: CredentialStore,
    endpoint: Arc<dyn TokenEndpoint>,
    // Held for the whole refresh round trip so concurrent callers share one refresh.
    // Guards the transport failure of the last round, if it failed that way.
    refresh_lock: Mutex<Option<String>>,
    /// Completed refresh rounds
    refresh_rounds: AtomicU64,
    events: broadcast::Sender<SessionEvent>,
}

impl SessionManager {
    pub fn new(
        config: AuthConfig,
        store: CredentialStore,
        endpoint: Arc<dyn TokenEndpoint>,
    ) -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            config,
            store,
            endpoint,
            refresh_lock: Mutex::new(None),
            refresh_rounds: AtomicU64::new(0),
            events,
        }
    }

    /// File-backed session talking to the configured token endpoint
    pub fn from_config(config: &Config) -> Result<Self, AuthError> {
        let path = config
            .credentials_path()
            .map_err(|e| AuthError::InvalidConfig(e.to_string()))?;
        let endpoint = HttpTokenEndpoint::new(
            config.spotify.token_url.clone(),
            config.spotify.client_id.clone(),
            config.spotify.redirect_uri.clone(),
        );
        Ok(Self::new(
            AuthConfig::from(&config.spotify),
            CredentialStore::new(Box::new(FileStore::new(path))),
            Arc::new(endpoint),
        ))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn redirect_uri(&self) -> &str {
        &self.config.redirect_uri
    }

    /// Generate a fresh PKCE pair, persist it, and return the authorization URL
    pub fn begin_authorization(&self) -> Result<String, AuthError> {
        let pkce = PkceVerifier::generate();
        let mut url = Url::parse(&self.config.authorize_url)
            .map_err(|e| AuthError::InvalidConfig(format!("authorize_url: {}", e)))?;

        url.query_pairs_mut()
            .append_pair("client_id", &self.config.client_id)
            .append_pair("response_type", "code")
            .append_pair("redirect_uri", &self.config.redirect_uri)
            .append_pair("code_challenge_method", "S256")
            .append_pair("code_challenge", &pkce.challenge())
            .append_pair("state", pkce.state())
            .append_pair("scope", &self.config.scopes.join(" "));

        self.store.save_pending(&pkce.into_pending())?;
        tracing::info!("Authorization started");
        Ok(url.into())
    }

    /// Exchange the returned code for a credential.
    ///
    /// The pending authorization is consumed whatever the outcome.
    pub async fn complete_authorization(&self, code: &str, state: &str) -> Result<(), AuthError> {
        let pending = self.store.load_pending()?;
        self.store.clear_pending()?;

        let pending = match pending {
            Some(p) if p.state == state => p,
            Some(_) => {
                tracing::warn!("Authorization callback state does not match");
                return Err(AuthError::StateMismatch);
            }
            None => {
                tracing::warn!("Authorization callback without a pending authorization");
                return Err(AuthError::StateMismatch);
            }
        };

        tracing::debug!(code_len = code.len(), "Exchanging authorization code");
        let response = match self.endpoint.exchange_code(code, &pending.code_verifier).await {
            Ok(r) => r,
            Err(TokenEndpointError::Transport(e)) => return Err(AuthError::Network(e)),
            Err(e) => {
                tracing::error!("Token exchange failed: {}", e);
                self.store.clear_credential()?;
                return Err(AuthError::TokenExchangeFailed(e.to_string()));
            }
        };

        let credential = Credential::from_expires_in(
            response.access_token,
            response.refresh_token,
            response.expires_in,
            now_ms(),
        );
        self.store.save_credential(&credential)?;
        tracing::info!(
            expires_at = credential.expires_at_epoch_ms,
            "Authorization complete"
        );
        let _ = self.events.send(SessionEvent::LoggedIn);
        Ok(())
    }

    /// Complete from the raw redirect parameters
    pub async fn complete_from_callback(&self, params: CallbackParams) -> Result<(), AuthError> {
        if let Some(error) = params.error {
            self.store.clear_pending()?;
            return Err(AuthError::AuthorizationDenied(error));
        }
        match (params.code, params.state) {
            (Some(code), Some(state)) => self.complete_authorization(&code, &state).await,
            _ => {
                self.store.clear_pending()?;
                Err(AuthError::StateMismatch)
            }
        }
    }

    /// Access token safe to use right now, refreshing first if it is inside the skew window.
    ///
    /// `Ok(None)` means there is no usable session: nothing stored, no refresh
    /// token, or the refresh token was rejected. Transport failures keep the
    /// stored credential and surface as [`AuthError::Network`].
    pub async fn get_valid_access_token(&self) -> Result<Option<String>, AuthError> {
        let skew = self.config.refresh_skew_ms;
        let round = self.refresh_rounds.load(Ordering::Acquire);
        match self.store.load_credential()? {
            None => return Ok(None),
            Some(c) if !c.needs_refresh(now_ms(), skew) => return Ok(Some(c.access_token)),
            Some(_) => {}
        }

        let mut last_failure = self.refresh_lock.lock().await;

        // A round finished while we waited and could not reach the server; share its result
        if self.refresh_rounds.load(Ordering::Acquire) != round {
            if let Some(ref reason) = *last_failure {
                return Err(AuthError::Network(reason.clone()));
            }
        }

        // Another caller may have refreshed (or lost the session) while we waited
        let credential = match self.store.load_credential()? {
            None => return Ok(None),
            Some(c) if !c.needs_refresh(now_ms(), skew) => return Ok(Some(c.access_token)),
            Some(c) => c,
        };

        let refresh_token = match credential.refresh_token {
            Some(ref token) => token.clone(),
            None => {
                tracing::warn!("Access token expiring and no refresh token held");
                self.store.clear_credential()?;
                let _ = self.events.send(SessionEvent::LoggedOut);
                return Ok(None);
            }
        };

        tracing::debug!("Refreshing access token");
        let result = self.endpoint.refresh(&refresh_token).await;
        *last_failure = match result {
            Err(TokenEndpointError::Transport(ref e)) => Some(e.clone()),
            _ => None,
        };
        self.refresh_rounds.fetch_add(1, Ordering::AcqRel);

        match result {
            Ok(response) => {
                let refreshed = Credential::from_expires_in(
                    response.access_token,
                    response.refresh_token.or(Some(refresh_token)),
                    response.expires_in,
                    now_ms(),
                );
                self.store.save_credential(&refreshed)?;
                tracing::info!(
                    expires_at = refreshed.expires_at_epoch_ms,
                    "Access token refreshed"
                );
                let _ = self.events.send(SessionEvent::TokenRefreshed);
                Ok(Some(refreshed.access_token))
            }
            Err(TokenEndpointError::Transport(e)) => {
                tracing::warn!("Token refresh did not reach the server: {}", e);
                Err(AuthError::Network(e))
            }
            Err(e) => {
                tracing::error!("{}", AuthError::RefreshRejected(e.to_string()));
                self.store.clear_all()?;
                let _ = self.events.send(SessionEvent::ForcedLogout);
                Ok(None)
            }
        }
    }

    /// Like [`get_valid_access_token`](Self::get_valid_access_token) but treats a missing session as an error
    pub async fn require_access_token(&self) -> Result<String, AuthError> {
        self.get_valid_access_token()
            .await?
            .ok_or(AuthError::NotAuthenticated)
    }

    /// Clear everything; safe to call repeatedly
    pub fn logout(&self) -> Result<(), AuthError> {
        self.store.clear_all()?;
        tracing::info!("Logged out");
        let _ = self.events.send(SessionEvent::LoggedOut);
        Ok(())
    }

    /// Credential present and not yet expired. Routing guard only; requests use
    /// [`get_valid_access_token`](Self::get_valid_access_token).
    pub fn is_authenticated(&self) -> bool {
        match self.store.load_credential() {
            Ok(Some(c)) => !c.is_expired(now_ms()),
            Ok(None) => false,
            Err(e) => {
                tracing::warn!("Could not read credential: {}", e);
                false
            }
        }
    }

    /// A downstream call answered 401: the credential was revoked server-side
    pub fn handle_unauthorized(&self) -> Result<(), AuthError> {
        tracing::warn!("Received 401; clearing session");
        self.store.clear_all()?;
        let _ = self.events.send(SessionEvent::ForcedLogout);
        Ok(())
    }

    /// Stored credential, for status reporting
    pub fn credential(&self) -> Result<Option<Credential>, AuthError> {
        Ok(self.store.load_credential()?)
    }
}

pub(crate) fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
