//! Authorized Web API gateway.
//!
//! All catalog and control requests go through [`WebApi`] so they share the
//! session's refresh handling and its 401 policy.

use crate::auth::{AuthError, SessionManager};
use crate::models::AccountTier;
use reqwest::{Client, Method, StatusCode};
use serde::{de::DeserializeOwned, Deserialize};
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    /// The server revoked the credential; the session has already been cleared
    #[error("Unauthorized; session cleared")]
    Unauthorized,
    #[error("Not authenticated")]
    NotAuthenticated,
    #[error("API returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("Network error: {0}")]
    Network(String),
    #[error("Failed to decode response: {0}")]
    Decode(String),
}

impl From<AuthError> for ApiError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::Network(e) => ApiError::Network(e),
            _ => ApiError::NotAuthenticated,
        }
    }
}

/// `GET /me` payload
#[derive(Debug, Clone, Deserialize)]
pub struct CurrentUser {
    pub id: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub product: Option<String>,
}

impl CurrentUser {
    pub fn tier(&self) -> AccountTier {
        AccountTier::from_product(self.product.as_deref())
    }
}

pub struct WebApi {
    http: Client,
    base_url: String,
    session: Arc<SessionManager>,
}

impl WebApi {
    pub fn new(base_url: impl Into<String>, session: Arc<SessionManager>) -> Self {
        Self {
            http: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            session,
        }
    }

    pub fn session(&self) -> &Arc<SessionManager> {
        &self.session
    }

    /// Send an authorized request. `Ok(None)` for empty (204) responses.
    pub async fn send(
        &self,
        method: Method,
        endpoint: &str,
        body: Option<&Value>,
    ) -> Result<Option<Value>, ApiError> {
        let token = self
            .session
            .get_valid_access_token()
            .await?
            .ok_or(ApiError::NotAuthenticated)?;

        let url = format!("{}/{}", self.base_url, endpoint.trim_start_matches('/'));
        tracing::debug!(method = %method, url = %url, "Web API request");

        let mut request = self.http.request(method, &url).bearer_auth(token);
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request
            .send()
            .await
            .map_err(|e| ApiError::Network(e.to_string()))?;
        let status = response.status();

        if status == StatusCode::UNAUTHORIZED {
            if let Err(e) = self.session.handle_unauthorized() {
                tracing::error!("Failed to clear session after 401: {}", e);
            }
            return Err(ApiError::Unauthorized);
        }

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ApiError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let text = response
            .text()
            .await
            .map_err(|e| ApiError::Network(e.to_string()))?;
        if status == StatusCode::NO_CONTENT || text.trim().is_empty() {
            return Ok(None);
        }

        serde_json::from_str(&text)
            .map(Some)
            .map_err(|e| ApiError::Decode(e.to_string()))
    }

    /// `GET` and decode into `T`
    pub async fn get_json<T: DeserializeOwned>(&self, endpoint: &str) -> Result<T, ApiError> {
        let value = self
            .send(Method::GET, endpoint, None)
            .await?
            .ok_or_else(|| ApiError::Decode(format!("empty response from {}", endpoint)))?;
        serde_json::from_value(value).map_err(|e| ApiError::Decode(e.to_string()))
    }

    pub async fn current_user(&self) -> Result<CurrentUser, ApiError> {
        self.get_json("me").await
    }

    /// Premium when the profile's `product` says so, free otherwise
    pub async fn account_tier(&self) -> Result<AccountTier, ApiError> {
        let user = self.current_user().await?;
        let tier = user.tier();
        tracing::info!(user = %user.id, tier = %tier, "Resolved account tier");
        Ok(tier)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{
        AuthConfig, Credential, CredentialStore, SessionEvent, TokenEndpoint, TokenEndpointError,
        TokenResponse,
    };
    use crate::config::SpotifyConfig;
    use async_trait::async_trait;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    struct NoEndpoint;

    #[async_trait]
    impl TokenEndpoint for NoEndpoint {
        async fn exchange_code(&self, _: &str, _: &str) -> Result<TokenResponse, TokenEndpointError> {
            Err(TokenEndpointError::Transport("unused".into()))
        }

        async fn refresh(&self, _: &str) -> Result<TokenResponse, TokenEndpointError> {
            Err(TokenEndpointError::Transport("unused".into()))
        }
    }

    /// One-shot HTTP server answering every request with `status` and `body`
    async fn serve(status: &'static str, body: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let mut buf = [0u8; 4096];
                let _ = socket.read(&mut buf).await;
                let response = format!(
                    "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    status,
                    body.len(),
                    body
                );
                let _ = socket.write_all(response.as_bytes()).await;
            }
        });
        format!("http://{}", addr)
    }

    fn signed_in_session() -> Arc<SessionManager> {
        let store = CredentialStore::in_memory();
        store
            .save_credential(&Credential::from_expires_in(
                "token".into(),
                Some("refresh".into()),
                3600,
                chrono::Utc::now().timestamp_millis(),
            ))
            .unwrap();
        Arc::new(SessionManager::new(
            AuthConfig::from(&SpotifyConfig::default()),
            store,
            Arc::new(NoEndpoint),
        ))
    }

    #[tokio::test]
    async fn test_premium_profile_maps_to_premium_tier() {
        let base = serve("200 OK", r#"{"id":"u1","display_name":"U","product":"premium"}"#).await;
        let api = WebApi::new(base, signed_in_session());
        assert_eq!(api.account_tier().await.unwrap(), AccountTier::Premium);
    }

    #[tokio::test]
    async fn test_no_content_is_none() {
        let base = serve("204 No Content", "").await;
        let api = WebApi::new(base, signed_in_session());
        let result = api.send(Method::PUT, "/me/player/play", None).await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_401_forces_logout() {
        let base = serve("401 Unauthorized", r#"{"error":{"status":401}}"#).await;
        let session = signed_in_session();
        let mut events = session.subscribe();
        let api = WebApi::new(base, session.clone());

        assert!(matches!(api.current_user().await, Err(ApiError::Unauthorized)));
        assert!(!session.is_authenticated());
        assert_eq!(events.recv().await.unwrap(), SessionEvent::ForcedLogout);
    }

    #[tokio::test]
    async fn test_other_errors_keep_session() {
        let base = serve("500 Internal Server Error", "boom").await;
        let session = signed_in_session();
        let api = WebApi::new(base, session.clone());

        assert!(matches!(
            api.current_user().await,
            Err(ApiError::Status { status: 500, .. })
        ));
        assert!(session.is_authenticated());
    }

    #[tokio::test]
    async fn test_signed_out_never_hits_network() {
        let session = Arc::new(SessionManager::new(
            AuthConfig::from(&SpotifyConfig::default()),
            CredentialStore::in_memory(),
            Arc::new(NoEndpoint),
        ));
        let api = WebApi::new("http://127.0.0.1:9", session);
        assert!(matches!(api.current_user().await, Err(ApiError::NotAuthenticated)));
    }
}
