/// Token endpoint client (authorization_code and refresh_token grants)
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TokenEndpointError {
    /// The server refused the grant (bad code, revoked refresh token, ...)
    #[error("Token endpoint rejected the grant ({status}): {body}")]
    Rejected { status: u16, body: String },
    #[error("Token endpoint unreachable: {0}")]
    Transport(String),
    #[error("Token endpoint answered with an unexpected body: {0}")]
    Malformed(String),
}

/// Successful token endpoint answer
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    pub expires_in: u64,
}

/// The two grants the session needs
#[async_trait]
pub trait TokenEndpoint: Send + Sync {
    async fn exchange_code(
        &self,
        code: &str,
        code_verifier: &str,
    ) -> Result<TokenResponse, TokenEndpointError>;

    async fn refresh(&self, refresh_token: &str) -> Result<TokenResponse, TokenEndpointError>;
}

/// Form-encoded POSTs against the real token URL
pub struct HttpTokenEndpoint {
    client: Client,
    token_url: String,
    client_id: String,
    redirect_uri: String,
}

impl HttpTokenEndpoint {
    pub fn new(token_url: String, client_id: String, redirect_uri: String) -> Self {
        Self {
            client: Client::new(),
            token_url,
            client_id,
            redirect_uri,
        }
    }

    async fn post_form(&self, params: &[(&str, &str)]) -> Result<TokenResponse, TokenEndpointError> {
        let response = self
            .client
            .post(&self.token_url)
            .form(params)
            .send()
            .await
            .map_err(|e| TokenEndpointError::Transport(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| TokenEndpointError::Transport(e.to_string()))?;

        if is_rejection(status) {
            return Err(TokenEndpointError::Rejected {
                status: status.as_u16(),
                body,
            });
        }
        if !status.is_success() {
            return Err(TokenEndpointError::Transport(format!(
                "HTTP {}: {}",
                status, body
            )));
        }

        parse_token_response(&body)
    }
}

#[async_trait]
impl TokenEndpoint for HttpTokenEndpoint {
    async fn exchange_code(
        &self,
        code: &str,
        code_verifier: &str,
    ) -> Result<TokenResponse, TokenEndpointError> {
        tracing::debug!("Exchanging authorization code for tokens");
        self.post_form(&[
            ("client_id", self.client_id.as_str()),
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", self.redirect_uri.as_str()),
            ("code_verifier", code_verifier),
        ])
        .await
    }

    async fn refresh(&self, refresh_token: &str) -> Result<TokenResponse, TokenEndpointError> {
        tracing::debug!("Requesting refreshed access token");
        self.post_form(&[
            ("client_id", self.client_id.as_str()),
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
        ])
        .await
    }
}

/// 4xx answers mean the grant itself is bad; retrying cannot help
fn is_rejection(status: StatusCode) -> bool {
    status.is_client_error() && status != StatusCode::TOO_MANY_REQUESTS
}

fn parse_token_response(body: &str) -> Result<TokenResponse, TokenEndpointError> {
    let parsed: TokenResponse =
        serde_json::from_str(body).map_err(|e| TokenEndpointError::Malformed(e.to_string()))?;
    if parsed.access_token.is_empty() {
        return Err(TokenEndpointError::Malformed(
            "empty access_token".to_string(),
        ));
    }
    Ok(parsed)
}
