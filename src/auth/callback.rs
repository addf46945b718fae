/// Loopback listener for the authorization redirect
use std::net::SocketAddr;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use url::Url;

const SUCCESS_PAGE: &str = "<!DOCTYPE html>\r\n\
<html>\r\n\
<head><title>Authentication Complete</title></head>\r\n\
<body style=\"font-family: Arial, sans-serif; text-align: center; padding: 50px;\">\r\n\
<h1>Authentication Successful</h1>\r\n\
<p>You can close this window.</p>\r\n\
</body>\r\n\
</html>\r\n";

const FAILURE_PAGE: &str = "<!DOCTYPE html>\r\n\
<html>\r\n\
<body>\r\n\
<p>Authentication failed. Please try again.</p>\r\n\
</body>\r\n\
</html>\r\n";

/// Query parameters delivered on the return leg of the redirect
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallbackParams {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
}

impl CallbackParams {
    /// Parse the request target of a callback (`/callback?code=..&state=..`).
    ///
    /// Returns `None` when the path is not `callback_path`.
    pub fn from_request_target(target: &str, callback_path: &str) -> Option<Self> {
        // Request targets are origin-form; give them a base to parse against
        let url = Url::parse("http://127.0.0.1").ok()?.join(target).ok()?;
        if url.path() != callback_path {
            return None;
        }

        let mut params = CallbackParams::default();
        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "code" => params.code = Some(value.into_owned()),
                "state" => params.state = Some(value.into_owned()),
                "error" => params.error = Some(value.into_owned()),
                _ => {}
            }
        }
        Some(params)
    }
}

/// Path component of a redirect URI, e.g. `/callback`
pub fn callback_path(redirect_uri: &str) -> String {
    Url::parse(redirect_uri)
        .map(|u| u.path().to_string())
        .unwrap_or_else(|_| "/callback".to_string())
}

/// Accept connections on `addr` until one hits `path`, answer it, and return its parameters
pub async fn wait_for_callback(addr: SocketAddr, path: &str) -> std::io::Result<CallbackParams> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!("OAuth callback server listening on {}", addr);

    loop {
        let (socket, peer) = listener.accept().await?;
        tracing::debug!("Callback connection from {}", peer);
        match handle_request(socket, path).await {
            Ok(Some(params)) => return Ok(params),
            Ok(None) => continue,
            Err(e) => {
                tracing::warn!("Error handling callback request: {}", e);
            }
        }
    }
}

async fn handle_request(socket: TcpStream, path: &str) -> std::io::Result<Option<CallbackParams>> {
    let (reader, mut writer) = socket.into_split();
    let mut reader = BufReader::new(reader);
    let mut request_line = String::new();
    reader.read_line(&mut request_line).await?;

    let params = request_line
        .split_whitespace()
        .nth(1)
        .and_then(|target| CallbackParams::from_request_target(target, path));

    let response = match params {
        Some(ref p) if p.error.is_none() && p.code.is_some() => {
            http_response("200 OK", SUCCESS_PAGE)
        }
        Some(_) => http_response("400 Bad Request", FAILURE_PAGE),
        None => http_response("404 Not Found", ""),
    };

    writer.write_all(response.as_bytes()).await?;
    writer.flush().await?;

    if params.is_some() {
        tracing::info!("OAuth callback received");
    }
    Ok(params)
}

fn http_response(status: &str, body: &str) -> String {
    format!(
        "HTTP/1.1 {}\r\nContent-Type: text/html\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        body.len(),
        body
    )
}
