//! WebSocket client for the ComfyUI event stream.
//!
//! [`ComfyUIClient`] holds the stream URL and the process-wide
//! [`BackendSession`]. Call [`ComfyUIClient::connect`] to open a live
//! [`ComfyUIConnection`]; ComfyUI only addresses job events to the
//! client id the job was submitted with, so submissions and stream
//! subscriptions must share one session.

use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

/// The raw WebSocket stream type used for ComfyUI connections.
pub type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Random identifier correlating this process's submissions with its
/// stream events. Generated once and never changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendSession {
    client_id: String,
}

impl BackendSession {
    /// Generate a fresh session (UUID v4).
    pub fn new() -> Self {
        Self {
            client_id: uuid::Uuid::new_v4().to_string(),
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }
}

impl Default for BackendSession {
    fn default() -> Self {
        Self::new()
    }
}

/// Connection configuration for one ComfyUI instance's event stream.
pub struct ComfyUIClient {
    ws_url: String,
    session: BackendSession,
}

/// A live WebSocket subscription to the ComfyUI event stream.
///
/// Dropping it closes the underlying socket.
pub struct ComfyUIConnection {
    /// Client ID sent during the WebSocket handshake.
    pub client_id: String,
    /// The raw WebSocket stream for reading frames.
    pub ws_stream: WsStream,
}

impl std::fmt::Debug for ComfyUIConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComfyUIConnection")
            .field("client_id", &self.client_id)
            .finish_non_exhaustive()
    }
}

impl ComfyUIClient {
    /// Create a client for the instance at `api_url` (e.g. `http://host:8188`).
    ///
    /// The stream URL is derived from it: `http` becomes `ws`, `https`
    /// becomes `wss`, and the path is replaced by `/ws`.
    pub fn new(api_url: &str, session: BackendSession) -> Result<Self, ComfyUIClientError> {
        Ok(Self {
            ws_url: derive_ws_url(api_url)?,
            session,
        })
    }

    /// WebSocket endpoint (e.g. `ws://host:8188/ws`).
    pub fn ws_url(&self) -> &str {
        &self.ws_url
    }

    pub fn session(&self) -> &BackendSession {
        &self.session
    }

    /// Open a stream subscription scoped to this client's session.
    pub async fn connect(&self) -> Result<ComfyUIConnection, ComfyUIClientError> {
        let client_id = self.session.client_id().to_string();
        let url = format!("{}?clientId={}", self.ws_url, client_id);

        let (ws_stream, _response) = connect_async(url.as_str()).await.map_err(|e| {
            ComfyUIClientError::Connection(format!(
                "Failed to connect to ComfyUI at {}: {e}",
                self.ws_url
            ))
        })?;

        tracing::debug!(client_id = %client_id, ws_url = %self.ws_url, "Stream subscription opened");

        Ok(ComfyUIConnection {
            client_id,
            ws_stream,
        })
    }
}

/// Map an HTTP base URL onto the ComfyUI WebSocket endpoint.
pub fn derive_ws_url(api_url: &str) -> Result<String, ComfyUIClientError> {
    let mut url = reqwest::Url::parse(api_url)
        .map_err(|e| ComfyUIClientError::InvalidUrl(format!("{api_url}: {e}")))?;

    let scheme = match url.scheme() {
        "http" => "ws",
        "https" => "wss",
        other => {
            return Err(ComfyUIClientError::InvalidUrl(format!(
                "{api_url}: unsupported scheme '{other}'"
            )))
        }
    };
    url.set_scheme(scheme)
        .map_err(|()| ComfyUIClientError::InvalidUrl(api_url.to_string()))?;
    url.set_path("/ws");
    url.set_query(None);
    url.set_fragment(None);
    Ok(url.to_string())
}

/// Errors that can occur when working with the WebSocket client.
#[derive(Debug, thiserror::Error)]
pub enum ComfyUIClientError {
    /// The configured backend URL cannot be turned into a stream URL.
    #[error("Invalid ComfyUI URL: {0}")]
    InvalidUrl(String),

    /// Failed to establish the WebSocket connection.
    #[error("Connection error: {0}")]
    Connection(String),
}
