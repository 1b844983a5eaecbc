//! REST API client for the ComfyUI HTTP endpoints.
//!
//! Wraps workflow submission, capability discovery, history lookup,
//! artifact download, and queue deletion using [`reqwest`]. Nothing here
//! retries: failures go straight back to the caller.

use std::time::Duration;

use serde::Deserialize;

use crate::history::{ArtifactRef, HistoryRecord};

const SUBMIT_TIMEOUT: Duration = Duration::from_secs(30);
const OBJECT_INFO_TIMEOUT: Duration = Duration::from_secs(30);
const HISTORY_TIMEOUT: Duration = Duration::from_secs(10);
const VIEW_TIMEOUT: Duration = Duration::from_secs(60);

/// HTTP client for a single ComfyUI instance.
#[derive(Clone)]
pub struct ComfyUIApi {
    client: reqwest::Client,
    api_url: String,
}

/// Response returned by the ComfyUI `/prompt` endpoint after
/// successfully queuing a workflow.
#[derive(Debug, Deserialize)]
pub struct SubmitResponse {
    /// Server-assigned identifier for the queued prompt.
    #[serde(default)]
    pub prompt_id: String,
    /// Position in the backend's execution queue.
    #[serde(default)]
    pub number: Option<i64>,
}

/// Errors from the ComfyUI REST API layer.
#[derive(Debug, thiserror::Error)]
pub enum ComfyUIApiError {
    /// The HTTP request itself failed (network, DNS, TLS, timeout).
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// ComfyUI returned a non-2xx status code.
    #[error("ComfyUI API error ({status}): {body}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Raw response body for debugging.
        body: String,
    },

    /// The response body was not the JSON shape we expected.
    #[error("Malformed ComfyUI response: {0}")]
    Malformed(#[from] serde_json::Error),

    /// The response parsed but a required field was absent or empty.
    #[error("ComfyUI response is missing `{0}`")]
    MissingField(&'static str),
}

impl ComfyUIApiError {
    /// Transport-level failure, as opposed to a bad or unexpected response.
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Request(e) if !e.is_decode())
    }
}

impl ComfyUIApi {
    /// Create a new API client for a ComfyUI instance.
    ///
    /// * `api_url` - Base HTTP URL, e.g. `http://host:8188`.
    pub fn new(api_url: impl Into<String>) -> Self {
        Self::with_client(reqwest::Client::new(), api_url)
    }

    /// Create an API client reusing an existing [`reqwest::Client`].
    pub fn with_client(client: reqwest::Client, api_url: impl Into<String>) -> Self {
        let api_url = api_url.into().trim_end_matches('/').to_string();
        Self { client, api_url }
    }

    /// Base HTTP URL this client talks to.
    pub fn api_url(&self) -> &str {
        &self.api_url
    }

    /// Submit a workflow for execution.
    ///
    /// Sends `POST /prompt` with the workflow and the session's client ID.
    /// A response without a `prompt_id` is a protocol error.
    pub async fn submit_workflow(
        &self,
        workflow: &serde_json::Value,
        client_id: &str,
    ) -> Result<SubmitResponse, ComfyUIApiError> {
        let body = serde_json::json!({
            "prompt": workflow,
            "client_id": client_id,
        });

        let response = self
            .client
            .post(format!("{}/prompt", self.api_url))
            .json(&body)
            .timeout(SUBMIT_TIMEOUT)
            .send()
            .await?;

        let submitted: SubmitResponse = Self::parse_response(response).await?;
        if submitted.prompt_id.is_empty() {
            return Err(ComfyUIApiError::MissingField("prompt_id"));
        }
        Ok(submitted)
    }

    /// Fetch the node capability map from `GET /object_info`.
    pub async fn get_object_info(&self) -> Result<serde_json::Value, ComfyUIApiError> {
        let response = self
            .client
            .get(format!("{}/object_info", self.api_url))
            .timeout(OBJECT_INFO_TIMEOUT)
            .send()
            .await?;

        Self::parse_response(response).await
    }

    /// Retrieve the history record for a prompt.
    ///
    /// A non-success status or a body without the prompt's key yields an
    /// empty record, so callers can poll until it is populated. Only
    /// transport failures and unparseable bodies are errors.
    pub async fn get_history(&self, prompt_id: &str) -> Result<HistoryRecord, ComfyUIApiError> {
        let response = self
            .client
            .get(format!("{}/history/{}", self.api_url, prompt_id))
            .timeout(HISTORY_TIMEOUT)
            .send()
            .await?;

        if !response.status().is_success() {
            tracing::debug!(
                prompt_id,
                status = response.status().as_u16(),
                "History not available yet",
            );
            return Ok(HistoryRecord::default());
        }

        let body = response.bytes().await?;
        Ok(HistoryRecord::from_response(&body, prompt_id)?)
    }

    /// Download an artifact's raw bytes via `GET /view`.
    pub async fn view(&self, artifact: &ArtifactRef) -> Result<Vec<u8>, ComfyUIApiError> {
        let response = self
            .client
            .get(format!("{}/view", self.api_url))
            .query(&[
                ("filename", artifact.filename.as_str()),
                ("subfolder", artifact.subfolder.as_str()),
                ("type", artifact.kind.as_str()),
            ])
            .timeout(VIEW_TIMEOUT)
            .send()
            .await?;

        let response = Self::ensure_success(response).await?;
        let bytes = response.bytes().await?;

        tracing::debug!(
            filename = %artifact.filename,
            size_kb = bytes.len() / 1024,
            "Downloaded artifact",
        );
        Ok(bytes.to_vec())
    }

    /// Remove a queued prompt from the backend queue.
    ///
    /// Sends a `POST /queue` request asking ComfyUI to delete the
    /// specified prompt. Has no effect on a prompt that already started.
    pub async fn cancel_execution(&self, prompt_id: &str) -> Result<(), ComfyUIApiError> {
        let body = serde_json::json!({
            "delete": [prompt_id],
        });

        let response = self
            .client
            .post(format!("{}/queue", self.api_url))
            .json(&body)
            .timeout(SUBMIT_TIMEOUT)
            .send()
            .await?;

        Self::ensure_success(response).await?;
        Ok(())
    }

    // ---- private helpers ----

    /// Ensure the response has a success status code. Returns the
    /// response unchanged on success, or a [`ComfyUIApiError::Status`]
    /// containing the status and body text on failure.
    async fn ensure_success(
        response: reqwest::Response,
    ) -> Result<reqwest::Response, ComfyUIApiError> {
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            return Err(ComfyUIApiError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }

    /// Parse a successful JSON response body into the expected type.
    ///
    /// Reads the body first so that a bad payload surfaces as
    /// [`ComfyUIApiError::Malformed`] rather than a transport error.
    async fn parse_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, ComfyUIApiError> {
        let response = Self::ensure_success(response).await?;
        let body = response.bytes().await?;
        Ok(serde_json::from_slice(&body)?)
    }
}
