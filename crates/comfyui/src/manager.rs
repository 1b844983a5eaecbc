//! ComfyUI protocol client.
//!
//! [`ComfyUIManager`] owns the process-wide [`BackendSession`] and ties
//! together the REST API, the event stream, capability discovery, and
//! completion detection for a single ComfyUI instance.
//!
//! Job-level events are broadcast via a [`tokio::sync::broadcast`]
//! channel. Call [`ComfyUIManager::subscribe`] to receive them.

use std::time::Duration;

use tokio::sync::broadcast;

use crate::api::{ComfyUIApi, ComfyUIApiError};
use crate::client::{BackendSession, ComfyUIClient, ComfyUIClientError, ComfyUIConnection};
use crate::completion::{CompletionConfig, CompletionDetector, Outcome, Phase};
use crate::events::ComfyUIEvent;
use crate::history::{ArtifactRef, HistoryRecord};
use crate::metadata::{BackendCapabilities, MetadataCache};

/// Broadcast channel capacity for job events.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Protocol client for one ComfyUI instance.
///
/// Created once at startup and shared behind an `Arc`. Nothing here
/// retries; every backend failure is returned to the caller.
pub struct ComfyUIManager {
    api: ComfyUIApi,
    client: ComfyUIClient,
    metadata: MetadataCache,
    event_tx: broadcast::Sender<ComfyUIEvent>,
    completion: CompletionConfig,
}

impl ComfyUIManager {
    /// Build a client for the instance at `server_url` with a fresh session.
    pub fn new(
        server_url: &str,
        completion: CompletionConfig,
    ) -> Result<Self, ComfyUIClientError> {
        let api = ComfyUIApi::new(server_url);
        let client = ComfyUIClient::new(api.api_url(), BackendSession::new())?;
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        tracing::info!(
            api_url = %api.api_url(),
            ws_url = %client.ws_url(),
            client_id = %client.session().client_id(),
            "ComfyUI client ready",
        );

        Ok(Self {
            api,
            client,
            metadata: MetadataCache::new(),
            event_tx,
            completion,
        })
    }

    pub fn session(&self) -> &BackendSession {
        self.client.session()
    }

    pub fn api_url(&self) -> &str {
        self.api.api_url()
    }

    pub fn completion_config(&self) -> &CompletionConfig {
        &self.completion
    }

    /// Subscribe to job events.
    pub fn subscribe(&self) -> broadcast::Receiver<ComfyUIEvent> {
        self.event_tx.subscribe()
    }

    /// Queue a backend-ready workflow and return its prompt id.
    pub async fn submit(&self, payload: &serde_json::Value) -> Result<String, ComfyUIApiError> {
        let response = self
            .api
            .submit_workflow(payload, self.session().client_id())
            .await?;

        tracing::info!(
            prompt_id = %response.prompt_id,
            backend_position = ?response.number,
            "Workflow submitted to ComfyUI",
        );

        Ok(response.prompt_id)
    }

    /// Samplers and schedulers the backend accepts.
    ///
    /// Never fails: falls back to stock lists and caches the first full
    /// discovery for the process lifetime.
    pub async fn fetch_metadata(&self) -> BackendCapabilities {
        self.metadata.get_or_fetch(&self.api).await
    }

    /// Open an event-stream subscription scoped to this session.
    ///
    /// Open it before [`submit`](Self::submit) and hand it to
    /// [`await_completion_on`](Self::await_completion_on) so that no
    /// frame of a fast job is missed.
    pub async fn open_stream(&self) -> Result<ComfyUIConnection, ComfyUIClientError> {
        self.client.connect().await
    }

    /// Wait for `prompt_id` to resolve, opening a new stream subscription.
    ///
    /// Falls back to history polling when the stream cannot be opened.
    pub async fn await_completion(&self, prompt_id: &str, timeout: Duration) -> Outcome {
        let stream = match self.open_stream().await {
            Ok(conn) => Some(conn),
            Err(e) => {
                tracing::warn!(prompt_id, error = %e, "Could not open event stream");
                None
            }
        };
        self.await_completion_on(stream, prompt_id, timeout).await
    }

    /// Wait for `prompt_id` to resolve on an already opened stream, or by
    /// polling history when `stream` is `None`.
    ///
    /// The stream is closed before this returns, whatever the outcome.
    pub async fn await_completion_on(
        &self,
        stream: Option<ComfyUIConnection>,
        prompt_id: &str,
        timeout: Duration,
    ) -> Outcome {
        let detector =
            CompletionDetector::new(&self.api, &self.event_tx, &self.completion, prompt_id, timeout);

        let phase = match stream {
            Some(conn) => Phase::Listening(conn.ws_stream),
            None => {
                detector.note_fallback("stream subscription could not be opened");
                Phase::Polling
            }
        };

        detector.run(phase).await
    }

    /// Download an artifact's bytes.
    pub async fn fetch_artifact(&self, artifact: &ArtifactRef) -> Result<Vec<u8>, ComfyUIApiError> {
        self.api.view(artifact).await
    }

    /// Look up a prompt's history record. Unpopulated is not an error.
    pub async fn fetch_history(&self, prompt_id: &str) -> Result<HistoryRecord, ComfyUIApiError> {
        self.api.get_history(prompt_id).await
    }

    /// Ask the backend to drop a queued prompt.
    pub async fn cancel(&self, prompt_id: &str) -> Result<(), ComfyUIApiError> {
        self.api.cancel_execution(prompt_id).await?;
        tracing::info!(prompt_id, "Asked ComfyUI to drop prompt");
        Ok(())
    }
}
