//! Job completion detection.
//!
//! Whether a prompt has finished is decided from two sources sharing one
//! deadline:
//!
//! - **Listening**: frames from the event stream are fed through
//!   [`CompletionState::observe`]. A hint that the job may be done
//!   triggers a history lookup, and only a populated history record
//!   resolves success. An `execution_error` for the prompt resolves
//!   failure immediately.
//! - **Polling**: if the stream cannot be opened, errors, or closes, the
//!   detector drops it and polls `/history/{id}` at a fixed interval
//!   until a record appears. It never goes back to the stream.
//!
//! Every wait is capped by what is left of the budget, so the detector
//! returns [`Outcome::Timeout`] promptly once the budget is spent, after
//! closing any stream it still holds.
//!
//! # Known race
//!
//! A `status` frame reporting an empty backend queue after *any* node of
//! this prompt finished is treated as a completion hint, even if that
//! node is not the one that writes the artifact. History verification
//! usually absorbs this, but if history is populated before the output
//! node's artifacts are recorded the job can resolve early with outputs
//! that lack an image. Callers see that as a missing-artifact error.

use std::collections::HashSet;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;

use crate::api::ComfyUIApi;
use crate::client::WsStream;
use crate::events::ComfyUIEvent;
use crate::history::HistoryOutputs;
use crate::messages::{parse_message, ComfyUIMessage, ProgressData};

/// How long to wait for the close handshake when releasing a stream.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Timing knobs for [`ComfyUIManager::await_completion`](crate::manager::ComfyUIManager::await_completion).
#[derive(Debug, Clone)]
pub struct CompletionConfig {
    /// Overall budget used when the caller does not pass one.
    pub timeout: Duration,
    /// Upper bound on a single stream receive.
    pub recv_timeout: Duration,
    /// Delay between history polls in the fallback path.
    pub poll_interval: Duration,
}

impl Default for CompletionConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(300),
            recv_timeout: Duration::from_secs(5),
            poll_interval: Duration::from_secs(2),
        }
    }
}

/// Resolution of one completion wait.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// History confirmed the job; carries its output mapping.
    Success(HistoryOutputs),
    /// The backend reported an execution error.
    Failure(ExecutionFailure),
    /// The budget elapsed without a resolution.
    Timeout,
}

/// Details of a backend-reported execution error.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionFailure {
    pub node_id: Option<String>,
    pub exception_type: String,
    pub message: String,
}

impl std::fmt::Display for ExecutionFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let message = if self.message.is_empty() {
            "unknown error"
        } else {
            &self.message
        };
        match (&self.node_id, self.exception_type.is_empty()) {
            (Some(node), false) => write!(f, "{} in node {node}: {message}", self.exception_type),
            (Some(node), true) => write!(f, "node {node}: {message}"),
            (None, false) => write!(f, "{}: {message}", self.exception_type),
            (None, true) => f.write_str(message),
        }
    }
}

/// What a single stream frame means for the waiting job.
#[derive(Debug, Clone, PartialEq)]
pub enum Signal {
    /// Nothing decisive; keep listening.
    Pending,
    /// The job may be done; check history.
    Verify,
    /// The backend reported failure for this job.
    Failed(ExecutionFailure),
}

/// Per-job view of the event stream.
#[derive(Debug)]
pub struct CompletionState {
    prompt_id: String,
    finished_nodes: HashSet<String>,
    queue_remaining: Option<i32>,
}

impl CompletionState {
    pub fn new(prompt_id: impl Into<String>) -> Self {
        Self {
            prompt_id: prompt_id.into(),
            finished_nodes: HashSet::new(),
            queue_remaining: None,
        }
    }

    pub fn prompt_id(&self) -> &str {
        &self.prompt_id
    }

    pub fn finished_nodes(&self) -> &HashSet<String> {
        &self.finished_nodes
    }

    pub fn queue_remaining(&self) -> Option<i32> {
        self.queue_remaining
    }

    /// Fold one frame into the state.
    ///
    /// `executed` and `execution_error` frames tagged with another
    /// prompt's id are ignored.
    pub fn observe(&mut self, message: &ComfyUIMessage) -> Signal {
        match message {
            ComfyUIMessage::Executed(data) => {
                if !self.concerns_this_prompt(data.prompt_id.as_deref()) {
                    return Signal::Pending;
                }
                let Some(node) = &data.node else {
                    return Signal::Verify;
                };
                self.finished_nodes.insert(node.clone());
                if data.has_artifact_listing() || self.queue_remaining == Some(0) {
                    Signal::Verify
                } else {
                    Signal::Pending
                }
            }
            ComfyUIMessage::Status(data) => {
                let remaining = data.status.exec_info.queue_remaining;
                self.queue_remaining = Some(remaining);
                if remaining == 0 && !self.finished_nodes.is_empty() {
                    Signal::Verify
                } else {
                    Signal::Pending
                }
            }
            ComfyUIMessage::ExecutionError(data) => {
                if !self.concerns_this_prompt(data.prompt_id.as_deref()) {
                    return Signal::Pending;
                }
                Signal::Failed(ExecutionFailure {
                    node_id: data.node_id.clone(),
                    exception_type: data.exception_type.clone(),
                    message: data.exception_message.clone(),
                })
            }
            ComfyUIMessage::Progress(_)
            | ComfyUIMessage::ExecutionStart(_)
            | ComfyUIMessage::ExecutionCached(_)
            | ComfyUIMessage::Executing(_)
            | ComfyUIMessage::Unknown(_) => Signal::Pending,
        }
    }

    fn concerns_this_prompt(&self, prompt_id: Option<&str>) -> bool {
        prompt_id.map_or(true, |id| id == self.prompt_id)
    }
}

/// The two mutually exclusive ways of waiting.
pub(crate) enum Phase {
    Listening(WsStream),
    Polling,
}

/// One completion wait, from first frame to resolution.
pub(crate) struct CompletionDetector<'a> {
    api: &'a ComfyUIApi,
    events: &'a broadcast::Sender<ComfyUIEvent>,
    config: &'a CompletionConfig,
    state: CompletionState,
    deadline: Instant,
}

impl<'a> CompletionDetector<'a> {
    pub(crate) fn new(
        api: &'a ComfyUIApi,
        events: &'a broadcast::Sender<ComfyUIEvent>,
        config: &'a CompletionConfig,
        prompt_id: &str,
        timeout: Duration,
    ) -> Self {
        Self {
            api,
            events,
            config,
            state: CompletionState::new(prompt_id),
            deadline: Instant::now() + timeout,
        }
    }

    /// Record a switch to polling before [`run`](Self::run) starts, e.g.
    /// because the stream could not be opened.
    pub(crate) fn note_fallback(&self, reason: &str) {
        tracing::warn!(
            prompt_id = %self.state.prompt_id,
            reason,
            "Event stream unavailable, polling history",
        );
        self.emit(ComfyUIEvent::StreamFallback {
            prompt_id: self.state.prompt_id.clone(),
            reason: reason.to_string(),
        });
    }

    pub(crate) async fn run(mut self, initial: Phase) -> Outcome {
        let mut phase = initial;

        loop {
            let remaining = self.remaining();
            if remaining.is_zero() {
                if let Phase::Listening(stream) = phase {
                    release(stream).await;
                }
                return self.finish(Outcome::Timeout);
            }

            phase = match phase {
                Phase::Listening(mut stream) => {
                    let wait = remaining.min(self.config.recv_timeout);
                    match tokio::time::timeout(wait, stream.next()).await {
                        // Sub-timeout; loop to re-check the budget.
                        Err(_) => Phase::Listening(stream),
                        Ok(Some(Ok(Message::Text(text)))) => match self.handle_frame(&text).await {
                            Some(outcome) => {
                                release(stream).await;
                                return self.finish(outcome);
                            }
                            None => Phase::Listening(stream),
                        },
                        Ok(Some(Ok(Message::Close(frame)))) => {
                            tracing::debug!(?frame, "Event stream closed by backend");
                            self.note_fallback("stream closed by backend");
                            Phase::Polling
                        }
                        // Binary preview images, ping/pong.
                        Ok(Some(Ok(_))) => Phase::Listening(stream),
                        Ok(Some(Err(e))) => {
                            self.note_fallback(&format!("stream receive error: {e}"));
                            Phase::Polling
                        }
                        Ok(None) => {
                            self.note_fallback("stream ended");
                            Phase::Polling
                        }
                    }
                }
                Phase::Polling => {
                    if let Some(outputs) = self.check_history(remaining).await {
                        return self.finish(Outcome::Success(outputs));
                    }
                    let pause = self.remaining().min(self.config.poll_interval);
                    tokio::time::sleep(pause).await;
                    Phase::Polling
                }
            };
        }
    }

    /// Interpret one text frame. Returns the outcome if it resolves the job.
    async fn handle_frame(&mut self, text: &str) -> Option<Outcome> {
        let message = match parse_message(text) {
            Ok(message) => message,
            Err(e) => {
                tracing::debug!(error = %e, raw_message = %text, "Unparseable stream frame");
                return None;
            }
        };

        match &message {
            ComfyUIMessage::Progress(data) => self.report_progress(data),
            ComfyUIMessage::Unknown(kind) => {
                tracing::trace!(kind = %kind, "Ignoring stream frame");
            }
            other => {
                tracing::trace!(prompt_id = %self.state.prompt_id, frame = ?other, "Stream frame");
            }
        }

        match self.state.observe(&message) {
            Signal::Pending => None,
            Signal::Failed(failure) => Some(Outcome::Failure(failure)),
            Signal::Verify => {
                let outputs = self.check_history(self.remaining()).await?;
                Some(Outcome::Success(outputs))
            }
        }
    }

    /// Ask history whether the job is done, giving up at `limit`.
    ///
    /// Transport errors and slow responses count as "not yet".
    async fn check_history(&self, limit: Duration) -> Option<HistoryOutputs> {
        let prompt_id = &self.state.prompt_id;
        match tokio::time::timeout(limit, self.api.get_history(prompt_id)).await {
            Ok(Ok(record)) => record.into_outputs(),
            Ok(Err(e)) => {
                tracing::warn!(prompt_id = %prompt_id, error = %e, "History lookup failed");
                None
            }
            Err(_) => None,
        }
    }

    fn report_progress(&self, data: &ProgressData) {
        if data
            .prompt_id
            .as_deref()
            .is_some_and(|id| id != self.state.prompt_id)
        {
            return;
        }
        let percent = data.percent();
        tracing::debug!(
            prompt_id = %self.state.prompt_id,
            value = data.value,
            max = data.max,
            percent,
            "Generation progress",
        );
        self.emit(ComfyUIEvent::GenerationProgress {
            prompt_id: self.state.prompt_id.clone(),
            value: data.value,
            max: data.max,
            percent,
        });
    }

    fn finish(self, outcome: Outcome) -> Outcome {
        let prompt_id = self.state.prompt_id.clone();
        match &outcome {
            Outcome::Success(outputs) => {
                tracing::info!(prompt_id = %prompt_id, nodes = outputs.len(), "Generation completed");
                self.emit(ComfyUIEvent::GenerationCompleted { prompt_id });
            }
            Outcome::Failure(failure) => {
                tracing::error!(prompt_id = %prompt_id, error = %failure, "Generation failed");
                self.emit(ComfyUIEvent::GenerationError {
                    prompt_id,
                    error: failure.to_string(),
                });
            }
            Outcome::Timeout => {
                tracing::warn!(
                    prompt_id = %prompt_id,
                    finished_nodes = self.state.finished_nodes.len(),
                    "Generation timed out",
                );
                self.emit(ComfyUIEvent::GenerationTimedOut { prompt_id });
            }
        }
        outcome
    }

    fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    fn emit(&self, event: ComfyUIEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

/// Close a stream without letting a slow peer hold up the caller.
async fn release(mut stream: WsStream) {
    if tokio::time::timeout(CLOSE_TIMEOUT, stream.close(None))
        .await
        .is_err()
    {
        tracing::debug!("Stream close handshake timed out");
    }
}
