//! Turning one [`JobRequest`] into an artifact.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use atelier_comfyui::completion::Outcome;
use atelier_comfyui::history::first_artifact;
use atelier_comfyui::manager::ComfyUIManager;

use crate::job::{GeneratedArtifact, JobError, JobRequest};

/// Runs a single job to completion. The queue calls this for one job at
/// a time and bounds it with its own timeout.
#[async_trait]
pub trait JobRunner: Send + Sync + 'static {
    async fn run(&self, request: Arc<JobRequest>) -> Result<GeneratedArtifact, JobError>;
}

/// Runs jobs on a ComfyUI instance: submit, wait for completion,
/// download the first image.
pub struct ComfyUIRunner {
    manager: Arc<ComfyUIManager>,
    completion_timeout: Duration,
}

impl ComfyUIRunner {
    /// Uses the manager's configured completion budget.
    pub fn new(manager: Arc<ComfyUIManager>) -> Self {
        let completion_timeout = manager.completion_config().timeout;
        Self {
            manager,
            completion_timeout,
        }
    }

    pub fn with_completion_timeout(mut self, timeout: Duration) -> Self {
        self.completion_timeout = timeout;
        self
    }
}

#[async_trait]
impl JobRunner for ComfyUIRunner {
    async fn run(&self, request: Arc<JobRequest>) -> Result<GeneratedArtifact, JobError> {
        // Subscribe first so a fast job cannot finish unobserved.
        let stream = match self.manager.open_stream().await {
            Ok(conn) => Some(conn),
            Err(e) => {
                tracing::warn!(error = %e, "Event stream unavailable, will poll history");
                None
            }
        };

        let prompt_id = self.manager.submit(&request.payload).await?;

        let outputs = match self
            .manager
            .await_completion_on(stream, &prompt_id, self.completion_timeout)
            .await
        {
            Outcome::Success(outputs) => outputs,
            Outcome::Failure(failure) => return Err(JobError::execution(failure.to_string())),
            Outcome::Timeout => {
                if let Err(e) = self.manager.cancel(&prompt_id).await {
                    tracing::warn!(prompt_id = %prompt_id, error = %e, "Could not cancel timed-out prompt");
                }
                return Err(JobError::timeout(format!(
                    "no completion within {:?}",
                    self.completion_timeout
                )));
            }
        };

        let artifact = first_artifact(&outputs)
            .cloned()
            .ok_or_else(|| JobError::protocol("no image found in outputs"))?;
        let bytes = self.manager.fetch_artifact(&artifact).await?;

        tracing::debug!(
            prompt_id = %prompt_id,
            filename = %artifact.filename,
            size_kb = bytes.len() / 1024,
            "Artifact retrieved",
        );

        Ok(GeneratedArtifact {
            prompt_id,
            artifact,
            bytes,
            outputs,
        })
    }
}
