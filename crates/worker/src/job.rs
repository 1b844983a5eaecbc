//! Jobs, their results, and where results are delivered.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use atelier_comfyui::api::ComfyUIApiError;
use atelier_comfyui::history::{ArtifactRef, HistoryOutputs};
use atelier_core::types::{JobId, Timestamp};
use serde::Serialize;
use tokio::sync::oneshot;

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

/// What the front end hands to the queue. Immutable once enqueued.
#[derive(Debug, Clone)]
pub struct JobRequest {
    /// Backend-ready workflow.
    pub payload: serde_json::Value,
    /// Echoed back in the success result (e.g. sampler and seed).
    pub metadata: serde_json::Value,
    /// Who asked, for queue listings.
    pub requester: Option<String>,
}

impl JobRequest {
    pub fn new(payload: serde_json::Value) -> Self {
        Self {
            payload,
            metadata: serde_json::Value::Null,
            requester: None,
        }
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_requester(mut self, requester: impl Into<String>) -> Self {
        self.requester = Some(requester.into());
        self
    }
}

/// A request the queue owns until its result is delivered.
pub(crate) struct Job {
    pub id: JobId,
    pub request: Arc<JobRequest>,
    pub sink: ResultSink,
    pub enqueued_at: Timestamp,
}

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

/// Closed set of reasons a job can fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Transport failure talking to the backend.
    Network,
    /// The backend answered with something unusable.
    Protocol,
    /// A completion or whole-job budget ran out.
    Timeout,
    /// The backend reported that the workflow failed.
    Execution,
    /// The job run itself crashed.
    Internal,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Network => "network",
            Self::Protocol => "protocol",
            Self::Timeout => "timeout",
            Self::Execution => "execution",
            Self::Internal => "internal",
        })
    }
}

/// Error returned by a [`JobRunner`](crate::runner::JobRunner).
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{kind} error: {reason}")]
pub struct JobError {
    pub kind: FailureKind,
    pub reason: String,
}

impl JobError {
    pub fn new(kind: FailureKind, reason: impl Into<String>) -> Self {
        Self {
            kind,
            reason: reason.into(),
        }
    }

    pub fn protocol(reason: impl Into<String>) -> Self {
        Self::new(FailureKind::Protocol, reason)
    }

    pub fn timeout(reason: impl Into<String>) -> Self {
        Self::new(FailureKind::Timeout, reason)
    }

    pub fn execution(reason: impl Into<String>) -> Self {
        Self::new(FailureKind::Execution, reason)
    }

    pub fn internal(reason: impl Into<String>) -> Self {
        Self::new(FailureKind::Internal, reason)
    }
}

impl From<ComfyUIApiError> for JobError {
    fn from(err: ComfyUIApiError) -> Self {
        let kind = if err.is_transport() {
            FailureKind::Network
        } else {
            FailureKind::Protocol
        };
        Self::new(kind, err.to_string())
    }
}

/// What a successful run produced.
#[derive(Debug, Clone)]
pub struct GeneratedArtifact {
    pub prompt_id: String,
    pub artifact: ArtifactRef,
    pub bytes: Vec<u8>,
    pub outputs: HistoryOutputs,
}

/// Successful job result.
#[derive(Debug, Clone)]
pub struct JobSuccess {
    pub job_id: JobId,
    pub prompt_id: String,
    pub artifact: ArtifactRef,
    pub bytes: Vec<u8>,
    pub outputs: HistoryOutputs,
    /// The request's metadata, echoed.
    pub metadata: serde_json::Value,
    pub elapsed: Duration,
}

/// Failed job result.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("job {job_id} failed ({kind}): {reason}")]
pub struct JobFailure {
    pub job_id: JobId,
    pub kind: FailureKind,
    pub reason: String,
}

pub type JobResult = Result<JobSuccess, JobFailure>;

// ---------------------------------------------------------------------------
// Sinks
// ---------------------------------------------------------------------------

/// Where a job's result goes. Consumed on delivery, so each job's sink
/// fires at most once; the queue guarantees it fires at least once.
pub struct ResultSink {
    inner: SinkInner,
}

enum SinkInner {
    Channel(oneshot::Sender<JobResult>),
    Callback(Box<dyn FnOnce(JobResult) + Send>),
}

impl ResultSink {
    /// A sink paired with the receiver the result will arrive on.
    pub fn channel() -> (Self, oneshot::Receiver<JobResult>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                inner: SinkInner::Channel(tx),
            },
            rx,
        )
    }

    /// A sink that calls `f` with the result, on the queue's worker task.
    pub fn callback(f: impl FnOnce(JobResult) + Send + 'static) -> Self {
        Self {
            inner: SinkInner::Callback(Box::new(f)),
        }
    }

    /// Hand over the result. A dropped receiver or a panicking callback
    /// is logged and otherwise ignored.
    pub(crate) fn deliver(self, result: JobResult) {
        let job_id = match &result {
            Ok(success) => success.job_id,
            Err(failure) => failure.job_id,
        };
        match self.inner {
            SinkInner::Channel(tx) => {
                if tx.send(result).is_err() {
                    tracing::debug!(job_id, "Result receiver dropped before delivery");
                }
            }
            SinkInner::Callback(f) => {
                if std::panic::catch_unwind(AssertUnwindSafe(|| f(result))).is_err() {
                    tracing::error!(job_id, "Result callback panicked");
                }
            }
        }
    }
}

impl std::fmt::Debug for ResultSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self.inner {
            SinkInner::Channel(_) => "channel",
            SinkInner::Callback(_) => "callback",
        };
        f.debug_struct("ResultSink").field("kind", &kind).finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    fn failure(job_id: JobId) -> JobResult {
        Err(JobFailure {
            job_id,
            kind: FailureKind::Execution,
            reason: "boom".into(),
        })
    }

    #[test]
    fn channel_sink_delivers() {
        let (sink, mut rx) = ResultSink::channel();
        sink.deliver(failure(3));
        assert_eq!(rx.try_recv().unwrap().unwrap_err().job_id, 3);
    }

    #[test]
    fn dropped_receiver_is_tolerated() {
        let (sink, rx) = ResultSink::channel();
        drop(rx);
        sink.deliver(failure(1));
    }

    #[test]
    fn callback_sink_delivers_and_survives_panics() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let recorder = Arc::clone(&seen);
        ResultSink::callback(move |r| recorder.lock().unwrap().push(r.unwrap_err().job_id))
            .deliver(failure(7));
        assert_eq!(*seen.lock().unwrap(), vec![7]);

        ResultSink::callback(|_| panic!("callback bug")).deliver(failure(8));
    }

    #[test]
    fn api_errors_map_to_failure_kinds() {
        let protocol = JobError::from(ComfyUIApiError::MissingField("prompt_id"));
        assert_eq!(protocol.kind, FailureKind::Protocol);

        let status = JobError::from(ComfyUIApiError::Status {
            status: 500,
            body: "oops".into(),
        });
        assert_eq!(status.kind, FailureKind::Protocol);
    }

    #[test]
    fn failure_display_names_job_and_kind() {
        let failure = JobFailure {
            job_id: 4,
            kind: FailureKind::Timeout,
            reason: "no completion within 300s".into(),
        };
        assert_eq!(
            failure.to_string(),
            "job 4 failed (timeout): no completion within 300s"
        );
    }
}
