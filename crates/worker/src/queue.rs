//! Serialized execution queue.
//!
//! [`ExecutionQueue`] holds pending jobs and runs them one at a time on a
//! single worker task. The pending list, the in-flight flag, and the id
//! of the running job live in one [`QueueState`] behind one mutex, and
//! every read-modify-write of them happens under that lock:
//!
//! - a trigger (from [`enqueue`](ExecutionQueue::enqueue) or
//!   [`sweep`](ExecutionQueue::sweep)) sets the flag and spawns the
//!   worker only if the flag was clear and work is pending, so double
//!   triggers are harmless;
//! - the worker loops popping the head job until the list is empty, then
//!   clears the flag in the same critical section that saw it empty.
//!
//! Each job runs on its own task under the queue's job timeout, so a job
//! that panics or hangs yields a failure result instead of taking the
//! worker down.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use atelier_core::types::{JobId, Timestamp};
use serde::Serialize;

use crate::job::{Job, JobError, JobFailure, JobRequest, JobResult, JobSuccess, ResultSink};
use crate::runner::JobRunner;

/// Pending entries included in a [`QueueSnapshot`].
const SNAPSHOT_HEAD: usize = 5;

#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Hard limit on one job's run, covering submit, wait, and download.
    pub job_timeout: Duration,
    /// Pending depth above which the watchdog sweep logs a warning.
    pub warn_depth: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            job_timeout: Duration::from_secs(300),
            warn_depth: 10,
        }
    }
}

/// Point-in-time view of the queue for status displays.
#[derive(Debug, Clone, Serialize)]
pub struct QueueSnapshot {
    pub pending: usize,
    pub in_flight: bool,
    pub running: Option<JobId>,
    /// The first few pending jobs, in dispatch order.
    pub head: Vec<PendingEntry>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PendingEntry {
    pub job_id: JobId,
    pub requester: Option<String>,
    pub enqueued_at: Timestamp,
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<Job>,
    /// True iff a worker task owns dispatch.
    in_flight: bool,
    running: Option<JobId>,
}

struct Inner {
    state: Mutex<QueueState>,
    runner: Arc<dyn JobRunner>,
    config: QueueConfig,
    next_id: AtomicU64,
}

/// Cloneable handle to the queue.
///
/// All methods that may start the worker must be called from within a
/// Tokio runtime.
#[derive(Clone)]
pub struct ExecutionQueue {
    inner: Arc<Inner>,
}

impl ExecutionQueue {
    pub fn new(runner: Arc<dyn JobRunner>, config: QueueConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(QueueState::default()),
                runner,
                config,
                next_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.inner.config
    }

    /// Append a job and start the worker if it is idle.
    ///
    /// Returns the job's 1-based position among pending jobs. `sink`
    /// receives exactly one result.
    pub fn enqueue(&self, request: JobRequest, sink: ResultSink) -> usize {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let job = Job {
            id,
            request: Arc::new(request),
            sink,
            enqueued_at: chrono::Utc::now(),
        };

        let position = {
            let mut state = self.lock();
            state.pending.push_back(job);
            state.pending.len()
        };
        tracing::info!(job_id = id, position, "Job queued");

        self.trigger();
        position
    }

    /// Restart dispatch if work is pending but no worker is running.
    ///
    /// Returns whether a worker was started. Also warns when the backlog
    /// exceeds the configured depth.
    pub fn sweep(&self) -> bool {
        let (pending, in_flight) = {
            let state = self.lock();
            (state.pending.len(), state.in_flight)
        };

        if pending > self.inner.config.warn_depth {
            tracing::warn!(
                pending,
                warn_depth = self.inner.config.warn_depth,
                "Execution queue is backing up",
            );
        }

        if in_flight || pending == 0 {
            return false;
        }

        let started = self.trigger();
        if started {
            tracing::warn!(pending, "Found idle queue with pending jobs, restarted dispatch");
        }
        started
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        let state = self.lock();
        QueueSnapshot {
            pending: state.pending.len(),
            in_flight: state.in_flight,
            running: state.running,
            head: state
                .pending
                .iter()
                .take(SNAPSHOT_HEAD)
                .map(|job| PendingEntry {
                    job_id: job.id,
                    requester: job.request.requester.clone(),
                    enqueued_at: job.enqueued_at,
                })
                .collect(),
        }
    }

    /// Test-and-set the in-flight flag; spawn the worker if we won.
    fn trigger(&self) -> bool {
        {
            let mut state = self.lock();
            if state.in_flight || state.pending.is_empty() {
                return false;
            }
            state.in_flight = true;
        }

        let queue = self.clone();
        tokio::spawn(async move { queue.work().await });
        true
    }

    /// The worker: run pending jobs in order until none are left.
    async fn work(self) {
        let mut guard = InFlightGuard {
            queue: &self,
            armed: true,
        };

        loop {
            let job = {
                let mut state = self.lock();
                match state.pending.pop_front() {
                    Some(job) => {
                        state.running = Some(job.id);
                        job
                    }
                    None => {
                        state.in_flight = false;
                        state.running = None;
                        guard.armed = false;
                        return;
                    }
                }
            };

            let Job {
                id,
                request,
                sink,
                enqueued_at,
            } = job;
            let result = self.execute(id, request, enqueued_at).await;
            self.lock().running = None;
            sink.deliver(result);
        }
    }

    /// Run one job under the job timeout and shape its result.
    async fn execute(
        &self,
        job_id: JobId,
        request: Arc<JobRequest>,
        enqueued_at: Timestamp,
    ) -> JobResult {
        let job_timeout = self.inner.config.job_timeout;
        let waited = chrono::Utc::now() - enqueued_at;
        tracing::info!(
            job_id,
            waited_ms = waited.num_milliseconds(),
            "Job started",
        );

        let started = Instant::now();
        let runner = Arc::clone(&self.inner.runner);
        let run_request = Arc::clone(&request);
        let mut handle = tokio::spawn(async move { runner.run(run_request).await });

        let run = match tokio::time::timeout(job_timeout, &mut handle).await {
            Ok(Ok(run)) => run,
            Ok(Err(join_err)) => Err(JobError::internal(format!("job run aborted: {join_err}"))),
            Err(_) => {
                // Make sure the run, and any stream it holds, is gone first.
                handle.abort();
                let _ = handle.await;
                Err(JobError::timeout(format!("job exceeded {job_timeout:?}")))
            }
        };
        let elapsed = started.elapsed();

        match run {
            Ok(generated) => {
                tracing::info!(
                    job_id,
                    prompt_id = %generated.prompt_id,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Job completed",
                );
                Ok(JobSuccess {
                    job_id,
                    prompt_id: generated.prompt_id,
                    artifact: generated.artifact,
                    bytes: generated.bytes,
                    outputs: generated.outputs,
                    metadata: request.metadata.clone(),
                    elapsed,
                })
            }
            Err(JobError { kind, reason }) => {
                tracing::error!(
                    job_id,
                    kind = %kind,
                    error = %reason,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Job failed",
                );
                Err(JobFailure {
                    job_id,
                    kind,
                    reason,
                })
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Append without triggering, as if the trigger had been lost.
    #[cfg(test)]
    pub(crate) fn push_untriggered(&self, request: JobRequest, sink: ResultSink) {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.lock().pending.push_back(Job {
            id,
            request: Arc::new(request),
            sink,
            enqueued_at: chrono::Utc::now(),
        });
    }
}

/// Clears the in-flight flag if the worker exits without doing so itself
/// (panic or runtime shutdown), leaving pending jobs for the watchdog.
struct InFlightGuard<'a> {
    queue: &'a ExecutionQueue,
    armed: bool,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            let mut state = self.queue.lock();
            state.in_flight = false;
            state.running = None;
            tracing::error!("Queue worker exited unexpectedly");
        }
    }
}

impl std::fmt::Debug for ExecutionQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let snapshot = self.snapshot();
        f.debug_struct("ExecutionQueue")
            .field("pending", &snapshot.pending)
            .field("in_flight", &snapshot.in_flight)
            .field("running", &snapshot.running)
            .finish()
    }
}
