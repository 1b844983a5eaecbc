//! End-to-end tests: `ExecutionQueue` driving `ComfyUIRunner` against an
//! in-process fake ComfyUI.

use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use serde_json::json;

use atelier_comfyui::completion::CompletionConfig;
use atelier_comfyui::manager::ComfyUIManager;
use atelier_comfyui::testing::{
    error_frame, executed_frame, FakeBackendConfig, FakeComfyUI, HistoryMode, ScriptStep,
    StreamMode, SubmitMode, FAKE_PNG,
};
use atelier_worker::config::WorkerConfig;
use atelier_worker::job::{FailureKind, JobRequest, JobResult, ResultSink};
use atelier_worker::queue::{ExecutionQueue, QueueConfig};
use atelier_worker::runner::ComfyUIRunner;

fn completion(timeout: Duration) -> CompletionConfig {
    CompletionConfig {
        timeout,
        recv_timeout: Duration::from_millis(250),
        poll_interval: Duration::from_millis(100),
    }
}

fn queue_for(url: &str, completion_timeout: Duration) -> ExecutionQueue {
    let manager = Arc::new(ComfyUIManager::new(url, completion(completion_timeout)).unwrap());
    ExecutionQueue::new(
        Arc::new(ComfyUIRunner::new(manager)),
        QueueConfig {
            job_timeout: Duration::from_secs(20),
            warn_depth: 10,
        },
    )
}

fn request(label: &str) -> JobRequest {
    JobRequest::new(json!({ "6": { "inputs": { "text": label } } }))
        .with_metadata(json!({ "label": label, "seed": 42 }))
        .with_requester("tester")
}

async fn run_one(queue: &ExecutionQueue, label: &str) -> JobResult {
    let (sink, rx) = ResultSink::channel();
    queue.enqueue(request(label), sink);
    tokio::time::timeout(Duration::from_secs(20), rx)
        .await
        .expect("result delivered")
        .expect("sink fired")
}

// ---------------------------------------------------------------------------
// Test: jobs run in order and each gets its artifact and echoed metadata
// ---------------------------------------------------------------------------

#[tokio::test]
async fn jobs_complete_in_order_with_artifacts() {
    let fake = FakeComfyUI::start(FakeBackendConfig::default()).await;
    let queue = queue_for(&fake.url(), Duration::from_secs(10));

    let mut receivers = Vec::new();
    for label in ["first", "second", "third"] {
        let (sink, rx) = ResultSink::channel();
        queue.enqueue(request(label), sink);
        receivers.push(rx);
    }

    let mut job_ids = Vec::new();
    for (rx, label) in receivers.into_iter().zip(["first", "second", "third"]) {
        let success = rx.await.unwrap().unwrap();
        assert_eq!(success.bytes, FAKE_PNG);
        assert_eq!(success.artifact.filename, "ComfyUI_00001_.png");
        assert_eq!(success.metadata["label"], label);
        job_ids.push(success.job_id);
    }
    assert!(job_ids.windows(2).all(|w| w[0] < w[1]));

    let texts: Vec<_> = fake
        .submissions()
        .iter()
        .map(|s| s["prompt"]["6"]["inputs"]["text"].clone())
        .collect();
    assert_eq!(texts, [json!("first"), json!("second"), json!("third")]);
    assert_eq!(fake.stream_connections(), 3);
}

// ---------------------------------------------------------------------------
// Test: backend execution error becomes an Execution failure
// ---------------------------------------------------------------------------

#[tokio::test]
async fn backend_error_is_execution_failure() {
    let fake = FakeComfyUI::start(FakeBackendConfig {
        stream: StreamMode::Script(vec![ScriptStep::Frame(error_frame("3", "CUDA out of memory"))]),
        ..Default::default()
    })
    .await;
    let queue = queue_for(&fake.url(), Duration::from_secs(10));

    let failure = run_one(&queue, "oom").await.unwrap_err();
    assert_eq!(failure.kind, FailureKind::Execution);
    assert!(failure.reason.contains("CUDA out of memory"));
}

// ---------------------------------------------------------------------------
// Test: outputs without an image are a Protocol failure
// ---------------------------------------------------------------------------

#[tokio::test]
async fn outputs_without_image_are_protocol_failure() {
    let fake = FakeComfyUI::start(FakeBackendConfig {
        outputs: json!({ "12": { "text": ["just a caption"] } }),
        stream: StreamMode::Script(vec![ScriptStep::Frame(json!({
            "type": "executed",
            "data": { "prompt_id": "{prompt_id}" }
        }))]),
        ..Default::default()
    })
    .await;
    let queue = queue_for(&fake.url(), Duration::from_secs(10));

    let failure = run_one(&queue, "caption").await.unwrap_err();
    assert_eq!(failure.kind, FailureKind::Protocol);
    assert_eq!(failure.reason, "no image found in outputs");
}

// ---------------------------------------------------------------------------
// Test: completion timeout fails the job and cancels it on the backend
// ---------------------------------------------------------------------------

#[tokio::test]
async fn completion_timeout_cancels_backend_prompt() {
    let fake = FakeComfyUI::start(FakeBackendConfig {
        stream: StreamMode::Script(vec![ScriptStep::Frame(executed_frame("4", json!({})))]),
        history: HistoryMode::Never,
        ..Default::default()
    })
    .await;
    let queue = queue_for(&fake.url(), Duration::from_secs(1));

    let failure = run_one(&queue, "slow").await.unwrap_err();
    assert_eq!(failure.kind, FailureKind::Timeout);
    assert_eq!(fake.cancelled(), vec!["prompt-1".to_string()]);
}

#[tokio::test]
async fn configured_timeouts_let_the_runner_cancel_before_the_queue_gives_up() {
    let fake = FakeComfyUI::start(FakeBackendConfig {
        stream: StreamMode::Script(vec![ScriptStep::Frame(executed_frame("4", json!({})))]),
        history: HistoryMode::Never,
        ..Default::default()
    })
    .await;
    let url = fake.url();
    let config = WorkerConfig::from_lookup(|var| match var {
        "COMFYUI_URL" => Some(url.clone()),
        "JOB_TIMEOUT_SECS" => Some("3".into()),
        "COMPLETION_TIMEOUT_SECS" => Some("1".into()),
        "STREAM_RECV_TIMEOUT_SECS" => Some("1".into()),
        "POLL_INTERVAL_SECS" => Some("1".into()),
        _ => None,
    })
    .unwrap();
    let manager = Arc::new(ComfyUIManager::new(&config.comfyui_url, config.completion.clone()).unwrap());
    let queue = ExecutionQueue::new(Arc::new(ComfyUIRunner::new(manager)), config.queue_config());

    let failure = run_one(&queue, "stuck").await.unwrap_err();
    assert_eq!(failure.kind, FailureKind::Timeout);
    assert!(failure.reason.starts_with("no completion within"));
    assert_eq!(fake.cancelled(), vec!["prompt-1".to_string()]);
}

// ---------------------------------------------------------------------------
// Test: no event stream at all still completes through polling
// ---------------------------------------------------------------------------

#[tokio::test]
async fn job_completes_without_event_stream() {
    let fake = FakeComfyUI::start(FakeBackendConfig {
        stream: StreamMode::Disabled,
        history: HistoryMode::Ready { after_polls: 2 },
        ..Default::default()
    })
    .await;
    let queue = queue_for(&fake.url(), Duration::from_secs(10));

    let success = run_one(&queue, "polled").await.unwrap();
    assert_eq!(success.bytes, FAKE_PNG);
    assert_eq!(fake.history_polls(&success.prompt_id), 3);
}

// ---------------------------------------------------------------------------
// Test: submission errors map to Protocol and Network
// ---------------------------------------------------------------------------

#[tokio::test]
async fn rejected_submission_is_protocol_failure() {
    let fake = FakeComfyUI::start(FakeBackendConfig {
        submit: SubmitMode::Reject(400),
        ..Default::default()
    })
    .await;
    let queue = queue_for(&fake.url(), Duration::from_secs(10));

    let failure = run_one(&queue, "bad").await.unwrap_err();
    assert_eq!(failure.kind, FailureKind::Protocol);
}

#[tokio::test]
async fn unreachable_backend_is_network_failure_and_queue_continues() {
    let queue = queue_for("http://127.0.0.1:9", Duration::from_secs(10));

    for label in ["one", "two"] {
        let failure = run_one(&queue, label).await.unwrap_err();
        assert_eq!(failure.kind, FailureKind::Network);
    }
    assert_matches!(queue.snapshot().running, None);
}
