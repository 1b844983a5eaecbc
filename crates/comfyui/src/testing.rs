//! In-process fake ComfyUI server for integration tests.
//!
//! Serves the HTTP routes and the `/ws` event stream on `127.0.0.1:0`.
//! Every stream connection plays a [`ScriptStep`] list once for each
//! prompt submitted after it connected, with `{prompt_id}` in frames
//! replaced by that prompt's id.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// How `POST /prompt` answers.
#[derive(Debug, Clone)]
pub enum SubmitMode {
    Accept,
    /// 200 with a body lacking `prompt_id`.
    MissingPromptId,
    /// 200 with a body that is not JSON.
    Malformed,
    /// Non-success status with a JSON error body.
    Reject(u16),
}

/// How `GET /history/{id}` answers for submitted prompts.
#[derive(Debug, Clone)]
pub enum HistoryMode {
    /// Empty for the first `after_polls` lookups of a prompt, then populated.
    Ready { after_polls: usize },
    Never,
}

/// One step of the stream script.
#[derive(Debug, Clone)]
pub enum ScriptStep {
    Frame(Value),
    Delay(Duration),
    Close,
}

/// How `/ws` behaves.
#[derive(Debug, Clone)]
pub enum StreamMode {
    /// Refuse the upgrade with 404.
    Disabled,
    Script(Vec<ScriptStep>),
}

#[derive(Debug, Clone)]
pub struct FakeBackendConfig {
    pub submit: SubmitMode,
    pub history: HistoryMode,
    /// `outputs` of a populated history record.
    pub outputs: Value,
    /// Body of `GET /view`; `None` answers 404.
    pub artifact: Option<Vec<u8>>,
    /// Body of `GET /object_info`; `None` answers 500.
    pub object_info: Option<Value>,
    pub stream: StreamMode,
}

impl Default for FakeBackendConfig {
    fn default() -> Self {
        Self {
            submit: SubmitMode::Accept,
            history: HistoryMode::Ready { after_polls: 0 },
            outputs: image_outputs("ComfyUI_00001_.png"),
            artifact: Some(FAKE_PNG.to_vec()),
            object_info: Some(sample_object_info()),
            stream: StreamMode::Script(success_script()),
        }
    }
}

/// Bytes served by the default `/view` route.
pub const FAKE_PNG: &[u8] = b"\x89PNG\r\n\x1a\nfake-image";

/// History `outputs` with a single `SaveImage` node.
pub fn image_outputs(filename: &str) -> Value {
    json!({
        "9": {
            "images": [{ "filename": filename, "subfolder": "", "type": "output" }]
        }
    })
}

/// `/object_info` listing two samplers and two schedulers.
pub fn sample_object_info() -> Value {
    json!({
        "KSampler": {
            "input": {
                "required": {
                    "sampler_name": [["euler", "dpmpp_2m"], {}],
                    "scheduler": [["normal", "karras"], {}]
                }
            }
        }
    })
}

/// Progress, then the image node finishing with an artifact listing.
pub fn success_script() -> Vec<ScriptStep> {
    vec![
        ScriptStep::Frame(json!({ "type": "execution_start", "data": { "prompt_id": "{prompt_id}" } })),
        ScriptStep::Frame(json!({ "type": "progress", "data": { "value": 1, "max": 2, "prompt_id": "{prompt_id}" } })),
        ScriptStep::Frame(json!({ "type": "progress", "data": { "value": 2, "max": 2, "prompt_id": "{prompt_id}" } })),
        ScriptStep::Frame(executed_frame("9", image_outputs("ComfyUI_00001_.png")["9"].clone())),
    ]
}

pub fn executed_frame(node: &str, output: Value) -> Value {
    json!({
        "type": "executed",
        "data": { "node": node, "output": output, "prompt_id": "{prompt_id}" }
    })
}

pub fn status_frame(queue_remaining: i32) -> Value {
    json!({
        "type": "status",
        "data": { "status": { "exec_info": { "queue_remaining": queue_remaining } } }
    })
}

pub fn error_frame(node_id: &str, message: &str) -> Value {
    json!({
        "type": "execution_error",
        "data": {
            "prompt_id": "{prompt_id}",
            "node_id": node_id,
            "exception_type": "RuntimeError",
            "exception_message": message
        }
    })
}

struct FakeState {
    config: FakeBackendConfig,
    next_prompt: AtomicU64,
    latest_prompt: watch::Sender<Option<String>>,
    submissions: Mutex<Vec<Value>>,
    history_polls: Mutex<HashMap<String, usize>>,
    object_info_calls: AtomicUsize,
    cancelled: Mutex<Vec<String>>,
    stream_connections: AtomicUsize,
}

/// A running fake. The server stops when this is dropped.
pub struct FakeComfyUI {
    addr: SocketAddr,
    state: Arc<FakeState>,
    handle: JoinHandle<()>,
}

impl FakeComfyUI {
    pub async fn start(config: FakeBackendConfig) -> Self {
        let (latest_prompt, _) = watch::channel(None);
        let state = Arc::new(FakeState {
            config,
            next_prompt: AtomicU64::new(1),
            latest_prompt,
            submissions: Mutex::new(Vec::new()),
            history_polls: Mutex::new(HashMap::new()),
            object_info_calls: AtomicUsize::new(0),
            cancelled: Mutex::new(Vec::new()),
            stream_connections: AtomicUsize::new(0),
        });

        let app = Router::new()
            .route("/prompt", post(submit_prompt))
            .route("/history/{prompt_id}", get(history))
            .route("/view", get(view))
            .route("/object_info", get(object_info))
            .route("/queue", post(queue))
            .route("/ws", get(stream))
            .with_state(Arc::clone(&state));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind fake backend");
        let addr = listener.local_addr().expect("fake backend address");
        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.expect("fake backend server");
        });

        Self {
            addr,
            state,
            handle,
        }
    }

    /// Base URL, e.g. `http://127.0.0.1:40123`.
    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Bodies of every `POST /prompt`, in arrival order.
    pub fn submissions(&self) -> Vec<Value> {
        self.state.submissions.lock().expect("lock").clone()
    }

    /// Number of history lookups for `prompt_id`.
    pub fn history_polls(&self, prompt_id: &str) -> usize {
        self.state
            .history_polls
            .lock()
            .expect("lock")
            .get(prompt_id)
            .copied()
            .unwrap_or(0)
    }

    pub fn object_info_calls(&self) -> usize {
        self.state.object_info_calls.load(Ordering::SeqCst)
    }

    /// Prompt ids deleted through `POST /queue`.
    pub fn cancelled(&self) -> Vec<String> {
        self.state.cancelled.lock().expect("lock").clone()
    }

    pub fn stream_connections(&self) -> usize {
        self.state.stream_connections.load(Ordering::SeqCst)
    }
}

impl Drop for FakeComfyUI {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

type Shared = State<Arc<FakeState>>;

async fn submit_prompt(State(state): Shared, Json(body): Json<Value>) -> Response {
    match &state.config.submit {
        SubmitMode::Accept => {
            let number = state.next_prompt.fetch_add(1, Ordering::SeqCst);
            let prompt_id = format!("prompt-{number}");
            state.submissions.lock().expect("lock").push(body);
            state.latest_prompt.send_replace(Some(prompt_id.clone()));
            Json(json!({ "prompt_id": prompt_id, "number": number })).into_response()
        }
        SubmitMode::MissingPromptId => Json(json!({ "number": 0 })).into_response(),
        SubmitMode::Malformed => "<html>not json</html>".into_response(),
        SubmitMode::Reject(status) => {
            let status = StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_REQUEST);
            (status, Json(json!({ "error": "invalid prompt" }))).into_response()
        }
    }
}

async fn history(State(state): Shared, Path(prompt_id): Path<String>) -> Json<Value> {
    let polls = {
        let mut polls = state.history_polls.lock().expect("lock");
        let count = polls.entry(prompt_id.clone()).or_insert(0);
        *count += 1;
        *count
    };

    let submitted = prompt_id
        .strip_prefix("prompt-")
        .and_then(|n| n.parse::<u64>().ok())
        .is_some_and(|n| n < state.next_prompt.load(Ordering::SeqCst));

    let ready = match state.config.history {
        HistoryMode::Ready { after_polls } => submitted && polls > after_polls,
        HistoryMode::Never => false,
    };

    if ready {
        Json(json!({
            prompt_id: {
                "outputs": state.config.outputs,
                "status": { "status_str": "success", "completed": true }
            }
        }))
    } else {
        Json(json!({}))
    }
}

async fn view(State(state): Shared, Query(_params): Query<HashMap<String, String>>) -> Response {
    match &state.config.artifact {
        Some(bytes) => bytes.clone().into_response(),
        None => (StatusCode::NOT_FOUND, "file not found").into_response(),
    }
}

async fn object_info(State(state): Shared) -> Response {
    state.object_info_calls.fetch_add(1, Ordering::SeqCst);
    match &state.config.object_info {
        Some(info) => Json(info.clone()).into_response(),
        None => (StatusCode::INTERNAL_SERVER_ERROR, "boom").into_response(),
    }
}

async fn queue(State(state): Shared, Json(body): Json<Value>) -> Json<Value> {
    if let Some(ids) = body["delete"].as_array() {
        let mut cancelled = state.cancelled.lock().expect("lock");
        cancelled.extend(ids.iter().filter_map(|id| id.as_str().map(str::to_string)));
    }
    Json(json!({}))
}

async fn stream(State(state): Shared, ws: WebSocketUpgrade) -> Response {
    let StreamMode::Script(script) = &state.config.stream else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let script = script.clone();
    state.stream_connections.fetch_add(1, Ordering::SeqCst);
    let prompts = state.latest_prompt.subscribe();
    ws.on_upgrade(move |socket| play_script(socket, prompts, script))
}

async fn play_script(
    mut socket: WebSocket,
    mut prompts: watch::Receiver<Option<String>>,
    script: Vec<ScriptStep>,
) {
    loop {
        tokio::select! {
            changed = prompts.changed() => {
                if changed.is_err() {
                    return;
                }
                let Some(prompt_id) = prompts.borrow_and_update().clone() else {
                    continue;
                };
                for step in &script {
                    match step {
                        ScriptStep::Frame(frame) => {
                            let text = frame.to_string().replace("{prompt_id}", &prompt_id);
                            if socket.send(Message::Text(text.into())).await.is_err() {
                                return;
                            }
                        }
                        ScriptStep::Delay(pause) => tokio::time::sleep(*pause).await,
                        ScriptStep::Close => {
                            let _ = socket.send(Message::Close(None)).await;
                            return;
                        }
                    }
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    None | Some(Err(_)) | Some(Ok(Message::Close(_))) => return,
                    Some(Ok(_)) => {}
                }
            }
        }
    }
}
