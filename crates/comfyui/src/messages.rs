//! ComfyUI WebSocket message types and parser.
//!
//! ComfyUI sends JSON frames with the shape `{"type": "<kind>", "data": {...}}`.
//! [`parse_message`] reads the envelope first and then decodes `data`
//! according to `type`, so every variant carries only its own fields and
//! an unrecognised kind becomes [`ComfyUIMessage::Unknown`] instead of an
//! error.

use serde::de::DeserializeOwned;
use serde::Deserialize;

/// All ComfyUI WebSocket message kinds this client distinguishes.
#[derive(Debug, Clone, PartialEq)]
pub enum ComfyUIMessage {
    /// Server status broadcast (queue depth).
    Status(StatusData),

    /// A prompt has started executing.
    ExecutionStart(ExecutionStartData),

    /// Some nodes were skipped because their outputs are cached.
    ExecutionCached(ExecutionCachedData),

    /// A specific node is currently executing.
    Executing(ExecutingData),

    /// Step-level progress from a long-running node (e.g. KSampler).
    Progress(ProgressData),

    /// A node has finished and produced output.
    Executed(ExecutedData),

    /// Execution failed with an error.
    ExecutionError(ErrorData),

    /// A kind this client does not interpret.
    Unknown(String),
}

/// Queue status information.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct StatusData {
    pub status: QueueStatus,
}

/// Current queue state.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct QueueStatus {
    pub exec_info: ExecInfo,
}

/// Execution queue statistics.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ExecInfo {
    pub queue_remaining: i32,
}

/// Payload for `execution_start` messages.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ExecutionStartData {
    pub prompt_id: String,
}

/// Payload for `execution_cached` messages.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ExecutionCachedData {
    pub prompt_id: String,
    /// Node IDs whose outputs were served from cache.
    #[serde(default)]
    pub nodes: Vec<String>,
}

/// Payload for `executing` messages.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ExecutingData {
    pub node: Option<String>,
    #[serde(default)]
    pub prompt_id: Option<String>,
}

/// Payload for `progress` messages.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ProgressData {
    /// Current step number.
    pub value: i32,
    /// Total number of steps.
    pub max: i32,
    #[serde(default)]
    pub prompt_id: Option<String>,
    #[serde(default)]
    pub node: Option<String>,
}

impl ProgressData {
    /// Completion percentage (0-100), or 0 when `max` is not positive.
    pub fn percent(&self) -> i16 {
        if self.max > 0 {
            ((self.value as f64 / self.max as f64) * 100.0).clamp(0.0, 100.0) as i16
        } else {
            0
        }
    }
}

/// Payload for `executed` messages.
///
/// `node` is absent when the frame marks the whole prompt as finished.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ExecutedData {
    #[serde(default)]
    pub node: Option<String>,
    /// Raw output value (images, text, ...).
    #[serde(default)]
    pub output: serde_json::Value,
    #[serde(default)]
    pub prompt_id: Option<String>,
}

impl ExecutedData {
    /// Whether `output` lists at least one artifact record, i.e. some
    /// field holds a non-empty array whose first element has a `filename`.
    pub fn has_artifact_listing(&self) -> bool {
        let Some(fields) = self.output.as_object() else {
            return false;
        };
        fields.values().any(|value| {
            value
                .as_array()
                .and_then(|items| items.first())
                .and_then(|first| first.as_object())
                .is_some_and(|record| record.contains_key("filename"))
        })
    }
}

/// Payload for `execution_error` messages.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ErrorData {
    #[serde(default)]
    pub prompt_id: Option<String>,
    #[serde(default)]
    pub node_id: Option<String>,
    #[serde(default)]
    pub exception_message: String,
    #[serde(default)]
    pub exception_type: String,
}

/// The outer `{type, data}` envelope shared by every frame.
#[derive(Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: serde_json::Value,
}

/// Parse a ComfyUI WebSocket text message into a typed message.
///
/// Returns `Err` for malformed JSON or a known kind whose `data` lacks
/// required fields. Unknown kinds parse successfully as
/// [`ComfyUIMessage::Unknown`].
pub fn parse_message(text: &str) -> Result<ComfyUIMessage, serde_json::Error> {
    let Envelope { kind, data } = serde_json::from_str(text)?;

    let message = match kind.as_str() {
        "status" => ComfyUIMessage::Status(decode(data)?),
        "execution_start" => ComfyUIMessage::ExecutionStart(decode(data)?),
        "execution_cached" => ComfyUIMessage::ExecutionCached(decode(data)?),
        "executing" => ComfyUIMessage::Executing(decode(data)?),
        "progress" => ComfyUIMessage::Progress(decode(data)?),
        "executed" => ComfyUIMessage::Executed(decode(data)?),
        "execution_error" => ComfyUIMessage::ExecutionError(decode(data)?),
        _ => ComfyUIMessage::Unknown(kind),
    };
    Ok(message)
}

fn decode<T: DeserializeOwned>(data: serde_json::Value) -> Result<T, serde_json::Error> {
    serde_json::from_value(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_status_message() {
        let json = r#"{"type":"status","data":{"status":{"exec_info":{"queue_remaining":3}},"sid":"s1"}}"#;
        let msg = parse_message(json).unwrap();
        match msg {
            ComfyUIMessage::Status(data) => {
                assert_eq!(data.status.exec_info.queue_remaining, 3);
            }
            other => panic!("Expected Status, got {other:?}"),
        }
    }

    #[test]
    fn parse_execution_start_message() {
        let json = r#"{"type":"execution_start","data":{"prompt_id":"abc-123"}}"#;
        let msg = parse_message(json).unwrap();
        match msg {
            ComfyUIMessage::ExecutionStart(data) => {
                assert_eq!(data.prompt_id, "abc-123");
            }
            other => panic!("Expected ExecutionStart, got {other:?}"),
        }
    }

    #[test]
    fn parse_execution_cached_without_nodes() {
        let json = r#"{"type":"execution_cached","data":{"prompt_id":"abc"}}"#;
        let msg = parse_message(json).unwrap();
        match msg {
            ComfyUIMessage::ExecutionCached(data) => {
                assert!(data.nodes.is_empty());
            }
            other => panic!("Expected ExecutionCached, got {other:?}"),
        }
    }

    #[test]
    fn parse_executing_finished() {
        let json = r#"{"type":"executing","data":{"node":null,"prompt_id":"xyz"}}"#;
        let msg = parse_message(json).unwrap();
        match msg {
            ComfyUIMessage::Executing(data) => {
                assert!(data.node.is_none());
                assert_eq!(data.prompt_id.as_deref(), Some("xyz"));
            }
            other => panic!("Expected Executing, got {other:?}"),
        }
    }

    #[test]
    fn parse_progress_message() {
        let json = r#"{"type":"progress","data":{"value":5,"max":20}}"#;
        let msg = parse_message(json).unwrap();
        match msg {
            ComfyUIMessage::Progress(data) => {
                assert_eq!(data.value, 5);
                assert_eq!(data.max, 20);
                assert_eq!(data.percent(), 25);
            }
            other => panic!("Expected Progress, got {other:?}"),
        }
    }

    #[test]
    fn progress_percent_handles_zero_max() {
        let data = ProgressData {
            value: 3,
            max: 0,
            prompt_id: None,
            node: None,
        };
        assert_eq!(data.percent(), 0);
    }

    #[test]
    fn parse_executed_with_images() {
        let json = r#"{"type":"executed","data":{"node":"9","output":{"images":[{"filename":"out.png","subfolder":"","type":"output"}]},"prompt_id":"abc"}}"#;
        let msg = parse_message(json).unwrap();
        match msg {
            ComfyUIMessage::Executed(data) => {
                assert_eq!(data.node.as_deref(), Some("9"));
                assert_eq!(data.prompt_id.as_deref(), Some("abc"));
                assert!(data.has_artifact_listing());
            }
            other => panic!("Expected Executed, got {other:?}"),
        }
    }

    #[test]
    fn executed_without_node_or_output() {
        let json = r#"{"type":"executed","data":{"prompt_id":"abc"}}"#;
        let msg = parse_message(json).unwrap();
        match msg {
            ComfyUIMessage::Executed(data) => {
                assert!(data.node.is_none());
                assert!(!data.has_artifact_listing());
            }
            other => panic!("Expected Executed, got {other:?}"),
        }
    }

    #[test]
    fn artifact_listing_requires_filename_records() {
        let cases = [
            (serde_json::json!({"text": ["hello"]}), false),
            (serde_json::json!({"images": []}), false),
            (serde_json::json!({"images": [{"subfolder": ""}]}), false),
            (serde_json::json!({"gifs": [{"filename": "a.gif"}]}), true),
        ];
        for (output, expected) in cases {
            let data = ExecutedData {
                node: Some("1".into()),
                output: output.clone(),
                prompt_id: None,
            };
            assert_eq!(data.has_artifact_listing(), expected, "output: {output}");
        }
    }

    #[test]
    fn parse_execution_error_message() {
        let json = r#"{"type":"execution_error","data":{"prompt_id":"abc","node_id":"5","exception_message":"out of memory","exception_type":"RuntimeError"}}"#;
        let msg = parse_message(json).unwrap();
        match msg {
            ComfyUIMessage::ExecutionError(data) => {
                assert_eq!(data.prompt_id.as_deref(), Some("abc"));
                assert_eq!(data.node_id.as_deref(), Some("5"));
                assert_eq!(data.exception_message, "out of memory");
                assert_eq!(data.exception_type, "RuntimeError");
            }
            other => panic!("Expected ExecutionError, got {other:?}"),
        }
    }

    #[test]
    fn unknown_type_is_not_an_error() {
        let json = r#"{"type":"crystools.monitor","data":{"cpu":12}}"#;
        assert_eq!(
            parse_message(json).unwrap(),
            ComfyUIMessage::Unknown("crystools.monitor".into())
        );
    }

    #[test]
    fn known_type_with_bad_data_is_an_error() {
        let json = r#"{"type":"status","data":{"status":{}}}"#;
        assert!(parse_message(json).is_err());
    }

    #[test]
    fn parse_invalid_json_returns_error() {
        assert!(parse_message("not json at all").is_err());
    }
}
