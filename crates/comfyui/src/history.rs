//! Typed view of the ComfyUI `/history/{prompt_id}` record.
//!
//! The history endpoint is the ground truth for job completion: stream
//! events only hint that a job may be done, a populated history record
//! proves it and lists the produced artifacts.

use std::collections::HashMap;

use indexmap::IndexMap;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// Node id -> that node's outputs, in the order the backend reported them.
pub type HistoryOutputs = IndexMap<String, NodeOutput>;

/// Outputs of a single node.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeOutput {
    /// Image artifacts written by this node (e.g. `SaveImage`). Entries
    /// that do not look like artifact references are skipped.
    #[serde(
        default,
        deserialize_with = "lenient_images",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub images: Vec<ArtifactRef>,
    /// Any other output kinds (text, gifs, ...), kept verbatim.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Address of an artifact retrievable through `GET /view`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRef {
    #[serde(default)]
    pub filename: String,
    #[serde(default)]
    pub subfolder: String,
    /// Storage area: `output`, `temp`, or `input`.
    #[serde(rename = "type", default = "default_kind")]
    pub kind: String,
}

fn default_kind() -> String {
    "output".to_string()
}

impl ArtifactRef {
    pub fn new(filename: impl Into<String>) -> Self {
        Self {
            filename: filename.into(),
            subfolder: String::new(),
            kind: default_kind(),
        }
    }
}

/// One prompt's history entry. `outputs` is `None` until the backend has
/// finished the prompt.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct HistoryRecord {
    #[serde(default, deserialize_with = "lenient_outputs")]
    pub outputs: Option<HistoryOutputs>,
}

/// Custom nodes report arbitrary shapes under `images`; keep only the
/// entries that parse.
fn lenient_images<'de, D>(deserializer: D) -> Result<Vec<ArtifactRef>, D::Error>
where
    D: Deserializer<'de>,
{
    let images = match Value::deserialize(deserializer)? {
        Value::Array(items) => items
            .into_iter()
            .filter_map(|item| serde_json::from_value(item).ok())
            .collect(),
        _ => Vec::new(),
    };
    Ok(images)
}

/// A node whose outputs do not parse still counts toward a populated
/// record, as an empty entry.
fn lenient_outputs<'de, D>(deserializer: D) -> Result<Option<HistoryOutputs>, D::Error>
where
    D: Deserializer<'de>,
{
    let Some(raw) = Option::<IndexMap<String, Value>>::deserialize(deserializer)? else {
        return Ok(None);
    };
    let outputs = raw
        .into_iter()
        .map(|(node, value)| {
            let output = serde_json::from_value(value).unwrap_or_else(|e| {
                tracing::debug!(node = %node, error = %e, "Unrecognised node output shape");
                NodeOutput::default()
            });
            (node, output)
        })
        .collect();
    Ok(Some(outputs))
}

impl HistoryRecord {
    /// Whether the backend has recorded outputs for this prompt.
    pub fn is_populated(&self) -> bool {
        self.outputs.is_some()
    }

    /// Consume the record, yielding its outputs if populated.
    pub fn into_outputs(self) -> Option<HistoryOutputs> {
        self.outputs
    }

    /// Extract the entry for `prompt_id` from a raw `/history` response body.
    ///
    /// A body without that key is an unpopulated (empty) record. Parsing
    /// straight from bytes keeps the backend's node order.
    pub fn from_response(body: &[u8], prompt_id: &str) -> Result<Self, serde_json::Error> {
        let mut entries: HashMap<String, HistoryRecord> = serde_json::from_slice(body)?;
        Ok(entries.remove(prompt_id).unwrap_or_default())
    }
}

/// The first image artifact across all nodes, in backend order.
pub fn first_artifact(outputs: &HistoryOutputs) -> Option<&ArtifactRef> {
    outputs
        .values()
        .flat_map(|node| node.images.first())
        .find(|artifact| !artifact.filename.is_empty())
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn missing_prompt_key_is_empty_record() {
        let record = HistoryRecord::from_response(b"{}", "abc").unwrap();
        assert!(!record.is_populated());
    }

    #[test]
    fn parses_outputs_with_defaults() {
        let body = br#"{
            "abc": {
                "outputs": {
                    "9": { "images": [{ "filename": "out_0001.png" }] }
                },
                "status": { "completed": true }
            }
        }"#;
        let record = HistoryRecord::from_response(body, "abc").unwrap();
        let outputs = record.into_outputs().unwrap();
        let image = &outputs["9"].images[0];
        assert_eq!(image.filename, "out_0001.png");
        assert_eq!(image.subfolder, "");
        assert_eq!(image.kind, "output");
    }

    #[test]
    fn foreign_node_shapes_do_not_hide_the_artifact() {
        let body = br#"{
            "abc": {
                "outputs": {
                    "15": { "images": null },
                    "16": { "images": [{ "filename": null }, "preview"] },
                    "17": null,
                    "9": { "images": [{ "filename": "ComfyUI_00001_.png" }] }
                }
            }
        }"#;
        let outputs = HistoryRecord::from_response(body, "abc")
            .unwrap()
            .into_outputs()
            .unwrap();
        assert_eq!(outputs.keys().collect::<Vec<_>>(), ["15", "16", "17", "9"]);
        assert!(outputs["15"].images.is_empty());
        assert!(outputs["16"].images.is_empty());
        assert_eq!(outputs["17"], NodeOutput::default());
        assert_eq!(first_artifact(&outputs).unwrap().filename, "ComfyUI_00001_.png");
    }

    #[test]
    fn first_artifact_skips_nodes_without_images() {
        let body = br#"{
            "p": {
                "outputs": {
                    "12": { "text": ["caption"] },
                    "9": { "images": [
                        { "filename": "a.png", "subfolder": "s", "type": "temp" },
                        { "filename": "b.png", "subfolder": "s", "type": "temp" }
                    ] }
                }
            }
        }"#;
        let outputs = HistoryRecord::from_response(body, "p")
            .unwrap()
            .into_outputs()
            .unwrap();
        let artifact = first_artifact(&outputs).unwrap();
        assert_eq!(artifact.filename, "a.png");
        assert_eq!(artifact.kind, "temp");
        assert_eq!(outputs["12"].extra["text"], json!(["caption"]));
    }

    #[test]
    fn outputs_round_trip_to_the_same_json() {
        let raw = r#"{
            "9": { "images": [{ "filename": "x.png", "subfolder": "", "type": "output" }] },
            "4": { "text": ["hi"] }
        }"#;
        let outputs: HistoryOutputs = serde_json::from_str(raw).unwrap();
        let expected: serde_json::Value = serde_json::from_str(raw).unwrap();
        assert_eq!(serde_json::to_value(&outputs).unwrap(), expected);
        assert_eq!(outputs.keys().collect::<Vec<_>>(), ["9", "4"]);
    }

    #[test]
    fn no_artifact_when_outputs_have_no_images() {
        let outputs: HistoryOutputs =
            serde_json::from_value(json!({ "4": { "text": ["hi"] } })).unwrap();
        assert!(first_artifact(&outputs).is_none());
    }
}
