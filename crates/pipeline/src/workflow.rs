//! Workflow template loading and placeholder substitution.
//!
//! A template is an arbitrary ComfyUI API-format workflow in which string
//! leaves may contain `%name%` placeholders. Rendering walks the JSON tree:
//!
//! - a string that is *exactly* one known placeholder is replaced by the
//!   typed value, so `"%steps%"` becomes the number `20`;
//! - any other string has each known placeholder replaced textually;
//! - unknown placeholders are left as-is.

use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::sync::LazyLock;

use regex::{Captures, Regex};
use serde_json::Value;

/// Values keyed by placeholder name (without the surrounding `%`).
pub type TemplateValues = HashMap<String, Value>;

const PLACEHOLDER_PATTERN: &str = r"%(\w+)%";

static PLACEHOLDER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(PLACEHOLDER_PATTERN).expect("valid regex"));

/// Errors from loading a workflow template.
#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    #[error("Failed to read workflow file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Workflow is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Workflow must be a JSON object")]
    NotAnObject,
}

/// A parsed workflow template with its placeholder inventory.
#[derive(Debug, Clone)]
pub struct WorkflowTemplate {
    template: Value,
    placeholders: Vec<String>,
}

impl WorkflowTemplate {
    /// Parse a template from a JSON string.
    pub fn from_json(json: &str) -> Result<Self, WorkflowError> {
        let template: Value = serde_json::from_str(json)?;
        Self::from_value(template)
    }

    /// Read and parse a template file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, WorkflowError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| WorkflowError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&text)
    }

    /// Wrap an already-parsed template.
    pub fn from_value(template: Value) -> Result<Self, WorkflowError> {
        if !template.is_object() {
            return Err(WorkflowError::NotAnObject);
        }
        let mut found = BTreeSet::new();
        collect_placeholders(&template, &mut found);
        let placeholders: Vec<String> = found.into_iter().collect();

        tracing::debug!(placeholders = ?placeholders, "Workflow template parsed");

        Ok(Self {
            template,
            placeholders,
        })
    }

    /// Distinct placeholder names in the template, sorted.
    pub fn placeholders(&self) -> &[String] {
        &self.placeholders
    }

    /// Placeholder names that `values` does not provide.
    pub fn missing(&self, values: &TemplateValues) -> Vec<&str> {
        self.placeholders
            .iter()
            .filter(|name| !values.contains_key(name.as_str()))
            .map(String::as_str)
            .collect()
    }

    /// Produce a backend-ready payload. The template itself is untouched.
    pub fn render(&self, values: &TemplateValues) -> Value {
        render_value(&self.template, values)
    }
}

fn collect_placeholders(value: &Value, found: &mut BTreeSet<String>) {
    match value {
        Value::Object(map) => map.values().for_each(|v| collect_placeholders(v, found)),
        Value::Array(items) => items.iter().for_each(|v| collect_placeholders(v, found)),
        Value::String(text) => {
            for caps in PLACEHOLDER_RE.captures_iter(text) {
                found.insert(caps[1].to_string());
            }
        }
        _ => {}
    }
}

fn render_value(value: &Value, values: &TemplateValues) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), render_value(v, values)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(|v| render_value(v, values)).collect()),
        Value::String(text) => render_string(text, values),
        other => other.clone(),
    }
}

fn render_string(text: &str, values: &TemplateValues) -> Value {
    let mut matches = PLACEHOLDER_RE.captures_iter(text);
    let Some(first) = matches.next() else {
        return Value::String(text.to_string());
    };

    // Whole-string placeholder keeps the value's JSON type.
    if matches.next().is_none() && first[0].len() == text.len() {
        return match values.get(&first[1]) {
            Some(v) => v.clone(),
            None => Value::String(text.to_string()),
        };
    }

    let rendered = PLACEHOLDER_RE.replace_all(text, |caps: &Captures| match values.get(&caps[1]) {
        Some(v) => display_value(v),
        None => caps[0].to_string(),
    });
    Value::String(rendered.into_owned())
}

fn display_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
