//! Workflow templating for ComfyUI payloads.
//!
//! Turns a workflow template containing `%name%` placeholders plus a
//! set of named values into the backend-ready request body.

pub mod workflow;

pub use workflow::{TemplateValues, WorkflowError, WorkflowTemplate};
