//! Shared domain types for the atelier generation bridge.
//!
//! Zero internal dependencies: everything here is pure data and
//! validation used by the pipeline, the ComfyUI client, and the worker.

pub mod error;
pub mod generation;
pub mod types;
