//! Events broadcast by [`ComfyUIManager`](crate::manager::ComfyUIManager)
//! while it waits on a job.
//!
//! These are notifications for progress display. Nothing in the job path
//! depends on anyone receiving them.

use serde::Serialize;

/// A job-level event observed on a ComfyUI instance.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ComfyUIEvent {
    /// A generation job made progress (step N of M).
    GenerationProgress {
        prompt_id: String,
        value: i32,
        max: i32,
        /// Completion percentage (0-100).
        percent: i16,
    },

    /// History confirmed the job finished.
    GenerationCompleted { prompt_id: String },

    /// The backend reported an execution error.
    GenerationError {
        prompt_id: String,
        /// Human-readable error description.
        error: String,
    },

    /// The completion budget ran out.
    GenerationTimedOut { prompt_id: String },

    /// The stream was unavailable or broke; completion is now tracked by
    /// polling history.
    StreamFallback { prompt_id: String, reason: String },
}

impl ComfyUIEvent {
    /// The prompt this event concerns.
    pub fn prompt_id(&self) -> &str {
        match self {
            Self::GenerationProgress { prompt_id, .. }
            | Self::GenerationCompleted { prompt_id }
            | Self::GenerationError { prompt_id, .. }
            | Self::GenerationTimedOut { prompt_id }
            | Self::StreamFallback { prompt_id, .. } => prompt_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_with_event_tag() {
        let event = ComfyUIEvent::StreamFallback {
            prompt_id: "p1".into(),
            reason: "connection reset".into(),
        };
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            serde_json::json!({
                "event": "stream_fallback",
                "prompt_id": "p1",
                "reason": "connection reset"
            })
        );
        assert_eq!(event.prompt_id(), "p1");
    }
}
