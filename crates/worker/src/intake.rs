//! Turning a front-end request line into a queued [`JobRequest`].
//!
//! A line is either plain prompt text or a JSON object of
//! [`GenerationParams`] fields, optionally with a `size` preset name.

use atelier_comfyui::metadata::BackendCapabilities;
use atelier_core::error::CoreError;
use atelier_core::generation::{size_preset, GenerationParams};
use atelier_pipeline::WorkflowTemplate;
use serde::Deserialize;

use crate::job::JobRequest;

#[derive(Debug, thiserror::Error)]
pub enum IntakeError {
    #[error("Empty request")]
    Empty,

    #[error("Request is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Unknown size preset '{0}'")]
    UnknownSize(String),

    #[error("Backend does not offer {field} '{value}'")]
    Unsupported { field: &'static str, value: String },

    #[error(transparent)]
    Invalid(#[from] CoreError),
}

#[derive(Deserialize)]
struct LineRequest {
    #[serde(flatten)]
    params: GenerationParams,
    #[serde(default)]
    size: Option<String>,
}

/// Parse one request line.
///
/// The sampler and scheduler, defaulted or explicit, must be ones the
/// backend offers.
pub fn parse_line(line: &str, caps: &BackendCapabilities) -> Result<GenerationParams, IntakeError> {
    let line = line.trim();
    if line.is_empty() {
        return Err(IntakeError::Empty);
    }

    let params = if line.starts_with('{') {
        let LineRequest { mut params, size } = serde_json::from_str(line)?;
        if let Some(name) = size {
            let preset = size_preset(&name).ok_or(IntakeError::UnknownSize(name))?;
            params.width = preset.width;
            params.height = preset.height;
        }
        params
    } else {
        GenerationParams::new(line)
    };

    offered("sampler", &params.sampler_name, &caps.samplers)?;
    offered("scheduler", &params.scheduler, &caps.schedulers)?;
    Ok(params)
}

fn offered(field: &'static str, value: &str, choices: &[String]) -> Result<(), IntakeError> {
    if choices.iter().any(|c| c == value) {
        Ok(())
    } else {
        Err(IntakeError::Unsupported {
            field,
            value: value.to_string(),
        })
    }
}

/// Validate `params`, pin its seed, and render the workflow for it.
///
/// The returned request echoes the final parameters as its metadata.
pub fn prepare(
    mut params: GenerationParams,
    template: &WorkflowTemplate,
) -> Result<(GenerationParams, JobRequest), IntakeError> {
    params.validate()?;
    params.resolve_seed();

    let values = params.template_values();
    let missing = template.missing(&values);
    if !missing.is_empty() {
        tracing::warn!(?missing, "Workflow placeholders without values are left as-is");
    }

    let payload = template.render(&values);
    let metadata = serde_json::to_value(&params)?;
    Ok((params, JobRequest::new(payload).with_metadata(metadata)))
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use atelier_core::generation::{DEFAULT_HEIGHT, MAX_SEED};
    use serde_json::json;

    use super::*;

    fn caps() -> BackendCapabilities {
        BackendCapabilities {
            samplers: vec!["dpmpp_2m".into(), "euler".into()],
            schedulers: vec!["karras".into(), "normal".into()],
        }
    }

    fn template() -> WorkflowTemplate {
        WorkflowTemplate::from_value(json!({
            "3": { "inputs": { "seed": "%seed%", "sampler_name": "%sampler_name%", "scheduler": "%schedule%" } },
            "6": { "inputs": { "text": "%prompt%" } },
            "7": { "inputs": { "text": "%imprompt%" } }
        }))
        .unwrap()
    }

    #[test]
    fn plain_text_keeps_default_sampler_and_scheduler() {
        let params = parse_line("  a quiet harbour at dawn ", &caps()).unwrap();
        assert_eq!(params.prompt, "a quiet harbour at dawn");
        assert_eq!(params.sampler_name, "euler");
        assert_eq!(params.scheduler, "normal");
        assert_eq!(params.height, DEFAULT_HEIGHT);
    }

    #[test]
    fn json_line_with_size_preset() {
        let params = parse_line(
            r#"{"prompt": "a fox", "seed": 42, "size": "landscape_m", "steps": 30}"#,
            &caps(),
        )
        .unwrap();
        assert_eq!(params.seed, Some(42));
        assert_eq!(params.steps, 30);
        let preset = size_preset("landscape_m").unwrap();
        assert_eq!((params.width, params.height), (preset.width, preset.height));
    }

    #[test]
    fn bad_lines_are_rejected() {
        assert_matches!(parse_line("   ", &caps()), Err(IntakeError::Empty));
        assert_matches!(parse_line("{not json", &caps()), Err(IntakeError::Json(_)));
        assert_matches!(
            parse_line(r#"{"prompt": "x", "size": "billboard"}"#, &caps()),
            Err(IntakeError::UnknownSize(name)) if name == "billboard"
        );
    }

    #[test]
    fn choices_the_backend_lacks_are_rejected() {
        assert_matches!(
            parse_line(r#"{"prompt": "x", "sampler_name": "lms"}"#, &caps()),
            Err(IntakeError::Unsupported { field: "sampler", value }) if value == "lms"
        );
        let sdxl_only = BackendCapabilities {
            samplers: vec!["euler".into()],
            schedulers: vec!["sgm_uniform".into()],
        };
        assert_matches!(
            parse_line("a fox", &sdxl_only),
            Err(IntakeError::Unsupported { field: "scheduler", value }) if value == "normal"
        );
        let params = parse_line(r#"{"prompt": "x", "scheduler": "karras"}"#, &caps()).unwrap();
        assert_eq!(params.scheduler, "karras");
    }

    #[test]
    fn prepare_renders_and_echoes_parameters() {
        let params = parse_line("a red fox", &caps()).unwrap();
        let (params, request) = prepare(params, &template()).unwrap();

        let seed = params.seed.unwrap();
        assert!((0..=MAX_SEED).contains(&seed));
        assert_eq!(request.payload["3"]["inputs"]["seed"], json!(seed));
        assert_eq!(request.payload["3"]["inputs"]["scheduler"], json!("normal"));
        assert_eq!(request.payload["6"]["inputs"]["text"], json!("a red fox"));
        assert_eq!(request.payload["7"]["inputs"]["text"], json!(""));
        assert_eq!(request.metadata["seed"], json!(seed));
        assert_eq!(request.metadata["sampler_name"], json!("euler"));
    }

    #[test]
    fn prepare_rejects_invalid_parameters() {
        let mut params = GenerationParams::new("x");
        params.width = 4096;
        assert_matches!(prepare(params, &template()), Err(IntakeError::Invalid(_)));
    }
}
