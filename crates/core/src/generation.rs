//! Generation parameters, size limits, and seed handling.
//!
//! A [`GenerationParams`] is what the front end collects from a user.
//! [`GenerationParams::template_values`] flattens it into the named
//! values the workflow template substitutes, and the same struct is
//! echoed back as backend metadata once the job finishes.

use std::collections::HashMap;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::CoreError;

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

pub const DEFAULT_WIDTH: u32 = 512;
pub const DEFAULT_HEIGHT: u32 = 768;
pub const DEFAULT_STEPS: u32 = 20;
pub const DEFAULT_CFG_SCALE: f64 = 7.0;
pub const DEFAULT_SAMPLER: &str = "euler";
pub const DEFAULT_SCHEDULER: &str = "normal";

/// Largest seed the backend accepts (signed 32-bit range).
pub const MAX_SEED: i64 = 2_147_483_647;

// ---------------------------------------------------------------------------
// Size limits and presets
// ---------------------------------------------------------------------------

/// Upper bound on `width * height`.
pub const MAX_PIXELS: u32 = 1024 * 1536;
pub const MAX_WIDTH: u32 = 2048;
pub const MAX_HEIGHT: u32 = 2048;

/// A named output size offered to users.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizePreset {
    pub name: &'static str,
    pub width: u32,
    pub height: u32,
}

#[rustfmt::skip]
pub const SIZE_PRESETS: &[SizePreset] = &[
    SizePreset { name: "portrait_s", width: 512, height: 768 },
    SizePreset { name: "portrait_m", width: 832, height: 1216 },
    SizePreset { name: "landscape_s", width: 768, height: 512 },
    SizePreset { name: "landscape_m", width: 1216, height: 832 },
    SizePreset { name: "square_s", width: 512, height: 512 },
    SizePreset { name: "square_m", width: 768, height: 768 },
    SizePreset { name: "square_l", width: 832, height: 832 },
    SizePreset { name: "hd", width: 1024, height: 1024 },
];

/// Look up a size preset by name.
pub fn size_preset(name: &str) -> Option<SizePreset> {
    SIZE_PRESETS.iter().copied().find(|p| p.name == name)
}

/// Validate output dimensions against the per-axis and total-pixel limits.
pub fn validate_dimensions(width: u32, height: u32) -> Result<(), CoreError> {
    if width == 0 || height == 0 {
        return Err(CoreError::Validation(
            "Width and height must be positive".to_string(),
        ));
    }
    if width > MAX_WIDTH || height > MAX_HEIGHT {
        return Err(CoreError::Validation(format!(
            "Size {width}x{height} exceeds the maximum of {MAX_WIDTH}x{MAX_HEIGHT}"
        )));
    }
    if u64::from(width) * u64::from(height) > u64::from(MAX_PIXELS) {
        return Err(CoreError::Validation(format!(
            "Size {width}x{height} exceeds the pixel budget of {MAX_PIXELS}"
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Parameters
// ---------------------------------------------------------------------------

/// User-facing parameters for one generation request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationParams {
    pub prompt: String,
    #[serde(default)]
    pub negative_prompt: String,
    #[serde(default = "default_width")]
    pub width: u32,
    #[serde(default = "default_height")]
    pub height: u32,
    #[serde(default = "default_steps")]
    pub steps: u32,
    #[serde(default = "default_cfg_scale")]
    pub cfg_scale: f64,
    /// `None` or a negative value asks for a random seed.
    #[serde(default)]
    pub seed: Option<i64>,
    #[serde(default = "default_sampler")]
    pub sampler_name: String,
    #[serde(default = "default_scheduler")]
    pub scheduler: String,
}

fn default_width() -> u32 {
    DEFAULT_WIDTH
}

fn default_height() -> u32 {
    DEFAULT_HEIGHT
}

fn default_steps() -> u32 {
    DEFAULT_STEPS
}

fn default_cfg_scale() -> f64 {
    DEFAULT_CFG_SCALE
}

fn default_sampler() -> String {
    DEFAULT_SAMPLER.to_string()
}

fn default_scheduler() -> String {
    DEFAULT_SCHEDULER.to_string()
}

impl GenerationParams {
    /// Parameters for `prompt` with every other field at its default.
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            negative_prompt: String::new(),
            width: DEFAULT_WIDTH,
            height: DEFAULT_HEIGHT,
            steps: DEFAULT_STEPS,
            cfg_scale: DEFAULT_CFG_SCALE,
            seed: None,
            sampler_name: default_sampler(),
            scheduler: default_scheduler(),
        }
    }

    /// Check the prompt and output size.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.prompt.trim().is_empty() {
            return Err(CoreError::Validation(
                "Prompt must not be empty".to_string(),
            ));
        }
        if self.steps == 0 {
            return Err(CoreError::Validation(
                "Steps must be at least 1".to_string(),
            ));
        }
        validate_dimensions(self.width, self.height)
    }

    /// Replace a missing or negative seed with a random one.
    ///
    /// Returns the seed now in effect.
    pub fn resolve_seed(&mut self) -> i64 {
        match self.seed {
            Some(seed) if seed >= 0 => seed,
            _ => {
                let seed = random_seed();
                self.seed = Some(seed);
                seed
            }
        }
    }

    /// Flatten into the placeholder values the workflow template uses.
    ///
    /// The negative prompt is exposed as `imprompt` and the scheduler as
    /// `schedule`, matching the placeholder names in stock templates.
    /// An unresolved seed is rendered as `-1`.
    pub fn template_values(&self) -> HashMap<String, serde_json::Value> {
        use serde_json::json;

        HashMap::from([
            ("width".to_string(), json!(self.width)),
            ("height".to_string(), json!(self.height)),
            ("prompt".to_string(), json!(self.prompt)),
            ("imprompt".to_string(), json!(self.negative_prompt)),
            ("seed".to_string(), json!(self.seed.unwrap_or(-1))),
            ("steps".to_string(), json!(self.steps)),
            ("cfg_scale".to_string(), json!(self.cfg_scale)),
            ("sampler_name".to_string(), json!(self.sampler_name)),
            ("schedule".to_string(), json!(self.scheduler)),
        ])
    }
}

/// A uniformly random seed in `0..=MAX_SEED`.
pub fn random_seed() -> i64 {
    rand::rng().random_range(0..=MAX_SEED)
}
