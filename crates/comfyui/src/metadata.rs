//! Backend capability discovery (available samplers and schedulers).
//!
//! Discovery is advisory: any failure falls back to the stock ComfyUI
//! lists and is never surfaced to the caller.

use serde::Serialize;
use serde_json::Value;
use tokio::sync::OnceCell;

use crate::api::ComfyUIApi;

/// Node whose required-input schema lists the sampler and scheduler names.
const SAMPLER_NODE: &str = "KSampler";

#[rustfmt::skip]
pub const DEFAULT_SAMPLERS: &[&str] = &[
    "euler", "euler_ancestral", "heun", "heunpp2", "dpm_2",
    "dpm_2_ancestral", "lms", "dpm_fast", "dpm_adaptive",
    "dpmpp_2s_ancestral", "dpmpp_sde", "dpmpp_sde_gpu",
    "dpmpp_2m", "dpmpp_2m_sde", "dpmpp_2m_sde_gpu",
    "dpmpp_3m_sde", "dpmpp_3m_sde_gpu", "ddpm", "lcm", "ddim", "uni_pc", "uni_pc_bh2",
];

#[rustfmt::skip]
pub const DEFAULT_SCHEDULERS: &[&str] = &[
    "normal", "karras", "exponential", "sgm_uniform",
    "simple", "ddim_uniform", "beta",
];

/// Sampler and scheduler names the backend accepts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackendCapabilities {
    pub samplers: Vec<String>,
    pub schedulers: Vec<String>,
}

impl BackendCapabilities {
    /// The stock lists, used when discovery fails.
    pub fn defaults() -> Self {
        Self {
            samplers: owned(DEFAULT_SAMPLERS),
            schedulers: owned(DEFAULT_SCHEDULERS),
        }
    }
}

/// What one `/object_info` response revealed. `None` means the field was
/// absent, malformed, or empty.
#[derive(Debug, Default, PartialEq)]
pub struct DiscoveredCapabilities {
    pub samplers: Option<Vec<String>>,
    pub schedulers: Option<Vec<String>>,
}

impl DiscoveredCapabilities {
    /// Read `KSampler.input.required.{sampler_name,scheduler}[0]`.
    pub fn from_object_info(object_info: &Value) -> Self {
        let required = &object_info[SAMPLER_NODE]["input"]["required"];
        Self {
            samplers: choice_list(&required["sampler_name"]),
            schedulers: choice_list(&required["scheduler"]),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.samplers.is_some() && self.schedulers.is_some()
    }

    /// Fill whichever field is missing from the stock lists.
    pub fn or_defaults(self) -> BackendCapabilities {
        BackendCapabilities {
            samplers: self.samplers.unwrap_or_else(|| owned(DEFAULT_SAMPLERS)),
            schedulers: self.schedulers.unwrap_or_else(|| owned(DEFAULT_SCHEDULERS)),
        }
    }
}

/// Process-lifetime cache of the first fully discovered capability set.
///
/// Partial or failed discoveries are returned with defaults filled in but
/// not cached, so a later call can try again.
#[derive(Debug, Default)]
pub struct MetadataCache {
    cell: OnceCell<BackendCapabilities>,
}

impl MetadataCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// The cached capabilities, if discovery has succeeded before.
    pub fn cached(&self) -> Option<&BackendCapabilities> {
        self.cell.get()
    }

    /// Return cached capabilities or ask the backend.
    ///
    /// Concurrent callers may both hit the backend before the cache is
    /// filled; the request is read-only so the first result wins.
    pub async fn get_or_fetch(&self, api: &ComfyUIApi) -> BackendCapabilities {
        if let Some(caps) = self.cell.get() {
            return caps.clone();
        }

        let discovered = match api.get_object_info().await {
            Ok(object_info) => DiscoveredCapabilities::from_object_info(&object_info),
            Err(e) => {
                tracing::warn!(error = %e, "Capability discovery failed, using defaults");
                return BackendCapabilities::defaults();
            }
        };

        if discovered.is_complete() {
            let caps = discovered.or_defaults();
            tracing::info!(
                samplers = caps.samplers.len(),
                schedulers = caps.schedulers.len(),
                "Discovered backend capabilities",
            );
            let _ = self.cell.set(caps.clone());
            return caps;
        }

        if discovered.samplers.is_none() {
            tracing::warn!("Could not find samplers on the backend, using defaults");
        }
        if discovered.schedulers.is_none() {
            tracing::warn!("Could not find schedulers on the backend, using defaults");
        }
        discovered.or_defaults()
    }
}

/// A ComfyUI combo input is `[[choice, ...], {options}]`.
fn choice_list(input: &Value) -> Option<Vec<String>> {
    let choices: Vec<String> = input
        .get(0)?
        .as_array()?
        .iter()
        .filter_map(|c| c.as_str().map(str::to_string))
        .collect();
    (!choices.is_empty()).then_some(choices)
}

fn owned(names: &[&str]) -> Vec<String> {
    names.iter().map(|s| s.to_string()).collect()
}
