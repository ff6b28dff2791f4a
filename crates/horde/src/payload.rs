//! Submission payload for `POST /v2/generate/async`.

use pixelq_core::params::GenerationParams;
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GenerationPayload {
    pub prompt: String,
    pub params: PayloadParams,
    pub nsfw: bool,
    pub censor_nsfw: bool,
    pub trusted_workers: bool,
    pub slow_workers: bool,
    pub models: Vec<String>,
    /// Ask for images as download URLs rather than inline base64.
    pub r2: bool,
    pub shared: bool,
    pub replacement_filter: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PayloadParams {
    pub sampler_name: String,
    pub cfg_scale: f32,
    pub height: u32,
    pub width: u32,
    pub steps: u32,
    #[serde(rename = "n")]
    pub num_images: u32,
    pub karras: bool,
    pub clip_skip: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<String>,
}

impl From<&GenerationParams> for GenerationPayload {
    fn from(p: &GenerationParams) -> Self {
        Self {
            prompt: p.full_prompt(),
            params: PayloadParams {
                sampler_name: p.sampler.clone(),
                cfg_scale: p.cfg_scale,
                height: p.height,
                width: p.width,
                steps: p.steps,
                num_images: p.num_images,
                karras: p.karras,
                clip_skip: p.clip_skip,
                seed: p.seed.clone().filter(|s| !s.trim().is_empty()),
            },
            nsfw: p.nsfw,
            censor_nsfw: !p.nsfw,
            trusted_workers: p.trusted_workers,
            slow_workers: p.allow_slow_workers,
            models: p
                .models
                .iter()
                .map(|m| m.trim().to_string())
                .filter(|m| !m.is_empty())
                .collect(),
            r2: true,
            shared: p.shared,
            replacement_filter: true,
        }
    }
}
