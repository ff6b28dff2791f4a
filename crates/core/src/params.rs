//! Generation parameters captured at submission time.
//!
//! Stored alongside each job so the dispatcher can build the remote payload
//! and a user-initiated retry can recreate the job unchanged.

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Maximum number of images a single job may request.
pub const MAX_IMAGES_PER_JOB: u32 = 20;

/// Width and height must be multiples of this value.
pub const DIMENSION_STEP: u32 = 64;

/// Maximum accepted prompt length in characters.
const MAX_PROMPT_LEN: usize = 5000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationParams {
    pub prompt: String,
    #[serde(default)]
    pub negative_prompt: Option<String>,
    pub models: Vec<String>,
    pub num_images: u32,
    pub width: u32,
    pub height: u32,
    pub steps: u32,
    pub cfg_scale: f32,
    pub sampler: String,
    /// Fixed seed; `None` lets each worker pick one.
    #[serde(default)]
    pub seed: Option<String>,
    #[serde(default)]
    pub karras: bool,
    #[serde(default = "default_clip_skip")]
    pub clip_skip: u32,
    /// Whether NSFW output is acceptable for this job.
    #[serde(default)]
    pub nsfw: bool,
    #[serde(default)]
    pub trusted_workers: bool,
    #[serde(default = "default_true")]
    pub allow_slow_workers: bool,
    #[serde(default)]
    pub shared: bool,
}

fn default_clip_skip() -> u32 {
    1
}

fn default_true() -> bool {
    true
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            prompt: String::new(),
            negative_prompt: None,
            models: vec!["stable_diffusion".to_string()],
            num_images: 1,
            width: 512,
            height: 512,
            steps: 30,
            cfg_scale: 7.0,
            sampler: "k_euler_a".to_string(),
            seed: None,
            karras: true,
            clip_skip: default_clip_skip(),
            nsfw: false,
            trusted_workers: false,
            allow_slow_workers: true,
            shared: false,
        }
    }
}

impl GenerationParams {
    /// Prompt sent upstream: negative prompts use the `###` separator.
    pub fn full_prompt(&self) -> String {
        match self.negative_prompt.as_deref().map(str::trim) {
            Some(neg) if !neg.is_empty() => format!("{} ### {}", self.prompt.trim(), neg),
            _ => self.prompt.trim().to_string(),
        }
    }

    /// Validate the parameters before a job is created.
    ///
    /// Rules:
    /// - Prompt must not be empty and must not exceed 5000 characters.
    /// - Between 1 and [`MAX_IMAGES_PER_JOB`] images.
    /// - Width and height must be non-zero multiples of [`DIMENSION_STEP`].
    /// - At least one model must be named.
    pub fn validate(&self) -> Result<(), CoreError> {
        let prompt = self.prompt.trim();
        if prompt.is_empty() {
            return Err(CoreError::Validation("Prompt must not be empty".into()));
        }
        if prompt.chars().count() > MAX_PROMPT_LEN {
            return Err(CoreError::Validation(format!(
                "Prompt must not exceed {MAX_PROMPT_LEN} characters"
            )));
        }
        if self.num_images == 0 || self.num_images > MAX_IMAGES_PER_JOB {
            return Err(CoreError::Validation(format!(
                "Number of images must be between 1 and {MAX_IMAGES_PER_JOB}"
            )));
        }
        for (name, value) in [("width", self.width), ("height", self.height)] {
            if value == 0 || value % DIMENSION_STEP != 0 {
                return Err(CoreError::Validation(format!(
                    "{name} must be a non-zero multiple of {DIMENSION_STEP}, got {value}"
                )));
            }
        }
        if self.models.iter().all(|m| m.trim().is_empty()) {
            return Err(CoreError::Validation("At least one model is required".into()));
        }
        Ok(())
    }
}
