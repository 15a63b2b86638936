//! Typed parameters for each job type, decoded from the job's JSON.

use clipper_core::job::JobType;
use clipper_worker::HandlerError;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use validator::Validate;

// ---------------------------------------------------------------------------
// Render mode and platform
// ---------------------------------------------------------------------------

/// Quality/speed trade-off requested by the client.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RenderMode {
    #[default]
    Draft,
    Hq,
}

impl RenderMode {
    pub fn as_str(self) -> &'static str {
        match self {
            RenderMode::Draft => "draft",
            RenderMode::Hq => "hq",
        }
    }

    /// Diffusion steps for still-image generation.
    pub fn image_steps(self) -> u32 {
        match self {
            RenderMode::Draft => 16,
            RenderMode::Hq => 28,
        }
    }

    /// Diffusion steps for masked edits.
    pub fn inpaint_steps(self) -> u32 {
        match self {
            RenderMode::Draft => 14,
            RenderMode::Hq => 28,
        }
    }
}

pub const DEFAULT_PLATFORM: &str = "9:16";

/// Output size for a platform aspect tag. Unknown tags get the 9:16 size.
pub fn platform_size(platform: &str) -> (u32, u32) {
    match platform {
        "4:5" => (1080, 1350),
        "1:1" => (1080, 1080),
        _ => (1080, 1920),
    }
}

/// Requested image size for a platform and mode. Draft halves both sides.
pub fn image_size(platform: &str, mode: RenderMode) -> (u32, u32) {
    let (width, height) = platform_size(platform);
    match mode {
        RenderMode::Draft => (width / 2, height / 2),
        RenderMode::Hq => (width, height),
    }
}

/// Seed derived from the prompt: the first 32 bits of its SHA-256.
pub fn prompt_seed(prompt: &str) -> u64 {
    let digest = Sha256::digest(prompt.as_bytes());
    u64::from(u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]))
}

// ---------------------------------------------------------------------------
// Per-type parameters
// ---------------------------------------------------------------------------

fn default_platform() -> String {
    DEFAULT_PLATFORM.to_string()
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct CopyParams {
    pub project_id: String,
    #[validate(length(min = 2, max = 160))]
    pub goal: String,
    #[validate(length(min = 1, max = 80))]
    pub cta: String,
    #[serde(default = "default_copy_count")]
    #[validate(range(min = 1, max = 10))]
    pub count: u32,
    #[serde(default)]
    pub mode: RenderMode,
}

fn default_copy_count() -> u32 {
    3
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct ImageParams {
    pub project_id: String,
    #[validate(length(min = 2, max = 400))]
    pub prompt: String,
    #[serde(default)]
    #[validate(length(max = 400))]
    pub negative_prompt: String,
    #[serde(default = "default_platform")]
    pub platform: String,
    #[serde(default)]
    pub mode: RenderMode,
    #[serde(default)]
    pub seed: Option<u64>,
}

/// `strength` is not range-checked here; the orchestrator clamps it.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct InpaintParams {
    pub project_id: String,
    pub image_asset_id: String,
    pub mask_asset_id: String,
    #[validate(length(min = 2, max = 400))]
    pub edit_prompt: String,
    #[serde(default)]
    pub mode: RenderMode,
    #[serde(default = "default_strength")]
    pub strength: f64,
}

fn default_strength() -> f64 {
    0.6
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct StoryboardParams {
    pub project_id: String,
    #[serde(default = "default_storyboard_duration")]
    #[validate(range(min = 5, max = 60))]
    pub duration_sec: u32,
    #[serde(default = "default_platform")]
    pub platform: String,
    #[serde(default = "default_voice")]
    pub voice_id: String,
    #[serde(default = "default_style_prompt")]
    #[validate(length(max = 300))]
    pub style_prompt: String,
    #[serde(default = "default_scene_count")]
    #[validate(range(min = 2, max = 10))]
    pub scene_count: u32,
    #[serde(default)]
    pub mode: RenderMode,
}

fn default_storyboard_duration() -> u32 {
    15
}

fn default_voice() -> String {
    "default".to_string()
}

fn default_style_prompt() -> String {
    "clean product ad".to_string()
}

fn default_scene_count() -> u32 {
    4
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct T2vParams {
    pub project_id: String,
    #[validate(length(min = 2, max = 400))]
    pub prompt: String,
    #[serde(default = "default_t2v_duration")]
    #[validate(range(min = 4, max = 20))]
    pub duration_sec: u32,
    #[serde(default = "default_platform")]
    pub platform: String,
    #[serde(default)]
    pub mode: RenderMode,
}

fn default_t2v_duration() -> u32 {
    8
}

/// Decode and bounds-check a job's parameters, failing the job on
/// malformed or out-of-range input.
pub fn decode<T: DeserializeOwned + Validate>(
    job_type: JobType,
    params: &serde_json::Value,
) -> Result<T, HandlerError> {
    let invalid = |e: &dyn std::fmt::Display| {
        HandlerError::Failed(format!("invalid parameters for {job_type}: {e}"))
    };
    let parsed = T::deserialize(params).map_err(|e| invalid(&e))?;
    parsed.validate().map_err(|e| invalid(&e))?;
    Ok(parsed)
}
