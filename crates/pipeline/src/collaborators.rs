//! Seams between the orchestrator and the systems it drives.
//!
//! Project and asset records are looked up and written through async
//! traits. The generators themselves are synchronous and CPU/accelerator
//! bound; the orchestrator always calls them from a blocking thread.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use clipper_core::retry_ladder::Rung;
use clipper_core::types::JobId;
use clipper_worker::HandlerError;
use serde::{Deserialize, Serialize};

use crate::params::RenderMode;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Failure reported by a collaborator.
///
/// The message is what ends up on the job, and what the retry ladder
/// inspects for memory exhaustion.
#[derive(Debug, thiserror::Error)]
pub enum GenerationError {
    #[error("{0}")]
    Failed(String),

    #[error("{0}")]
    Io(#[from] std::io::Error),

    /// A blocking generation task panicked or was cancelled.
    #[error("generation task failed: {0}")]
    Join(String),
}

impl GenerationError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

impl From<GenerationError> for HandlerError {
    fn from(err: GenerationError) -> Self {
        HandlerError::Failed(err.to_string())
    }
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// Brand brief a job generates content for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    pub id: String,
    pub name: String,
    pub brand_name: String,
    pub product: String,
    pub audience: String,
    pub offer: String,
    pub tone: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssetKind {
    Copy,
    Image,
    Subtitle,
    Meta,
    Audio,
    Video,
}

/// An asset to record for a job.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NewAsset {
    pub project_id: String,
    pub job_id: JobId,
    pub kind: AssetKind,
    pub path: PathBuf,
    pub meta: serde_json::Value,
}

/// A recorded asset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Asset {
    pub id: String,
    pub project_id: String,
    pub job_id: Option<JobId>,
    pub kind: AssetKind,
    pub path: PathBuf,
    pub meta: serde_json::Value,
}

#[async_trait]
pub trait ProjectCatalog: Send + Sync {
    async fn project(&self, id: &str) -> Result<Option<Project>, GenerationError>;
}

#[async_trait]
pub trait AssetSink: Send + Sync {
    /// Persist a new asset and return it with its id.
    async fn record(&self, asset: NewAsset) -> Result<Asset, GenerationError>;

    async fn asset(&self, id: &str) -> Result<Option<Asset>, GenerationError>;
}

// ---------------------------------------------------------------------------
// Generators
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct CopyRequest {
    pub project: Project,
    pub goal: String,
    pub cta: String,
    pub count: u32,
    pub mode: RenderMode,
}

/// One ad copy variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CopyVariant {
    pub hook: String,
    pub headline: String,
    pub primary_text: String,
    pub cta: String,
}

pub trait CopyWriter: Send + Sync {
    fn write_variants(&self, request: &CopyRequest) -> Result<Vec<CopyVariant>, GenerationError>;
}

#[derive(Debug, Clone)]
pub struct ImageRequest {
    pub prompt: String,
    pub negative_prompt: String,
    pub platform: String,
    pub mode: RenderMode,
    pub seed: u64,
}

/// Text-to-image generation.
pub trait ImageSynthesizer: Send + Sync {
    /// Render one image at the rung's size and step count into `output`.
    ///
    /// Returns engine metadata as a JSON object.
    fn synthesize(
        &self,
        request: &ImageRequest,
        rung: &Rung,
        output: &Path,
    ) -> Result<serde_json::Value, GenerationError>;
}

#[derive(Debug, Clone)]
pub struct InpaintRequest {
    pub image_path: PathBuf,
    pub mask_path: PathBuf,
    pub edit_prompt: String,
    pub mode: RenderMode,
    /// Edit strength in `0.05..=1.0`.
    pub strength: f64,
}

/// Masked image editing.
pub trait InpaintEditor: Send + Sync {
    fn edit(
        &self,
        request: &InpaintRequest,
        rung: &Rung,
        output: &Path,
    ) -> Result<serde_json::Value, GenerationError>;
}

#[derive(Debug, Clone)]
pub struct RenderRequest {
    pub scene_paths: Vec<PathBuf>,
    pub narration: String,
    pub voice_id: String,
    pub duration_sec: u32,
    pub output_dir: PathBuf,
}

/// Media a composer managed to produce. Either part may be missing.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RenderedMedia {
    pub audio_path: Option<PathBuf>,
    pub video_path: Option<PathBuf>,
}

/// Voiceover and slideshow rendering for storyboards.
pub trait StoryboardComposer: Send + Sync {
    fn render(&self, request: &RenderRequest) -> Result<RenderedMedia, GenerationError>;
}

/// Whether direct text-to-video can run on this machine, and why.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct T2vCapability {
    pub enabled: bool,
    pub reason: String,
}

#[derive(Debug, Clone)]
pub struct T2vRequest {
    pub prompt: String,
    pub duration_sec: u32,
    pub mode: RenderMode,
}

/// Direct text-to-video generation.
pub trait TextToVideo: Send + Sync {
    fn capability(&self) -> T2vCapability;

    /// Produce a video in `output_dir`. `Ok(None)` means nothing usable came
    /// out and the caller should fall back.
    fn generate(
        &self,
        request: &T2vRequest,
        output_dir: &Path,
    ) -> Result<Option<PathBuf>, GenerationError>;
}

/// [`TextToVideo`] for machines without a video model.
#[derive(Debug, Clone, Default)]
pub struct DisabledTextToVideo {
    pub reason: String,
}

impl TextToVideo for DisabledTextToVideo {
    fn capability(&self) -> T2vCapability {
        T2vCapability {
            enabled: false,
            reason: self.reason.clone(),
        }
    }

    fn generate(&self, _: &T2vRequest, _: &Path) -> Result<Option<PathBuf>, GenerationError> {
        Ok(None)
    }
}
