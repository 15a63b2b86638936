//! Handlers for the five generation job types.
//!
//! Each handler decodes its parameters, resolves the project, reports
//! progress at fixed checkpoints, runs generation on a blocking thread
//! (images and edits through the [`RetryLadder`]), writes outputs under
//! `<projects_dir>/<project_id>/jobs/<job_id>/`, and records assets.
//!
//! | Job type           | Checkpoints                                              |
//! |--------------------|----------------------------------------------------------|
//! | `copy_generate`    | `copy_generating` 20, `copy_saving` 80                    |
//! | `image_generate`   | `image_generating` 30, `image_saving` 85                  |
//! | `image_inpaint`    | `inpaint_editing` 35, `inpaint_saving` 85                 |
//! | `video_storyboard` | `storyboard_planning` 15, `storyboard_scene_<n>` 15..70, `storyboard_rendering` 70, `storyboard_assets` 80 |
//! | `video_t2v`        | `t2v_capability_check` 10, `t2v_assets` 80                |

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use clipper_core::job::{Job, JobType};
use clipper_core::oom::{MemoryReclaimer, PhraseClassifier};
use clipper_core::retry_ladder::{LadderOutcome, LadderPolicy, RetryLadder};
use clipper_core::types::JobId;
use clipper_worker::{HandlerError, HandlerRegistry, JobHandler, ProgressReporter, WorkerConfig};
use serde::Serialize;
use serde_json::{json, Value};

use crate::collaborators::{
    Asset, AssetKind, AssetSink, CopyRequest, CopyWriter, GenerationError, ImageRequest,
    ImageSynthesizer, InpaintEditor, InpaintRequest, NewAsset, Project, ProjectCatalog,
    RenderRequest, RenderedMedia, StoryboardComposer, T2vRequest, TextToVideo,
};
use crate::params::{
    decode, image_size, prompt_seed, CopyParams, ImageParams, InpaintParams, RenderMode,
    StoryboardParams, T2vParams, DEFAULT_PLATFORM,
};
use crate::storyboard;

/// Storyboard scene `i` (0-based) is rendered with seed `SCENE_SEED_BASE + i`.
const SCENE_SEED_BASE: u64 = 11;

/// Scenes rendered when text-to-video falls back to a storyboard.
const T2V_FALLBACK_SCENES: u32 = 4;

/// Progress window covered by per-scene storyboard checkpoints.
const SCENE_PROGRESS_START: i32 = 15;
const SCENE_PROGRESS_END: i32 = 70;

const MIN_INPAINT_STRENGTH: f64 = 0.05;
const MAX_INPAINT_STRENGTH: f64 = 1.0;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Root of the per-project output folders.
    pub projects_dir: PathBuf,
}

impl PipelineConfig {
    pub fn job_dir(&self, project_id: &str, job_id: JobId) -> PathBuf {
        self.projects_dir
            .join(project_id)
            .join("jobs")
            .join(job_id.to_string())
    }
}

impl From<&WorkerConfig> for PipelineConfig {
    fn from(config: &WorkerConfig) -> Self {
        Self {
            projects_dir: config.projects_dir.clone(),
        }
    }
}

/// Everything the orchestrator calls out to.
#[derive(Clone)]
pub struct Collaborators {
    pub projects: Arc<dyn ProjectCatalog>,
    pub assets: Arc<dyn AssetSink>,
    pub copy: Arc<dyn CopyWriter>,
    pub images: Arc<dyn ImageSynthesizer>,
    pub inpaint: Arc<dyn InpaintEditor>,
    pub composer: Arc<dyn StoryboardComposer>,
    pub t2v: Arc<dyn TextToVideo>,
    pub reclaimer: Arc<dyn MemoryReclaimer>,
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

pub struct GenerationOrchestrator {
    collab: Collaborators,
    ladder: RetryLadder,
    config: PipelineConfig,
}

/// Registered in the [`HandlerRegistry`] for every job type.
struct OrchestratorHandler(Arc<GenerationOrchestrator>);

#[async_trait]
impl JobHandler for OrchestratorHandler {
    async fn handle(&self, job: Job, progress: ProgressReporter) -> Result<Value, HandlerError> {
        self.0.handle(job, progress).await
    }
}

impl GenerationOrchestrator {
    pub fn new(collab: Collaborators, config: PipelineConfig) -> Self {
        let ladder = build_ladder(LadderPolicy::default(), collab.reclaimer.clone());
        Self {
            collab,
            ladder,
            config,
        }
    }

    pub fn with_ladder_policy(mut self, policy: LadderPolicy) -> Self {
        self.ladder = build_ladder(policy, self.collab.reclaimer.clone());
        self
    }

    /// Register this orchestrator as the handler for every job type.
    pub fn register_all(self: &Arc<Self>, registry: &mut HandlerRegistry) {
        for job_type in JobType::ALL {
            registry.register(*job_type, OrchestratorHandler(self.clone()));
        }
    }

    /// Run `job` with the handler for its type.
    pub async fn handle(&self, job: Job, progress: ProgressReporter) -> Result<Value, HandlerError> {
        tracing::info!(job_id = %job.id, job_type = %job.job_type, "Generation started");
        match job.job_type {
            JobType::CopyGenerate => self.copy_generate(&job, &progress).await,
            JobType::ImageGenerate => self.image_generate(&job, &progress).await,
            JobType::ImageInpaint => self.image_inpaint(&job, &progress).await,
            JobType::VideoStoryboard => self.video_storyboard(&job, &progress).await,
            JobType::VideoT2v => self.video_t2v(&job, &progress).await,
        }
    }

    // -- copy --

    async fn copy_generate(&self, job: &Job, progress: &ProgressReporter) -> Result<Value, HandlerError> {
        let params: CopyParams = decode(job.job_type, &job.params)?;
        let project = self.require_project(&params.project_id).await?;
        progress.report("copy_generating", 20).await?;

        let writer = self.collab.copy.clone();
        let request = CopyRequest {
            project: project.clone(),
            goal: params.goal,
            cta: params.cta,
            count: params.count,
            mode: params.mode,
        };
        let variants = off_thread(move || writer.write_variants(&request)).await?;
        progress.report("copy_saving", 80).await?;

        let out_dir = self.ensure_job_dir(&project.id, job.id).await?;
        let path = out_dir.join("copy_variants.json");
        write_json(&path, &variants).await?;

        let asset_id = self
            .record(
                job.id,
                &project.id,
                AssetKind::Copy,
                path,
                json!({ "count": variants.len(), "mode": params.mode }),
            )
            .await?;

        Ok(json!({ "asset_ids": [asset_id], "variants": variants }))
    }

    // -- still images --

    async fn image_generate(&self, job: &Job, progress: &ProgressReporter) -> Result<Value, HandlerError> {
        let params: ImageParams = decode(job.job_type, &job.params)?;
        let project = self.require_project(&params.project_id).await?;
        progress.report("image_generating", 30).await?;

        let out_dir = self.ensure_job_dir(&project.id, job.id).await?;
        let output = out_dir.join("image.png");
        let seed = params.seed.unwrap_or_else(|| prompt_seed(&params.prompt));
        let request = ImageRequest {
            prompt: params.prompt,
            negative_prompt: params.negative_prompt,
            platform: params.platform,
            mode: params.mode,
            seed,
        };
        let image_meta = self.generate_image(request, output.clone()).await?;
        progress.report("image_saving", 85).await?;

        let asset_id = self
            .record(job.id, &project.id, AssetKind::Image, output, image_meta.clone())
            .await?;

        Ok(json!({ "asset_ids": [asset_id], "image_meta": image_meta }))
    }

    /// Generate one image through the ladder and describe the result.
    async fn generate_image(&self, request: ImageRequest, output: PathBuf) -> Result<Value, HandlerError> {
        let (width, height) = image_size(&request.platform, request.mode);
        let steps = request.mode.image_steps();

        let ladder = self.ladder.clone();
        let images = self.collab.images.clone();
        let attempt_request = request.clone();
        let outcome = off_thread(move || {
            ladder.run(width, height, steps, |rung| {
                images.synthesize(&attempt_request, rung, &output)
            })
        })
        .await?;

        let extra = json!({
            "requested_width": width,
            "requested_height": height,
            "platform": request.platform,
            "mode": request.mode,
            "seed": request.seed,
        });
        Ok(describe_outcome(outcome, extra))
    }

    // -- masked edits --

    async fn image_inpaint(&self, job: &Job, progress: &ProgressReporter) -> Result<Value, HandlerError> {
        let params: InpaintParams = decode(job.job_type, &job.params)?;
        let project = self.require_project(&params.project_id).await?;
        let image = self.require_asset("image_asset_id", &params.image_asset_id).await?;
        let mask = self.require_asset("mask_asset_id", &params.mask_asset_id).await?;
        ensure_file_exists("Base image", &image.path).await?;
        ensure_file_exists("Mask image", &mask.path).await?;

        progress.report("inpaint_editing", 35).await?;

        let out_dir = self.ensure_job_dir(&project.id, job.id).await?;
        let output = out_dir.join("inpaint.png");
        let (width, height) =
            asset_size(&image.meta).unwrap_or_else(|| image_size(DEFAULT_PLATFORM, params.mode));
        let steps = params.mode.inpaint_steps();
        let strength = params
            .strength
            .clamp(MIN_INPAINT_STRENGTH, MAX_INPAINT_STRENGTH);
        let request = InpaintRequest {
            image_path: image.path.clone(),
            mask_path: mask.path.clone(),
            edit_prompt: params.edit_prompt,
            mode: params.mode,
            strength,
        };

        let ladder = self.ladder.clone();
        let editor = self.collab.inpaint.clone();
        let edit_output = output.clone();
        let outcome = off_thread(move || {
            ladder.run(width, height, steps, |rung| {
                editor.edit(&request, rung, &edit_output)
            })
        })
        .await?;
        progress.report("inpaint_saving", 85).await?;

        let inpaint_meta = describe_outcome(
            outcome,
            json!({
                "requested_width": width,
                "requested_height": height,
                "mode": params.mode,
                "strength": strength,
            }),
        );
        let asset_meta = merge_meta(
            inpaint_meta.clone(),
            json!({
                "source_image_asset_id": image.id,
                "source_mask_asset_id": mask.id,
            }),
        );
        let asset_id = self
            .record(job.id, &project.id, AssetKind::Image, output, asset_meta)
            .await?;

        Ok(json!({ "asset_ids": [asset_id], "inpaint_meta": inpaint_meta }))
    }

    // -- storyboard video --

    async fn video_storyboard(&self, job: &Job, progress: &ProgressReporter) -> Result<Value, HandlerError> {
        let params: StoryboardParams = decode(job.job_type, &job.params)?;
        let project = self.require_project(&params.project_id).await?;
        progress.report("storyboard_planning", 15).await?;

        let board = self
            .render_storyboard(job.id, &project, StoryboardPlan::from(params), progress, true)
            .await?;
        progress.report("storyboard_assets", 80).await?;

        let mut asset_ids = Vec::new();
        for (path, meta) in board.scene_paths.iter().zip(&board.scene_meta) {
            let meta = merge_meta(meta.clone(), json!({ "type": "story_scene" }));
            asset_ids.push(
                self.record(job.id, &project.id, AssetKind::Image, path.clone(), meta)
                    .await?,
            );
        }
        asset_ids.push(
            self.record(
                job.id,
                &project.id,
                AssetKind::Subtitle,
                board.subtitle_path.clone(),
                json!({ "format": "srt" }),
            )
            .await?,
        );
        asset_ids.push(
            self.record(
                job.id,
                &project.id,
                AssetKind::Meta,
                board.manifest_path.clone(),
                json!({ "format": "json" }),
            )
            .await?,
        );
        if let Some(audio) = &board.media.audio_path {
            asset_ids.push(
                self.record(
                    job.id,
                    &project.id,
                    AssetKind::Audio,
                    audio.clone(),
                    json!({ "format": "wav" }),
                )
                .await?,
            );
        }
        if let Some(video) = &board.media.video_path {
            asset_ids.push(
                self.record(
                    job.id,
                    &project.id,
                    AssetKind::Video,
                    video.clone(),
                    board.metadata.clone(),
                )
                .await?,
            );
        }

        Ok(json!({
            "asset_ids": asset_ids,
            "video_path": board.media.video_path.as_deref().map(path_string),
            "metadata": board.metadata,
        }))
    }

    /// Render scene images, narration, subtitles, optional media, and the
    /// manifest into the job directory.
    ///
    /// With `report_scenes` each scene is a progress checkpoint; otherwise
    /// cancellation is still polled between scenes.
    async fn render_storyboard(
        &self,
        job_id: JobId,
        project: &Project,
        plan: StoryboardPlan,
        progress: &ProgressReporter,
        report_scenes: bool,
    ) -> Result<StoryboardOutput, HandlerError> {
        let out_dir = self.ensure_job_dir(&project.id, job_id).await?;
        let scene_dir = out_dir.join("scenes");
        tokio::fs::create_dir_all(&scene_dir)
            .await
            .map_err(GenerationError::from)?;

        let prompts = storyboard::scene_prompts(project, &plan.style_prompt, plan.scene_count);
        let mut scene_paths = Vec::with_capacity(prompts.len());
        let mut scene_meta = Vec::with_capacity(prompts.len());

        for (idx, prompt) in prompts.iter().enumerate() {
            let path = scene_dir.join(format!("scene_{:02}.png", idx + 1));
            let request = ImageRequest {
                prompt: prompt.clone(),
                negative_prompt: String::new(),
                platform: plan.platform.clone(),
                mode: plan.mode,
                seed: SCENE_SEED_BASE + idx as u64,
            };
            scene_meta.push(self.generate_image(request, path.clone()).await?);
            scene_paths.push(path);

            if report_scenes {
                let stage = format!("storyboard_scene_{}", idx + 1);
                progress
                    .report(&stage, scene_percent(idx, prompts.len()))
                    .await?;
            } else if progress.is_cancelled().await? {
                return Err(HandlerError::Cancelled);
            }
        }

        let narration = storyboard::narration_script(project, plan.scene_count);
        let narration_path = out_dir.join("narration.txt");
        write_text(&narration_path, &narration).await?;

        let subtitle_path = out_dir.join("subtitles.srt");
        write_text(
            &subtitle_path,
            &storyboard::subtitles_srt(&narration, plan.duration_sec),
        )
        .await?;

        if report_scenes {
            progress.report("storyboard_rendering", SCENE_PROGRESS_END).await?;
        }

        let composer = self.collab.composer.clone();
        let request = RenderRequest {
            scene_paths: scene_paths.clone(),
            narration,
            voice_id: plan.voice_id.clone(),
            duration_sec: plan.duration_sec,
            output_dir: out_dir.clone(),
        };
        let media = match off_thread(move || composer.render(&request)).await {
            Ok(media) => media,
            Err(e) => {
                tracing::warn!(
                    job_id = %job_id,
                    error = %e,
                    "Storyboard media rendering failed; keeping stills only",
                );
                RenderedMedia::default()
            }
        };

        let degraded_scenes = scene_meta
            .iter()
            .filter(|m| m["degraded"].as_bool().unwrap_or(false))
            .count();
        let metadata = json!({
            "scene_count": plan.scene_count,
            "duration_sec": plan.duration_sec,
            "platform": plan.platform,
            "mode": plan.mode,
            "voice_id": plan.voice_id,
            "video_rendered": media.video_path.is_some(),
            "degraded_scenes": degraded_scenes,
        });

        let manifest_path = out_dir.join("storyboard_manifest.json");
        let manifest = json!({
            "prompts": prompts,
            "scenes": scene_meta,
            "narration_path": path_string(&narration_path),
            "subtitle_path": path_string(&subtitle_path),
            "audio_path": media.audio_path.as_deref().map(path_string),
            "video_path": media.video_path.as_deref().map(path_string),
            "metadata": metadata,
        });
        write_json(&manifest_path, &manifest).await?;

        Ok(StoryboardOutput {
            scene_paths,
            scene_meta,
            subtitle_path,
            manifest_path,
            media,
            metadata,
        })
    }

    // -- text to video --

    async fn video_t2v(&self, job: &Job, progress: &ProgressReporter) -> Result<Value, HandlerError> {
        let params: T2vParams = decode(job.job_type, &job.params)?;
        let project = self.require_project(&params.project_id).await?;
        progress.report("t2v_capability_check", 10).await?;

        let out_dir = self.ensure_job_dir(&project.id, job.id).await?;
        let t2v = self.collab.t2v.clone();
        let request = T2vRequest {
            prompt: params.prompt.clone(),
            duration_sec: params.duration_sec,
            mode: params.mode,
        };
        let job_id = job.id;
        let (capability, direct_video) = off_thread(move || {
            let capability = t2v.capability();
            if !capability.enabled {
                return Ok::<_, GenerationError>((capability, None));
            }
            match t2v.generate(&request, &out_dir) {
                Ok(video) => Ok((capability, video)),
                Err(e) => {
                    tracing::warn!(job_id = %job_id, error = %e, "Text-to-video failed");
                    Ok((capability, None))
                }
            }
        })
        .await?;

        let (t2v_mode, fallback_used, video_path, scene_paths, manifest_path) = match direct_video {
            Some(video) => ("local", false, Some(video), Vec::new(), None),
            None => {
                tracing::info!(
                    job_id = %job.id,
                    reason = %capability.reason,
                    "Falling back to a storyboard video",
                );
                let plan = StoryboardPlan {
                    scene_count: T2V_FALLBACK_SCENES,
                    duration_sec: params.duration_sec,
                    platform: params.platform,
                    voice_id: "default".to_string(),
                    style_prompt: params.prompt,
                    mode: params.mode,
                };
                let board = self
                    .render_storyboard(job.id, &project, plan, progress, false)
                    .await?;
                (
                    "disabled_local_fallback",
                    true,
                    board.media.video_path,
                    board.scene_paths,
                    Some(board.manifest_path),
                )
            }
        };
        progress.report("t2v_assets", 80).await?;

        let t2v_meta = json!({
            "t2v_mode": t2v_mode,
            "fallback_used": fallback_used,
            "capability_reason": capability.reason,
        });
        let mut asset_ids = Vec::new();
        for path in scene_paths {
            asset_ids.push(
                self.record(
                    job.id,
                    &project.id,
                    AssetKind::Image,
                    path,
                    json!({ "type": "t2v_fallback_scene" }),
                )
                .await?,
            );
        }
        if let Some(video) = &video_path {
            asset_ids.push(
                self.record(job.id, &project.id, AssetKind::Video, video.clone(), t2v_meta.clone())
                    .await?,
            );
        }
        if let Some(manifest) = manifest_path {
            asset_ids.push(
                self.record(job.id, &project.id, AssetKind::Meta, manifest, t2v_meta.clone())
                    .await?,
            );
        }

        Ok(json!({
            "asset_ids": asset_ids,
            "t2v_mode": t2v_mode,
            "fallback_used": fallback_used,
            "capability_reason": capability.reason,
            "video_path": video_path.as_deref().map(path_string),
        }))
    }

    // -- helpers --

    async fn require_project(&self, project_id: &str) -> Result<Project, HandlerError> {
        self.collab
            .projects
            .project(project_id)
            .await?
            .ok_or_else(|| HandlerError::Failed(format!("project_id '{project_id}' was not found.")))
    }

    async fn require_asset(&self, field: &str, asset_id: &str) -> Result<Asset, HandlerError> {
        self.collab
            .assets
            .asset(asset_id)
            .await?
            .ok_or_else(|| HandlerError::Failed(format!("{field} '{asset_id}' was not found.")))
    }

    async fn ensure_job_dir(&self, project_id: &str, job_id: JobId) -> Result<PathBuf, HandlerError> {
        let dir = self.config.job_dir(project_id, job_id);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(GenerationError::from)?;
        Ok(dir)
    }

    /// Record an asset and return its id.
    async fn record(
        &self,
        job_id: JobId,
        project_id: &str,
        kind: AssetKind,
        path: PathBuf,
        meta: Value,
    ) -> Result<String, HandlerError> {
        let asset = self
            .collab
            .assets
            .record(NewAsset {
                project_id: project_id.to_string(),
                job_id,
                kind,
                path,
                meta,
            })
            .await?;
        tracing::debug!(job_id = %job_id, asset_id = %asset.id, kind = ?kind, "Asset recorded");
        Ok(asset.id)
    }
}

fn build_ladder(policy: LadderPolicy, reclaimer: Arc<dyn MemoryReclaimer>) -> RetryLadder {
    RetryLadder::new(policy, Arc::new(PhraseClassifier::default()), reclaimer)
}

// ---------------------------------------------------------------------------
// Storyboard plan
// ---------------------------------------------------------------------------

struct StoryboardPlan {
    scene_count: u32,
    duration_sec: u32,
    platform: String,
    voice_id: String,
    style_prompt: String,
    mode: RenderMode,
}

impl From<StoryboardParams> for StoryboardPlan {
    fn from(params: StoryboardParams) -> Self {
        Self {
            scene_count: params.scene_count,
            duration_sec: params.duration_sec,
            platform: params.platform,
            voice_id: params.voice_id,
            style_prompt: params.style_prompt,
            mode: params.mode,
        }
    }
}

struct StoryboardOutput {
    scene_paths: Vec<PathBuf>,
    scene_meta: Vec<Value>,
    subtitle_path: PathBuf,
    manifest_path: PathBuf,
    media: RenderedMedia,
    metadata: Value,
}

/// Checkpoint after scene `idx` of `total`, spread over the scene window.
fn scene_percent(idx: usize, total: usize) -> i32 {
    let span = (SCENE_PROGRESS_END - SCENE_PROGRESS_START) as usize;
    SCENE_PROGRESS_START + (span * (idx + 1) / total.max(1)) as i32
}

// ---------------------------------------------------------------------------
// Blocking work and file helpers
// ---------------------------------------------------------------------------

/// Run CPU/accelerator-bound work on the blocking pool.
async fn off_thread<T, E, F>(work: F) -> Result<T, HandlerError>
where
    T: Send + 'static,
    E: Into<HandlerError> + Send + 'static,
    F: FnOnce() -> Result<T, E> + Send + 'static,
{
    match tokio::task::spawn_blocking(work).await {
        Ok(result) => result.map_err(Into::into),
        Err(e) => Err(GenerationError::Join(e.to_string()).into()),
    }
}

/// Engine metadata plus the rung that produced it.
fn describe_outcome(outcome: LadderOutcome<Value>, extra: Value) -> Value {
    let report = outcome.report();
    let rung = outcome.rung;
    merge_meta(
        merge_meta(outcome.value, extra),
        json!({
            "width": rung.width,
            "height": rung.height,
            "steps": rung.steps,
            "ladder": report,
            "degraded": rung.index > 0,
        }),
    )
}

/// Overlay `extra`'s fields onto `base`. A non-object `base` is kept under
/// `"engine"`.
fn merge_meta(base: Value, extra: Value) -> Value {
    let mut merged = match base {
        Value::Object(map) => map,
        Value::Null => serde_json::Map::new(),
        other => {
            let mut map = serde_json::Map::new();
            map.insert("engine".to_string(), other);
            map
        }
    };
    if let Value::Object(extra) = extra {
        merged.extend(extra);
    }
    Value::Object(merged)
}

/// `width`/`height` recorded on an image asset, if both are present.
fn asset_size(meta: &Value) -> Option<(u32, u32)> {
    let width = u32::try_from(meta.get("width")?.as_u64()?).ok()?;
    let height = u32::try_from(meta.get("height")?.as_u64()?).ok()?;
    Some((width, height))
}

async fn ensure_file_exists(label: &str, path: &Path) -> Result<(), HandlerError> {
    match tokio::fs::try_exists(path).await {
        Ok(true) => Ok(()),
        _ => Err(HandlerError::Failed(format!(
            "{label} missing: {}",
            path.display()
        ))),
    }
}

async fn write_text(path: &Path, text: &str) -> Result<(), HandlerError> {
    tokio::fs::write(path, text)
        .await
        .map_err(GenerationError::from)?;
    Ok(())
}

async fn write_json(path: &Path, value: &impl Serialize) -> Result<(), HandlerError> {
    let body = serde_json::to_vec_pretty(value)
        .map_err(|e| GenerationError::failed(format!("encoding {}: {e}", path.display())))?;
    tokio::fs::write(path, body)
        .await
        .map_err(GenerationError::from)?;
    Ok(())
}

fn path_string(path: &Path) -> String {
    path.display().to_string()
}
