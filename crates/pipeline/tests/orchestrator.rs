use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use assert_matches::assert_matches;
use async_trait::async_trait;
use clipper_core::job::{Job, JobStatus, JobType, JobUpdate};
use clipper_core::job_store::{cancel_job, JobStore, MemoryJobStore};
use clipper_core::oom::MemoryReclaimer;
use clipper_core::retry_ladder::Rung;
use clipper_pipeline::collaborators::{
    Asset, AssetSink, CopyRequest, CopyVariant, CopyWriter, GenerationError, ImageRequest,
    ImageSynthesizer, InpaintEditor, InpaintRequest, NewAsset, Project, ProjectCatalog,
    RenderRequest, RenderedMedia, StoryboardComposer, T2vCapability, T2vRequest, TextToVideo,
};
use clipper_pipeline::params::prompt_seed;
use clipper_pipeline::{Collaborators, GenerationOrchestrator, PipelineConfig};
use clipper_worker::{HandlerError, HandlerRegistry, JobQueue, ProgressReporter, WorkerConfig};
use serde_json::{json, Value};
use tempfile::TempDir;

// ---------------------------------------------------------------------------
// Fakes
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Catalog {
    projects: HashMap<String, Project>,
}

#[async_trait]
impl ProjectCatalog for Catalog {
    async fn project(&self, id: &str) -> Result<Option<Project>, GenerationError> {
        Ok(self.projects.get(id).cloned())
    }
}

#[derive(Default)]
struct Assets {
    items: Mutex<Vec<Asset>>,
}

impl Assets {
    fn all(&self) -> Vec<Asset> {
        self.items.lock().unwrap().clone()
    }

    fn insert(&self, id: &str, path: PathBuf, meta: Value) {
        self.items.lock().unwrap().push(Asset {
            id: id.to_string(),
            project_id: "p1".to_string(),
            job_id: None,
            kind: clipper_pipeline::collaborators::AssetKind::Image,
            path,
            meta,
        });
    }
}

#[async_trait]
impl AssetSink for Assets {
    async fn record(&self, asset: NewAsset) -> Result<Asset, GenerationError> {
        let mut items = self.items.lock().unwrap();
        let recorded = Asset {
            id: format!("asset_{}", items.len() + 1),
            project_id: asset.project_id,
            job_id: Some(asset.job_id),
            kind: asset.kind,
            path: asset.path,
            meta: asset.meta,
        };
        items.push(recorded.clone());
        Ok(recorded)
    }

    async fn asset(&self, id: &str) -> Result<Option<Asset>, GenerationError> {
        Ok(self.items.lock().unwrap().iter().find(|a| a.id == id).cloned())
    }
}

struct Writer;

impl CopyWriter for Writer {
    fn write_variants(&self, request: &CopyRequest) -> Result<Vec<CopyVariant>, GenerationError> {
        Ok((0..request.count)
            .map(|i| CopyVariant {
                hook: format!("Hook {i}"),
                headline: format!("{} for {}", request.project.product, request.project.audience),
                primary_text: request.goal.clone(),
                cta: request.cta.clone(),
            })
            .collect())
    }
}

/// Image synthesizer that fails with queued messages before succeeding.
#[derive(Default)]
struct Painter {
    failures: Mutex<VecDeque<String>>,
    calls: Mutex<Vec<(u64, Rung)>>,
}

impl Painter {
    fn fail_next(&self, message: &str) {
        self.failures.lock().unwrap().push_back(message.to_string());
    }

    fn calls(&self) -> Vec<(u64, Rung)> {
        self.calls.lock().unwrap().clone()
    }
}

impl ImageSynthesizer for Painter {
    fn synthesize(
        &self,
        request: &ImageRequest,
        rung: &Rung,
        output: &Path,
    ) -> Result<Value, GenerationError> {
        self.calls.lock().unwrap().push((request.seed, *rung));
        if let Some(message) = self.failures.lock().unwrap().pop_front() {
            return Err(GenerationError::failed(message));
        }
        std::fs::write(output, b"png")?;
        Ok(json!({ "engine": "fake" }))
    }
}

#[derive(Default)]
struct Editor {
    calls: Mutex<Vec<Rung>>,
}

impl InpaintEditor for Editor {
    fn edit(
        &self,
        request: &InpaintRequest,
        rung: &Rung,
        output: &Path,
    ) -> Result<Value, GenerationError> {
        self.calls.lock().unwrap().push(*rung);
        std::fs::write(output, b"png")?;
        Ok(json!({ "engine": "fake_inpaint", "prompt": request.edit_prompt }))
    }
}

struct Composer {
    with_media: bool,
}

impl StoryboardComposer for Composer {
    fn render(&self, request: &RenderRequest) -> Result<RenderedMedia, GenerationError> {
        if !self.with_media {
            return Ok(RenderedMedia::default());
        }
        let audio = request.output_dir.join("voiceover.wav");
        let video = request.output_dir.join("storyboard.mp4");
        std::fs::write(&audio, b"wav")?;
        std::fs::write(&video, b"mp4")?;
        Ok(RenderedMedia {
            audio_path: Some(audio),
            video_path: Some(video),
        })
    }
}

struct Video {
    enabled: bool,
}

impl TextToVideo for Video {
    fn capability(&self) -> T2vCapability {
        T2vCapability {
            enabled: self.enabled,
            reason: if self.enabled { "gpu_detected" } else { "nvidia_gpu_not_detected" }.into(),
        }
    }

    fn generate(
        &self,
        _request: &T2vRequest,
        output_dir: &Path,
    ) -> Result<Option<PathBuf>, GenerationError> {
        let path = output_dir.join("t2v.mp4");
        std::fs::write(&path, b"mp4")?;
        Ok(Some(path))
    }
}

#[derive(Default)]
struct CountingReclaimer(AtomicUsize);

impl MemoryReclaimer for CountingReclaimer {
    fn release_cached_memory(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

struct Harness {
    dir: TempDir,
    store: Arc<dyn JobStore>,
    assets: Arc<Assets>,
    painter: Arc<Painter>,
    editor: Arc<Editor>,
    reclaimer: Arc<CountingReclaimer>,
    orchestrator: Arc<GenerationOrchestrator>,
}

fn project() -> Project {
    Project {
        id: "p1".into(),
        name: "Spring launch".into(),
        brand_name: "Acme".into(),
        product: "trail shoes".into(),
        audience: "weekend hikers".into(),
        offer: "20% off".into(),
        tone: "upbeat".into(),
    }
}

fn harness(t2v_enabled: bool, with_media: bool) -> Harness {
    let dir = TempDir::new().unwrap();
    let mut catalog = Catalog::default();
    catalog.projects.insert("p1".into(), project());

    let assets = Arc::new(Assets::default());
    let painter = Arc::new(Painter::default());
    let editor = Arc::new(Editor::default());
    let reclaimer = Arc::new(CountingReclaimer::default());

    let collab = Collaborators {
        projects: Arc::new(catalog),
        assets: assets.clone(),
        copy: Arc::new(Writer),
        images: painter.clone(),
        inpaint: editor.clone(),
        composer: Arc::new(Composer { with_media }),
        t2v: Arc::new(Video {
            enabled: t2v_enabled,
        }),
        reclaimer: reclaimer.clone(),
    };
    let config = PipelineConfig {
        projects_dir: dir.path().join("projects"),
    };

    Harness {
        dir,
        store: Arc::new(MemoryJobStore::new()),
        assets,
        painter,
        editor,
        reclaimer,
        orchestrator: Arc::new(GenerationOrchestrator::new(collab, config)),
    }
}

impl Harness {
    async fn running_job(&self, job_type: JobType, params: Value) -> Job {
        let job = self.store.create(job_type, params).await.unwrap();
        self.store
            .update(job.id, JobUpdate::new().status(JobStatus::Running))
            .await
            .unwrap()
            .unwrap()
    }

    async fn handle(&self, job: Job) -> (Result<Value, HandlerError>, Job) {
        let id = job.id;
        let reporter = ProgressReporter::new(self.store.clone(), id, job.job_type);
        let result = self.orchestrator.handle(job, reporter).await;
        (result, self.store.get(id).await.unwrap().unwrap())
    }

    async fn run(&self, job_type: JobType, params: Value) -> (Result<Value, HandlerError>, Job) {
        let job = self.running_job(job_type, params).await;
        self.handle(job).await
    }
}

// ---------------------------------------------------------------------------
// copy_generate
// ---------------------------------------------------------------------------

#[tokio::test]
async fn copy_variants_are_written_and_recorded() {
    let h = harness(false, false);
    let (result, job) = h
        .run(
            JobType::CopyGenerate,
            json!({"project_id": "p1", "goal": "more signups", "cta": "Join now", "count": 2}),
        )
        .await;
    let result = result.unwrap();

    assert_eq!(result["variants"].as_array().unwrap().len(), 2);
    assert_eq!(result["variants"][0]["cta"], "Join now");
    assert_eq!(result["asset_ids"], json!(["asset_1"]));
    assert_eq!(job.stage, "copy_saving");
    assert_eq!(job.progress_pct, 80);

    let assets = h.assets.all();
    assert_eq!(assets.len(), 1);
    assert_eq!(assets[0].meta, json!({"count": 2, "mode": "draft"}));
    let written: Vec<CopyVariant> =
        serde_json::from_slice(&std::fs::read(&assets[0].path).unwrap()).unwrap();
    assert_eq!(written.len(), 2);
    assert!(assets[0]
        .path
        .ends_with(format!("projects/p1/jobs/{}/copy_variants.json", job.id)));
}

#[tokio::test]
async fn unknown_project_fails_with_its_id() {
    let h = harness(false, false);
    let (result, _) = h
        .run(
            JobType::CopyGenerate,
            json!({"project_id": "nope", "goal": "signups", "cta": "Go"}),
        )
        .await;
    assert_matches!(result, Err(HandlerError::Failed(msg)) => {
        assert_eq!(msg, "project_id 'nope' was not found.");
    });
}

#[tokio::test]
async fn malformed_params_fail_before_any_work() {
    let h = harness(false, false);
    let (result, job) = h
        .run(JobType::ImageGenerate, json!({"project_id": "p1"}))
        .await;
    assert_matches!(result, Err(HandlerError::Failed(msg)) => {
        assert!(msg.starts_with("invalid parameters for image_generate:"));
    });
    assert!(h.painter.calls().is_empty());
    assert_eq!(job.progress_pct, 0);
}

// ---------------------------------------------------------------------------
// image_generate
// ---------------------------------------------------------------------------

#[tokio::test]
async fn draft_image_uses_half_size_and_prompt_seed() {
    let h = harness(false, false);
    let prompt = "trail shoes on a mountain ridge";
    let (result, job) = h
        .run(
            JobType::ImageGenerate,
            json!({"project_id": "p1", "prompt": prompt, "platform": "9:16"}),
        )
        .await;
    let meta = result.unwrap()["image_meta"].clone();

    let calls = h.painter.calls();
    assert_eq!(calls.len(), 1);
    let (seed, rung) = calls[0];
    assert_eq!(seed, prompt_seed(prompt));
    assert_eq!((rung.width, rung.height, rung.steps), (540, 960, 16));

    assert_eq!(meta["engine"], "fake");
    assert_eq!(meta["degraded"], false);
    assert_eq!(meta["requested_width"], 540);
    assert_eq!(meta["seed"], prompt_seed(prompt));
    assert_eq!(job.stage, "image_saving");
    assert_eq!(job.progress_pct, 85);
    assert!(h.assets.all()[0].path.exists());
}

#[tokio::test]
async fn explicit_seed_and_hq_mode() {
    let h = harness(false, false);
    let (result, _) = h
        .run(
            JobType::ImageGenerate,
            json!({"project_id": "p1", "prompt": "shoe", "platform": "1:1", "mode": "hq", "seed": 42}),
        )
        .await;
    assert!(result.is_ok());

    let (seed, rung) = h.painter.calls()[0];
    assert_eq!(seed, 42);
    assert_eq!((rung.width, rung.height, rung.steps), (1080, 1080, 28));
}

#[tokio::test]
async fn memory_exhaustion_steps_down_the_ladder() {
    let h = harness(false, false);
    h.painter.fail_next("CUDA out of memory. Tried to allocate 2.00 GiB");
    h.painter.fail_next("CUDA out of memory. Tried to allocate 1.00 GiB");

    let (result, job) = h
        .run(
            JobType::ImageGenerate,
            json!({"project_id": "p1", "prompt": "shoe", "mode": "hq", "seed": 5}),
        )
        .await;
    let meta = result.unwrap()["image_meta"].clone();

    let calls = h.painter.calls();
    assert_eq!(calls.len(), 3);
    assert!(calls.iter().all(|(seed, _)| *seed == 5));
    assert_eq!(h.reclaimer.0.load(Ordering::SeqCst), 2);

    assert_eq!(meta["degraded"], true);
    assert_eq!(meta["ladder"]["rung_index"], 2);
    assert_eq!(meta["ladder"]["oom_recovered"], true);
    assert_eq!(meta["width"], 832);
    assert_eq!(meta["height"], 1536);
    assert_eq!(meta["steps"], 19);
    assert_eq!(meta["requested_width"], 1080);
    assert_eq!(job.status, JobStatus::Running);
}

#[tokio::test]
async fn other_failures_are_not_retried() {
    let h = harness(false, false);
    h.painter.fail_next("safetensors header is corrupt");

    let (result, _) = h
        .run(JobType::ImageGenerate, json!({"project_id": "p1", "prompt": "shoe"}))
        .await;

    assert_matches!(result, Err(HandlerError::Failed(msg)) => {
        assert_eq!(msg, "safetensors header is corrupt");
    });
    assert_eq!(h.painter.calls().len(), 1);
    assert_eq!(h.reclaimer.0.load(Ordering::SeqCst), 0);
    assert!(h.assets.all().is_empty());
}

// ---------------------------------------------------------------------------
// image_inpaint
// ---------------------------------------------------------------------------

#[tokio::test]
async fn inpaint_edits_at_the_base_image_size() {
    let h = harness(false, false);
    let image = h.dir.path().join("base.png");
    let mask = h.dir.path().join("mask.png");
    std::fs::write(&image, b"png").unwrap();
    std::fs::write(&mask, b"png").unwrap();
    h.assets.insert("img", image, json!({"width": 540, "height": 960}));
    h.assets.insert("msk", mask, json!({}));

    let (result, job) = h
        .run(
            JobType::ImageInpaint,
            json!({
                "project_id": "p1",
                "image_asset_id": "img",
                "mask_asset_id": "msk",
                "edit_prompt": "make it red",
                "strength": 3.0,
            }),
        )
        .await;
    let meta = result.unwrap()["inpaint_meta"].clone();

    let calls = h.editor.calls.lock().unwrap().clone();
    assert_eq!(calls.len(), 1);
    assert_eq!((calls[0].width, calls[0].height, calls[0].steps), (540, 960, 14));
    assert_eq!(meta["strength"], 1.0);
    assert_eq!(meta["prompt"], "make it red");
    assert_eq!(job.stage, "inpaint_saving");

    let recorded = h.assets.all().pop().unwrap();
    assert_eq!(recorded.meta["source_image_asset_id"], "img");
    assert_eq!(recorded.meta["source_mask_asset_id"], "msk");
}

#[tokio::test]
async fn inpaint_requires_both_assets() {
    let h = harness(false, false);
    let image = h.dir.path().join("base.png");
    std::fs::write(&image, b"png").unwrap();
    h.assets.insert("img", image, json!({}));

    let (result, _) = h
        .run(
            JobType::ImageInpaint,
            json!({
                "project_id": "p1",
                "image_asset_id": "img",
                "mask_asset_id": "m404",
                "edit_prompt": "make it red",
            }),
        )
        .await;
    assert_matches!(result, Err(HandlerError::Failed(msg)) => {
        assert_eq!(msg, "mask_asset_id 'm404' was not found.");
    });
}

#[tokio::test]
async fn inpaint_requires_files_on_disk() {
    let h = harness(false, false);
    let missing = h.dir.path().join("gone.png");
    h.assets.insert("img", missing.clone(), json!({}));
    h.assets.insert("msk", missing.clone(), json!({}));

    let (result, _) = h
        .run(
            JobType::ImageInpaint,
            json!({
                "project_id": "p1",
                "image_asset_id": "img",
                "mask_asset_id": "msk",
                "edit_prompt": "make it red",
            }),
        )
        .await;
    assert_matches!(result, Err(HandlerError::Failed(msg)) => {
        assert_eq!(msg, format!("Base image missing: {}", missing.display()));
    });
    assert!(h.editor.calls.lock().unwrap().is_empty());
}

// ---------------------------------------------------------------------------
// video_storyboard
// ---------------------------------------------------------------------------

#[tokio::test]
async fn storyboard_renders_scenes_text_and_media() {
    let h = harness(false, true);
    let (result, job) = h
        .run(
            JobType::VideoStoryboard,
            json!({"project_id": "p1", "scene_count": 3, "duration_sec": 9}),
        )
        .await;
    let result = result.unwrap();

    let seeds: Vec<u64> = h.painter.calls().iter().map(|(seed, _)| *seed).collect();
    assert_eq!(seeds, vec![11, 12, 13]);

    // 3 scenes + subtitles + manifest + audio + video
    assert_eq!(result["asset_ids"].as_array().unwrap().len(), 7);
    assert_eq!(result["metadata"]["video_rendered"], true);
    assert_eq!(result["metadata"]["scene_count"], 3);
    assert!(result["video_path"].as_str().unwrap().ends_with("storyboard.mp4"));

    let job_dir = h
        .dir
        .path()
        .join("projects/p1/jobs")
        .join(job.id.to_string());
    assert!(job_dir.join("scenes/scene_03.png").exists());
    let narration = std::fs::read_to_string(job_dir.join("narration.txt")).unwrap();
    assert_eq!(
        narration,
        "Acme presents trail shoes. Built for weekend hikers. Get started with 20% off."
    );
    let srt = std::fs::read_to_string(job_dir.join("subtitles.srt")).unwrap();
    assert!(srt.ends_with("00:00:09,000\nGet started with 20% off.\n"));
    let manifest: Value =
        serde_json::from_slice(&std::fs::read(job_dir.join("storyboard_manifest.json")).unwrap())
            .unwrap();
    assert_eq!(manifest["prompts"].as_array().unwrap().len(), 3);

    assert_eq!(job.stage, "storyboard_assets");
    assert_eq!(job.progress_pct, 80);
}

#[tokio::test]
async fn cancelled_job_stops_at_first_checkpoint() {
    let h = harness(false, true);
    let job = h
        .running_job(JobType::VideoStoryboard, json!({"project_id": "p1"}))
        .await;
    cancel_job(h.store.as_ref(), job.id).await.unwrap();

    let (result, job) = h.handle(job).await;

    assert_matches!(result, Err(HandlerError::Cancelled));
    assert!(h.painter.calls().is_empty());
    assert_eq!(job.status, JobStatus::Cancelled);
}

// ---------------------------------------------------------------------------
// video_t2v
// ---------------------------------------------------------------------------

#[tokio::test]
async fn t2v_without_capability_falls_back_to_storyboard() {
    let h = harness(false, false);
    let (result, job) = h
        .run(
            JobType::VideoT2v,
            json!({"project_id": "p1", "prompt": "sneaker launch teaser"}),
        )
        .await;
    let result = result.unwrap();

    assert_eq!(result["t2v_mode"], "disabled_local_fallback");
    assert_eq!(result["fallback_used"], true);
    assert_eq!(result["capability_reason"], "nvidia_gpu_not_detected");
    assert_eq!(result["video_path"], Value::Null);
    // 4 fallback scenes + manifest
    assert_eq!(result["asset_ids"].as_array().unwrap().len(), 5);
    assert_eq!(h.painter.calls().len(), 4);
    assert_eq!(job.stage, "t2v_assets");
    assert_eq!(job.progress_pct, 80);
}

#[tokio::test]
async fn t2v_with_capability_uses_direct_video() {
    let h = harness(true, false);
    let (result, _) = h
        .run(
            JobType::VideoT2v,
            json!({"project_id": "p1", "prompt": "sneaker launch teaser", "mode": "hq"}),
        )
        .await;
    let result = result.unwrap();

    assert_eq!(result["t2v_mode"], "local");
    assert_eq!(result["fallback_used"], false);
    assert!(result["video_path"].as_str().unwrap().ends_with("t2v.mp4"));
    assert_eq!(result["asset_ids"].as_array().unwrap().len(), 1);
    assert!(h.painter.calls().is_empty());
}

// ---------------------------------------------------------------------------
// Through the worker pool
// ---------------------------------------------------------------------------

#[tokio::test]
async fn registered_orchestrator_completes_jobs_in_the_pool() {
    let h = harness(false, false);
    let mut registry = HandlerRegistry::new();
    h.orchestrator.register_all(&mut registry);

    let queue =
        JobQueue::try_new(h.store.clone(), registry, &WorkerConfig::with_concurrency(1)).unwrap();
    let job = h
        .store
        .create(
            JobType::ImageGenerate,
            json!({"project_id": "p1", "prompt": "shoe"}),
        )
        .await
        .unwrap();
    queue.enqueue(job.id);
    queue.start();

    let done = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let job = h.store.get(job.id).await.unwrap().unwrap();
            if job.status.is_terminal() {
                return job;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    queue.stop().await;

    assert_eq!(done.status, JobStatus::Done);
    assert_eq!(done.stage, "completed");
    assert_eq!(done.progress_pct, 100);
    assert_eq!(done.result.unwrap()["asset_ids"], json!(["asset_1"]));
}
