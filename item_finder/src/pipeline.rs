// THEORY:
// The `pipeline` module is the top-level API of the engine. `SearchPipeline` takes
// an image and a text prompt and drives them through six strictly ordered stages:
//
//   load -> detect -> segment -> composite -> persist -> search
//
// Each stage consumes the previous stage's output, so a run has no internal
// parallelism. Many runs may execute at once; they share only the `ProgressBus`
// and the capability handles, which are either reentrant or wrapped in
// `Serialized`.
//
// Key architectural principles:
// 1.  **One Emission Call**: Stages never receive a progress callback. The run owns
//     a `RunReporter` that publishes to the bus and records the same event in the
//     run's log, so live observers and the final result always agree.
// 2.  **First Failure Wins**: The first stage error aborts everything after it.
//     One terminal error event is published, then the error is returned. There is
//     no partial success and no retry.
// 3.  **Bounded Network Calls**: Storage and search are wrapped in a timeout; an
//     expired timeout is an ordinary stage failure.
// 4.  **Never Search Blind**: A store call that returns an empty or malformed URL
//     fails the persist stage instead of handing garbage to the searcher.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tracing::Instrument;

use crate::core_modules::capabilities::{
    ArtifactMetadata, ArtifactStore, CapabilityError, DetectionCandidate, Detector,
    ProductMatch, ProductSearcher, SegmentationResult, Segmenter,
};
use crate::core_modules::compositor::{self, CompositeError, CompositeOptions, CropRect};
use crate::core_modules::image_helper;
use crate::core_modules::progress_bus::{ProgressBus, ProgressEvent};
use crate::error::{PipelineError, Stage, StageFailure};

pub const DEFAULT_BUCKET: &str = "images-bucket";
pub const DEFAULT_NETWORK_TIMEOUT: Duration = Duration::from_secs(10);
pub const SEARCH_COMPLETED: &str = "Search completed successfully.";

/// Configuration for the SearchPipeline.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Minimum box confidence passed to the detector. Candidates scoring below it
    /// are ignored even if the detector returns them.
    pub box_threshold: f32,
    pub text_threshold: f32,
    /// Storage bucket artifacts are uploaded to.
    pub bucket: String,
    /// Upper bound on each storage and search call.
    pub network_timeout: Duration,
    /// Matches beyond this count are dropped.
    pub max_matches: usize,
    pub composite: CompositeOptions,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            box_threshold: 0.35,
            text_threshold: 0.25,
            bucket: DEFAULT_BUCKET.to_string(),
            network_timeout: DEFAULT_NETWORK_TIMEOUT,
            max_matches: 5,
            composite: CompositeOptions::default(),
        }
    }
}

/// One submission. The image bytes are dropped as soon as they are decoded.
#[derive(Debug, Clone)]
pub struct PipelineRequest {
    pub image: Vec<u8>,
    pub prompt: String,
}

impl PipelineRequest {
    pub fn new(image: impl Into<Vec<u8>>, prompt: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            prompt: prompt.into(),
        }
    }
}

/// Everything a completed run produced.
#[derive(Debug, Clone)]
pub struct PipelineResult {
    pub matches: Vec<ProductMatch>,
    /// Every event this run published, in order.
    pub progress: Vec<ProgressEvent>,
    pub artifact_data_url: String,
    /// Public URL returned by the artifact store.
    pub artifact_url: String,
    pub segmentation_score: f32,
    pub detection: DetectionCandidate,
    pub crop: CropRect,
}

impl PipelineResult {
    pub fn progress_messages(&self) -> Vec<&str> {
        self.progress.iter().map(|e| e.message.as_str()).collect()
    }
}

/// The four collaborators a run needs, built once at startup.
#[derive(Clone)]
pub struct Capabilities {
    pub detector: Arc<dyn Detector>,
    pub segmenter: Arc<dyn Segmenter>,
    pub store: Arc<dyn ArtifactStore>,
    pub searcher: Arc<dyn ProductSearcher>,
}

impl Capabilities {
    pub fn new(
        detector: Arc<dyn Detector>,
        segmenter: Arc<dyn Segmenter>,
        store: Arc<dyn ArtifactStore>,
        searcher: Arc<dyn ProductSearcher>,
    ) -> Self {
        Self {
            detector,
            segmenter,
            store,
            searcher,
        }
    }
}

/// Lowercases and trims the prompt and terminates it with a period, the form
/// grounded detectors expect. Returns `None` for a blank prompt.
pub fn normalize_prompt(prompt: &str) -> Option<String> {
    let mut normalized = prompt.trim().to_lowercase();
    if normalized.is_empty() {
        return None;
    }
    if !normalized.ends_with('.') {
        normalized.push('.');
    }
    Some(normalized)
}

/// Picks the highest-scoring candidate; on a tie the earliest one wins.
/// Non-finite scores are never selected.
pub fn select_candidate(candidates: &[DetectionCandidate]) -> Option<&DetectionCandidate> {
    candidates
        .iter()
        .filter(|c| c.score.is_finite())
        .fold(None, |best: Option<&DetectionCandidate>, candidate| match best {
            Some(current) if current.score >= candidate.score => Some(current),
            _ => Some(candidate),
        })
}

fn validate_public_url(raw: &str) -> Result<(), String> {
    if raw.trim().is_empty() {
        return Err("store returned an empty URL".to_string());
    }
    let parsed = url::Url::parse(raw).map_err(|e| format!("store returned an invalid URL {raw:?}: {e}"))?;
    if !matches!(parsed.scheme(), "http" | "https") || parsed.host_str().is_none() {
        return Err(format!("store returned a non-public URL {raw:?}"));
    }
    Ok(())
}

/// Publishes a run's events and keeps its log.
struct RunReporter<'a> {
    bus: &'a ProgressBus,
    run_id: u64,
    log: Vec<ProgressEvent>,
}

impl<'a> RunReporter<'a> {
    fn new(bus: &'a ProgressBus, run_id: u64) -> Self {
        Self {
            bus,
            run_id,
            log: Vec::new(),
        }
    }

    fn emit(&mut self, message: impl Into<String>) {
        let event = ProgressEvent::new(self.run_id, self.log.len() as u64, message);
        self.bus.publish(&event);
        self.log.push(event);
    }

    fn into_log(self) -> Vec<ProgressEvent> {
        self.log
    }
}

/// Intermediate outputs of a run that reached the end.
struct Completed {
    matches: Vec<ProductMatch>,
    artifact_data_url: String,
    artifact_url: String,
    segmentation_score: f32,
    detection: DetectionCandidate,
    crop: CropRect,
}

/// The pipeline coordinator.
pub struct SearchPipeline {
    capabilities: Capabilities,
    bus: Arc<ProgressBus>,
    config: PipelineConfig,
    next_run: AtomicU64,
}

impl SearchPipeline {
    pub fn new(capabilities: Capabilities, bus: Arc<ProgressBus>, config: PipelineConfig) -> Self {
        Self {
            capabilities,
            bus,
            config,
            next_run: AtomicU64::new(0),
        }
    }

    pub fn bus(&self) -> &Arc<ProgressBus> {
        &self.bus
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Executes one run to completion or to its first failure.
    pub async fn run(&self, request: PipelineRequest) -> Result<PipelineResult, PipelineError> {
        let run_id = self.next_run.fetch_add(1, Ordering::Relaxed);
        let span = tracing::info_span!("pipeline.run", run = run_id, prompt = %request.prompt);
        let mut reporter = RunReporter::new(&self.bus, run_id);

        let outcome = self.execute(request, &mut reporter).instrument(span.clone()).await;

        match outcome {
            Ok(done) => {
                span.in_scope(|| tracing::info!(matches = done.matches.len(), "run completed"));
                Ok(PipelineResult {
                    matches: done.matches,
                    progress: reporter.into_log(),
                    artifact_data_url: done.artifact_data_url,
                    artifact_url: done.artifact_url,
                    segmentation_score: done.segmentation_score,
                    detection: done.detection,
                    crop: done.crop,
                })
            }
            Err(err) => {
                span.in_scope(|| tracing::warn!(stage = %err.stage, error = %err.cause, "run aborted"));
                reporter.emit(format!("Error during {} step: {}", err.stage, err.cause));
                Err(err)
            }
        }
    }

    async fn execute(
        &self,
        request: PipelineRequest,
        reporter: &mut RunReporter<'_>,
    ) -> Result<Completed, PipelineError> {
        let PipelineRequest { image: raw_image, prompt } = request;

        // --- 1. Load & Normalize ---
        reporter.emit("Loading image...");
        let detector_prompt = normalize_prompt(&prompt).ok_or_else(|| {
            PipelineError::new(Stage::Load, StageFailure::Input("prompt is empty".to_string()))
        })?;
        let image = image_helper::load_rgb(&raw_image)
            .map_err(|e| PipelineError::new(Stage::Load, StageFailure::Input(e.to_string())))?;
        drop(raw_image);
        let (width, height) = image.dimensions();
        tracing::info!(stage = %Stage::Load, width, height, "image loaded");
        reporter.emit(format!("Image loaded ({width}x{height})."));

        // --- 2. Detection & Selection ---
        reporter.emit("Detecting object in image...");
        let mut candidates = self
            .capabilities
            .detector
            .detect(
                &image,
                &detector_prompt,
                self.config.box_threshold,
                self.config.text_threshold,
            )
            .await
            .map_err(|e| PipelineError::internal(Stage::Detect, e.to_string()))?;
        candidates.retain(|c| c.score >= self.config.box_threshold);
        let detection = select_candidate(&candidates).cloned().ok_or_else(|| {
            PipelineError::new(Stage::Detect, StageFailure::NoDetection { prompt: prompt.clone() })
        })?;
        tracing::info!(
            stage = %Stage::Detect,
            candidates = candidates.len(),
            score = detection.score,
            label = %detection.label,
            "object detected"
        );
        reporter.emit(format!(
            "Object detected with confidence score: {:.2}",
            detection.score
        ));

        // --- 3. Segmentation ---
        reporter.emit("Segmenting object...");
        let bbox = detection.bbox.clamp_to(width, height);
        let SegmentationResult { mask, score: segmentation_score } = self
            .capabilities
            .segmenter
            .segment(&image, &bbox)
            .await
            .map_err(|e| PipelineError::internal(Stage::Segment, e.to_string()))?;
        if mask.dimensions() != image.dimensions() {
            return Err(PipelineError::internal(
                Stage::Segment,
                format!(
                    "mask is {}x{} but image is {width}x{height}",
                    mask.width(),
                    mask.height()
                ),
            ));
        }
        tracing::info!(stage = %Stage::Segment, score = segmentation_score, "object segmented");
        reporter.emit(format!(
            "Segmentation completed with score: {segmentation_score:.2}"
        ));

        // --- 4. Composite ---
        reporter.emit("Extracting segmented object...");
        let options = self.config.composite;
        let artifact = tokio::task::spawn_blocking(move || {
            compositor::compose_artifact(&image, &mask, &options)
        })
        .await
        .map_err(|e| PipelineError::internal(Stage::Composite, e.to_string()))?
        .map_err(|e| match e {
            CompositeError::EmptyMask => PipelineError::new(Stage::Composite, StageFailure::EmptyMask),
            other => PipelineError::internal(Stage::Composite, other.to_string()),
        })?;
        let crop = artifact.crop;
        tracing::info!(
            stage = %Stage::Composite,
            width = crop.width,
            height = crop.height,
            bytes = artifact.bytes.len(),
            "artifact composited"
        );
        reporter.emit(format!("Object extracted ({}x{}).", crop.width, crop.height));

        // --- 5. Persist ---
        reporter.emit("Uploading artifact to storage...");
        let metadata = ArtifactMetadata {
            score: detection.score,
            prompt: prompt.clone(),
        };
        let artifact_url = self
            .bounded(
                Stage::Persist,
                self.capabilities
                    .store
                    .store(&artifact, &self.config.bucket, &metadata),
            )
            .await?;
        validate_public_url(&artifact_url)
            .map_err(|reason| PipelineError::new(Stage::Persist, StageFailure::Upload(reason)))?;
        tracing::info!(stage = %Stage::Persist, url = %artifact_url, "artifact stored");
        reporter.emit("Artifact uploaded successfully.");

        // --- 6. Search ---
        reporter.emit("Searching for similar products...");
        let mut matches = self
            .bounded(Stage::Search, self.capabilities.searcher.search(&artifact_url))
            .await?;
        matches.truncate(self.config.max_matches);
        tracing::info!(stage = %Stage::Search, matches = matches.len(), "search finished");
        reporter.emit(format!("Found {} similar products.", matches.len()));
        reporter.emit(SEARCH_COMPLETED);

        Ok(Completed {
            matches,
            artifact_data_url: artifact.to_data_url(),
            artifact_url,
            segmentation_score,
            detection,
            crop,
        })
    }

    /// Applies the network timeout to a storage or search call and maps its
    /// failure onto the stage's failure kind.
    async fn bounded<T, F>(&self, stage: Stage, call: F) -> Result<T, PipelineError>
    where
        F: Future<Output = Result<T, CapabilityError>>,
    {
        let failure = |message: String| match stage {
            Stage::Persist => StageFailure::Upload(message),
            Stage::Search => StageFailure::Search(message),
            _ => StageFailure::Internal(message),
        };

        match tokio::time::timeout(self.config.network_timeout, call).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => Err(PipelineError::new(stage, failure(err.to_string()))),
            Err(_) => {
                let err = CapabilityError::Timeout(self.config.network_timeout);
                Err(PipelineError::new(stage, failure(err.to_string())))
            }
        }
    }
}
