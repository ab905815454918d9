// THEORY:
// This file is the main entry point for the `item_finder` library crate.
// It defines the public API consumed by front ends such as `item_finder_server`.
//
// The primary export is `SearchPipeline` together with its request, result and
// configuration types, plus the `ProgressBus` observers join to watch runs live.
// The capability traits are public so that deployments can plug in real model
// and storage services and tests can plug in fakes. The compositor stays a plain
// set of pure functions.

pub mod core_modules;
pub mod error;
pub mod pipeline;

pub use core_modules::capabilities::{
    ArtifactMetadata, ArtifactStore, BoundingBox, CapabilityError, DetectionCandidate, Detector,
    Mask, ProductMatch, ProductSearcher, SegmentationResult, Segmenter, Serialized,
};
pub use core_modules::compositor::{Artifact, ArtifactFormat, CompositeOptions, CropRect};
pub use core_modules::progress_bus::{ProgressBus, ProgressEvent, SubscriberId, Subscription};
pub use error::{PipelineError, Stage, StageFailure};
pub use pipeline::{
    Capabilities, PipelineConfig, PipelineRequest, PipelineResult, SearchPipeline,
};
