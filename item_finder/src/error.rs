// THEORY:
// Every way a run can end early is described by two coordinates: the `Stage`
// that was executing and the `StageFailure` that stopped it. The coordinator
// never invents a third kind of outcome, so callers can match exhaustively and
// the HTTP layer can render a single message without inspecting internals.

use std::fmt;

use thiserror::Error;

/// The logical steps of a search run, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum Stage {
    Load,
    Detect,
    Segment,
    Composite,
    Persist,
    Search,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Load => "load",
            Stage::Detect => "detect",
            Stage::Segment => "segment",
            Stage::Composite => "composite",
            Stage::Persist => "persist",
            Stage::Search => "search",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a stage stopped the run.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum StageFailure {
    /// The image could not be decoded, or the prompt is unusable.
    #[error("invalid input: {0}")]
    Input(String),
    #[error("no object matching \"{prompt}\" was detected")]
    NoDetection { prompt: String },
    #[error("segmentation produced an empty mask")]
    EmptyMask,
    #[error("artifact upload failed: {0}")]
    Upload(String),
    #[error("product search failed: {0}")]
    Search(String),
    #[error("internal error: {0}")]
    Internal(String),
}

/// The error returned by a run that did not complete.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{stage} stage failed: {cause}")]
pub struct PipelineError {
    pub stage: Stage,
    #[source]
    pub cause: StageFailure,
}

impl PipelineError {
    pub fn new(stage: Stage, cause: StageFailure) -> Self {
        Self { stage, cause }
    }

    pub fn internal(stage: Stage, message: impl Into<String>) -> Self {
        Self::new(stage, StageFailure::Internal(message.into()))
    }
}
