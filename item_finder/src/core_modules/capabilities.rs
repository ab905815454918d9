// THEORY:
// The `capabilities` module is the seam between the engine and the outside world.
// Detection, segmentation, artifact storage and product search are all performed
// by collaborators the engine does not own: model servers, object stores and
// third-party search APIs. This module defines what the engine needs from each of
// them and nothing more.
//
// Key architectural principles:
// 1.  **Explicit Service Objects**: Each collaborator is a long-lived object built
//     once at startup and handed to the coordinator behind an `Arc<dyn Trait>`.
//     Tests substitute in-process fakes through the same traits.
// 2.  **Dumb Value Types**: `BoundingBox`, `DetectionCandidate`, `Mask` and
//     `ProductMatch` carry data only. Decisions (which candidate wins, what the
//     crop looks like) belong to the coordinator and the compositor.
// 3.  **Opt-in Serialization**: A collaborator that cannot serve concurrent calls
//     is wrapped in `Serialized`, which owns the single exclusion point for that
//     collaborator. Reentrant collaborators pay nothing.

use std::time::Duration;

use async_trait::async_trait;
use image::{GrayImage, RgbImage};
use thiserror::Error;
use tokio::sync::Mutex;

use crate::core_modules::compositor::Artifact;

/// An axis-aligned box in source-image pixel coordinates, `(x0, y0)` top-left and
/// `(x1, y1)` bottom-right.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BoundingBox {
    pub x0: f32,
    pub y0: f32,
    pub x1: f32,
    pub y1: f32,
}

impl BoundingBox {
    pub fn new(x0: f32, y0: f32, x1: f32, y1: f32) -> Self {
        Self { x0, y0, x1, y1 }
    }

    pub fn width(&self) -> f32 {
        (self.x1 - self.x0).max(0.0)
    }

    pub fn height(&self) -> f32 {
        (self.y1 - self.y0).max(0.0)
    }

    /// Returns a copy with every coordinate pulled inside `[0, width] x [0, height]`
    /// and the corners ordered.
    pub fn clamp_to(&self, width: u32, height: u32) -> Self {
        let (w, h) = (width as f32, height as f32);
        let (x0, x1) = (self.x0.min(self.x1), self.x0.max(self.x1));
        let (y0, y1) = (self.y0.min(self.y1), self.y0.max(self.y1));
        Self {
            x0: x0.clamp(0.0, w),
            y0: y0.clamp(0.0, h),
            x1: x1.clamp(0.0, w),
            y1: y1.clamp(0.0, h),
        }
    }
}

/// One region the detector believes matches the prompt.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DetectionCandidate {
    pub bbox: BoundingBox,
    pub score: f32,
    pub label: String,
}

/// A binary mask with the same dimensions as the image it was computed for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mask {
    width: u32,
    height: u32,
    data: Vec<bool>,
}

impl Mask {
    /// An all-background mask.
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            data: vec![false; (width as usize) * (height as usize)],
        }
    }

    /// Builds a mask from row-major values. Returns `None` when the length does
    /// not match `width * height`.
    pub fn from_raw(width: u32, height: u32, data: Vec<bool>) -> Option<Self> {
        if data.len() != (width as usize) * (height as usize) {
            return None;
        }
        Some(Self { width, height, data })
    }

    pub fn from_fn(width: u32, height: u32, f: impl Fn(u32, u32) -> bool) -> Self {
        let mut data = Vec::with_capacity((width as usize) * (height as usize));
        for y in 0..height {
            for x in 0..width {
                data.push(f(x, y));
            }
        }
        Self { width, height, data }
    }

    /// Any non-zero luma value is foreground.
    pub fn from_luma(image: &GrayImage) -> Self {
        Self {
            width: image.width(),
            height: image.height(),
            data: image.as_raw().iter().map(|&v| v != 0).collect(),
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// Out-of-range coordinates read as background.
    pub fn get(&self, x: u32, y: u32) -> bool {
        if x >= self.width || y >= self.height {
            return false;
        }
        self.data[(y as usize) * (self.width as usize) + x as usize]
    }

    pub fn set(&mut self, x: u32, y: u32, value: bool) {
        if x < self.width && y < self.height {
            self.data[(y as usize) * (self.width as usize) + x as usize] = value;
        }
    }

    pub fn foreground_count(&self) -> usize {
        self.data.iter().filter(|&&v| v).count()
    }

    pub fn has_foreground(&self) -> bool {
        self.data.iter().any(|&v| v)
    }
}

/// The segmenter's mask for the selected box and the score of its top proposal.
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentationResult {
    pub mask: Mask,
    pub score: f32,
}

/// Metadata stored alongside an uploaded artifact.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ArtifactMetadata {
    pub score: f32,
    pub prompt: String,
}

/// A single visually similar product returned by the searcher.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ProductMatch {
    pub title: String,
    pub link: String,
    pub thumbnail: Option<String>,
    pub price: Option<f64>,
}

/// Failure reported by a collaborator.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CapabilityError {
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("service unavailable: {0}")]
    Unavailable(String),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
    #[error("{0}")]
    Failed(String),
}

/// Locates regions matching a text prompt.
#[async_trait]
pub trait Detector: Send + Sync {
    async fn detect(
        &self,
        image: &RgbImage,
        prompt: &str,
        box_threshold: f32,
        text_threshold: f32,
    ) -> Result<Vec<DetectionCandidate>, CapabilityError>;
}

/// Produces a pixel mask for the object inside a box.
#[async_trait]
pub trait Segmenter: Send + Sync {
    async fn segment(
        &self,
        image: &RgbImage,
        bbox: &BoundingBox,
    ) -> Result<SegmentationResult, CapabilityError>;
}

/// Persists an artifact and returns a publicly reachable URL for it.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    async fn store(
        &self,
        artifact: &Artifact,
        bucket: &str,
        metadata: &ArtifactMetadata,
    ) -> Result<String, CapabilityError>;
}

/// Reverse image search by public URL.
#[async_trait]
pub trait ProductSearcher: Send + Sync {
    async fn search(&self, url: &str) -> Result<Vec<ProductMatch>, CapabilityError>;
}

/// Routes every call to the wrapped collaborator through one async mutex, so at
/// most one call is in flight no matter how many runs share it.
pub struct Serialized<C> {
    inner: C,
    gate: Mutex<()>,
}

impl<C> Serialized<C> {
    pub fn new(inner: C) -> Self {
        Self {
            inner,
            gate: Mutex::new(()),
        }
    }

    pub fn into_inner(self) -> C {
        self.inner
    }
}

#[async_trait]
impl<C: Detector> Detector for Serialized<C> {
    async fn detect(
        &self,
        image: &RgbImage,
        prompt: &str,
        box_threshold: f32,
        text_threshold: f32,
    ) -> Result<Vec<DetectionCandidate>, CapabilityError> {
        let _turn = self.gate.lock().await;
        self.inner
            .detect(image, prompt, box_threshold, text_threshold)
            .await
    }
}

#[async_trait]
impl<C: Segmenter> Segmenter for Serialized<C> {
    async fn segment(
        &self,
        image: &RgbImage,
        bbox: &BoundingBox,
    ) -> Result<SegmentationResult, CapabilityError> {
        let _turn = self.gate.lock().await;
        self.inner.segment(image, bbox).await
    }
}

#[async_trait]
impl<C: ArtifactStore> ArtifactStore for Serialized<C> {
    async fn store(
        &self,
        artifact: &Artifact,
        bucket: &str,
        metadata: &ArtifactMetadata,
    ) -> Result<String, CapabilityError> {
        let _turn = self.gate.lock().await;
        self.inner.store(artifact, bucket, metadata).await
    }
}

#[async_trait]
impl<C: ProductSearcher> ProductSearcher for Serialized<C> {
    async fn search(&self, url: &str) -> Result<Vec<ProductMatch>, CapabilityError> {
        let _turn = self.gate.lock().await;
        self.inner.search(url).await
    }
}
