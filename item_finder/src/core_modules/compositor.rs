// THEORY:
// The `compositor` turns a full-size image and the segmenter's mask into the small,
// self-contained picture that is uploaded and searched for. It is the only place in
// the engine that touches pixels after loading, and it is a pure function: no I/O,
// no clocks, no randomness. Identical input bytes always produce identical output
// bytes, which is what makes the artifact safe to cache or re-upload.
//
// Algorithm steps:
// 1.  **Tight Bounds**: Scan the mask for the smallest rectangle containing every
//     foreground pixel. A mask with no foreground is rejected as `EmptyMask`.
// 2.  **Margin**: Grow the rectangle on all four sides by a percentage of its
//     width, so the object is not cut flush at its silhouette.
// 3.  **Clamp**: Pull the grown rectangle back inside the image bounds.
// 4.  **Matte**: Inside the crop, keep source pixels where the mask is set and
//     paint everything else with a flat matte color.
// 5.  **Encode**: Compress with a fixed lossy quality to bound the upload size.

use image::{Rgb, RgbImage};
use thiserror::Error;

use crate::core_modules::capabilities::Mask;
use crate::core_modules::image_helper;

pub const WHITE_MATTE: Rgb<u8> = Rgb([255, 255, 255]);

/// A pixel-aligned rectangle inside the source image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CropRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl CropRect {
    /// Exclusive right edge.
    pub fn right(&self) -> u32 {
        self.x + self.width
    }

    /// Exclusive bottom edge.
    pub fn bottom(&self) -> u32 {
        self.y + self.height
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactFormat {
    Jpeg,
}

impl ArtifactFormat {
    pub fn mime(self) -> &'static str {
        match self {
            ArtifactFormat::Jpeg => "image/jpeg",
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            ArtifactFormat::Jpeg => "jpg",
        }
    }
}

/// Tunables for the composite.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CompositeOptions {
    /// Margin added on every side, as a percentage of the tight box width.
    pub margin_percent: u32,
    pub matte: Rgb<u8>,
    /// Lossy encoder quality, `1..=100`.
    pub quality: u8,
}

impl Default for CompositeOptions {
    fn default() -> Self {
        Self {
            margin_percent: 10,
            matte: WHITE_MATTE,
            quality: 80,
        }
    }
}

/// The encoded cut-out and where it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub bytes: Vec<u8>,
    pub format: ArtifactFormat,
    pub crop: CropRect,
}

impl Artifact {
    pub fn to_data_url(&self) -> String {
        image_helper::data_url(self.format.mime(), &self.bytes)
    }
}

#[derive(Debug, Error)]
pub enum CompositeError {
    #[error("mask has no foreground pixels")]
    EmptyMask,
    #[error("mask is {mask:?} but image is {image:?}")]
    DimensionMismatch { image: (u32, u32), mask: (u32, u32) },
    #[error("failed to encode artifact: {0}")]
    Encode(#[from] image::ImageError),
}

/// The smallest rectangle containing every foreground pixel, or `None` for an
/// empty mask.
pub fn foreground_bounds(mask: &Mask) -> Option<CropRect> {
    let (width, height) = mask.dimensions();
    let mut min_x = u32::MAX;
    let mut min_y = u32::MAX;
    let mut max_x = 0;
    let mut max_y = 0;
    let mut found = false;

    for y in 0..height {
        for x in 0..width {
            if mask.get(x, y) {
                found = true;
                min_x = min_x.min(x);
                min_y = min_y.min(y);
                max_x = max_x.max(x);
                max_y = max_y.max(y);
            }
        }
    }

    found.then(|| CropRect {
        x: min_x,
        y: min_y,
        width: max_x - min_x + 1,
        height: max_y - min_y + 1,
    })
}

/// Grows `bounds` by `margin_percent` of its width on every side, then clamps the
/// result to a `width x height` image.
pub fn expand_and_clamp(bounds: CropRect, margin_percent: u32, width: u32, height: u32) -> CropRect {
    let margin = bounds.width.saturating_mul(margin_percent) / 100;
    let x0 = bounds.x.saturating_sub(margin);
    let y0 = bounds.y.saturating_sub(margin);
    let x1 = bounds.right().saturating_add(margin).min(width);
    let y1 = bounds.bottom().saturating_add(margin).min(height);
    CropRect {
        x: x0,
        y: y0,
        width: x1.saturating_sub(x0),
        height: y1.saturating_sub(y0),
    }
}

/// Crops and mattes without encoding. Every output pixel is either the source
/// pixel at the same position or exactly `options.matte`.
pub fn composite_pixels(
    image: &RgbImage,
    mask: &Mask,
    options: &CompositeOptions,
) -> Result<(RgbImage, CropRect), CompositeError> {
    if image.dimensions() != mask.dimensions() {
        return Err(CompositeError::DimensionMismatch {
            image: image.dimensions(),
            mask: mask.dimensions(),
        });
    }

    let bounds = foreground_bounds(mask).ok_or(CompositeError::EmptyMask)?;
    let crop = expand_and_clamp(bounds, options.margin_percent, image.width(), image.height());

    let output = RgbImage::from_fn(crop.width, crop.height, |cx, cy| {
        let (sx, sy) = (crop.x + cx, crop.y + cy);
        if mask.get(sx, sy) {
            *image.get_pixel(sx, sy)
        } else {
            options.matte
        }
    });

    Ok((output, crop))
}

/// Encodes an already composited crop.
pub fn encode_artifact(
    pixels: &RgbImage,
    crop: CropRect,
    options: &CompositeOptions,
) -> Result<Artifact, CompositeError> {
    let bytes = image_helper::encode_jpeg(pixels, options.quality)?;
    Ok(Artifact {
        bytes,
        format: ArtifactFormat::Jpeg,
        crop,
    })
}

/// Full transform: bounds, margin, clamp, matte, encode.
pub fn compose_artifact(
    image: &RgbImage,
    mask: &Mask,
    options: &CompositeOptions,
) -> Result<Artifact, CompositeError> {
    let (pixels, crop) = composite_pixels(image, mask, options)?;
    encode_artifact(&pixels, crop, options)
}
