use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::PngEncoder;
use image::{ExtendedColorType, ImageEncoder, ImageError, RgbImage};

use crate::core_modules::capabilities::Mask;

/// Decodes any supported container and normalizes it to 8-bit RGB.
pub fn load_rgb(bytes: &[u8]) -> Result<RgbImage, ImageError> {
    Ok(image::load_from_memory(bytes)?.to_rgb8())
}

/// Decodes a single-channel (or any) image and treats non-zero luma as foreground.
pub fn load_mask(bytes: &[u8]) -> Result<Mask, ImageError> {
    let luma = image::load_from_memory(bytes)?.to_luma8();
    Ok(Mask::from_luma(&luma))
}

/// Lossless encoding used when an image has to cross a process boundary.
pub fn encode_png(image: &RgbImage) -> Result<Vec<u8>, ImageError> {
    let mut buffer = Vec::new();
    let encoder = PngEncoder::new(&mut buffer);
    encoder.write_image(
        image.as_raw(),
        image.width(),
        image.height(),
        ExtendedColorType::Rgb8,
    )?;
    Ok(buffer)
}

/// Lossy encoding. `quality` is clamped to `1..=100`.
pub fn encode_jpeg(image: &RgbImage, quality: u8) -> Result<Vec<u8>, ImageError> {
    let mut buffer = Vec::new();
    let encoder = JpegEncoder::new_with_quality(&mut buffer, quality.clamp(1, 100));
    encoder.write_image(
        image.as_raw(),
        image.width(),
        image.height(),
        ExtendedColorType::Rgb8,
    )?;
    Ok(buffer)
}

/// Renders bytes as an RFC 2397 data URL.
pub fn data_url(mime: &str, bytes: &[u8]) -> String {
    format!("data:{mime};base64,{}", STANDARD.encode(bytes))
}
