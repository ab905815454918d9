use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use image::RgbImage;
use item_finder::core_modules::image_helper;
use item_finder::{
    BoundingBox, CapabilityError, DetectionCandidate, Detector, SegmentationResult, Segmenter,
};
use serde::{Deserialize, Serialize};

use super::{check_status, transport_error};

#[derive(Serialize)]
struct DetectRequest<'a> {
    image: String,
    prompt: &'a str,
    box_threshold: f32,
    text_threshold: f32,
}

#[derive(Debug, Deserialize)]
struct DetectResponse {
    #[serde(default)]
    detections: Vec<WireDetection>,
}

#[derive(Debug, Deserialize)]
struct WireDetection {
    #[serde(rename = "box")]
    bbox: [f32; 4],
    score: f32,
    #[serde(default)]
    label: String,
}

impl From<WireDetection> for DetectionCandidate {
    fn from(wire: WireDetection) -> Self {
        let [x0, y0, x1, y1] = wire.bbox;
        DetectionCandidate {
            bbox: BoundingBox::new(x0, y0, x1, y1),
            score: wire.score,
            label: wire.label,
        }
    }
}

#[derive(Serialize)]
struct SegmentRequest {
    image: String,
    #[serde(rename = "box")]
    bbox: [f32; 4],
}

#[derive(Debug, Deserialize)]
struct SegmentResponse {
    /// Base64 PNG, non-zero pixels are foreground.
    mask: String,
    score: f32,
}

fn encode_image(image: &RgbImage) -> Result<String, CapabilityError> {
    let png = image_helper::encode_png(image)
        .map_err(|e| CapabilityError::Failed(format!("failed to encode request image: {e}")))?;
    Ok(STANDARD.encode(png))
}

/// Posts the image and prompt to a grounded object detection service.
///
/// Request: `{"image": <b64 png>, "prompt", "box_threshold", "text_threshold"}`.
/// Response: `{"detections": [{"box": [x0, y0, x1, y1], "score", "label"}]}`.
pub struct HttpDetector {
    client: reqwest::Client,
    endpoint: String,
    timeout: Duration,
}

impl HttpDetector {
    pub fn new(client: reqwest::Client, endpoint: &str, timeout: Duration) -> Self {
        Self {
            client,
            endpoint: endpoint.to_string(),
            timeout,
        }
    }
}

#[async_trait]
impl Detector for HttpDetector {
    async fn detect(
        &self,
        image: &RgbImage,
        prompt: &str,
        box_threshold: f32,
        text_threshold: f32,
    ) -> Result<Vec<DetectionCandidate>, CapabilityError> {
        let body = DetectRequest {
            image: encode_image(image)?,
            prompt,
            box_threshold,
            text_threshold,
        };
        let response = self
            .client
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await
            .map_err(|e| transport_error(e, self.timeout))?;
        let parsed: DetectResponse = check_status(response)
            .await?
            .json()
            .await
            .map_err(|e| transport_error(e, self.timeout))?;
        Ok(parsed.detections.into_iter().map(Into::into).collect())
    }
}

/// Posts the image and a box to a promptable segmentation service.
///
/// Request: `{"image": <b64 png>, "box": [x0, y0, x1, y1]}`.
/// Response: `{"mask": <b64 png>, "score"}`.
pub struct HttpSegmenter {
    client: reqwest::Client,
    endpoint: String,
    timeout: Duration,
}

impl HttpSegmenter {
    pub fn new(client: reqwest::Client, endpoint: &str, timeout: Duration) -> Self {
        Self {
            client,
            endpoint: endpoint.to_string(),
            timeout,
        }
    }
}

#[async_trait]
impl Segmenter for HttpSegmenter {
    async fn segment(
        &self,
        image: &RgbImage,
        bbox: &BoundingBox,
    ) -> Result<SegmentationResult, CapabilityError> {
        let body = SegmentRequest {
            image: encode_image(image)?,
            bbox: [bbox.x0, bbox.y0, bbox.x1, bbox.y1],
        };
        let response = self
            .client
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await
            .map_err(|e| transport_error(e, self.timeout))?;
        let parsed: SegmentResponse = check_status(response)
            .await?
            .json()
            .await
            .map_err(|e| transport_error(e, self.timeout))?;
        decode_segmentation(parsed)
    }
}

fn decode_segmentation(parsed: SegmentResponse) -> Result<SegmentationResult, CapabilityError> {
    let png = STANDARD
        .decode(parsed.mask.as_bytes())
        .map_err(|e| CapabilityError::InvalidResponse(format!("mask is not base64: {e}")))?;
    let mask = image_helper::load_mask(&png)
        .map_err(|e| CapabilityError::InvalidResponse(format!("mask is not an image: {e}")))?;
    Ok(SegmentationResult {
        mask,
        score: parsed.score,
    })
}
