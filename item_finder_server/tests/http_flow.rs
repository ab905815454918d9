use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use image::{Rgb, RgbImage};
use item_finder::core_modules::image_helper;
use item_finder::{
    Artifact, ArtifactMetadata, ArtifactStore, BoundingBox, Capabilities, CapabilityError,
    DetectionCandidate, Detector, Mask, ProductMatch, ProductSearcher, ProgressBus, SearchPipeline,
    SegmentationResult, Segmenter,
};
use futures_util::{SinkExt, StreamExt};
use item_finder_server::providers::ReadinessCheck;
use item_finder_server::{AppState, ServerConfig, start_server};
use reqwest::multipart::{Form, Part};
use serde_json::Value;
use tokio_tungstenite::tungstenite::Message;

struct OneChair;

#[async_trait]
impl Detector for OneChair {
    async fn detect(
        &self,
        _image: &RgbImage,
        prompt: &str,
        _box_threshold: f32,
        _text_threshold: f32,
    ) -> Result<Vec<DetectionCandidate>, CapabilityError> {
        if !prompt.contains("chair") {
            return Ok(Vec::new());
        }
        Ok(vec![DetectionCandidate {
            bbox: BoundingBox::new(8.0, 8.0, 24.0, 24.0),
            score: 0.8,
            label: "chair".into(),
        }])
    }
}

struct BoxMask;

#[async_trait]
impl Segmenter for BoxMask {
    async fn segment(
        &self,
        image: &RgbImage,
        bbox: &BoundingBox,
    ) -> Result<SegmentationResult, CapabilityError> {
        let (x0, y0, x1, y1) = (bbox.x0 as u32, bbox.y0 as u32, bbox.x1 as u32, bbox.y1 as u32);
        Ok(SegmentationResult {
            mask: Mask::from_fn(image.width(), image.height(), |x, y| {
                x >= x0 && x < x1 && y >= y0 && y < y1
            }),
            score: 0.9,
        })
    }
}

struct FixedUrl;

#[async_trait]
impl ArtifactStore for FixedUrl {
    async fn store(
        &self,
        _artifact: &Artifact,
        bucket: &str,
        _metadata: &ArtifactMetadata,
    ) -> Result<String, CapabilityError> {
        Ok(format!("https://storage.example.com/{bucket}/chair.jpg"))
    }
}

struct TwoMatches;

#[async_trait]
impl ProductSearcher for TwoMatches {
    async fn search(&self, _url: &str) -> Result<Vec<ProductMatch>, CapabilityError> {
        Ok((1..=2)
            .map(|n| ProductMatch {
                title: format!("Chair #{n}"),
                link: format!("https://shop.example.com/{n}"),
                thumbnail: None,
                price: Some(10.0 * n as f64),
            })
            .collect())
    }
}

fn test_config() -> ServerConfig {
    ServerConfig {
        bind_addr: "127.0.0.1:0".into(),
        max_upload_bytes: 1024 * 1024,
        network_timeout: Duration::from_secs(5),
        inference_timeout: Duration::from_secs(5),
        readiness: ReadinessCheck {
            attempts: 0,
            interval: Duration::from_millis(10),
        },
        bucket: "images-bucket".into(),
        box_threshold: 0.35,
        text_threshold: 0.25,
        max_matches: 5,
        detector_url: String::new(),
        segmenter_url: String::new(),
        supabase_url: String::new(),
        supabase_key: String::new(),
        serpapi_key: String::new(),
        serpapi_endpoint: String::new(),
    }
}

struct TestServer {
    base: String,
    addr: String,
    pipeline: Arc<SearchPipeline>,
}

async fn spawn_server() -> TestServer {
    let cfg = test_config();
    let capabilities = Capabilities::new(
        Arc::new(OneChair),
        Arc::new(BoxMask),
        Arc::new(FixedUrl),
        Arc::new(TwoMatches),
    );
    let pipeline = Arc::new(SearchPipeline::new(
        capabilities,
        Arc::new(ProgressBus::new()),
        cfg.pipeline_config(),
    ));
    let server = start_server(AppState::new(pipeline.clone()), &cfg)
        .await
        .expect("server starts");
    TestServer {
        base: format!("http://{}", server.addr),
        addr: server.addr.to_string(),
        pipeline,
    }
}

async fn wait_for_subscribers(pipeline: &SearchPipeline, expected: usize) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while pipeline.bus().subscriber_count() != expected {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("subscriber count settles");
}

fn photo() -> Vec<u8> {
    let image = RgbImage::from_fn(32, 32, |x, y| Rgb([x as u8 * 8, y as u8 * 8, 128]));
    image_helper::encode_png(&image).expect("encode fixture")
}

async fn submit(base: &str, form: Form) -> Value {
    reqwest::Client::new()
        .post(format!("{base}/api/search"))
        .multipart(form)
        .send()
        .await
        .expect("request")
        .json()
        .await
        .expect("json body")
}

#[tokio::test]
async fn submission_returns_matches_and_progress() {
    let base = spawn_server().await.base;
    let form = Form::new()
        .part("image", Part::bytes(photo()).file_name("photo.png"))
        .text("text_prompt", "the chair");

    let body = submit(&base, form).await;

    assert_eq!(body["status"], "success", "body: {body}");
    assert_eq!(body["results"].as_array().map(Vec::len), Some(2));
    assert_eq!(body["results"][0]["title"], "Chair #1");
    assert!(
        body["artifact"]
            .as_str()
            .is_some_and(|a| a.starts_with("data:image/jpeg;base64,"))
    );
    let steps = body["progress_steps"].as_array().expect("progress steps");
    assert_eq!(steps.first().and_then(Value::as_str), Some("Loading image..."));
    assert_eq!(
        steps.last().and_then(Value::as_str),
        Some("Search completed successfully.")
    );
}

#[tokio::test]
async fn missing_object_is_reported_as_error_status() {
    let base = spawn_server().await.base;
    let form = Form::new()
        .part("image", Part::bytes(photo()).file_name("photo.png"))
        .text("text_prompt", "a bicycle");

    let body = submit(&base, form).await;

    assert_eq!(body["status"], "error");
    assert!(body["message"].as_str().is_some_and(|m| m.contains("detect")));
}

#[tokio::test]
async fn missing_fields_are_rejected() {
    let base = spawn_server().await.base;

    let body = submit(&base, Form::new().text("text_prompt", "the chair")).await;
    assert_eq!(body["status"], "error");
    assert_eq!(body["message"], "missing image field");

    let form = Form::new().part("image", Part::bytes(photo()).file_name("photo.png"));
    let body = submit(&base, form).await;
    assert_eq!(body["message"], "missing text_prompt field");
}

#[tokio::test]
async fn health_check_answers() {
    let base = spawn_server().await.base;
    let text = reqwest::get(format!("{base}/healthz"))
        .await
        .expect("request")
        .text()
        .await
        .expect("body");
    assert_eq!(text, "ok");
}

#[tokio::test]
async fn observer_receives_progress_frames_in_order() {
    let server = spawn_server().await;
    let (mut socket, _) = tokio_tungstenite::connect_async(format!("ws://{}/ws/progress", server.addr))
        .await
        .expect("websocket handshake");
    wait_for_subscribers(&server.pipeline, 1).await;

    // Inbound keepalive traffic must not end the session.
    socket.send(Message::Text("keepalive".into())).await.expect("send text");
    socket.send(Message::Ping(b"ka".to_vec())).await.expect("send ping");

    let form = Form::new()
        .part("image", Part::bytes(photo()).file_name("photo.png"))
        .text("text_prompt", "the chair");
    let body = submit(&server.base, form).await;
    assert_eq!(body["status"], "success", "body: {body}");
    let steps: Vec<String> = body["progress_steps"]
        .as_array()
        .expect("progress steps")
        .iter()
        .filter_map(|s| s.as_str().map(str::to_string))
        .collect();

    let mut frames = Vec::new();
    while frames.len() < steps.len() {
        let message = tokio::time::timeout(Duration::from_secs(5), socket.next())
            .await
            .expect("frame in time")
            .expect("socket open")
            .expect("valid frame");
        if let Message::Text(text) = message {
            let frame: Value = serde_json::from_str(&text).expect("json frame");
            frames.push(frame["progress"].as_str().expect("progress key").to_string());
        }
    }
    assert_eq!(frames, steps);

    socket.close(None).await.expect("close");
    wait_for_subscribers(&server.pipeline, 0).await;
}
