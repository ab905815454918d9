use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{DefaultBodyLimit, Multipart, State};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::{SinkExt, StreamExt};
use item_finder::{PipelineRequest, PipelineResult, ProductMatch, ProgressBus, ProgressEvent, SearchPipeline};
use serde::Serialize;

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<SearchPipeline>,
}

impl AppState {
    pub fn new(pipeline: Arc<SearchPipeline>) -> Self {
        Self { pipeline }
    }
}

/// Body of `POST /api/search`.
#[derive(Debug, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SearchResponse {
    Success {
        results: Vec<ProductMatch>,
        progress_steps: Vec<String>,
        artifact: String,
        segmentation_score: f32,
    },
    Error {
        message: String,
    },
}

impl SearchResponse {
    pub fn error(message: impl Into<String>) -> Self {
        SearchResponse::Error {
            message: message.into(),
        }
    }
}

impl From<PipelineResult> for SearchResponse {
    fn from(result: PipelineResult) -> Self {
        SearchResponse::Success {
            progress_steps: result.progress.into_iter().map(|e| e.message).collect(),
            results: result.matches,
            artifact: result.artifact_data_url,
            segmentation_score: result.segmentation_score,
        }
    }
}

#[derive(Serialize)]
struct ProgressFrame<'a> {
    progress: &'a str,
}

/// The text frame pushed to live observers for one event.
pub fn progress_frame(event: &ProgressEvent) -> String {
    serde_json::to_string(&ProgressFrame {
        progress: &event.message,
    })
    .unwrap_or_else(|_| "{}".to_string())
}

pub fn router(state: AppState, max_upload_bytes: usize) -> Router {
    Router::new()
        .route("/api/search", post(search_handler))
        .route("/ws/progress", get(progress_handler))
        .route("/healthz", get(|| async { "ok" }))
        .layer(DefaultBodyLimit::max(max_upload_bytes))
        .with_state(state)
}

async fn read_submission(multipart: &mut Multipart) -> Result<PipelineRequest, String> {
    let mut image: Option<Vec<u8>> = None;
    let mut prompt: Option<String> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| format!("malformed upload: {e}"))?
    {
        match field.name() {
            Some("image") => {
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| format!("failed to read image: {e}"))?;
                image = Some(bytes.to_vec());
            }
            Some("text_prompt") => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| format!("failed to read text_prompt: {e}"))?;
                prompt = Some(text);
            }
            _ => {}
        }
    }

    let image = image.filter(|b| !b.is_empty()).ok_or("missing image field")?;
    let prompt = prompt.ok_or("missing text_prompt field")?;
    Ok(PipelineRequest::new(image, prompt))
}

async fn search_handler(State(state): State<AppState>, mut multipart: Multipart) -> Json<SearchResponse> {
    let request = match read_submission(&mut multipart).await {
        Ok(request) => request,
        Err(message) => return Json(SearchResponse::error(message)),
    };

    // The run lives on its own task so a client hanging up does not cancel it.
    let pipeline = state.pipeline.clone();
    let run = tokio::spawn(async move { pipeline.run(request).await });

    match run.await {
        Ok(Ok(result)) => Json(result.into()),
        Ok(Err(err)) => Json(SearchResponse::error(err.to_string())),
        Err(err) => {
            tracing::error!("pipeline task failed: {err}");
            Json(SearchResponse::error("internal error"))
        }
    }
}

async fn progress_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    let bus = state.pipeline.bus().clone();
    ws.on_upgrade(move |socket| progress_conn(socket, bus))
}

async fn progress_conn(socket: WebSocket, bus: Arc<ProgressBus>) {
    let mut subscription = bus.join();
    let id = subscription.id();
    let (mut ws_tx, mut ws_rx) = socket.split();

    loop {
        tokio::select! {
            event = subscription.recv() => match event {
                Some(event) => {
                    if ws_tx.send(Message::Text(progress_frame(&event))).await.is_err() {
                        break;
                    }
                }
                // Evicted by the bus for falling behind.
                None => break,
            },
            inbound = ws_rx.next() => match inbound {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                // Keepalive traffic is accepted and ignored.
                Some(Ok(_)) => {}
            },
        }
    }

    bus.leave(id);
    let _ = ws_tx.close().await;
}
