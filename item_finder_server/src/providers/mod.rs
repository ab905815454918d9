//! HTTP adapters for the engine's four collaborators.
//!
//! Nothing here runs a model or ranks results: the detector and segmenter post
//! images to a remote inference service, the store uploads to Supabase Storage and
//! the searcher queries SerpAPI's Google Lens engine.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use item_finder::{CapabilityError, Capabilities, Serialized};

use crate::config::ServerConfig;

pub mod inference;
pub mod serpapi;
pub mod supabase;

pub use inference::{HttpDetector, HttpSegmenter};
pub use serpapi::LensSearcher;
pub use supabase::{ReadinessCheck, SupabaseStore};

/// Builds the production collaborators. Model endpoints usually sit in front of a
/// single accelerator, so detector and segmenter calls are serialized. Model calls
/// get their own client timeout; storage and search share the network timeout.
pub fn build_capabilities(cfg: &ServerConfig) -> Result<Capabilities> {
    let inference = http_client(cfg.inference_timeout)?;
    let network = http_client(cfg.network_timeout)?;

    let detector = HttpDetector::new(inference.clone(), &cfg.detector_url, cfg.inference_timeout);
    let segmenter = HttpSegmenter::new(inference, &cfg.segmenter_url, cfg.inference_timeout);
    let mut store = SupabaseStore::new(
        network.clone(),
        &cfg.supabase_url,
        &cfg.supabase_key,
        cfg.network_timeout,
    );
    if cfg.readiness.attempts > 0 {
        store = store.with_readiness(cfg.readiness);
    }
    let searcher = LensSearcher::new(
        network,
        &cfg.serpapi_endpoint,
        &cfg.serpapi_key,
        cfg.max_matches,
        cfg.network_timeout,
    );

    Ok(Capabilities::new(
        Arc::new(Serialized::new(detector)),
        Arc::new(Serialized::new(segmenter)),
        Arc::new(store),
        Arc::new(searcher),
    ))
}

pub fn http_client(timeout: Duration) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .user_agent(concat!("item_finder/", env!("CARGO_PKG_VERSION")))
        .build()
        .context("failed to build HTTP client")
}

/// `timeout` is the client timeout the request ran under.
pub(crate) fn transport_error(err: reqwest::Error, timeout: Duration) -> CapabilityError {
    if err.is_timeout() {
        CapabilityError::Timeout(timeout)
    } else if err.is_decode() {
        CapabilityError::InvalidResponse(err.to_string())
    } else {
        CapabilityError::Unavailable(err.to_string())
    }
}

/// Turns a non-2xx response into an error carrying a short excerpt of the body.
pub(crate) async fn check_status(
    response: reqwest::Response,
) -> Result<reqwest::Response, CapabilityError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let excerpt: String = body.chars().take(200).collect();
    Err(CapabilityError::Failed(format!("HTTP {status}: {excerpt}")))
}
