use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use item_finder::pipeline::{DEFAULT_BUCKET, PipelineConfig};

use crate::providers::ReadinessCheck;

pub const DEFAULT_BIND: &str = "127.0.0.1:8000";
pub const DEFAULT_SERPAPI_ENDPOINT: &str = "https://serpapi.com/search.json";
pub const DEFAULT_MAX_UPLOAD_BYTES: usize = 20 * 1024 * 1024;
pub const DEFAULT_INFERENCE_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_READINESS_INTERVAL_MS: u64 = 500;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: String,
    pub max_upload_bytes: usize,
    /// Storage and search calls.
    pub network_timeout: Duration,
    /// Detector and segmenter calls.
    pub inference_timeout: Duration,
    /// Public-URL polling after upload; zero attempts disables it.
    pub readiness: ReadinessCheck,
    pub bucket: String,
    pub box_threshold: f32,
    pub text_threshold: f32,
    pub max_matches: usize,
    pub detector_url: String,
    pub segmenter_url: String,
    pub supabase_url: String,
    pub supabase_key: String,
    pub serpapi_key: String,
    pub serpapi_endpoint: String,
}

impl ServerConfig {
    /// Reads the configuration from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = PipelineConfig::default();

        let timeout_secs: u64 = parsed(&lookup, "ITEM_FINDER_NETWORK_TIMEOUT_SECS", 10)?;
        let inference_secs: u64 = parsed(
            &lookup,
            "ITEM_FINDER_INFERENCE_TIMEOUT_SECS",
            DEFAULT_INFERENCE_TIMEOUT_SECS,
        )?;
        for (key, value) in [
            ("ITEM_FINDER_NETWORK_TIMEOUT_SECS", timeout_secs),
            ("ITEM_FINDER_INFERENCE_TIMEOUT_SECS", inference_secs),
        ] {
            if value == 0 {
                bail!("{key} must be at least 1");
            }
        }
        let readiness = ReadinessCheck {
            attempts: parsed(&lookup, "ITEM_FINDER_READINESS_ATTEMPTS", 0)?,
            interval: Duration::from_millis(parsed(
                &lookup,
                "ITEM_FINDER_READINESS_INTERVAL_MS",
                DEFAULT_READINESS_INTERVAL_MS,
            )?),
        };
        let box_threshold = parsed(&lookup, "ITEM_FINDER_BOX_THRESHOLD", defaults.box_threshold)?;
        let text_threshold = parsed(&lookup, "ITEM_FINDER_TEXT_THRESHOLD", defaults.text_threshold)?;
        for (key, value) in [
            ("ITEM_FINDER_BOX_THRESHOLD", box_threshold),
            ("ITEM_FINDER_TEXT_THRESHOLD", text_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                bail!("{key} must be within 0.0..=1.0, got {value}");
            }
        }

        Ok(Self {
            bind_addr: lookup("ITEM_FINDER_BIND")
                .filter(|v| !v.is_empty())
                .unwrap_or_else(|| DEFAULT_BIND.to_string()),
            max_upload_bytes: parsed(&lookup, "ITEM_FINDER_MAX_UPLOAD_BYTES", DEFAULT_MAX_UPLOAD_BYTES)?,
            network_timeout: Duration::from_secs(timeout_secs),
            inference_timeout: Duration::from_secs(inference_secs),
            readiness,
            bucket: lookup("ITEM_FINDER_BUCKET")
                .filter(|v| !v.is_empty())
                .unwrap_or_else(|| DEFAULT_BUCKET.to_string()),
            box_threshold,
            text_threshold,
            max_matches: parsed(&lookup, "ITEM_FINDER_MAX_MATCHES", defaults.max_matches)?,
            detector_url: required(&lookup, "ITEM_FINDER_DETECTOR_URL")?,
            segmenter_url: required(&lookup, "ITEM_FINDER_SEGMENTER_URL")?,
            supabase_url: required(&lookup, "SUPABASE_URL")?,
            supabase_key: required(&lookup, "SUPABASE_KEY")?,
            serpapi_key: required(&lookup, "SERPAPI_API_KEY")?,
            serpapi_endpoint: lookup("SERPAPI_ENDPOINT")
                .filter(|v| !v.is_empty())
                .unwrap_or_else(|| DEFAULT_SERPAPI_ENDPOINT.to_string()),
        })
    }

    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            box_threshold: self.box_threshold,
            text_threshold: self.text_threshold,
            bucket: self.bucket.clone(),
            network_timeout: self.network_timeout,
            max_matches: self.max_matches,
            ..PipelineConfig::default()
        }
    }
}

fn required(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<String> {
    lookup(key)
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| anyhow!("{key} must be set"))
}

fn parsed<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key).filter(|v| !v.trim().is_empty()) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .with_context(|| format!("{key} has an invalid value {raw:?}")),
        None => Ok(default),
    }
}
