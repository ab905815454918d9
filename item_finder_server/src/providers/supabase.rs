use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, Utc};
use item_finder::{Artifact, ArtifactMetadata, ArtifactStore, CapabilityError};
use serde_json::json;

use super::{check_status, transport_error};

/// Polls a freshly uploaded object's public URL until it answers 200.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadinessCheck {
    pub attempts: u32,
    pub interval: Duration,
}

/// Uploads artifacts to a Supabase Storage bucket and returns their public URL.
/// The bucket must be public for the returned URL to be reachable by the searcher.
pub struct SupabaseStore {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    timeout: Duration,
    readiness: Option<ReadinessCheck>,
    uploads: AtomicU64,
}

impl SupabaseStore {
    pub fn new(client: reqwest::Client, base_url: &str, api_key: &str, timeout: Duration) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            timeout,
            readiness: None,
            uploads: AtomicU64::new(0),
        }
    }

    /// Waits for the public URL to become reachable before returning it. The wait
    /// counts toward the caller's persist timeout.
    pub fn with_readiness(mut self, check: ReadinessCheck) -> Self {
        self.readiness = Some(check);
        self
    }

    fn upload_url(&self, bucket: &str, object: &str) -> String {
        format!("{}/storage/v1/object/{bucket}/{object}", self.base_url)
    }

    fn public_url(&self, bucket: &str, object: &str) -> String {
        format!("{}/storage/v1/object/public/{bucket}/{object}", self.base_url)
    }

    async fn wait_until_public(&self, url: &str, check: ReadinessCheck) -> Result<(), CapabilityError> {
        for attempt in 1..=check.attempts {
            match self.client.get(url).send().await {
                Ok(response) if response.status() == reqwest::StatusCode::OK => return Ok(()),
                Ok(response) => {
                    tracing::debug!(attempt, status = %response.status(), "artifact not public yet")
                }
                Err(err) => tracing::debug!(attempt, error = %err, "artifact not public yet"),
            }
            if attempt < check.attempts {
                tokio::time::sleep(check.interval).await;
            }
        }
        Err(CapabilityError::Unavailable(format!(
            "{url} was not reachable after {} attempts",
            check.attempts
        )))
    }
}

/// `<YYYYmmddHHMMSS>_<prompt>_<score>_<unique>.<ext>`, e.g.
/// `20250301120000_the_chair_0.82_0001a2b3c4d5e6f7.jpg`.
/// Whitespace in the prompt becomes `_`; anything outside `[A-Za-z0-9_-]` is dropped.
/// `unique` tells apart uploads that share the same second, prompt and score.
pub fn object_name(
    now: DateTime<Utc>,
    metadata: &ArtifactMetadata,
    unique: u64,
    extension: &str,
) -> String {
    let prompt: String = metadata
        .prompt
        .trim()
        .chars()
        .filter_map(|c| {
            if c.is_whitespace() {
                Some('_')
            } else if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                Some(c)
            } else {
                None
            }
        })
        .collect();
    format!(
        "{}_{}_{:.2}_{unique:016x}.{extension}",
        now.format("%Y%m%d%H%M%S"),
        prompt,
        metadata.score
    )
}

/// Sub-second time in the high bits, a per-store counter in the low bits.
fn unique_suffix(now: DateTime<Utc>, sequence: u64) -> u64 {
    (u64::from(now.timestamp_subsec_nanos()) << 32) | (sequence & 0xffff_ffff)
}

fn metadata_header(metadata: &ArtifactMetadata) -> String {
    let payload = json!({
        "score": metadata.score.to_string(),
        "text_prompt": metadata.prompt,
    });
    STANDARD.encode(payload.to_string())
}

#[async_trait]
impl ArtifactStore for SupabaseStore {
    async fn store(
        &self,
        artifact: &Artifact,
        bucket: &str,
        metadata: &ArtifactMetadata,
    ) -> Result<String, CapabilityError> {
        let now = Utc::now();
        let sequence = self.uploads.fetch_add(1, Ordering::Relaxed);
        let object = object_name(now, metadata, unique_suffix(now, sequence), artifact.format.extension());
        let response = self
            .client
            .post(self.upload_url(bucket, &object))
            .bearer_auth(&self.api_key)
            .header("apikey", &self.api_key)
            .header(reqwest::header::CONTENT_TYPE, artifact.format.mime())
            .header("x-upsert", "false")
            .header("x-metadata", metadata_header(metadata))
            .body(artifact.bytes.clone())
            .send()
            .await
            .map_err(|e| transport_error(e, self.timeout))?;
        check_status(response).await?;

        tracing::debug!(bucket, object = %object, "artifact uploaded to supabase");
        let url = self.public_url(bucket, &object);
        if let Some(check) = self.readiness {
            self.wait_until_public(&url, check).await?;
        }
        Ok(url)
    }
}
