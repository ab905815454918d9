use std::sync::Arc;

use item_finder::{ProgressBus, SearchPipeline};
use item_finder_server::{AppState, ServerConfig, providers, start_server};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    let cfg = ServerConfig::from_env()?;
    let capabilities = providers::build_capabilities(&cfg)?;
    let bus = Arc::new(ProgressBus::new());
    let pipeline = Arc::new(SearchPipeline::new(capabilities, bus, cfg.pipeline_config()));

    let server = start_server(AppState::new(pipeline), &cfg).await?;
    tracing::info!(
        addr = %server.addr,
        bucket = %cfg.bucket,
        timeout_secs = cfg.network_timeout.as_secs(),
        "item_finder server listening"
    );

    // Park forever
    server.handle.await.ok();
    Ok(())
}
