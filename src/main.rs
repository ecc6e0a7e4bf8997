//! Hermes: V4L2 camera to UDP JPEG streamer

use std::sync::Arc;

use color_eyre::{eyre::eyre, Result};
use hermes::pipeline::CameraPipeline;
use hermes::Config;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize error handling and logging
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| "hermes=info".into()))
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();

    info!("Hermes launching...");

    // Load configuration (defaults apply when the file is absent)
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config/hermes".into());
    let config = Config::load(&config_path)?;
    hermes::CONFIG.store(Arc::new(config.clone()));

    if config.cameras.is_empty() {
        return Err(eyre!("no cameras configured"));
    }

    // Any initialization failure here is fatal: report and exit non-zero.
    let mut pipelines = Vec::with_capacity(config.cameras.len());
    for (index, camera) in config.cameras.iter().enumerate() {
        pipelines.push(CameraPipeline::spawn(index, camera, &config)?);
    }
    info!(count = pipelines.len(), "streaming started; Ctrl-C to stop");

    tokio::signal::ctrl_c().await?;
    info!("interrupt received; shutting down");

    // Reverse start order: the most recently started pipeline goes first.
    for pipeline in pipelines.into_iter().rev() {
        pipeline.stop();
    }

    info!("Hermes shut down");
    Ok(())
}
