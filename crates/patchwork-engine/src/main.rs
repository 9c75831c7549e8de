//! Patchwork engine binary.
//!
//! # Startup Sequence
//!
//! 1. Load configuration from `$PATCHWORK_CONFIG` (default `patchwork.yaml`)
//! 2. Initialize structured logging (tracing)
//! 3. Create a fresh world, or restore the snapshot at `persistence.load_time`
//! 4. Start the session server and the autosave task
//! 5. Wait for Ctrl-C, then stop serving and write a final snapshot

mod autosave;
mod engine;
mod error;
mod logging;

use std::path::PathBuf;

use anyhow::Context as _;
use patchwork_core::{EngineConfig, Simulator};
use tracing::info;

use crate::engine::Engine;

const CONFIG_ENV: &str = "PATCHWORK_CONFIG";
const DEFAULT_CONFIG_PATH: &str = "patchwork.yaml";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = std::env::var_os(CONFIG_ENV)
        .map_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH), PathBuf::from);
    let config = EngineConfig::from_file(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;
    logging::init(&config.logging)?;

    info!(
        config = %config_path.display(),
        seed = config.simulator.seed,
        items = config.simulator.items.len(),
        patch_size = config.simulator.patch_size,
        load_time = ?config.persistence.load_time,
        "patchwork-engine starting"
    );

    let engine = Engine::start(&config).await.context("starting engine")?;
    info!(
        addr = %engine.local_addr(),
        time = engine.simulator().map_or(0, Simulator::time),
        "Ready for clients"
    );

    tokio::signal::ctrl_c()
        .await
        .context("listening for Ctrl-C")?;
    info!("Shutdown requested");

    let saved = engine.shutdown().await.context("final save")?;
    info!(snapshot = ?saved, "patchwork-engine shutdown complete");
    Ok(())
}
