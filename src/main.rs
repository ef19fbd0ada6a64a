// src/main.rs

mod analysis;
mod config;
mod depth;
mod engine;
mod pipeline;
mod providers;
mod sim;
mod speech;
mod types;

use anyhow::Result;
use engine::GuidanceEngine;
use pipeline::PipelineRunner;
use providers::LogDisplay;
use sim::{SimDepth, SimDetector, SimSpeech};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let config = types::Config::load("config.yaml")?;

    tracing_subscriber::fmt()
        .with_env_filter(format!("sightguide={}", config.logging.level))
        .init();

    info!("🦯 sightguide starting");
    info!("✓ Configuration loaded");
    info!(
        "Wall detection: grid {}x{}, {} sub-bands, warn below {:.1} m",
        config.wall.grid_rows,
        config.wall.grid_cols,
        config.wall.sub_bands,
        config.wall.warning_distance_m
    );

    let (msg_tx, msg_rx) = mpsc::unbounded_channel();

    let engine = GuidanceEngine::new(
        config,
        Box::new(SimSpeech::new(msg_tx.clone())),
        Box::new(LogDisplay),
    );
    let runner = PipelineRunner::new(
        engine,
        Box::new(SimDetector::new()),
        Box::new(SimDepth::new()),
        msg_tx,
        msg_rx,
    );

    // Offline demo: a synthetic 4-second walk toward a wall. Swap the sim
    // providers for real camera/model adapters in a deployment.
    let (frame_tx, frame_rx) = mpsc::channel(1);
    let source = sim::spawn_frame_source(frame_tx, 120, 64, 64, Duration::from_millis(33));

    runner.run(frame_rx).await?;
    source.await?;

    info!("✓ Done");
    Ok(())
}
