// src/sim.rs
//
// Synthetic frame/detection/depth/speech stand-ins so the full pipeline can
// run offline without camera hardware or model assets. Real deployments
// plug their providers into the same traits.

use crate::depth::DepthMap;
use crate::pipeline::EngineMsg;
use crate::providers::{DepthProvider, DetectionProvider};
use crate::speech::SpeechEngine;
use crate::types::{DetectionBox, DetectionOutput, Frame};
use anyhow::Result;
use ndarray::Array2;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::info;

fn raw_for(meters: f32) -> f32 {
    1.0 / (meters * 0.0025)
}

/// Scripted detector: a chair dead ahead, then a pair of people on the
/// left, then an empty corridor.
pub struct SimDetector {
    step: usize,
}

impl SimDetector {
    pub fn new() -> Self {
        Self { step: 0 }
    }

    fn boxed(label: &str, cx: f32, cy: f32, size: f32) -> DetectionBox {
        DetectionBox {
            x1: cx - size / 2.0,
            y1: cy - size / 2.0,
            x2: cx + size / 2.0,
            y2: cy + size / 2.0,
            cls_name: label.to_string(),
            confidence: 0.85,
        }
    }
}

impl Default for SimDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl DetectionProvider for SimDetector {
    fn detect(&mut self, _frame: &Frame) -> Result<DetectionOutput> {
        let boxes = match self.step {
            0..=5 => vec![Self::boxed("chair-center", 0.5, 0.55, 0.25)],
            6..=11 => vec![
                Self::boxed("person-left", 0.2, 0.5, 0.3),
                Self::boxed("person-left", 0.35, 0.5, 0.28),
            ],
            _ => Vec::new(),
        };
        self.step += 1;
        Ok(DetectionOutput {
            boxes,
            inference_ms: 12,
        })
    }
}

/// Flat depth plane that walks toward the camera and stops at 0.9 m, which
/// exercises the wall detector and its warning path.
pub struct SimDepth {
    step: usize,
}

impl SimDepth {
    pub fn new() -> Self {
        Self { step: 0 }
    }
}

impl Default for SimDepth {
    fn default() -> Self {
        Self::new()
    }
}

impl DepthProvider for SimDepth {
    fn estimate(&mut self, _frame: &Frame) -> Result<DepthMap> {
        let distance = (3.5 - 0.15 * self.step as f32).max(0.9);
        self.step += 1;
        Ok(DepthMap::new(Array2::from_elem((64, 64), raw_for(distance))))
    }
}

/// Logs utterances and reports completion immediately.
pub struct SimSpeech {
    done_tx: mpsc::UnboundedSender<EngineMsg>,
}

impl SimSpeech {
    pub fn new(done_tx: mpsc::UnboundedSender<EngineMsg>) -> Self {
        Self { done_tx }
    }
}

impl SpeechEngine for SimSpeech {
    fn speak(&mut self, text: &str) -> Result<()> {
        info!("🔊 [tts] {text}");
        let _ = self.done_tx.send(EngineMsg::SpeechDone);
        Ok(())
    }
}

/// Produces evenly-lit frames at a fixed interval, stamped with capture
/// time, then closes the channel.
pub fn spawn_frame_source(
    tx: mpsc::Sender<Frame>,
    frame_count: usize,
    width: usize,
    height: usize,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let started = Instant::now();
        for _ in 0..frame_count {
            let frame = Frame {
                data: vec![120; width * height * 4],
                width,
                height,
                timestamp_ms: started.elapsed().as_millis() as u64,
            };
            if tx.send(frame).await.is_err() {
                break;
            }
            tokio::time::sleep(interval).await;
        }
    })
}
