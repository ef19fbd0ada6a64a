// src/providers.rs
//
// Seams to the external perception and presentation collaborators. The
// engine never calls these directly on its own task; lane workers do, and
// hand the results back as messages.

use crate::depth::DepthMap;
use crate::types::{DetectionBox, DetectionOutput, Frame, Rect};
use anyhow::Result;
use tracing::debug;

/// Object detector. An empty box list is a valid steady state, not an error.
pub trait DetectionProvider: Send {
    fn detect(&mut self, frame: &Frame) -> Result<DetectionOutput>;
}

/// Monocular depth estimator. An error here surfaces to the engine as
/// "depth absent", never as a silently stale map.
pub trait DepthProvider: Send {
    fn estimate(&mut self, frame: &Frame) -> Result<DepthMap>;
}

/// Read-only presentation collaborator; no feedback into the engine.
pub trait DisplaySink: Send {
    fn render(&mut self, boxes: &[DetectionBox], wall: Option<Rect>, debug_line: &str);
}

/// Display that discards everything; for headless deployments and tests.
pub struct NullDisplay;

impl DisplaySink for NullDisplay {
    fn render(&mut self, _boxes: &[DetectionBox], _wall: Option<Rect>, _debug_line: &str) {}
}

/// Display that forwards the debug line to the log.
pub struct LogDisplay;

impl DisplaySink for LogDisplay {
    fn render(&mut self, boxes: &[DetectionBox], wall: Option<Rect>, debug_line: &str) {
        debug!(
            "display: {} boxes, wall={}, {}",
            boxes.len(),
            wall.map(|r| format!("{:.2}x{:.2}", r.width(), r.height()))
                .unwrap_or_else(|| "none".to_string()),
            debug_line
        );
    }
}
