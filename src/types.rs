// src/types.rs

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub depth: DepthConfig,
    pub tracker: TrackerConfig,
    pub wall: WallConfig,
    pub guidance: GuidanceConfig,
    pub speech: SpeechConfig,
    pub health: HealthConfig,
    pub pipeline: PipelineConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DepthConfig {
    /// Meters = 1 / (raw_code * scale_factor); fixed per deployment.
    pub scale_factor: f32,
    pub patch_radius: usize,
}

impl Default for DepthConfig {
    fn default() -> Self {
        Self {
            scale_factor: 0.0025,
            patch_radius: 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    pub persistence_frames: u64,
    pub movement_threshold: f32,
    pub depth_threshold_m: f32,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            persistence_frames: 10,
            movement_threshold: 0.04,
            depth_threshold_m: 0.5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WallConfig {
    pub grid_rows: usize,
    pub grid_cols: usize,
    /// Vertical sub-bands per grid cell, to catch tall narrow obstacles.
    pub sub_bands: usize,
    /// Cells whose top edge lies below this fraction of frame height are floor.
    pub floor_exclude_height: f32,
    pub variance_threshold: f32,
    pub aspect_ratio_min: f32,
    pub iou_suppress_threshold: f32,
    pub min_distance_m: f32,
    pub max_distance_m: f32,
    pub optimal_distance_min_m: f32,
    pub optimal_distance_max_m: f32,
    pub min_score: f32,
    pub merge_adjacency: f32,
    pub warning_distance_m: f32,
    pub speech_cooldown_ms: u64,
    pub state_history: usize,
    pub distance_history: usize,
}

impl Default for WallConfig {
    fn default() -> Self {
        Self {
            grid_rows: 3,
            grid_cols: 3,
            sub_bands: 5,
            floor_exclude_height: 0.8,
            variance_threshold: 0.04,
            aspect_ratio_min: 1.0,
            iou_suppress_threshold: 0.10,
            min_distance_m: 0.3,
            max_distance_m: 4.0,
            optimal_distance_min_m: 0.5,
            optimal_distance_max_m: 3.0,
            min_score: 0.8,
            merge_adjacency: 0.15,
            warning_distance_m: 1.5,
            speech_cooldown_ms: 300,
            state_history: 3,
            distance_history: 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GuidanceConfig {
    pub person_cluster_threshold: f32,
    pub valid_min_m: f32,
    pub valid_max_m: f32,
    pub very_near_m: f32,
    pub corridor_clear_m: f32,
    pub required_empty_streak: u32,
}

impl Default for GuidanceConfig {
    fn default() -> Self {
        Self {
            person_cluster_threshold: 2.0,
            valid_min_m: 0.5,
            valid_max_m: 5.0,
            very_near_m: 0.5,
            corridor_clear_m: 1.2,
            required_empty_streak: 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SpeechConfig {
    pub global_cooldown_ms: u64,
    pub identity_cooldown_ms: u64,
}

impl Default for SpeechConfig {
    fn default() -> Self {
        Self {
            global_cooldown_ms: 1000,
            identity_cooldown_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub depth_stale_ms: u64,
    pub detector_streak: u32,
    pub failure_threshold: u32,
    pub failure_cooldown_ms: u64,
    /// Average brightness (0-255) below this counts as darkness.
    pub darkness_brightness: f32,
    pub darkness_frames: u32,
    pub darkness_cooldown_ms: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            depth_stale_ms: 5000,
            detector_streak: 10,
            failure_threshold: 30,
            failure_cooldown_ms: 10_000,
            darkness_brightness: 30.0,
            darkness_frames: 5,
            darkness_cooldown_ms: 5000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Whether the speech-replay lane re-offers the last guidance each turn.
    pub replay_last_guidance: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            replay_last_guidance: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// One camera frame, RGBA8, orientation already normalized by the source.
#[derive(Debug, Clone)]
pub struct Frame {
    pub data: Vec<u8>,
    pub width: usize,
    pub height: usize,
    pub timestamp_ms: u64,
}

impl Frame {
    /// RGB at (x, y). Callers must stay in bounds.
    pub fn rgb_at(&self, x: usize, y: usize) -> (u8, u8, u8) {
        let idx = (y * self.width + x) * 4;
        (self.data[idx], self.data[idx + 1], self.data[idx + 2])
    }
}

/// Axis-aligned rectangle in normalized [0,1] coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Rect {
    pub left: f32,
    pub top: f32,
    pub right: f32,
    pub bottom: f32,
}

impl Rect {
    pub fn new(left: f32, top: f32, right: f32, bottom: f32) -> Self {
        Self {
            left,
            top,
            right,
            bottom,
        }
    }

    pub fn width(&self) -> f32 {
        self.right - self.left
    }

    pub fn height(&self) -> f32 {
        self.bottom - self.top
    }

    pub fn area(&self) -> f32 {
        self.width() * self.height()
    }

    pub fn center(&self) -> (f32, f32) {
        (
            (self.left + self.right) / 2.0,
            (self.top + self.bottom) / 2.0,
        )
    }

    /// Intersection-over-union, always in [0,1].
    pub fn iou(&self, other: &Rect) -> f32 {
        let ix1 = self.left.max(other.left);
        let iy1 = self.top.max(other.top);
        let ix2 = self.right.min(other.right);
        let iy2 = self.bottom.min(other.bottom);
        let inter_w = (ix2 - ix1).max(0.0);
        let inter_h = (iy2 - iy1).max(0.0);
        let inter = inter_w * inter_h;
        let denom = (self.area() + other.area() - inter).max(1e-6);
        inter / denom
    }
}

/// A single detection from the external detector.
///
/// Coordinates are normalized to [0,1]. The class label carries a region
/// suffix (`chair-left`, `person-center`, ...) assigned by the detector.
#[derive(Debug, Clone)]
pub struct DetectionBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
    pub cls_name: String,
    pub confidence: f32,
}

impl DetectionBox {
    pub fn w(&self) -> f32 {
        self.x2 - self.x1
    }

    pub fn h(&self) -> f32 {
        self.y2 - self.y1
    }

    pub fn center(&self) -> (f32, f32) {
        ((self.x1 + self.x2) / 2.0, (self.y1 + self.y2) / 2.0)
    }

    pub fn rect(&self) -> Rect {
        Rect::new(self.x1, self.y1, self.x2, self.y2)
    }

    /// Label without the region suffix ("chair-left" -> "chair").
    pub fn object_name(&self) -> &str {
        match self.cls_name.find('-') {
            Some(idx) => &self.cls_name[..idx],
            None => &self.cls_name,
        }
    }

    /// Confidence-weighted screen area; used to pick the primary object.
    pub fn salience(&self) -> f32 {
        self.confidence * self.w() * self.h()
    }
}

/// Output of one detection cycle.
#[derive(Debug, Clone)]
pub struct DetectionOutput {
    pub boxes: Vec<DetectionBox>,
    pub inference_ms: u64,
}

/// A candidate utterance handed to the speech arbiter.
#[derive(Debug, Clone)]
pub struct GuidanceEvent {
    pub text: String,
    /// Identity for per-identity cooldown ("wall", "darkness", ...).
    pub identity: Option<String>,
}

impl GuidanceEvent {
    pub fn new(text: impl Into<String>, identity: Option<&str>) -> Self {
        Self {
            text: text.into(),
            identity: identity.map(|s| s.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn iou_with_self_is_one() {
        let r = Rect::new(0.1, 0.2, 0.6, 0.9);
        assert!((r.iou(&r) - 1.0).abs() < 1e-4);
    }

    #[test]
    fn iou_of_disjoint_rects_is_zero() {
        let a = Rect::new(0.0, 0.0, 0.3, 0.3);
        let b = Rect::new(0.5, 0.5, 0.9, 0.9);
        assert_eq!(a.iou(&b), 0.0);
    }

    #[test]
    fn iou_is_bounded() {
        let a = Rect::new(0.0, 0.0, 0.5, 0.5);
        let b = Rect::new(0.25, 0.25, 0.75, 0.75);
        let iou = a.iou(&b);
        assert!(iou > 0.0 && iou < 1.0);
    }

    #[test]
    fn object_name_strips_region_suffix() {
        let b = DetectionBox {
            x1: 0.0,
            y1: 0.0,
            x2: 0.1,
            y2: 0.1,
            cls_name: "chair-left".to_string(),
            confidence: 0.9,
        };
        assert_eq!(b.object_name(), "chair");
    }

    #[test]
    fn config_defaults_match_deployment_constants() {
        let cfg = Config::default();
        assert_eq!(cfg.depth.scale_factor, 0.0025);
        assert_eq!(cfg.tracker.persistence_frames, 10);
        assert_eq!(cfg.wall.state_history, 3);
        assert_eq!(cfg.speech.global_cooldown_ms, 1000);
    }
}
