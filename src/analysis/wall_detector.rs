// src/analysis/wall_detector.rs
//
// Passive planar-obstacle detection from depth statistics alone. Bounding-box
// detectors trained on discrete objects never report walls, so this scans the
// depth map for large flat regions the detections did not claim. False
// positives are held down three ways: distance gates exclude floor and
// background, IOU suppression yields to real detections, and a multi-frame
// majority vote gates the published state.

use crate::analysis::guidance::wall_warning_text;
use crate::depth::{DepthMap, DepthSampler, RawDepth};
use crate::types::{DetectionBox, GuidanceEvent, Rect, WallConfig};
use std::collections::VecDeque;
use tracing::debug;

/// Smoothed, publicly visible wall state.
#[derive(Debug, Clone, Copy, Default)]
pub struct WallState {
    pub present: bool,
    pub distance_m: Option<f32>,
}

/// Result of one depth cycle.
#[derive(Debug, Clone)]
pub struct WallUpdate {
    /// Merged wall rectangle for this cycle, pre-smoothing. For display.
    pub region: Option<Rect>,
    pub state: WallState,
    pub warning: Option<GuidanceEvent>,
}

/// Per-candidate scan statistics, kept for the debug line.
#[derive(Debug, Clone, Copy, Default)]
pub struct WallDebug {
    pub score: f32,
    pub variance: f32,
    pub aspect: f32,
    pub mean_norm: f32,
}

pub struct WallDetector {
    cfg: WallConfig,
    state_history: VecDeque<bool>,
    distance_history: VecDeque<f32>,
    smoothed: WallState,
    last_warned_ms: Option<u64>,
    debug: WallDebug,
}

impl WallDetector {
    pub fn new(cfg: WallConfig) -> Self {
        Self {
            state_history: VecDeque::with_capacity(cfg.state_history),
            distance_history: VecDeque::with_capacity(cfg.distance_history),
            cfg,
            smoothed: WallState::default(),
            last_warned_ms: None,
            debug: WallDebug::default(),
        }
    }

    /// Current smoothed state without running a new scan.
    pub fn state(&self) -> WallState {
        self.smoothed
    }

    pub fn debug_stats(&self) -> WallDebug {
        self.debug
    }

    /// Run one full cycle: scan, merge, smooth, maybe warn. With no depth
    /// map there is nothing to scan and the histories are left untouched.
    pub fn update(
        &mut self,
        depth: Option<&DepthMap>,
        sampler: &DepthSampler,
        detections: &[DetectionBox],
        now_ms: u64,
    ) -> WallUpdate {
        let Some(depth) = depth else {
            return WallUpdate {
                region: None,
                state: self.smoothed,
                warning: None,
            };
        };

        let (best, best_score, candidates) = self.scan(depth, sampler, detections);

        let region = match best {
            Some(rect) if best_score >= self.cfg.min_score => {
                Some(self.merge_adjacent(&candidates, rect))
            }
            _ => None,
        };
        self.debug.score = best_score;

        let raw_distance = region.and_then(|r| {
            let (cx, cy) = r.center();
            sampler.depth_at_norm(depth, cx, cy)
        });
        self.smoothed = self.smooth(region.is_some(), raw_distance);

        let warning = self.maybe_warn(now_ms);

        let consensus = self.state_history.iter().filter(|&&b| b).count();
        debug!(
            "wall raw={} smoothed={} consensus={}/{} score={:.3} var={:.5} dist={:?}",
            region.is_some(),
            self.smoothed.present,
            consensus,
            self.state_history.len(),
            best_score,
            self.debug.variance,
            self.smoothed.distance_m
        );

        WallUpdate {
            region,
            state: self.smoothed,
            warning,
        }
    }

    /// Grid × sub-band scan. Returns the best candidate, its score, and all
    /// candidates at or above the minimum score (for merging).
    fn scan(
        &mut self,
        depth: &DepthMap,
        sampler: &DepthSampler,
        detections: &[DetectionBox],
    ) -> (Option<Rect>, f32, Vec<(Rect, f32)>) {
        let Some((min_v, max_v)) = depth.min_max_raw() else {
            return (None, f32::NEG_INFINITY, Vec::new());
        };
        let range = (max_v - min_v).max(1e-6);

        let detection_rects: Vec<Rect> = detections.iter().map(|b| b.rect()).collect();

        let mut best_rect: Option<Rect> = None;
        let mut best_score = f32::NEG_INFINITY;
        let mut candidates: Vec<(Rect, f32)> = Vec::new();

        let rows = self.cfg.grid_rows;
        let cols = self.cfg.grid_cols;
        let bands = self.cfg.sub_bands;

        for r in 0..rows {
            for c in 0..cols {
                let y_start_n = r as f32 / rows as f32;
                let y_end_n = (r + 1) as f32 / rows as f32;
                let x_start_n = c as f32 / cols as f32;
                let x_end_n = (c + 1) as f32 / cols as f32;

                // Floors are not walls.
                if y_start_n > self.cfg.floor_exclude_height {
                    continue;
                }

                for b in 0..bands {
                    let bx_start_n = x_start_n + (b as f32 / bands as f32) * (x_end_n - x_start_n);
                    let bx_end_n =
                        x_start_n + ((b + 1) as f32 / bands as f32) * (x_end_n - x_start_n);

                    let stats = match band_stats(
                        depth, sampler, min_v, range, bx_start_n, bx_end_n, y_start_n, y_end_n,
                    ) {
                        Some(s) => s,
                        None => continue,
                    };

                    // Too close is floor or clutter, too far is background.
                    if let Some(min_m) = stats.min_m {
                        if min_m < self.cfg.min_distance_m {
                            continue;
                        }
                    }
                    if let Some(max_m) = stats.max_m {
                        if max_m > self.cfg.max_distance_m {
                            continue;
                        }
                    }

                    let aspect = (y_end_n - y_start_n) / (bx_end_n - bx_start_n).max(1e-6);

                    if stats.variance > self.cfg.variance_threshold {
                        continue;
                    }
                    if aspect < self.cfg.aspect_ratio_min {
                        continue;
                    }

                    let rect = Rect::new(bx_start_n, y_start_n, bx_end_n, y_end_n);

                    // Detections own their space; only report what they missed.
                    let overlaps = detection_rects
                        .iter()
                        .any(|d| rect.iou(d) > self.cfg.iou_suppress_threshold);
                    if overlaps {
                        continue;
                    }

                    let score = self.score_band(&stats);

                    if score > best_score {
                        best_score = score;
                        best_rect = Some(rect);
                        self.debug.variance = stats.variance;
                        self.debug.aspect = aspect;
                        self.debug.mean_norm = stats.mean;
                    }
                    if score >= self.cfg.min_score {
                        candidates.push((rect, score));
                    }
                }
            }
        }

        (best_rect, best_score, candidates)
    }

    /// Flatness + distance preference + depth consistency.
    fn score_band(&self, stats: &BandStats) -> f32 {
        let flatness = (1.0 - stats.variance * 10.0).max(0.0);

        let avg_m = match (stats.min_m, stats.max_m) {
            (Some(min_m), Some(max_m)) => Some((min_m + max_m) / 2.0),
            _ => None,
        };
        let distance_score = match avg_m {
            Some(d) if d >= self.cfg.optimal_distance_min_m && d <= self.cfg.optimal_distance_max_m => {
                1.0
            }
            Some(d) if d < self.cfg.optimal_distance_min_m => 0.7,
            Some(_) => 0.5,
            None => 0.0,
        };

        // Flat walls have a small max-min spread; free hallway space tends to
        // carry a floor/ceiling gradient instead.
        let consistency_score = match (stats.min_m, stats.max_m) {
            (Some(min_m), Some(max_m)) => {
                let spread = max_m - min_m;
                if spread < 0.3 {
                    1.0
                } else if spread < 0.6 {
                    0.7
                } else {
                    0.2
                }
            }
            _ => 0.0,
        };

        flatness + distance_score + consistency_score
    }

    /// Grow the winning band into a bounding rectangle over every candidate
    /// that is adjacent or overlapping (within tolerance) and scores at
    /// least 80% of the minimum threshold.
    fn merge_adjacent(&self, candidates: &[(Rect, f32)], best: Rect) -> Rect {
        if candidates.len() <= 1 {
            return best;
        }
        let tol = self.cfg.merge_adjacency;
        let score_floor = self.cfg.min_score * 0.8;

        let mut merged = best;
        let mut merged_any = false;
        for (rect, score) in candidates {
            if *rect == best || *score < score_floor {
                continue;
            }
            let horizontally_near =
                !(rect.right < best.left - tol || rect.left > best.right + tol);
            let vertically_near = !(rect.bottom < best.top - tol || rect.top > best.bottom + tol);
            if horizontally_near && vertically_near {
                merged = Rect::new(
                    merged.left.min(rect.left),
                    merged.top.min(rect.top),
                    merged.right.max(rect.right),
                    merged.bottom.max(rect.bottom),
                );
                merged_any = true;
            }
        }
        if merged_any {
            merged
        } else {
            best
        }
    }

    /// Majority vote over the boolean history; averaged distance history.
    fn smooth(&mut self, present: bool, distance_m: Option<f32>) -> WallState {
        self.state_history.push_back(present);
        while self.state_history.len() > self.cfg.state_history {
            self.state_history.pop_front();
        }
        if let Some(d) = distance_m {
            self.distance_history.push_back(d);
            while self.distance_history.len() > self.cfg.distance_history {
                self.distance_history.pop_front();
            }
        }

        let votes = self.state_history.iter().filter(|&&b| b).count();
        let majority = self.cfg.state_history / 2 + 1;
        let smoothed_present = votes >= majority;

        let smoothed_distance = if self.distance_history.is_empty() {
            None
        } else {
            Some(self.distance_history.iter().sum::<f32>() / self.distance_history.len() as f32)
        };

        WallState {
            present: smoothed_present,
            distance_m: smoothed_distance,
        }
    }

    fn maybe_warn(&mut self, now_ms: u64) -> Option<GuidanceEvent> {
        if !self.smoothed.present {
            return None;
        }
        let distance = self.smoothed.distance_m?;
        if distance >= self.cfg.warning_distance_m {
            return None;
        }
        if let Some(last) = self.last_warned_ms {
            if now_ms.saturating_sub(last) <= self.cfg.speech_cooldown_ms {
                return None;
            }
        }
        self.last_warned_ms = Some(now_ms);
        Some(GuidanceEvent::new(
            wall_warning_text(Some(distance)),
            Some("wall"),
        ))
    }
}

struct BandStats {
    mean: f32,
    variance: f32,
    /// Nearest valid sample in meters.
    min_m: Option<f32>,
    /// Farthest valid sample in meters.
    max_m: Option<f32>,
}

/// Mean/variance of the normalized depth within one sub-band, plus the
/// nearest/farthest valid sample in meters. None when the band has no pixels.
#[allow(clippy::too_many_arguments)]
fn band_stats(
    depth: &DepthMap,
    sampler: &DepthSampler,
    min_v: f32,
    range: f32,
    bx_start_n: f32,
    bx_end_n: f32,
    y_start_n: f32,
    y_end_n: f32,
) -> Option<BandStats> {
    let h = depth.height();
    let w = depth.width();
    let y_start = (y_start_n * (h - 1) as f32) as usize;
    let y_end = ((y_end_n * (h - 1) as f32) as usize).max(y_start + 1).min(h - 1);
    let x_start = (bx_start_n * (w - 1) as f32) as usize;
    let x_end = ((bx_end_n * (w - 1) as f32) as usize).max(x_start + 1).min(w - 1);

    let mut sum = 0.0f64;
    let mut sum_sq = 0.0f64;
    let mut count = 0usize;
    let mut min_raw = f32::MAX;
    let mut max_raw = f32::MIN;

    for y in y_start..=y_end {
        for x in x_start..=x_end {
            let raw = depth.raw_at(x, y).0;
            if raw > 0.0 {
                min_raw = min_raw.min(raw);
                max_raw = max_raw.max(raw);
            }
            let norm = ((raw - min_v) / range) as f64;
            sum += norm;
            sum_sq += norm * norm;
            count += 1;
        }
    }
    if count == 0 {
        return None;
    }
    let mean = (sum / count as f64) as f32;
    let variance = ((sum_sq / count as f64) - (sum / count as f64).powi(2)) as f32;

    // Conversion is reciprocal: the largest raw code is the nearest point.
    let min_m = (max_raw > f32::MIN)
        .then(|| sampler.to_meters(RawDepth(max_raw)))
        .flatten();
    let max_m = (min_raw < f32::MAX)
        .then(|| sampler.to_meters(RawDepth(min_raw)))
        .flatten();

    Some(BandStats {
        mean,
        variance,
        min_m,
        max_m,
    })
}
