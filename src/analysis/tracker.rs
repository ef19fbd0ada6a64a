// src/analysis/tracker.rs
//
// Per-identity object persistence. Decides whether a detection warrants a
// fresh announcement or is the same stationary object we already told the
// user about. Identity is the full class label (name + region), stable for
// a given (label, region) pair.

use crate::types::{DetectionBox, TrackerConfig};
use std::collections::HashMap;
use tracing::debug;

#[derive(Debug, Clone)]
struct ObjectTrack {
    last_frame: u64,
    last_x: f32,
    last_y: f32,
    last_depth: Option<f32>,
}

pub struct ObjectTracker {
    cfg: TrackerConfig,
    tracks: HashMap<String, ObjectTrack>,
    last_sweep_frame: u64,
}

impl ObjectTracker {
    pub fn new(cfg: TrackerConfig) -> Self {
        Self {
            cfg,
            tracks: HashMap::new(),
            last_sweep_frame: 0,
        }
    }

    /// True when this sighting deserves a fresh announcement: unknown
    /// identity, real movement in either axis, a depth jump, or a track
    /// that fell out of the persistence window. The track is updated
    /// regardless of the verdict.
    pub fn should_announce(
        &mut self,
        b: &DetectionBox,
        current_frame: u64,
        depth_m: Option<f32>,
    ) -> bool {
        let (cx, cy) = b.center();
        let announce = match self.tracks.get(&b.cls_name) {
            None => true,
            Some(track) => {
                let moved_x = (cx - track.last_x).abs() > self.cfg.movement_threshold;
                let moved_y = (cy - track.last_y).abs() > self.cfg.movement_threshold;
                let depth_jump = match (depth_m, track.last_depth) {
                    (Some(new), Some(old)) => (new - old).abs() > self.cfg.depth_threshold_m,
                    _ => false,
                };
                let expired =
                    current_frame.saturating_sub(track.last_frame) > self.cfg.persistence_frames;
                moved_x || moved_y || depth_jump || expired
            }
        };

        self.tracks.insert(
            b.cls_name.clone(),
            ObjectTrack {
                last_frame: current_frame,
                last_x: cx,
                last_y: cy,
                last_depth: depth_m,
            },
        );

        self.maybe_sweep(current_frame);
        announce
    }

    /// Evaluate a whole detection list. Every box's track is updated, not
    /// just up to the first positive verdict.
    pub fn any_should_announce(
        &mut self,
        boxes: &[DetectionBox],
        current_frame: u64,
        mut depth_of: impl FnMut(&DetectionBox) -> Option<f32>,
    ) -> bool {
        let mut any = false;
        for b in boxes {
            let d = depth_of(b);
            if self.should_announce(b, current_frame, d) {
                any = true;
            }
        }
        any
    }

    /// Drop tracks older than the persistence window so the map stays
    /// bounded over long sessions. An evicted identity announces again on
    /// its next sighting, which is what an expired track does anyway.
    fn maybe_sweep(&mut self, current_frame: u64) {
        let window = self.cfg.persistence_frames;
        if current_frame.saturating_sub(self.last_sweep_frame) < window {
            return;
        }
        self.last_sweep_frame = current_frame;
        let before = self.tracks.len();
        self.tracks
            .retain(|_, t| current_frame.saturating_sub(t.last_frame) <= window);
        if self.tracks.len() < before {
            debug!(
                "swept {} stale object tracks ({} live)",
                before - self.tracks.len(),
                self.tracks.len()
            );
        }
    }

    #[cfg(test)]
    pub fn track_count(&self) -> usize {
        self.tracks.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn boxed_at(label: &str, cx: f32, cy: f32) -> DetectionBox {
        DetectionBox {
            x1: cx - 0.05,
            y1: cy - 0.05,
            x2: cx + 0.05,
            y2: cy + 0.05,
            cls_name: label.to_string(),
            confidence: 0.9,
        }
    }

    fn tracker() -> ObjectTracker {
        ObjectTracker::new(TrackerConfig::default())
    }

    #[test]
    fn unknown_identity_always_announces() {
        let mut t = tracker();
        assert!(t.should_announce(&boxed_at("chair-left", 0.3, 0.5), 1, Some(1.5)));
    }

    #[test]
    fn stationary_object_is_debounced() {
        let mut t = tracker();
        let b = boxed_at("chair-left", 0.3, 0.5);
        assert!(t.should_announce(&b, 1, Some(1.5)));
        // Same center (delta < 0.04), same depth (delta < 0.5), inside window.
        assert!(!t.should_announce(&b, 2, Some(1.5)));
        assert!(!t.should_announce(&boxed_at("chair-left", 0.32, 0.5), 3, Some(1.7)));
    }

    #[test]
    fn movement_beyond_threshold_announces() {
        let mut t = tracker();
        assert!(t.should_announce(&boxed_at("chair-left", 0.3, 0.5), 1, Some(1.5)));
        assert!(t.should_announce(&boxed_at("chair-left", 0.36, 0.5), 2, Some(1.5)));
    }

    #[test]
    fn depth_jump_announces() {
        let mut t = tracker();
        assert!(t.should_announce(&boxed_at("chair-left", 0.3, 0.5), 1, Some(2.5)));
        assert!(t.should_announce(&boxed_at("chair-left", 0.3, 0.5), 2, Some(1.8)));
    }

    #[test]
    fn unknown_depth_on_either_side_is_not_a_jump() {
        let mut t = tracker();
        assert!(t.should_announce(&boxed_at("chair-left", 0.3, 0.5), 1, None));
        assert!(!t.should_announce(&boxed_at("chair-left", 0.3, 0.5), 2, Some(1.8)));
    }

    #[test]
    fn expired_track_announces_again() {
        let mut t = tracker();
        let b = boxed_at("chair-left", 0.3, 0.5);
        assert!(t.should_announce(&b, 1, Some(1.5)));
        // persistence window is 10 frames; 12 - 1 > 10.
        assert!(t.should_announce(&b, 12, Some(1.5)));
    }

    #[test]
    fn sweep_bounds_track_map() {
        let mut t = tracker();
        for i in 0..20 {
            let label = format!("thing{i}-left");
            t.should_announce(&boxed_at(&label, 0.3, 0.5), i, None);
        }
        // By frame 19 everything last seen before frame 9 has been swept.
        assert!(t.track_count() < 20);
    }

    #[test]
    fn all_tracks_update_even_after_positive_verdict() {
        let mut t = tracker();
        let a = boxed_at("chair-left", 0.2, 0.5);
        let b = boxed_at("door-right", 0.8, 0.5);
        assert!(t.any_should_announce(&[a.clone(), b.clone()], 1, |_| Some(1.5)));
        // Second cycle: both were recorded on the first, so neither announces.
        assert!(!t.any_should_announce(&[a, b], 2, |_| Some(1.5)));
    }
}
