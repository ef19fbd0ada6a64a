// src/engine.rs
//
// Single owner of all guidance state. Every callback (frames, detection
// results, depth results, speech completion) is funneled onto one task and
// lands here; the per-cycle algorithms below never need locks because
// nothing else mutates this state.

use crate::analysis::guidance::{self, GuidanceInputs};
use crate::analysis::health::{DarknessMonitor, SystemFailureMonitor};
use crate::analysis::regions::RegionOccupancy;
use crate::analysis::tracker::ObjectTracker;
use crate::analysis::wall_detector::WallDetector;
use crate::depth::{DepthMap, DepthSampler};
use crate::pipeline::stepper::{Lane, PipelineStepper};
use crate::providers::DisplaySink;
use crate::speech::{SpeechArbiter, SpeechEngine};
use crate::types::{Config, DetectionBox, Frame, GuidanceEvent, Rect};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct GuidanceEngine {
    cfg: Config,
    sampler: DepthSampler,
    stepper: PipelineStepper,
    tracker: ObjectTracker,
    wall: WallDetector,
    failure: SystemFailureMonitor,
    darkness: DarknessMonitor,
    arbiter: SpeechArbiter,
    display: Box<dyn DisplaySink>,

    /// Published by reference and swapped wholesale; readers always see a
    /// complete map.
    depth_map: Option<Arc<DepthMap>>,
    depth_source_ts_ms: Option<u64>,
    last_depth_inference_ms: u64,
    last_detection_inference_ms: u64,
    last_detection_frame_ts_ms: u64,
    last_lag_ms: u64,

    frame_step: u64,
    empty_streak: u32,
    last_spoken_guidance: Option<String>,
    current_boxes: Vec<DetectionBox>,
    last_wall_region: Option<Rect>,
}

impl GuidanceEngine {
    pub fn new(cfg: Config, speech: Box<dyn SpeechEngine>, display: Box<dyn DisplaySink>) -> Self {
        let sampler = DepthSampler::new(&cfg.depth);
        let tracker = ObjectTracker::new(cfg.tracker.clone());
        let wall = WallDetector::new(cfg.wall.clone());
        let failure = SystemFailureMonitor::new(cfg.health.clone());
        let darkness = DarknessMonitor::new(cfg.health.clone());
        let arbiter = SpeechArbiter::new(speech, cfg.speech.clone());
        Self {
            cfg,
            sampler,
            stepper: PipelineStepper::new(),
            tracker,
            wall,
            failure,
            darkness,
            arbiter,
            display,
            depth_map: None,
            depth_source_ts_ms: None,
            last_depth_inference_ms: 0,
            last_detection_inference_ms: 0,
            last_detection_frame_ts_ms: 0,
            last_lag_ms: 0,
            frame_step: 0,
            empty_streak: 0,
            last_spoken_guidance: None,
            current_boxes: Vec::new(),
            last_wall_region: None,
        }
    }

    pub fn set_speech_ready(&mut self, now_ms: u64) {
        self.arbiter.set_ready(now_ms);
    }

    /// One camera frame arrived. Advances the scheduler and returns the lane
    /// the caller should feed this frame to; engine-side lane work (darkness
    /// sampling, guidance replay) happens here.
    pub fn on_frame(&mut self, frame: &Frame, now_ms: u64) -> Lane {
        self.frame_step += 1;
        self.arbiter.tick(now_ms);

        let lane = self.stepper.advance();
        match lane {
            Lane::Detection => {
                if let Some(evt) = self.darkness.check(frame, now_ms) {
                    self.speak_event(evt, now_ms);
                }
            }
            Lane::Depth => {}
            Lane::SpeechReplay => {
                if self.cfg.pipeline.replay_last_guidance {
                    if let Some(text) = self.last_spoken_guidance.clone() {
                        // Cheap periodic retry; the arbiter's cooldowns
                        // decide whether it actually goes out again.
                        self.arbiter.speak(&text, None, now_ms);
                    }
                }
            }
        }
        lane
    }

    /// A detection cycle completed.
    pub fn on_detections(
        &mut self,
        boxes: Vec<DetectionBox>,
        inference_ms: u64,
        frame_ts_ms: u64,
        now_ms: u64,
    ) {
        if boxes.is_empty() {
            self.on_empty_detections(now_ms);
            return;
        }
        self.empty_streak = 0;
        self.last_detection_inference_ms = inference_ms;
        self.last_detection_frame_ts_ms = frame_ts_ms;

        let occupancy = RegionOccupancy::of_boxes(&boxes);

        // Guidance sees the wall state the user currently knows about; the
        // rescan below (with fresh suppression boxes) feeds the next cycle.
        let wall_before = self.wall.state();
        let guidance = guidance::generate(&GuidanceInputs {
            occupancy,
            boxes: &boxes,
            depth: self.depth_map.as_deref(),
            sampler: &self.sampler,
            wall: wall_before,
            cfg: &self.cfg.guidance,
            wall_warning_distance_m: self.cfg.wall.warning_distance_m,
        });

        let update = self
            .wall
            .update(self.depth_map.as_deref(), &self.sampler, &boxes, now_ms);
        self.last_wall_region = update.region;
        if let Some(evt) = update.warning {
            self.speak_event(evt, now_ms);
        }

        let depth_map = self.depth_map.clone();
        let sampler = self.sampler.clone();
        let should_speak = self.tracker.any_should_announce(&boxes, self.frame_step, |b| {
            depth_map.as_deref().and_then(|m| sampler.box_depth(b, m))
        });

        if let Some(text) = guidance {
            let is_new = self.last_spoken_guidance.as_deref() != Some(text.as_str());
            if is_new && should_speak {
                info!("guidance: {text}");
                let identity = boxes
                    .first()
                    .map(|b| b.cls_name.clone())
                    .unwrap_or_else(|| "general".to_string());
                self.last_spoken_guidance = Some(text.clone());
                self.arbiter.speak(&text, Some(&identity), now_ms);
            }
        }

        self.current_boxes = boxes;
        self.render(now_ms);
    }

    /// A detection cycle completed with no boxes (or failed; same thing to
    /// the decision logic).
    pub fn on_empty_detections(&mut self, now_ms: u64) {
        self.empty_streak += 1;

        let depth_age = self.depth_age_ms(now_ms);
        if let Some(evt) = self.failure.check(
            self.depth_map.is_some(),
            depth_age,
            self.empty_streak,
            now_ms,
        ) {
            self.speak_event(evt, now_ms);
        }

        if self.empty_streak >= self.cfg.guidance.required_empty_streak {
            let update = self
                .wall
                .update(self.depth_map.as_deref(), &self.sampler, &[], now_ms);
            self.last_wall_region = update.region;
            if let Some(evt) = update.warning {
                self.speak_event(evt, now_ms);
            }

            let path_clear = guidance::path_clear_guidance(
                self.depth_map.as_deref(),
                &self.sampler,
                self.wall.state(),
                &self.cfg.guidance,
                self.cfg.wall.warning_distance_m,
            );
            if let Some(text) = path_clear {
                if self.last_spoken_guidance.as_deref() != Some(text.as_str()) {
                    info!("guidance: {text}");
                    self.last_spoken_guidance = Some(text.clone());
                    self.arbiter.speak(&text, Some("path_clear"), now_ms);
                }
            }
        }

        self.current_boxes.clear();
        self.render(now_ms);
    }

    /// A depth cycle produced a fresh map; swap it in wholesale.
    pub fn on_depth(&mut self, map: DepthMap, source_ts_ms: u64, inference_ms: u64, now_ms: u64) {
        self.last_lag_ms = now_ms.saturating_sub(source_ts_ms);
        self.last_depth_inference_ms = inference_ms;
        self.depth_map = Some(Arc::new(map));
        self.depth_source_ts_ms = Some(source_ts_ms);
        debug!(
            "depth updated: inference={}ms lag={}ms",
            inference_ms, self.last_lag_ms
        );
        self.render(now_ms);
    }

    /// A depth cycle failed. The old map must not masquerade as current.
    pub fn on_depth_failed(&mut self, now_ms: u64) {
        warn!("depth estimation failed; treating depth as absent");
        self.depth_map = None;
        self.depth_source_ts_ms = None;
        self.render(now_ms);
    }

    pub fn on_speech_done(&mut self, now_ms: u64) {
        self.arbiter.on_done(now_ms);
    }

    pub fn on_speech_error(&mut self) {
        self.arbiter.on_error();
    }

    fn speak_event(&mut self, evt: GuidanceEvent, now_ms: u64) {
        self.arbiter.speak(&evt.text, evt.identity.as_deref(), now_ms);
    }

    fn depth_age_ms(&self, now_ms: u64) -> Option<u64> {
        self.depth_source_ts_ms
            .map(|ts| now_ms.saturating_sub(ts))
    }

    fn render(&mut self, now_ms: u64) {
        let line = self.debug_line(now_ms);
        self.display
            .render(&self.current_boxes, self.last_wall_region, &line);
    }

    fn debug_line(&self, now_ms: u64) -> String {
        let age = self
            .depth_age_ms(now_ms)
            .map(|a| format!("{a}ms"))
            .unwrap_or_else(|| "n/a".to_string());
        let det_age = if self.last_detection_frame_ts_ms > 0 {
            format!("{}ms", now_ms.saturating_sub(self.last_detection_frame_ts_ms))
        } else {
            "n/a".to_string()
        };
        let wall_state = self.wall.state();
        let wall_text = if wall_state.present {
            let stats = self.wall.debug_stats();
            let dist = wall_state
                .distance_m
                .map(|d| format!("{d:.1}m"))
                .unwrap_or_else(|| "n/a".to_string());
            format!(
                "WALL yes s={:.2} v={:.4} a={:.2} m={:.2} d={}",
                stats.score, stats.variance, stats.aspect, stats.mean_norm, dist
            )
        } else {
            "WALL no".to_string()
        };
        format!(
            "Det: {}ms (age {}) Depth: {}ms Lag: {}ms DepthAge: {} | {} | Brightness: {:.1}",
            self.last_detection_inference_ms,
            det_age,
            self.last_depth_inference_ms,
            self.last_lag_ms,
            age,
            wall_text,
            self.darkness.last_brightness()
        )
    }

    #[cfg(test)]
    pub fn last_spoken_guidance(&self) -> Option<&str> {
        self.last_spoken_guidance.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::NullDisplay;
    use crate::speech::SpeechEngine;
    use anyhow::Result;
    use ndarray::Array2;
    use std::sync::{Arc as StdArc, Mutex};

    const W: usize = 64;
    const H: usize = 64;

    #[derive(Clone, Default)]
    struct RecordingSpeech {
        spoken: StdArc<Mutex<Vec<String>>>,
    }

    impl SpeechEngine for RecordingSpeech {
        fn speak(&mut self, text: &str) -> Result<()> {
            self.spoken.lock().unwrap().push(text.to_string());
            Ok(())
        }
    }

    fn engine() -> (GuidanceEngine, StdArc<Mutex<Vec<String>>>) {
        let speech = RecordingSpeech::default();
        let spoken = speech.spoken.clone();
        let mut e = GuidanceEngine::new(
            Config::default(),
            Box::new(speech),
            Box::new(NullDisplay),
        );
        e.set_speech_ready(0);
        (e, spoken)
    }

    fn raw_for(meters: f32) -> f32 {
        1.0 / (meters * 0.0025)
    }

    fn uniform_map(meters: f32) -> DepthMap {
        DepthMap::new(Array2::from_elem((H, W), raw_for(meters)))
    }

    fn split_map(left_m: f32, right_m: f32) -> DepthMap {
        let grid = Array2::from_shape_fn((H, W), |(_, x)| {
            if x < W / 2 {
                raw_for(left_m)
            } else {
                raw_for(right_m)
            }
        });
        DepthMap::new(grid)
    }

    fn boxed(label: &str, cx: f32, cy: f32, size: f32) -> DetectionBox {
        DetectionBox {
            x1: cx - size / 2.0,
            y1: cy - size / 2.0,
            x2: cx + size / 2.0,
            y2: cy + size / 2.0,
            cls_name: label.to_string(),
            confidence: 0.9,
        }
    }

    #[test]
    fn center_object_at_1_8_meters_end_to_end() {
        let (mut e, spoken) = engine();
        e.on_depth(uniform_map(1.8), 0, 5, 10);
        e.on_detections(vec![boxed("chair-center", 0.5, 0.5, 0.2)], 8, 50, 100);

        let spoken = spoken.lock().unwrap();
        assert_eq!(spoken.len(), 1);
        assert!(spoken[0].contains("center"), "got: {}", spoken[0]);
        assert!(spoken[0].contains("1.8 meters"), "got: {}", spoken[0]);
        assert!(spoken[0].contains("move left or right"), "got: {}", spoken[0]);
    }

    #[test]
    fn person_pair_clusters_into_one_announcement() {
        let (mut e, spoken) = engine();
        e.on_depth(split_map(1.0, 1.05), 0, 5, 10);
        e.on_detections(
            vec![
                boxed("person-left", 0.25, 0.5, 0.2),
                boxed("person-left", 0.75, 0.5, 0.2),
            ],
            8,
            50,
            100,
        );

        let spoken = spoken.lock().unwrap();
        assert_eq!(spoken.as_slice(), ["people left 1.0 meters ahead"]);
    }

    #[test]
    fn stationary_object_is_announced_once() {
        let (mut e, spoken) = engine();
        e.on_depth(uniform_map(1.8), 0, 5, 10);
        for i in 0..5u64 {
            e.on_detections(
                vec![boxed("chair-center", 0.5, 0.5, 0.2)],
                8,
                50,
                100 + i * 100,
            );
        }
        assert_eq!(spoken.lock().unwrap().len(), 1);
    }

    #[test]
    fn path_clear_after_empty_streak() {
        let (mut e, spoken) = engine();
        e.on_depth(uniform_map(2.0), 0, 5, 10);
        e.on_empty_detections(100);
        assert!(spoken.lock().unwrap().is_empty(), "one empty cycle is not enough");
        e.on_empty_detections(200);

        let spoken = spoken.lock().unwrap();
        assert_eq!(spoken.as_slice(), ["Path clear, proceed forward"]);
    }

    #[test]
    fn sustained_outage_warns_exactly_once_within_cooldown() {
        let (mut e, spoken) = engine();
        // No depth ever arrives and no detections come in; 60 cycles over
        // six seconds.
        for i in 0..60u64 {
            e.on_empty_detections(i * 100);
        }
        let spoken = spoken.lock().unwrap();
        let warnings: Vec<&String> = spoken
            .iter()
            .filter(|s| s.contains("Navigation system"))
            .collect();
        assert_eq!(warnings.len(), 1);
    }

    #[test]
    fn identical_guidance_is_not_resubmitted() {
        let (mut e, _) = engine();
        e.on_depth(uniform_map(1.8), 0, 5, 10);
        e.on_detections(vec![boxed("chair-center", 0.5, 0.5, 0.2)], 8, 50, 100);
        assert_eq!(
            e.last_spoken_guidance(),
            Some("chair center 1.8 meters ahead, move left or right")
        );
    }

    #[test]
    fn replay_lane_reoffers_last_guidance_through_cooldowns() {
        let (mut e, spoken) = engine();
        e.on_depth(uniform_map(1.8), 0, 5, 10);
        e.on_detections(vec![boxed("chair-center", 0.5, 0.5, 0.2)], 8, 50, 100);
        e.on_speech_done(300);

        let frame = Frame {
            data: vec![128; W * H * 4],
            width: W,
            height: H,
            timestamp_ms: 0,
        };
        // Lane order is detection, depth, speech-replay.
        assert_eq!(e.on_frame(&frame, 400), Lane::Detection);
        assert_eq!(e.on_frame(&frame, 500), Lane::Depth);
        assert_eq!(e.on_frame(&frame, 600), Lane::SpeechReplay);
        // Inside the global cooldown the replay is queued, not spoken.
        assert_eq!(spoken.lock().unwrap().len(), 1);
        // Next pass, past the cooldown, the queued replay goes out.
        assert_eq!(e.on_frame(&frame, 1200), Lane::Detection);
        assert_eq!(spoken.lock().unwrap().len(), 2);
    }

    #[test]
    fn depth_failure_clears_the_map() {
        let (mut e, spoken) = engine();
        e.on_depth(uniform_map(2.0), 0, 5, 10);
        e.on_depth_failed(50);
        // With depth absent, path-clear can never fire.
        e.on_empty_detections(100);
        e.on_empty_detections(200);
        assert!(spoken.lock().unwrap().is_empty());
    }
}
