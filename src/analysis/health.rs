// src/analysis/health.rs
//
// Safety escalation when the perception stack degrades. There is no separate
// error channel to the user: sustained failure and darkness both surface as
// spoken warnings through the arbiter, on their own identities.

use crate::types::{Frame, GuidanceEvent, HealthConfig};
use tracing::warn;

pub const SYSTEM_FAILURE_WARNING: &str = "Warning: Navigation system may not be working properly. \
     Please be extra careful and consider stopping.";

pub const DARKNESS_WARNING: &str = "Warning: Environment is too dark for safe navigation. \
     Please stop and find better lighting or assistance.";

/// Detects combined staleness of detections and depth. The counter decays
/// instead of resetting so a single good cycle cannot mask a failing system.
pub struct SystemFailureMonitor {
    cfg: HealthConfig,
    counter: u32,
    last_warning_ms: Option<u64>,
}

impl SystemFailureMonitor {
    pub fn new(cfg: HealthConfig) -> Self {
        Self {
            cfg,
            counter: 0,
            last_warning_ms: None,
        }
    }

    pub fn check(
        &mut self,
        depth_present: bool,
        depth_age_ms: Option<u64>,
        empty_streak: u32,
        now_ms: u64,
    ) -> Option<GuidanceEvent> {
        let depth_failing =
            !depth_present || matches!(depth_age_ms, Some(age) if age > self.cfg.depth_stale_ms);
        let detector_failing = empty_streak > self.cfg.detector_streak;

        if depth_failing && detector_failing {
            self.counter += 1;
            if self.counter >= self.cfg.failure_threshold && self.cooldown_elapsed(now_ms) {
                warn!(
                    "system failure: depth_failing={} detector_failing={} counter={}",
                    depth_failing, detector_failing, self.counter
                );
                self.last_warning_ms = Some(now_ms);
                return Some(GuidanceEvent::new(
                    SYSTEM_FAILURE_WARNING,
                    Some("system_failure"),
                ));
            }
        } else {
            self.counter = self.counter.saturating_sub(2);
        }
        None
    }

    fn cooldown_elapsed(&self, now_ms: u64) -> bool {
        match self.last_warning_ms {
            None => true,
            Some(last) => now_ms.saturating_sub(last) > self.cfg.failure_cooldown_ms,
        }
    }

    #[cfg(test)]
    fn counter(&self) -> u32 {
        self.counter
    }
}

/// Warns when the camera has been looking at darkness for a sustained run.
pub struct DarknessMonitor {
    cfg: HealthConfig,
    counter: u32,
    last_warning_ms: Option<u64>,
    last_brightness: f32,
}

impl DarknessMonitor {
    pub fn new(cfg: HealthConfig) -> Self {
        Self {
            cfg,
            counter: 0,
            last_warning_ms: None,
            last_brightness: 0.0,
        }
    }

    pub fn last_brightness(&self) -> f32 {
        self.last_brightness
    }

    pub fn check(&mut self, frame: &Frame, now_ms: u64) -> Option<GuidanceEvent> {
        let brightness = average_brightness(frame);
        self.last_brightness = brightness;

        if brightness < self.cfg.darkness_brightness {
            self.counter += 1;
            let cooled = match self.last_warning_ms {
                None => true,
                Some(last) => now_ms.saturating_sub(last) > self.cfg.darkness_cooldown_ms,
            };
            if self.counter >= self.cfg.darkness_frames && cooled {
                warn!("dark environment: brightness={brightness:.1}");
                self.last_warning_ms = Some(now_ms);
                return Some(GuidanceEvent::new(DARKNESS_WARNING, Some("darkness")));
            }
        } else {
            self.counter = 0;
        }
        None
    }
}

/// Luminance-weighted average brightness over a coarse pixel grid
/// (every 4th pixel in each axis; accurate enough for a threshold check).
pub fn average_brightness(frame: &Frame) -> f32 {
    let step = 4;
    let mut total = 0.0f64;
    let mut count = 0usize;
    let mut y = 0;
    while y < frame.height {
        let mut x = 0;
        while x < frame.width {
            let (r, g, b) = frame.rgb_at(x, y);
            total += 0.299 * r as f64 + 0.587 * g as f64 + 0.114 * b as f64;
            count += 1;
            x += step;
        }
        y += step;
    }
    if count > 0 {
        (total / count as f64) as f32
    } else {
        0.0
    }
}
