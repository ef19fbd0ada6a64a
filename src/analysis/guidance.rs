// src/analysis/guidance.rs
//
// Priority rule engine: one instruction per cycle, first matching rule wins.
// The rules are an explicit ordered table so the priority order is visible
// and testable on its own, instead of being buried in nested conditionals.

use crate::analysis::regions::{Region, RegionOccupancy};
use crate::analysis::wall_detector::WallState;
use crate::depth::{DepthMap, DepthSampler};
use crate::types::{DetectionBox, GuidanceConfig};
use tracing::debug;

/// Everything one guidance cycle gets to look at.
pub struct GuidanceInputs<'a> {
    pub occupancy: RegionOccupancy,
    pub boxes: &'a [DetectionBox],
    pub depth: Option<&'a DepthMap>,
    pub sampler: &'a DepthSampler,
    pub wall: WallState,
    pub cfg: &'a GuidanceConfig,
    pub wall_warning_distance_m: f32,
}

impl<'a> GuidanceInputs<'a> {
    fn box_depth(&self, b: &DetectionBox) -> Option<f32> {
        self.sampler.box_depth(b, self.depth?)
    }

    /// Most salient detection: confidence x area.
    fn primary(&self) -> Option<&'a DetectionBox> {
        self.boxes
            .iter()
            .max_by(|a, b| a.salience().partial_cmp(&b.salience()).unwrap_or(std::cmp::Ordering::Equal))
    }

    fn primary_name(&self) -> &str {
        self.primary().map(|b| b.object_name()).unwrap_or("object")
    }

    fn in_valid_range(&self, d: f32) -> bool {
        d >= self.cfg.valid_min_m && d <= self.cfg.valid_max_m
    }

    fn wall_close(&self) -> bool {
        self.wall.present
            && matches!(self.wall.distance_m, Some(d) if d < self.wall_warning_distance_m)
    }
}

enum RuleOutcome {
    Instruction(String),
    /// Stop evaluating; say nothing this cycle.
    Suppress,
}

struct Rule {
    name: &'static str,
    eval: fn(&GuidanceInputs) -> Option<RuleOutcome>,
}

/// Evaluated top to bottom; order is the safety contract.
const RULES: &[Rule] = &[
    Rule {
        name: "person_cluster",
        eval: person_cluster,
    },
    Rule {
        name: "primary_out_of_range",
        eval: primary_out_of_range,
    },
    Rule {
        name: "below_override",
        eval: below_override,
    },
    Rule {
        name: "above_only",
        eval: above_only,
    },
    Rule {
        name: "very_near",
        eval: very_near,
    },
    Rule {
        name: "directional",
        eval: directional,
    },
    Rule {
        name: "close_wall",
        eval: close_wall,
    },
];

/// At most one instruction per cycle.
pub fn generate(inputs: &GuidanceInputs) -> Option<String> {
    for rule in RULES {
        if let Some(outcome) = (rule.eval)(inputs) {
            debug!("guidance rule '{}' matched", rule.name);
            return match outcome {
                RuleOutcome::Instruction(text) => Some(text),
                RuleOutcome::Suppress => None,
            };
        }
    }
    None
}

/// Several people at similar depth read better as one announcement than as a
/// per-person stream. Single-pass: sort by depth, split where consecutive
/// depths differ by more than the clustering threshold.
fn person_cluster(i: &GuidanceInputs) -> Option<RuleOutcome> {
    let mut people: Vec<(&DetectionBox, f32)> = i
        .boxes
        .iter()
        .filter(|b| b.cls_name.starts_with("person"))
        .filter_map(|b| i.box_depth(b).map(|d| (b, d)))
        .collect();
    if people.len() < 2 {
        return None;
    }
    people.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));

    let mut clusters: Vec<Vec<(&DetectionBox, f32)>> = Vec::new();
    let mut current: Vec<(&DetectionBox, f32)> = Vec::new();
    let mut last_depth: Option<f32> = None;
    for (b, d) in people {
        match last_depth {
            Some(prev) if (d - prev).abs() >= i.cfg.person_cluster_threshold => {
                clusters.push(std::mem::take(&mut current));
                current.push((b, d));
            }
            _ => current.push((b, d)),
        }
        last_depth = Some(d);
    }
    if !current.is_empty() {
        clusters.push(current);
    }

    let largest = clusters.iter().max_by_key(|c| c.len())?;
    if largest.len() < 2 {
        return None;
    }

    let distance = largest
        .iter()
        .map(|(_, d)| *d)
        .fold(f32::MAX, f32::min);
    if !i.in_valid_range(distance) {
        return None;
    }

    let region = dominant_region(largest.iter().map(|(b, _)| *b));
    Some(RuleOutcome::Instruction(format!(
        "people {region} {distance:.1} meters ahead"
    )))
}

/// Objects closer than anything real or farther than anything relevant
/// silence object guidance for the whole cycle.
fn primary_out_of_range(i: &GuidanceInputs) -> Option<RuleOutcome> {
    let primary = i.primary()?;
    let d = i.box_depth(primary)?;
    if i.in_valid_range(d) {
        None
    } else {
        Some(RuleOutcome::Suppress)
    }
}

fn below_override(i: &GuidanceInputs) -> Option<RuleOutcome> {
    if i.occupancy.below {
        Some(RuleOutcome::Instruction(format!(
            "{} below, stop immediately",
            i.primary_name()
        )))
    } else {
        None
    }
}

fn above_only(i: &GuidanceInputs) -> Option<RuleOutcome> {
    let occ = i.occupancy;
    if occ.above && !(occ.left || occ.center || occ.right) {
        Some(RuleOutcome::Instruction(format!(
            "{} above, lower your head",
            i.primary_name()
        )))
    } else {
        None
    }
}

fn very_near(i: &GuidanceInputs) -> Option<RuleOutcome> {
    let (closest, distance) = i
        .boxes
        .iter()
        .filter_map(|b| i.box_depth(b).map(|d| (b, d)))
        .min_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))?;
    if distance > 0.0 && distance < i.cfg.very_near_m {
        Some(RuleOutcome::Instruction(format!(
            "{} very close, stop!",
            closest.object_name()
        )))
    } else {
        None
    }
}

fn directional(i: &GuidanceInputs) -> Option<RuleOutcome> {
    let occ = i.occupancy;
    let name = i.primary_name().to_string();
    let dist = i.primary().and_then(|p| i.box_depth(p));

    let text = if occ.left && !occ.right {
        if !occ.center {
            place_instruction(&name, "left", dist, "move right")
        } else {
            place_instruction(&name, "left and center", dist, "move further right")
        }
    } else if occ.right && !occ.left {
        if !occ.center {
            place_instruction(&name, "right", dist, "move left")
        } else {
            place_instruction(&name, "right and center", dist, "move further left")
        }
    } else if occ.center {
        match (occ.left, occ.right) {
            (false, false) => place_instruction(&name, "center", dist, "move left or right"),
            (false, true) => place_instruction(&name, "center", dist, "move left"),
            (true, false) => place_instruction(&name, "center", dist, "move right"),
            (true, true) => match dist {
                Some(d) => format!("{name} {d:.1} meters ahead blocking path, stop"),
                None => format!("{name} ahead blocking path, stop"),
            },
        }
    } else if occ.left && occ.right {
        // Center reads free; check whether it actually is before sending the
        // user between two obstacles.
        let corridor_clear = match i.depth {
            Some(depth) => forward_corridor_clear(
                depth,
                i.sampler,
                i.wall,
                i.wall_warning_distance_m,
                i.cfg.corridor_clear_m,
            ),
            None => false,
        };
        if i.wall_close() {
            wall_warning_text(i.wall.distance_m)
        } else if corridor_clear {
            both_sides_instruction(dist, "center path is clear, proceed forward")
        } else {
            both_sides_instruction(dist, "proceed carefully forward")
        }
    } else {
        return None;
    };

    Some(RuleOutcome::Instruction(text))
}

fn close_wall(i: &GuidanceInputs) -> Option<RuleOutcome> {
    if i.wall_close() {
        Some(RuleOutcome::Instruction(wall_warning_text(
            i.wall.distance_m,
        )))
    } else {
        None
    }
}

/// "Path clear" check used once the empty-detection streak is long enough:
/// no close wall and a clear forward corridor.
pub fn path_clear_guidance(
    depth: Option<&DepthMap>,
    sampler: &DepthSampler,
    wall: WallState,
    cfg: &GuidanceConfig,
    wall_warning_distance_m: f32,
) -> Option<String> {
    let depth = depth?;
    let wall_close =
        wall.present && matches!(wall.distance_m, Some(d) if d < wall_warning_distance_m);
    if wall_close {
        return None;
    }
    if forward_corridor_clear(depth, sampler, wall, wall_warning_distance_m, cfg.corridor_clear_m) {
        Some("Path clear, proceed forward".to_string())
    } else {
        None
    }
}

/// Forward corridor: lower-center rectangle of the frame, sampled on a
/// coarse 8x8-ish grid. Clear when the closest valid sample is far enough.
pub fn forward_corridor_clear(
    depth: &DepthMap,
    sampler: &DepthSampler,
    wall: WallState,
    wall_warning_distance_m: f32,
    clear_min_m: f32,
) -> bool {
    // A smoothed wall beyond the warning threshold is the dominant planar
    // structure ahead and it is far; skip the sampling.
    if wall.present {
        if let Some(d) = wall.distance_m {
            if d >= wall_warning_distance_m {
                return true;
            }
        }
    }

    let w = depth.width();
    let h = depth.height();
    let x_start = (0.33 * (w - 1) as f32) as usize;
    let x_end = ((0.66 * (w - 1) as f32) as usize).max(x_start + 1);
    let y_start = (0.60 * (h - 1) as f32) as usize;
    let y_end = ((0.95 * (h - 1) as f32) as usize).max(y_start + 1);

    let step_x = ((x_end - x_start) / 8).max(1);
    let step_y = ((y_end - y_start) / 8).max(1);

    let mut min_m = f32::MAX;
    let mut samples = 0usize;
    let mut y = y_start;
    while y <= y_end {
        let mut x = x_start;
        while x <= x_end {
            if let Some(m) = sampler.to_meters(depth.raw_at(x, y)) {
                min_m = min_m.min(m);
                samples += 1;
            }
            x += step_x;
        }
        y += step_y;
    }

    samples > 0 && min_m >= clear_min_m
}

/// Wall announcement, with the distance clause only when it is plausible.
pub fn wall_warning_text(distance_m: Option<f32>) -> String {
    match distance_m {
        Some(d) if (0.5..=5.0).contains(&d) => {
            format!("Wall ahead {d:.1} meters, be careful, feel what's in front of you and stop")
        }
        _ => "Wall ahead, be careful, feel what's in front of you and stop".to_string(),
    }
}

fn place_instruction(name: &str, place: &str, dist: Option<f32>, action: &str) -> String {
    match dist {
        Some(d) => format!("{name} {place} {d:.1} meters ahead, {action}"),
        None => format!("{name} {place} ahead, {action}"),
    }
}

fn both_sides_instruction(dist: Option<f32>, tail: &str) -> String {
    match dist {
        Some(d) => format!("Objects on both sides {d:.1} meters ahead, {tail}"),
        None => format!("Objects on both sides ahead, {tail}"),
    }
}

/// Most common region among a cluster's boxes; "ahead" when none is tagged.
fn dominant_region<'a>(boxes: impl Iterator<Item = &'a DetectionBox>) -> &'static str {
    let mut counts: Vec<(&'static str, usize)> = Vec::new();
    for b in boxes {
        let region = Region::of_label(&b.cls_name)
            .map(|r| r.as_str())
            .unwrap_or("ahead");
        match counts.iter_mut().find(|(r, _)| *r == region) {
            Some((_, n)) => *n += 1,
            None => counts.push((region, 1)),
        }
    }
    counts
        .into_iter()
        .max_by_key(|(_, n)| *n)
        .map(|(r, _)| r)
        .unwrap_or("ahead")
}
