// src/depth.rs
//
// Raw depth codes and robust sampling. The depth provider hands over a grid
// of raw sensor codes; everything downstream works in meters through the
// conversion here. Median-of-patch sampling suppresses single-pixel noise
// without the cost of a full smoothing filter.

use crate::types::{DepthConfig, DetectionBox};
use ndarray::Array2;

/// A raw depth code straight from the depth model. Meaningless without the
/// deployment's scale factor; wrap it so raw codes and meters cannot mix.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RawDepth(pub f32);

/// One depth cycle's output. Replaced wholesale each cycle and published by
/// reference; never mutated in place.
#[derive(Debug, Clone)]
pub struct DepthMap {
    grid: Array2<f32>,
}

impl DepthMap {
    pub fn new(grid: Array2<f32>) -> Self {
        Self { grid }
    }

    pub fn width(&self) -> usize {
        self.grid.ncols()
    }

    pub fn height(&self) -> usize {
        self.grid.nrows()
    }

    pub fn raw_at(&self, x: usize, y: usize) -> RawDepth {
        RawDepth(self.grid[(y, x)])
    }

    /// Min/max raw code over the whole grid, for per-frame normalization.
    pub fn min_max_raw(&self) -> Option<(f32, f32)> {
        let mut min_v = f32::MAX;
        let mut max_v = f32::MIN;
        for &v in self.grid.iter() {
            if v < min_v {
                min_v = v;
            }
            if v > max_v {
                max_v = v;
            }
        }
        if min_v <= max_v {
            Some((min_v, max_v))
        } else {
            None
        }
    }
}

/// Converts raw codes to meters and answers point/patch/box queries.
#[derive(Debug, Clone)]
pub struct DepthSampler {
    scale_factor: f32,
    patch_radius: usize,
}

impl DepthSampler {
    pub fn new(cfg: &DepthConfig) -> Self {
        Self {
            scale_factor: cfg.scale_factor,
            patch_radius: cfg.patch_radius,
        }
    }

    /// `1 / (raw * scale_factor)`. A zero (or negative, from dequantization)
    /// code carries no data and must not read as infinite distance.
    pub fn to_meters(&self, raw: RawDepth) -> Option<f32> {
        if raw.0 <= 0.0 {
            return None;
        }
        Some(1.0 / (raw.0 * self.scale_factor))
    }

    /// Median raw code over a `(2r+1)^2` window around (cx, cy), in-bounds
    /// samples only. None when the window is entirely out of bounds.
    pub fn median_patch(&self, map: &DepthMap, cx: usize, cy: usize) -> Option<RawDepth> {
        let r = self.patch_radius as isize;
        let mut samples = Vec::with_capacity((2 * self.patch_radius + 1).pow(2));
        for dy in -r..=r {
            for dx in -r..=r {
                let px = cx as isize + dx;
                let py = cy as isize + dy;
                if px >= 0 && py >= 0 && (px as usize) < map.width() && (py as usize) < map.height()
                {
                    samples.push(map.raw_at(px as usize, py as usize).0);
                }
            }
        }
        if samples.is_empty() {
            return None;
        }
        samples.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        Some(RawDepth(samples[samples.len() / 2]))
    }

    /// Median-patch depth in meters at a normalized (x, y) position.
    pub fn depth_at_norm(&self, map: &DepthMap, xn: f32, yn: f32) -> Option<f32> {
        let x = (xn.clamp(0.0, 1.0) * (map.width() - 1) as f32) as usize;
        let y = (yn.clamp(0.0, 1.0) * (map.height() - 1) as f32) as usize;
        let raw = self.median_patch(map, x, y)?;
        self.to_meters(raw)
    }

    /// Depth in meters at a detection box's center.
    pub fn box_depth(&self, b: &DetectionBox, map: &DepthMap) -> Option<f32> {
        let (cx, cy) = b.center();
        self.depth_at_norm(map, cx, cy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DepthConfig;
    use ndarray::Array2;

    fn sampler() -> DepthSampler {
        DepthSampler::new(&DepthConfig::default())
    }

    fn uniform_map(raw: f32, w: usize, h: usize) -> DepthMap {
        DepthMap::new(Array2::from_elem((h, w), raw))
    }

    #[test]
    fn to_meters_inverts_scale() {
        let s = sampler();
        // raw 400 @ scale 0.0025 -> 1.0 m
        let m = s.to_meters(RawDepth(400.0)).unwrap();
        assert!((m - 1.0).abs() < 1e-4);
    }

    #[test]
    fn zero_raw_code_is_no_data() {
        let s = sampler();
        assert!(s.to_meters(RawDepth(0.0)).is_none());
        assert!(s.to_meters(RawDepth(-3.0)).is_none());
    }

    #[test]
    fn median_patch_clips_to_bounds() {
        let s = sampler();
        let map = uniform_map(100.0, 8, 8);
        // Corner patch still has in-bounds samples.
        let raw = s.median_patch(&map, 0, 0).unwrap();
        assert_eq!(raw.0, 100.0);
    }

    #[test]
    fn median_patch_suppresses_outliers() {
        let s = sampler();
        let mut grid = Array2::from_elem((16, 16), 200.0);
        grid[(8, 8)] = 5000.0; // hot pixel at the query point
        let map = DepthMap::new(grid);
        let raw = s.median_patch(&map, 8, 8).unwrap();
        assert_eq!(raw.0, 200.0);
    }

    #[test]
    fn box_depth_reads_center_patch() {
        let s = sampler();
        let map = uniform_map(400.0, 32, 32);
        let b = DetectionBox {
            x1: 0.4,
            y1: 0.4,
            x2: 0.6,
            y2: 0.6,
            cls_name: "chair-center".to_string(),
            confidence: 0.8,
        };
        let d = s.box_depth(&b, &map).unwrap();
        assert!((d - 1.0).abs() < 1e-3);
    }
}
