//! Dense optical flow.
//!
//! Flow fields are `(H, W, 2)` arrays holding `(dx, dy)` per pixel in the *reverse*
//! direction: `old(x + dx, y + dy) ≈ new(x, y)`. With that convention [`warp`] turns the old
//! frame into a prediction of the new one.

use flowseg_core::GeneratorError;
use image::RgbImage;
use ndarray::{Array2, Array3};
use serde::{Deserialize, Serialize};

use crate::preprocess::to_gray;

pub type FlowField = Array3<f32>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowAlgorithm {
    /// Iterative Lucas-Kanade on every pixel, coarse to fine.
    PyramidalLucasKanade,
    /// Patch-based inverse-compositional search with weighted densification.
    DenseInverseSearch,
}

impl FlowAlgorithm {
    pub fn from_name(name: &str) -> Result<Self, GeneratorError> {
        match name.trim().to_ascii_lowercase().as_str() {
            "lk" | "pyr_lk" => Ok(FlowAlgorithm::PyramidalLucasKanade),
            "dis" => Ok(FlowAlgorithm::DenseInverseSearch),
            _ => Err(GeneratorError::UnsupportedFlowAlgorithm(name.to_string())),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FlowAlgorithm::PyramidalLucasKanade => "lk",
            FlowAlgorithm::DenseInverseSearch => "dis",
        }
    }
}

/// Tuning knobs shared by both algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowParams {
    pub max_levels: usize,
    /// A coarser level is only added while its smaller side stays at or above this.
    pub min_level_size: usize,
    pub iterations: usize,
    /// Lucas-Kanade window radius; the window is `2r + 1` pixels wide.
    pub window_radius: usize,
    pub patch_size: usize,
    pub patch_stride: usize,
}

impl Default for FlowParams {
    fn default() -> Self {
        Self {
            max_levels: 3,
            min_level_size: 16,
            iterations: 8,
            window_radius: 3,
            patch_size: 8,
            patch_stride: 4,
        }
    }
}

impl FlowParams {
    pub fn validate(&self) -> Result<(), GeneratorError> {
        if self.max_levels == 0 || self.iterations == 0 {
            return Err(GeneratorError::invalid_config(
                "flow levels and iterations must be > 0",
            ));
        }
        if self.min_level_size == 0 {
            return Err(GeneratorError::invalid_config(
                "flow min_level_size must be > 0",
            ));
        }
        if self.patch_size < 2 || self.patch_stride == 0 {
            return Err(GeneratorError::invalid_config(
                "flow patch_size must be >= 2 and patch_stride > 0",
            ));
        }
        Ok(())
    }
}

const MIN_DETERMINANT: f32 = 1e-6;
const MAX_STEP: f32 = 2.0;

#[derive(Debug, Clone)]
pub struct FlowEstimator {
    algorithm: FlowAlgorithm,
    params: FlowParams,
}

impl FlowEstimator {
    pub fn new(algorithm: FlowAlgorithm) -> Self {
        Self {
            algorithm,
            params: FlowParams::default(),
        }
    }

    pub fn from_name(name: &str) -> Result<Self, GeneratorError> {
        Ok(Self::new(FlowAlgorithm::from_name(name)?))
    }

    pub fn with_params(mut self, params: FlowParams) -> Result<Self, GeneratorError> {
        params.validate()?;
        self.params = params;
        Ok(self)
    }

    pub fn algorithm(&self) -> FlowAlgorithm {
        self.algorithm
    }

    pub fn params(&self) -> &FlowParams {
        &self.params
    }

    /// Reverse flow from `new` back into `old`.
    pub fn estimate(&self, old: &RgbImage, new: &RgbImage) -> Result<FlowField, GeneratorError> {
        self.estimate_gray(&to_gray(old), &to_gray(new))
    }

    pub fn estimate_gray(
        &self,
        old: &Array2<f32>,
        new: &Array2<f32>,
    ) -> Result<FlowField, GeneratorError> {
        if old.dim() != new.dim() {
            return Err(GeneratorError::invalid_config(format!(
                "flow frames differ in size: {:?} vs {:?}",
                old.dim(),
                new.dim()
            )));
        }
        let (h, w) = new.dim();
        if h == 0 || w == 0 {
            return Err(GeneratorError::invalid_config("flow frames are empty"));
        }

        let levels = level_count(h, w, &self.params);
        let reference = build_pyramid(new, levels);
        let target = build_pyramid(old, levels);

        // The pyramid may stop short of `levels` once a side would reach zero.
        let mut flow: Option<FlowField> = None;
        for level in (0..reference.len().min(target.len())).rev() {
            let (lh, lw) = reference[level].dim();
            let mut current = match flow.take() {
                Some(coarse) => upsample_flow(&coarse, lh, lw),
                None => Array3::zeros((lh, lw, 2)),
            };
            match self.algorithm {
                FlowAlgorithm::PyramidalLucasKanade => {
                    refine_lk(&reference[level], &target[level], &mut current, &self.params)
                }
                FlowAlgorithm::DenseInverseSearch => {
                    refine_dis(&reference[level], &target[level], &mut current, &self.params)
                }
            }
            flow = Some(current);
        }
        Ok(flow.unwrap_or_else(|| Array3::zeros((h, w, 2))))
    }
}

/// Resamples `image` (`(H, W, C)`) at `(x + dx, y + dy)`, clamping at the borders.
pub fn warp(image: &Array3<f32>, flow: &FlowField) -> Result<Array3<f32>, GeneratorError> {
    let (h, w, c) = image.dim();
    if flow.dim() != (h, w, 2) {
        return Err(GeneratorError::invalid_config(format!(
            "flow shape {:?} does not match image {:?}",
            flow.dim(),
            image.dim()
        )));
    }
    let mut out = Array3::zeros((h, w, c));
    for y in 0..h {
        for x in 0..w {
            let sx = x as f32 + flow[[y, x, 0]];
            let sy = y as f32 + flow[[y, x, 1]];
            let s = Sampler::new(h, w, sx, sy);
            for ch in 0..c {
                out[[y, x, ch]] = s.apply(|yy, xx| image[[yy, xx, ch]]);
            }
        }
    }
    Ok(out)
}

/// HSV rendering: hue follows direction, value follows magnitude relative to this field's
/// maximum. A zero field renders black.
pub fn to_visualization(flow: &FlowField) -> Result<RgbImage, GeneratorError> {
    let (h, w, c) = flow.dim();
    if c != 2 {
        return Err(GeneratorError::invalid_config(format!(
            "flow must have 2 channels, got {c}"
        )));
    }
    let width = u32::try_from(w).map_err(|_| GeneratorError::invalid_config("width overflow"))?;
    let height = u32::try_from(h).map_err(|_| GeneratorError::invalid_config("height overflow"))?;

    let magnitude = Array2::from_shape_fn((h, w), |(y, x)| {
        flow[[y, x, 0]].hypot(flow[[y, x, 1]])
    });
    let max = magnitude.iter().copied().fold(0.0f32, f32::max);

    Ok(RgbImage::from_fn(width, height, |x, y| {
        let (x, y) = (x as usize, y as usize);
        let angle = flow[[y, x, 1]].atan2(flow[[y, x, 0]]);
        let hue = angle.to_degrees().rem_euclid(360.0);
        let value = if max > 0.0 { magnitude[[y, x]] / max } else { 0.0 };
        image::Rgb(hsv_to_rgb(hue, 1.0, value))
    }))
}

fn hsv_to_rgb(hue: f32, saturation: f32, value: f32) -> [u8; 3] {
    let chroma = value * saturation;
    let sector = hue / 60.0;
    let second = chroma * (1.0 - (sector.rem_euclid(2.0) - 1.0).abs());
    let (r, g, b) = match sector as u32 {
        0 => (chroma, second, 0.0),
        1 => (second, chroma, 0.0),
        2 => (0.0, chroma, second),
        3 => (0.0, second, chroma),
        4 => (second, 0.0, chroma),
        _ => (chroma, 0.0, second),
    };
    let m = value - chroma;
    let px = |v: f32| ((v + m) * 255.0).round().clamp(0.0, 255.0) as u8;
    [px(r), px(g), px(b)]
}

/// Bilinear sample weights for a clamped sub-pixel position.
struct Sampler {
    x0: usize,
    x1: usize,
    y0: usize,
    y1: usize,
    fx: f32,
    fy: f32,
}

impl Sampler {
    fn new(h: usize, w: usize, x: f32, y: f32) -> Self {
        let x = if x.is_finite() { x.clamp(0.0, (w - 1) as f32) } else { 0.0 };
        let y = if y.is_finite() { y.clamp(0.0, (h - 1) as f32) } else { 0.0 };
        let x0 = x.floor() as usize;
        let y0 = y.floor() as usize;
        Self {
            x0,
            x1: (x0 + 1).min(w - 1),
            y0,
            y1: (y0 + 1).min(h - 1),
            fx: x - x0 as f32,
            fy: y - y0 as f32,
        }
    }

    fn apply(&self, at: impl Fn(usize, usize) -> f32) -> f32 {
        let top = at(self.y0, self.x0) * (1.0 - self.fx) + at(self.y0, self.x1) * self.fx;
        let bottom = at(self.y1, self.x0) * (1.0 - self.fx) + at(self.y1, self.x1) * self.fx;
        top * (1.0 - self.fy) + bottom * self.fy
    }
}

fn sample(img: &Array2<f32>, x: f32, y: f32) -> f32 {
    let (h, w) = img.dim();
    Sampler::new(h, w, x, y).apply(|yy, xx| img[[yy, xx]])
}

fn level_count(h: usize, w: usize, params: &FlowParams) -> usize {
    let mut levels = 1;
    while levels < params.max_levels && (h.min(w) >> levels) >= params.min_level_size {
        levels += 1;
    }
    levels
}

/// Level 0 is the input; each further level halves both sides with a 2x2 box average.
fn build_pyramid(img: &Array2<f32>, levels: usize) -> Vec<Array2<f32>> {
    let mut out = vec![img.clone()];
    for _ in 1..levels {
        let Some(prev) = out.last() else { break };
        let (h, w) = prev.dim();
        let (nh, nw) = (h / 2, w / 2);
        if nh == 0 || nw == 0 {
            break;
        }
        let next = Array2::from_shape_fn((nh, nw), |(y, x)| {
            let (sy, sx) = (2 * y, 2 * x);
            0.25 * (prev[[sy, sx]] + prev[[sy, sx + 1]] + prev[[sy + 1, sx]] + prev[[sy + 1, sx + 1]])
        });
        out.push(next);
    }
    out
}

fn upsample_flow(coarse: &FlowField, h: usize, w: usize) -> FlowField {
    let (ch, cw, _) = coarse.dim();
    let sx = w as f32 / cw as f32;
    let sy = h as f32 / ch as f32;
    let mut out = Array3::zeros((h, w, 2));
    for y in 0..h {
        for x in 0..w {
            let cx = (x as f32 + 0.5) / sx - 0.5;
            let cy = (y as f32 + 0.5) / sy - 0.5;
            let s = Sampler::new(ch, cw, cx, cy);
            out[[y, x, 0]] = s.apply(|yy, xx| coarse[[yy, xx, 0]]) * sx;
            out[[y, x, 1]] = s.apply(|yy, xx| coarse[[yy, xx, 1]]) * sy;
        }
    }
    out
}

/// Central differences, one-sided at the borders.
fn gradients(img: &Array2<f32>) -> (Array2<f32>, Array2<f32>) {
    let (h, w) = img.dim();
    let gx = Array2::from_shape_fn((h, w), |(y, x)| {
        let (l, r) = (x.saturating_sub(1), (x + 1).min(w - 1));
        if r == l {
            0.0
        } else {
            (img[[y, r]] - img[[y, l]]) / (r - l) as f32
        }
    });
    let gy = Array2::from_shape_fn((h, w), |(y, x)| {
        let (t, b) = (y.saturating_sub(1), (y + 1).min(h - 1));
        if b == t {
            0.0
        } else {
            (img[[b, x]] - img[[t, x]]) / (b - t) as f32
        }
    });
    (gx, gy)
}

/// Sum over a `(2r + 1)^2` window clipped to the image, via a summed-area table.
fn box_sum(a: &Array2<f32>, r: usize) -> Array2<f32> {
    let (h, w) = a.dim();
    let mut integral = Array2::<f64>::zeros((h + 1, w + 1));
    for y in 0..h {
        let mut row = 0.0f64;
        for x in 0..w {
            row += f64::from(a[[y, x]]);
            integral[[y + 1, x + 1]] = integral[[y, x + 1]] + row;
        }
    }
    Array2::from_shape_fn((h, w), |(y, x)| {
        let (y0, y1) = (y.saturating_sub(r), (y + r + 1).min(h));
        let (x0, x1) = (x.saturating_sub(r), (x + r + 1).min(w));
        (integral[[y1, x1]] - integral[[y0, x1]] - integral[[y1, x0]] + integral[[y0, x0]]) as f32
    })
}

fn warp_gray(img: &Array2<f32>, flow: &FlowField) -> Array2<f32> {
    let (h, w) = img.dim();
    Array2::from_shape_fn((h, w), |(y, x)| {
        sample(img, x as f32 + flow[[y, x, 0]], y as f32 + flow[[y, x, 1]])
    })
}

fn clamp_step(v: f32) -> f32 {
    if v.is_finite() {
        v.clamp(-MAX_STEP, MAX_STEP)
    } else {
        0.0
    }
}

fn refine_lk(reference: &Array2<f32>, target: &Array2<f32>, flow: &mut FlowField, p: &FlowParams) {
    let (h, w) = reference.dim();
    for _ in 0..p.iterations {
        let warped = warp_gray(target, flow);
        let (gx, gy) = gradients(&warped);
        let it = &warped - reference;

        let sxx = box_sum(&(&gx * &gx), p.window_radius);
        let sxy = box_sum(&(&gx * &gy), p.window_radius);
        let syy = box_sum(&(&gy * &gy), p.window_radius);
        let sxt = box_sum(&(&gx * &it), p.window_radius);
        let syt = box_sum(&(&gy * &it), p.window_radius);

        let mut moved = 0.0f32;
        for y in 0..h {
            for x in 0..w {
                let (a, b, c) = (sxx[[y, x]], sxy[[y, x]], syy[[y, x]]);
                let det = a * c - b * b;
                if det.abs() <= MIN_DETERMINANT * (a + c).max(1.0) {
                    continue;
                }
                let (ex, ey) = (sxt[[y, x]], syt[[y, x]]);
                let du = clamp_step((b * ey - c * ex) / det);
                let dv = clamp_step((b * ex - a * ey) / det);
                flow[[y, x, 0]] += du;
                flow[[y, x, 1]] += dv;
                moved = moved.max(du.abs().max(dv.abs()));
            }
        }
        if moved < 1e-3 {
            break;
        }
    }
}

fn patch_origins(len: usize, patch: usize, stride: usize) -> Vec<usize> {
    let last = len - patch;
    let mut out: Vec<usize> = (0..=last).step_by(stride).collect();
    if out.last() != Some(&last) {
        out.push(last);
    }
    out
}

fn refine_dis(reference: &Array2<f32>, target: &Array2<f32>, flow: &mut FlowField, p: &FlowParams) {
    let (h, w) = reference.dim();
    let ps = p.patch_size.min(h).min(w);
    if ps < 2 {
        return refine_lk(reference, target, flow, p);
    }
    let (gx, gy) = gradients(reference);

    let mut acc = Array3::<f32>::zeros((h, w, 2));
    let mut weight = Array2::<f32>::zeros((h, w));

    for &y0 in &patch_origins(h, ps, p.patch_stride) {
        for &x0 in &patch_origins(w, ps, p.patch_stride) {
            let (mut hxx, mut hxy, mut hyy) = (0.0f32, 0.0f32, 0.0f32);
            for py in y0..y0 + ps {
                for px in x0..x0 + ps {
                    let (ix, iy) = (gx[[py, px]], gy[[py, px]]);
                    hxx += ix * ix;
                    hxy += ix * iy;
                    hyy += iy * iy;
                }
            }
            let det = hxx * hyy - hxy * hxy;

            let (cy, cx) = (y0 + ps / 2, x0 + ps / 2);
            let (mut u, mut v) = (flow[[cy, cx, 0]], flow[[cy, cx, 1]]);

            if det.abs() > MIN_DETERMINANT * (hxx + hyy).max(1.0) {
                for _ in 0..p.iterations {
                    let (mut bx, mut by) = (0.0f32, 0.0f32);
                    for py in y0..y0 + ps {
                        for px in x0..x0 + ps {
                            let e = sample(target, px as f32 + u, py as f32 + v)
                                - reference[[py, px]];
                            bx += gx[[py, px]] * e;
                            by += gy[[py, px]] * e;
                        }
                    }
                    // Inverse compositional: the reference patch moves by the solved delta, so
                    // the target offset moves the other way.
                    let du = clamp_step((hyy * bx - hxy * by) / det);
                    let dv = clamp_step((hxx * by - hxy * bx) / det);
                    u -= du;
                    v -= dv;
                    if du.abs().max(dv.abs()) < 1e-3 {
                        break;
                    }
                }
            }

            for py in y0..y0 + ps {
                for px in x0..x0 + ps {
                    let e = sample(target, px as f32 + u, py as f32 + v) - reference[[py, px]];
                    let wgt = 1.0 / e.abs().max(1.0);
                    acc[[py, px, 0]] += wgt * u;
                    acc[[py, px, 1]] += wgt * v;
                    weight[[py, px]] += wgt;
                }
            }
        }
    }

    for y in 0..h {
        for x in 0..w {
            let wgt = weight[[y, x]];
            if wgt > 0.0 {
                flow[[y, x, 0]] = acc[[y, x, 0]] / wgt;
                flow[[y, x, 1]] = acc[[y, x, 1]] / wgt;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn algorithm_names() {
        assert_eq!(
            FlowAlgorithm::from_name("pyr_lk").unwrap(),
            FlowAlgorithm::PyramidalLucasKanade
        );
        assert_eq!(
            FlowAlgorithm::from_name(" DIS ").unwrap(),
            FlowAlgorithm::DenseInverseSearch
        );
        let err = FlowAlgorithm::from_name("tvl1").unwrap_err();
        assert!(matches!(err, GeneratorError::UnsupportedFlowAlgorithm(n) if n == "tvl1"));
    }

    #[test]
    fn zero_flow_warp_is_identity() {
        let img = Array3::from_shape_fn((4, 5, 3), |(y, x, c)| (y * 10 + x + c) as f32);
        let flow = Array3::zeros((4, 5, 2));
        assert_eq!(warp(&img, &flow).unwrap(), img);
    }

    #[test]
    fn integer_flow_warp_shifts_and_clamps() {
        let img = Array3::from_shape_fn((2, 4, 1), |(_, x, _)| x as f32);
        let mut flow = Array3::zeros((2, 4, 2));
        flow.slice_mut(ndarray::s![.., .., 0]).fill(1.0);
        let out = warp(&img, &flow).unwrap();
        let row: Vec<f32> = (0..4).map(|x| out[[0, x, 0]]).collect();
        assert_eq!(row, vec![1.0, 2.0, 3.0, 3.0]);
    }

    #[test]
    fn warp_rejects_mismatched_flow() {
        let img = Array3::<f32>::zeros((4, 4, 3));
        let flow = Array3::<f32>::zeros((4, 3, 2));
        assert!(warp(&img, &flow).is_err());
    }

    #[test]
    fn visualization_of_zero_flow_is_black() {
        let vis = to_visualization(&Array3::zeros((3, 3, 2))).unwrap();
        assert!(vis.pixels().all(|p| p.0 == [0, 0, 0]));
    }

    #[test]
    fn visualization_hue_follows_direction() {
        let mut flow = Array3::zeros((1, 3, 2));
        flow[[0, 0, 0]] = 2.0; // +x: red
        flow[[0, 1, 1]] = 1.0; // +y, half magnitude
        flow[[0, 2, 0]] = -2.0; // -x: cyan
        let vis = to_visualization(&flow).unwrap();
        assert_eq!(vis.get_pixel(0, 0).0, [255, 0, 0]);
        assert_eq!(vis.get_pixel(2, 0).0, [0, 255, 255]);
        let half = vis.get_pixel(1, 0).0;
        assert_eq!(half.iter().copied().max(), Some(128));
    }

    #[test]
    fn box_sum_counts_clipped_window() {
        let ones = Array2::<f32>::ones((5, 5));
        let s = box_sum(&ones, 1);
        assert_eq!(s[[0, 0]], 4.0);
        assert_eq!(s[[2, 2]], 9.0);
        assert_eq!(s[[4, 2]], 6.0);
    }

    #[test]
    fn pyramid_stops_at_min_level_size() {
        let p = FlowParams::default();
        assert_eq!(level_count(64, 96, &p), 3);
        assert_eq!(level_count(20, 20, &p), 1);
        let pyr = build_pyramid(&Array2::zeros((64, 96)), 3);
        assert_eq!(pyr[2].dim(), (16, 24));
    }

    #[test]
    fn zero_min_level_size_is_rejected() {
        let params = FlowParams {
            max_levels: 8,
            min_level_size: 0,
            ..FlowParams::default()
        };
        let err = FlowEstimator::new(FlowAlgorithm::PyramidalLucasKanade)
            .with_params(params)
            .unwrap_err();
        assert!(matches!(err, GeneratorError::InvalidConfiguration(_)));
    }

    #[test]
    fn deep_pyramid_on_small_frame_estimates() {
        let params = FlowParams {
            max_levels: 8,
            min_level_size: 1,
            ..FlowParams::default()
        };
        let frame = RgbImage::from_fn(32, 16, |x, y| image::Rgb([(x * 7) as u8, (y * 11) as u8, 90]));
        for algorithm in [FlowAlgorithm::PyramidalLucasKanade, FlowAlgorithm::DenseInverseSearch] {
            let flow = FlowEstimator::new(algorithm)
                .with_params(params)
                .unwrap()
                .estimate(&frame, &frame)
                .unwrap();
            assert_eq!(flow.dim(), (16, 32, 2));
        }
        // A pyramid asked for more levels than the frame allows stops early.
        assert_eq!(build_pyramid(&Array2::zeros((3, 40)), 4).len(), 2);
    }

    #[test]
    fn patch_origins_cover_the_edge() {
        assert_eq!(patch_origins(18, 8, 4), vec![0, 4, 8, 10]);
        assert_eq!(patch_origins(8, 8, 4), vec![0]);
    }
}
