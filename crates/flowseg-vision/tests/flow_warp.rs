use flowseg_vision::{normalize, to_visualization, warp, FlowAlgorithm, FlowEstimator};
use image::RgbImage;

const W: u32 = 96;
const H: u32 = 64;
const MARGIN: usize = 8;

fn pattern(x: f32, y: f32) -> f32 {
    128.0 + 50.0 * (0.2 * x + 0.3).sin() + 40.0 * (0.15 * y).cos() + 20.0 * (0.1 * (x + y)).sin()
}

/// `new(x, y) = old(x - 2, y - 1)`, so the reverse flow is `(-2, -1)` everywhere.
fn translated_pair() -> (RgbImage, RgbImage) {
    let gray = |dx: f32, dy: f32| {
        RgbImage::from_fn(W, H, move |x, y| {
            let v = pattern(x as f32 - dx, y as f32 - dy).round().clamp(0.0, 255.0) as u8;
            image::Rgb([v, v, v])
        })
    };
    (gray(0.0, 0.0), gray(2.0, 1.0))
}

fn interior_mean(h: usize, w: usize, f: impl Fn(usize, usize) -> f32) -> f32 {
    let mut sum = 0.0f32;
    let mut n = 0usize;
    for y in MARGIN..h - MARGIN {
        for x in MARGIN..w - MARGIN {
            sum += f(y, x);
            n += 1;
        }
    }
    sum / n as f32
}

fn check_algorithm(algorithm: FlowAlgorithm) {
    let (old, new) = translated_pair();
    let estimator = FlowEstimator::new(algorithm);
    let flow = estimator.estimate(&old, &new).unwrap();
    assert_eq!(flow.dim(), (H as usize, W as usize, 2));

    let (h, w) = (H as usize, W as usize);
    let dx = interior_mean(h, w, |y, x| flow[[y, x, 0]]);
    let dy = interior_mean(h, w, |y, x| flow[[y, x, 1]]);
    assert!((dx + 2.0).abs() < 0.25, "{algorithm:?}: mean dx {dx}");
    assert!((dy + 1.0).abs() < 0.25, "{algorithm:?}: mean dy {dy}");

    let predicted = warp(&normalize(&old), &flow).unwrap();
    let target = normalize(&new);
    let err = interior_mean(h, w, |y, x| (predicted[[y, x, 0]] - target[[y, x, 0]]).abs());
    assert!(err < 0.03, "{algorithm:?}: mean warp error {err}");
}

#[test]
fn lucas_kanade_recovers_translation() {
    check_algorithm(FlowAlgorithm::PyramidalLucasKanade);
}

#[test]
fn dense_inverse_search_recovers_translation() {
    check_algorithm(FlowAlgorithm::DenseInverseSearch);
}

#[test]
fn identical_frames_give_near_zero_flow() {
    let (old, _) = translated_pair();
    for algorithm in [FlowAlgorithm::PyramidalLucasKanade, FlowAlgorithm::DenseInverseSearch] {
        let flow = FlowEstimator::new(algorithm).estimate(&old, &old).unwrap();
        let max = flow.iter().fold(0.0f32, |m, v| m.max(v.abs()));
        assert!(max < 0.05, "{algorithm:?}: max |flow| {max}");
    }
}

#[test]
fn mismatched_frames_are_rejected() {
    let a = RgbImage::new(8, 8);
    let b = RgbImage::new(8, 9);
    assert!(FlowEstimator::new(FlowAlgorithm::DenseInverseSearch)
        .estimate(&a, &b)
        .is_err());
}

#[test]
fn visualization_matches_flow_size() {
    let (old, new) = translated_pair();
    let flow = FlowEstimator::new(FlowAlgorithm::DenseInverseSearch)
        .estimate(&old, &new)
        .unwrap();
    let vis = to_visualization(&flow).unwrap();
    assert_eq!(vis.dimensions(), (W, H));
    assert!(vis.pixels().any(|p| p.0 != [0, 0, 0]));
}
