//! In-memory video clips for demos and tests: a textured frame drifting right by
//! `speed` pixels per frame, labelled with vertical class bands that drift with it.

use std::path::PathBuf;

use flowseg_core::{FrameSize, MemoryIndex, Sample, SplitName};
use flowseg_vision::MemoryImageReader;
use image::{GrayImage, Luma, Rgb, RgbImage};

/// Class ids painted into synthetic labels (Cityscapes road, sidewalk, building, vegetation,
/// sky, car).
pub const BAND_IDS: [u8; 6] = [7, 8, 11, 21, 23, 26];

#[derive(Debug, Clone, Copy)]
pub struct SyntheticClip {
    pub size: FrameSize,
    pub samples: usize,
    /// Horizontal drift between consecutive frames, in pixels.
    pub speed: u32,
}

fn texture(x: f32, y: f32) -> [u8; 3] {
    let v = |phase: f32| {
        (128.0 + 50.0 * (0.2 * x + phase).sin() + 40.0 * (0.15 * y).cos()
            + 20.0 * (0.1 * (x + y)).sin())
        .round()
        .clamp(0.0, 255.0) as u8
    };
    [v(0.0), v(0.7), v(1.4)]
}

impl SyntheticClip {
    pub fn frame(&self, t: u32) -> RgbImage {
        let shift = (t * self.speed) as f32;
        RgbImage::from_fn(self.size.width, self.size.height, |x, y| {
            Rgb(texture(x as f32 - shift, y as f32))
        })
    }

    pub fn label(&self, t: u32) -> GrayImage {
        let w = self.size.width;
        let shift = t * self.speed;
        GrayImage::from_fn(w, self.size.height, |x, _| {
            let band = ((x + w - shift % w) % w) * BAND_IDS.len() as u32 / w;
            Luma([BAND_IDS[band as usize]])
        })
    }

    fn path(split: SplitName, kind: &str, i: usize) -> PathBuf {
        PathBuf::from(format!("synthetic/{split}/{i:05}_{kind}.png"))
    }

    /// Sample `i` pairs frames `i` and `i + 1`; the label belongs to frame `i + 1`.
    pub fn build(&self, splits: &[SplitName]) -> (MemoryIndex, MemoryImageReader) {
        let mut index = MemoryIndex::new();
        let mut reader = MemoryImageReader::new();
        for &split in splits {
            let mut samples = Vec::with_capacity(self.samples);
            for i in 0..self.samples {
                let sample = Sample::new(
                    Self::path(split, "prev", i),
                    Self::path(split, "curr", i),
                    Self::path(split, "label", i),
                );
                let t = i as u32;
                reader.insert(sample.prev_frame.clone(), self.frame(t));
                reader.insert(sample.curr_frame.clone(), self.frame(t + 1));
                reader.insert(sample.label.clone(), self.label(t + 1));
                samples.push(sample);
            }
            index.insert(split, samples);
        }
        (index, reader)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowseg_core::DatasetIndex;

    #[test]
    fn builds_requested_splits_only() {
        let clip = SyntheticClip {
            size: FrameSize::new(8, 12),
            samples: 3,
            speed: 1,
        };
        let (index, reader) = clip.build(&[SplitName::Train]);
        assert_eq!(index.load(SplitName::Train).unwrap().len(), 3);
        assert!(index.load(SplitName::Val).unwrap().is_empty());
        assert_eq!(reader.len(), 9);
    }

    #[test]
    fn frames_drift_by_speed() {
        let clip = SyntheticClip {
            size: FrameSize::new(8, 16),
            samples: 1,
            speed: 2,
        };
        let (a, b) = (clip.frame(0), clip.frame(1));
        assert_eq!(b.get_pixel(5, 3), a.get_pixel(3, 3));
    }
}
