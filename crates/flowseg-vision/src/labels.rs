use std::sync::Arc;

use flowseg_core::{FrameSize, GeneratorError};
use image::{DynamicImage, RgbImage};
use ndarray::Array3;

use crate::palette::{LabelKey, Palette};

/// A raw label value, keyed the way the palette expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LabelPixel {
    Id(u8),
    Color([u8; 3]),
}

/// Channel index for `pixel`, or `None` when the palette does not know it.
pub fn resolve_class_id(pixel: LabelPixel, palette: &Palette) -> Option<usize> {
    match pixel {
        LabelPixel::Id(id) => palette.channel_for_id(id),
        LabelPixel::Color(rgb) => palette.channel_for_color(rgb),
    }
}

/// Decoded label raster, row-major.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelImage {
    size: FrameSize,
    pixels: Vec<LabelPixel>,
}

impl LabelImage {
    pub fn from_pixels(size: FrameSize, pixels: Vec<LabelPixel>) -> Result<Self, GeneratorError> {
        size.validate()?;
        if pixels.len() != size.pixels() {
            return Err(GeneratorError::invalid_config(format!(
                "label of size {size} needs {} pixels, got {}",
                size.pixels(),
                pixels.len()
            )));
        }
        Ok(Self { size, pixels })
    }

    /// Class-id labels are read from the luma channel, color labels from RGB.
    pub fn from_dynamic(image: &DynamicImage, key: LabelKey) -> Result<Self, GeneratorError> {
        let size = FrameSize::new(image.height(), image.width());
        let pixels = match key {
            LabelKey::ClassId => image
                .to_luma8()
                .pixels()
                .map(|p| LabelPixel::Id(p[0]))
                .collect(),
            LabelKey::Color => image
                .to_rgb8()
                .pixels()
                .map(|p| LabelPixel::Color(p.0))
                .collect(),
        };
        Self::from_pixels(size, pixels)
    }

    pub fn size(&self) -> FrameSize {
        self.size
    }

    pub fn get(&self, y: u32, x: u32) -> LabelPixel {
        self.pixels[y as usize * self.size.width as usize + x as usize]
    }

    /// Nearest-neighbour resize; never blends class values.
    pub fn resize_nearest(&self, size: FrameSize) -> Self {
        if size == self.size {
            return self.clone();
        }
        let src_w = self.size.width as u64;
        let src_h = self.size.height as u64;
        let nearest = |dst: u32, dst_len: u32, src_len: u64| -> u32 {
            let v = ((2 * dst as u64 + 1) * src_len) / (2 * dst_len as u64);
            v.min(src_len - 1) as u32
        };
        let mut pixels = Vec::with_capacity(size.pixels());
        for y in 0..size.height {
            let sy = nearest(y, size.height, src_h);
            for x in 0..size.width {
                pixels.push(self.get(sy, nearest(x, size.width, src_w)));
            }
        }
        Self { size, pixels }
    }

    pub fn flip_horizontal(&self) -> Self {
        let w = self.size.width as usize;
        let pixels = self
            .pixels
            .chunks(w)
            .flat_map(|row| row.iter().rev().copied())
            .collect();
        Self {
            size: self.size,
            pixels,
        }
    }
}

/// One-hot target `(H, W, C)`. Unresolved pixels are all-zero and counted.
#[derive(Debug, Clone)]
pub struct OneHotTensor {
    pub data: Array3<f32>,
    pub unresolved_pixels: u64,
}

impl OneHotTensor {
    pub fn size(&self) -> FrameSize {
        let (h, w, _) = self.data.dim();
        FrameSize::new(h as u32, w as u32)
    }

    pub fn n_classes(&self) -> usize {
        self.data.dim().2
    }
}

#[derive(Debug, Clone)]
pub struct LabelEncoder {
    palette: Arc<Palette>,
}

impl LabelEncoder {
    pub fn new(palette: Arc<Palette>) -> Self {
        Self { palette }
    }

    pub fn palette(&self) -> &Palette {
        &self.palette
    }

    pub fn read(&self, image: &DynamicImage) -> Result<LabelImage, GeneratorError> {
        LabelImage::from_dynamic(image, self.palette.key())
    }

    /// Resize the full-resolution label to `target`, mirror it when `flip` is set, then one-hot.
    pub fn encode(
        &self,
        label: &LabelImage,
        target: FrameSize,
        flip: bool,
    ) -> Result<OneHotTensor, GeneratorError> {
        target.validate()?;
        let resized = label.resize_nearest(target);
        let resized = if flip {
            resized.flip_horizontal()
        } else {
            resized
        };

        let (h, w) = (target.height as usize, target.width as usize);
        let mut data = Array3::<f32>::zeros((h, w, self.palette.n_classes()));
        let mut unresolved_pixels = 0u64;
        for (i, pixel) in resized.pixels.iter().enumerate() {
            match resolve_class_id(*pixel, &self.palette) {
                Some(ch) => data[[i / w, i % w, ch]] = 1.0,
                None => unresolved_pixels += 1,
            }
        }
        Ok(OneHotTensor {
            data,
            unresolved_pixels,
        })
    }

    /// One tensor per factor, each at `base / factor` and each resized from the full-resolution label.
    pub fn encode_multi_scale(
        &self,
        label: &LabelImage,
        base: FrameSize,
        factors: &[u32],
        flip: bool,
    ) -> Result<Vec<OneHotTensor>, GeneratorError> {
        if factors.is_empty() {
            return Err(GeneratorError::invalid_config("at least one label scale is required"));
        }
        factors
            .iter()
            .map(|&factor| self.encode(label, base.scaled_down(factor)?, flip))
            .collect()
    }

    pub fn decode(&self, one_hot: &Array3<f32>) -> Result<RgbImage, GeneratorError> {
        decode(one_hot, &self.palette)
    }
}

/// Per-pixel argmax mapped to the palette color; all-zero pixels render black.
pub fn decode(one_hot: &Array3<f32>, palette: &Palette) -> Result<RgbImage, GeneratorError> {
    let (h, w, c) = one_hot.dim();
    if c != palette.n_classes() {
        return Err(GeneratorError::invalid_config(format!(
            "one-hot has {c} channels, palette has {}",
            palette.n_classes()
        )));
    }
    let width = u32::try_from(w).map_err(|_| GeneratorError::invalid_config("width overflow"))?;
    let height = u32::try_from(h).map_err(|_| GeneratorError::invalid_config("height overflow"))?;

    Ok(RgbImage::from_fn(width, height, |x, y| {
        let (x, y) = (x as usize, y as usize);
        let mut best: Option<(usize, f32)> = None;
        for ch in 0..c {
            let v = one_hot[[y, x, ch]];
            if v > 0.0 && best.map_or(true, |(_, b)| v > b) {
                best = Some((ch, v));
            }
        }
        let color = best
            .and_then(|(ch, _)| palette.color(ch))
            .unwrap_or([0, 0, 0]);
        image::Rgb(color)
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(w: u32, h: u32, f: impl Fn(u32, u32) -> u8) -> LabelImage {
        let pixels = (0..h)
            .flat_map(|y| (0..w).map(move |x| (x, y)))
            .map(|(x, y)| LabelPixel::Id(f(x, y)))
            .collect();
        LabelImage::from_pixels(FrameSize::new(h, w), pixels).unwrap()
    }

    fn encoder() -> LabelEncoder {
        LabelEncoder::new(Arc::new(Palette::cityscapes(LabelKey::ClassId)))
    }

    #[test]
    fn nearest_resize_never_invents_values() {
        let label = ids(4, 4, |x, _| if x < 2 { 7 } else { 26 });
        let small = label.resize_nearest(FrameSize::new(2, 2));
        assert_eq!(small.get(0, 0), LabelPixel::Id(7));
        assert_eq!(small.get(0, 1), LabelPixel::Id(26));
        let big = label.resize_nearest(FrameSize::new(8, 8));
        assert_eq!(big.get(0, 3), LabelPixel::Id(7));
        assert_eq!(big.get(0, 4), LabelPixel::Id(26));
    }

    #[test]
    fn one_hot_rows_sum_to_one_when_resolved() {
        let label = ids(6, 4, |x, y| ((x + y) % 34) as u8);
        let t = encoder().encode(&label, FrameSize::new(4, 6), false).unwrap();
        assert_eq!(t.data.dim(), (4, 6, 34));
        assert_eq!(t.unresolved_pixels, 0);
        for y in 0..4 {
            for x in 0..6 {
                let s: f32 = (0..34).map(|c| t.data[[y, x, c]]).sum();
                assert_eq!(s, 1.0);
            }
        }
        assert_eq!(t.data[[1, 2, 3]], 1.0);
    }

    #[test]
    fn unknown_values_are_zero_and_counted() {
        let label = ids(2, 1, |x, _| if x == 0 { 200 } else { 7 });
        let t = encoder().encode(&label, FrameSize::new(1, 2), false).unwrap();
        assert_eq!(t.unresolved_pixels, 1);
        assert_eq!(t.data.slice(ndarray::s![0, 0, ..]).sum(), 0.0);
        assert_eq!(t.data[[0, 1, 7]], 1.0);
    }

    #[test]
    fn color_labels_resolve_by_rgb() {
        let enc = LabelEncoder::new(Arc::new(Palette::cityscapes(LabelKey::Color)));
        let img = RgbImage::from_fn(2, 1, |x, _| {
            if x == 0 {
                image::Rgb([70, 130, 180])
            } else {
                image::Rgb([0, 0, 142])
            }
        });
        let label = enc.read(&DynamicImage::ImageRgb8(img)).unwrap();
        let t = enc.encode(&label, FrameSize::new(1, 2), false).unwrap();
        assert_eq!(t.data[[0, 0, 23]], 1.0);
        assert_eq!(t.data[[0, 1, 26]], 1.0);
    }

    #[test]
    fn decode_maps_argmax_and_blacks_out_empty_pixels() {
        let enc = encoder();
        let mut one_hot = Array3::<f32>::zeros((1, 3, 34));
        one_hot[[0, 0, 7]] = 1.0;
        one_hot[[0, 1, 23]] = 0.6;
        one_hot[[0, 1, 26]] = 0.4;
        let img = enc.decode(&one_hot).unwrap();
        assert_eq!(img.get_pixel(0, 0).0, [128, 64, 128]);
        assert_eq!(img.get_pixel(1, 0).0, [70, 130, 180]);
        assert_eq!(img.get_pixel(2, 0).0, [0, 0, 0]);
    }

    #[test]
    fn decode_rejects_channel_mismatch() {
        let err = encoder().decode(&Array3::zeros((1, 1, 3))).unwrap_err();
        assert!(matches!(err, GeneratorError::InvalidConfiguration(_)));
    }

    #[test]
    fn multi_scale_requires_exact_division() {
        let label = ids(8, 8, |_, _| 7);
        let err = encoder()
            .encode_multi_scale(&label, FrameSize::new(10, 12), &[1, 4], false)
            .unwrap_err();
        assert!(matches!(err, GeneratorError::InvalidConfiguration(_)));
    }
}
