use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use fast_image_resize::images::Image as FirImage;
use fast_image_resize::{
    FilterType as FirFilterType, PixelType as FirPixelType, ResizeAlg as FirResizeAlg,
    ResizeOptions as FirResizeOptions, Resizer as FirResizer,
};
use flowseg_core::{FrameSize, GeneratorError};
use image::imageops::FilterType as ImageFilterType;
use image::{DynamicImage, RgbImage};
use ndarray::{Array2, Array3};
use serde::{Deserialize, Serialize};

/// Source of decoded images. Decoding failures are fatal for the sample that needed the image.
pub trait ImageReader: Send + Sync + 'static {
    fn read(&self, path: &Path) -> Result<DynamicImage, GeneratorError>;
}

/// Decodes files from the local filesystem with the `image` crate.
#[derive(Debug, Clone, Copy, Default)]
pub struct FsImageReader;

impl ImageReader for FsImageReader {
    fn read(&self, path: &Path) -> Result<DynamicImage, GeneratorError> {
        image::open(path).map_err(|e| GeneratorError::decode(path, e))
    }
}

/// Pre-decoded images keyed by path. Used by tests and tools that synthesize frames.
#[derive(Debug, Clone, Default)]
pub struct MemoryImageReader {
    images: HashMap<PathBuf, DynamicImage>,
}

impl MemoryImageReader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, path: impl Into<PathBuf>, image: impl Into<DynamicImage>) {
        self.images.insert(path.into(), image.into());
    }

    pub fn with(mut self, path: impl Into<PathBuf>, image: impl Into<DynamicImage>) -> Self {
        self.insert(path, image);
        self
    }

    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }
}

impl ImageReader for MemoryImageReader {
    fn read(&self, path: &Path) -> Result<DynamicImage, GeneratorError> {
        self.images
            .get(path)
            .cloned()
            .ok_or_else(|| GeneratorError::decode(path, "no such image"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResizeBackend {
    #[default]
    FastImageResize,
    Image,
}

impl ResizeBackend {
    pub fn from_name(name: &str) -> Result<Self, GeneratorError> {
        match name.trim().to_ascii_lowercase().as_str() {
            "" | "fast" | "fir" | "fast_image_resize" => Ok(ResizeBackend::FastImageResize),
            "image" => Ok(ResizeBackend::Image),
            other => Err(GeneratorError::invalid_config(format!(
                "unsupported resize backend {other:?} (expected: fast_image_resize|image)"
            ))),
        }
    }
}

/// Frame loading and pixel transforms. Every operation is pure.
#[derive(Clone)]
pub struct ImagePreprocessor {
    reader: Arc<dyn ImageReader>,
    backend: ResizeBackend,
}

impl std::fmt::Debug for ImagePreprocessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImagePreprocessor")
            .field("backend", &self.backend)
            .finish_non_exhaustive()
    }
}

impl ImagePreprocessor {
    pub fn new(reader: Arc<dyn ImageReader>) -> Self {
        Self {
            reader,
            backend: ResizeBackend::default(),
        }
    }

    pub fn with_backend(mut self, backend: ResizeBackend) -> Self {
        self.backend = backend;
        self
    }

    pub fn backend(&self) -> ResizeBackend {
        self.backend
    }

    /// Decodes `path` as-is. Labels go through here so their pixel values are not converted.
    pub fn load_raw(&self, path: &Path) -> Result<DynamicImage, GeneratorError> {
        self.reader.read(path)
    }

    pub fn load(&self, path: &Path) -> Result<RgbImage, GeneratorError> {
        Ok(self.reader.read(path)?.to_rgb8())
    }

    /// Load, resize to `size`, then mirror when `flip` is set.
    pub fn prepare(
        &self,
        path: &Path,
        size: FrameSize,
        flip: bool,
    ) -> Result<RgbImage, GeneratorError> {
        let frame = self.resize(&self.load(path)?, size)?;
        Ok(if flip { Self::flip(&frame) } else { frame })
    }

    pub fn resize(&self, image: &RgbImage, size: FrameSize) -> Result<RgbImage, GeneratorError> {
        size.validate()?;
        if image.width() == 0 || image.height() == 0 {
            return Err(GeneratorError::invalid_config("cannot resize an empty image"));
        }
        if image.dimensions() == (size.width, size.height) {
            return Ok(image.clone());
        }
        match self.backend {
            ResizeBackend::FastImageResize => {
                let src_image = FirImage::from_vec_u8(
                    image.width(),
                    image.height(),
                    image.as_raw().clone(),
                    FirPixelType::U8x3,
                )
                .map_err(|e| {
                    GeneratorError::invalid_config(format!("fast resize source init failed: {e}"))
                })?;
                let mut dst_image = FirImage::new(size.width, size.height, FirPixelType::U8x3);
                let mut resizer = FirResizer::new();
                let resize_options = FirResizeOptions::new()
                    .resize_alg(FirResizeAlg::Convolution(FirFilterType::Bilinear));
                resizer
                    .resize(&src_image, &mut dst_image, &resize_options)
                    .map_err(|e| {
                        GeneratorError::invalid_config(format!("fast resize failed: {e}"))
                    })?;
                RgbImage::from_raw(size.width, size.height, dst_image.into_vec()).ok_or_else(
                    || GeneratorError::invalid_config("resized rgb buffer shape mismatch"),
                )
            }
            ResizeBackend::Image => Ok(image::imageops::resize(
                image,
                size.width,
                size.height,
                ImageFilterType::Triangle,
            )),
        }
    }

    pub fn flip(image: &RgbImage) -> RgbImage {
        image::imageops::flip_horizontal(image)
    }
}

pub const NORMALIZE_SCALE: f32 = 127.5;

/// `x / 127.5 - 1.0`, laid out as `(H, W, 3)`.
pub fn normalize(image: &RgbImage) -> Array3<f32> {
    let (w, h) = image.dimensions();
    Array3::from_shape_fn((h as usize, w as usize, 3), |(y, x, c)| {
        f32::from(image.get_pixel(x as u32, y as u32)[c]) / NORMALIZE_SCALE - 1.0
    })
}

/// Inverse of [`normalize`]; out-of-range values are clamped.
pub fn denormalize(array: &Array3<f32>) -> Result<RgbImage, GeneratorError> {
    let (h, w, c) = array.dim();
    if c != 3 {
        return Err(GeneratorError::invalid_config(format!(
            "denormalize expects 3 channels, got {c}"
        )));
    }
    let width = u32::try_from(w).map_err(|_| GeneratorError::invalid_config("width overflow"))?;
    let height = u32::try_from(h).map_err(|_| GeneratorError::invalid_config("height overflow"))?;
    let raw: Vec<u8> = array
        .iter()
        .map(|v| ((v + 1.0) * NORMALIZE_SCALE).round().clamp(0.0, 255.0) as u8)
        .collect();
    RgbImage::from_raw(width, height, raw)
        .ok_or_else(|| GeneratorError::invalid_config("denormalized buffer shape mismatch"))
}

/// Rec. 601 luma in `[0, 255]`.
pub fn to_gray(image: &RgbImage) -> Array2<f32> {
    let (w, h) = image.dimensions();
    Array2::from_shape_fn((h as usize, w as usize), |(y, x)| {
        let p = image.get_pixel(x as u32, y as u32);
        0.299 * f32::from(p[0]) + 0.587 * f32::from(p[1]) + 0.114 * f32::from(p[2])
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gradient(w: u32, h: u32) -> RgbImage {
        RgbImage::from_fn(w, h, |x, y| image::Rgb([(x * 10) as u8, (y * 20) as u8, 7]))
    }

    #[test]
    fn normalize_maps_into_unit_range_and_back() {
        let img = RgbImage::from_fn(3, 2, |x, y| {
            image::Rgb([0, 255, (x * 40 + y * 90) as u8])
        });
        let arr = normalize(&img);
        assert_eq!(arr.dim(), (2, 3, 3));
        assert_eq!(arr[[0, 0, 0]], -1.0);
        assert_eq!(arr[[1, 2, 1]], 1.0);
        assert!(arr.iter().all(|v| (-1.0..=1.0).contains(v)));
        assert_eq!(denormalize(&arr).unwrap(), img);
    }

    #[test]
    fn denormalize_clamps_out_of_range() {
        let arr = Array3::from_shape_vec((1, 1, 3), vec![-3.0, 0.0, 9.0]).unwrap();
        let img = denormalize(&arr).unwrap();
        assert_eq!(img.get_pixel(0, 0).0, [0, 128, 255]);
    }

    #[test]
    fn denormalize_rejects_wrong_channel_count() {
        let arr = Array3::<f32>::zeros((2, 2, 2));
        assert!(matches!(
            denormalize(&arr),
            Err(GeneratorError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn flip_mirrors_columns() {
        let img = gradient(4, 3);
        let flipped = ImagePreprocessor::flip(&img);
        for y in 0..3 {
            for x in 0..4 {
                assert_eq!(flipped.get_pixel(x, y), img.get_pixel(3 - x, y));
            }
        }
    }

    #[test]
    fn resize_hits_requested_size_with_both_backends() {
        let reader = Arc::new(MemoryImageReader::new());
        let img = gradient(16, 8);
        for backend in [ResizeBackend::FastImageResize, ResizeBackend::Image] {
            let pre = ImagePreprocessor::new(reader.clone()).with_backend(backend);
            let out = pre.resize(&img, FrameSize::new(4, 8)).unwrap();
            assert_eq!(out.dimensions(), (8, 4));
        }
    }

    #[test]
    fn resize_rejects_zero_size() {
        let pre = ImagePreprocessor::new(Arc::new(MemoryImageReader::new()));
        let err = pre.resize(&gradient(4, 4), FrameSize::new(0, 4)).unwrap_err();
        assert!(matches!(err, GeneratorError::InvalidConfiguration(_)));
    }

    #[test]
    fn missing_image_is_a_decode_error() {
        let pre = ImagePreprocessor::new(Arc::new(MemoryImageReader::new()));
        let err = pre.load(Path::new("nope.png")).unwrap_err();
        assert!(matches!(err, GeneratorError::ImageDecode { .. }));
    }

    #[test]
    fn prepare_flips_after_resize() {
        let reader = MemoryImageReader::new().with("a.png", gradient(8, 4));
        let pre = ImagePreprocessor::new(Arc::new(reader));
        let size = FrameSize::new(4, 8);
        let plain = pre.prepare(Path::new("a.png"), size, false).unwrap();
        let flipped = pre.prepare(Path::new("a.png"), size, true).unwrap();
        assert_eq!(ImagePreprocessor::flip(&plain), flipped);
    }

    #[test]
    fn resize_backend_names() {
        assert_eq!(
            ResizeBackend::from_name("fir").unwrap(),
            ResizeBackend::FastImageResize
        );
        assert_eq!(ResizeBackend::from_name("image").unwrap(), ResizeBackend::Image);
        assert!(ResizeBackend::from_name("cuda").is_err());
    }
}
