//! Convolutional feature extraction.
//!
//! The backbone is a fully convolutional network (pooling and head stripped)
//! that downsamples the slide by 32x and emits a C x H x W feature map. The
//! production implementation runs an ONNX export through `ort`, behind the
//! `onnx` cargo feature; tests use [`MockBackbone`].

pub mod cache;

pub use cache::FeatureCache;

use image::RgbImage;
use ndarray::{Array3, Array4};

use crate::error::HeatmapError;

/// Spatial downsampling factor of the backbone (ResNet-style, 5 stride-2 stages).
pub const DOWNSAMPLE: u32 = 32;

/// ImageNet channel means / standard deviations, applied to 0..1 input.
pub const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
pub const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// Turns a working-resolution slide image into a C x H x W feature map.
pub trait FeatureExtractor: Send + Sync {
    fn extract(&self, slide: &RgbImage) -> Result<Array3<f32>, HeatmapError>;
}

/// Convert an RGB image to a normalized NCHW tensor (N = 1).
pub fn imagenet_normalize(slide: &RgbImage) -> Array4<f32> {
    let (w, h) = (slide.width() as usize, slide.height() as usize);
    let mut tensor = Array4::<f32>::zeros((1, 3, h, w));
    for (x, y, pixel) in slide.enumerate_pixels() {
        for c in 0..3 {
            let v = pixel.0[c] as f32 / 255.0;
            tensor[[0, c, y as usize, x as usize]] = (v - IMAGENET_MEAN[c]) / IMAGENET_STD[c];
        }
    }
    tensor
}

// ═══════════════════════════════════════════════════════════
// ONNX backbone (behind the `onnx` feature)
// ═══════════════════════════════════════════════════════════

#[cfg(feature = "onnx")]
mod onnx {
    use std::path::Path;
    use std::sync::Mutex;

    use image::RgbImage;
    use ndarray::Array3;
    use ort::session::Session;

    use super::{imagenet_normalize, FeatureExtractor};
    use crate::error::HeatmapError;

    /// Fully convolutional backbone run through ONNX Runtime.
    ///
    /// Expects `backbone.onnx` in the model directory: input `[1,3,H,W]`
    /// (ImageNet-normalized), output `[1,C,H/32,W/32]`.
    ///
    /// Interior mutability (Mutex) because `ort::Session::run` requires
    /// `&mut self` while [`FeatureExtractor`] exposes `&self`.
    pub struct OnnxBackbone {
        session: Mutex<Session>,
    }

    impl OnnxBackbone {
        pub fn load(model_dir: &Path, force_cpu: bool) -> Result<Self, HeatmapError> {
            let model_path = model_dir.join("backbone.onnx");
            if !model_path.exists() {
                return Err(HeatmapError::ModelNotFound(model_path));
            }

            let mut builder = Session::builder()
                .map_err(|e: ort::Error| HeatmapError::ModelLoad(e.to_string()))?;

            if !force_cpu {
                // GPU if a CUDA runtime is present; silently falls back to
                // CPU when registration fails.
                use ort::execution_providers::CUDAExecutionProvider;
                builder = builder
                    .with_execution_providers([CUDAExecutionProvider::default().build()])
                    .map_err(|e: ort::Error| HeatmapError::ModelLoad(e.to_string()))?;
            }

            let threads = std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1);
            let session = builder
                .with_intra_threads(threads)
                .map_err(|e: ort::Error| HeatmapError::ModelLoad(e.to_string()))?
                .commit_from_file(&model_path)
                .map_err(|e: ort::Error| {
                    HeatmapError::ModelLoad(format!("ONNX load failed: {e}"))
                })?;

            tracing::info!(path = %model_path.display(), force_cpu, "Backbone loaded");
            Ok(Self {
                session: Mutex::new(session),
            })
        }
    }

    impl FeatureExtractor for OnnxBackbone {
        fn extract(&self, slide: &RgbImage) -> Result<Array3<f32>, HeatmapError> {
            use ort::value::TensorRef;

            let input = imagenet_normalize(slide);
            let input_tensor = TensorRef::from_array_view(&input)
                .map_err(|e| HeatmapError::Inference(e.to_string()))?;

            let mut session = self
                .session
                .lock()
                .map_err(|_| HeatmapError::Inference("session lock poisoned".into()))?;

            let outputs = session
                .run(ort::inputs![input_tensor])
                .map_err(|e| HeatmapError::Inference(format!("ONNX inference failed: {e}")))?;

            let (shape, data) = outputs[0]
                .try_extract_tensor::<f32>()
                .map_err(|e| HeatmapError::Inference(format!("output extraction: {e}")))?;

            if shape.len() != 4 || shape[0] != 1 {
                return Err(HeatmapError::Inference(format!(
                    "unexpected backbone output shape {shape:?}, expected [1, C, H, W]"
                )));
            }
            let (c, h, w) = (shape[1] as usize, shape[2] as usize, shape[3] as usize);

            Array3::from_shape_vec((c, h, w), data.to_vec())
                .map_err(|e| HeatmapError::Inference(e.to_string()))
        }
    }
}

#[cfg(feature = "onnx")]
pub use onnx::OnnxBackbone;

// ═══════════════════════════════════════════════════════════
// Mock backbone (testing)
// ═══════════════════════════════════════════════════════════

/// Deterministic stand-in for the convolutional backbone.
///
/// Each output cell is the mean brightness of the corresponding 32x32 input
/// block, scaled per channel. Downsampling geometry matches the real
/// backbone, so mask/render code paths are exercised with true shapes.
pub struct MockBackbone {
    channels: usize,
}

impl MockBackbone {
    pub fn new(channels: usize) -> Self {
        Self { channels }
    }
}

impl FeatureExtractor for MockBackbone {
    fn extract(&self, slide: &RgbImage) -> Result<Array3<f32>, HeatmapError> {
        let d = DOWNSAMPLE;
        let h = (slide.height() / d) as usize;
        let w = (slide.width() / d) as usize;
        if h == 0 || w == 0 {
            return Err(HeatmapError::Inference(format!(
                "slide {}x{} smaller than one {d}x{d} feature cell",
                slide.width(),
                slide.height()
            )));
        }

        let mut feats = Array3::<f32>::zeros((self.channels, h, w));
        for gy in 0..h {
            for gx in 0..w {
                let mut sum = 0u64;
                for y in 0..d {
                    for x in 0..d {
                        sum += slide.get_pixel(gx as u32 * d + x, gy as u32 * d + y).0[0] as u64;
                    }
                }
                let mean = sum as f32 / (d * d) as f32 / 255.0;
                for c in 0..self.channels {
                    feats[[c, gy, gx]] = mean * (c as f32 + 1.0) / self.channels as f32;
                }
            }
        }
        Ok(feats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn imagenet_normalize_maps_channel_extremes() {
        let img = RgbImage::from_pixel(2, 2, Rgb([255, 0, 128]));
        let t = imagenet_normalize(&img);
        assert_eq!(t.shape(), &[1, 3, 2, 2]);

        let r = t[[0, 0, 0, 0]];
        let g = t[[0, 1, 0, 0]];
        assert!((r - (1.0 - 0.485) / 0.229).abs() < 1e-5);
        assert!((g - (0.0 - 0.456) / 0.224).abs() < 1e-5);
    }

    #[test]
    fn mock_backbone_downsamples_by_32() {
        let img = RgbImage::from_pixel(128, 96, Rgb([100, 100, 100]));
        let feats = MockBackbone::new(4).extract(&img).unwrap();
        assert_eq!(feats.shape(), &[4, 3, 4]);
    }

    #[test]
    fn mock_backbone_reflects_brightness() {
        let mut img = RgbImage::from_pixel(64, 32, Rgb([0, 0, 0]));
        for y in 0..32 {
            for x in 32..64 {
                img.put_pixel(x, y, Rgb([255, 255, 255]));
            }
        }
        let feats = MockBackbone::new(1).extract(&img).unwrap();
        assert!(feats[[0, 0, 0]] < 0.01);
        assert!(feats[[0, 0, 1]] > 0.99);
    }

    #[test]
    fn mock_backbone_rejects_tiny_slides() {
        let img = RgbImage::from_pixel(16, 16, Rgb([0, 0, 0]));
        assert!(MockBackbone::new(1).extract(&img).is_err());
    }

    #[test]
    fn mock_backbone_is_deterministic() {
        let img = RgbImage::from_pixel(64, 64, Rgb([42, 42, 42]));
        let a = MockBackbone::new(2).extract(&img).unwrap();
        let b = MockBackbone::new(2).extract(&img).unwrap();
        assert_eq!(a, b);
    }
}
