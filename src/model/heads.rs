//! Per-pixel evaluation primitives.
//!
//! The exported fully connected layers are applied as 1x1 convolutions over
//! the C x H x W feature map: one matrix multiply over the flattened spatial
//! axes.

use ndarray::{Array1, Array2, Array3, Axis};

use super::weights::{BatchNorm, Linear};
use crate::error::HeatmapError;

/// Apply a fully connected layer at every spatial position.
pub fn conv1x1(layer: &Linear, feats: &Array3<f32>) -> Result<Array3<f32>, HeatmapError> {
    let (c, h, w) = feats.dim();
    if c != layer.in_features() {
        return Err(HeatmapError::Inference(format!(
            "feature map has {c} channels, layer expects {}",
            layer.in_features()
        )));
    }

    let flat = feats
        .to_shape((c, h * w))
        .map_err(|e| HeatmapError::Inference(e.to_string()))?;
    let mut out = layer.weight.dot(&flat.view());
    out += &layer.bias.view().insert_axis(Axis(1));
    out.into_shape_with_order((layer.out_features(), h, w))
        .map_err(|e| HeatmapError::Inference(e.to_string()))
}

pub fn relu_inplace(map: &mut Array3<f32>) {
    map.mapv_inplace(|v| v.max(0.0));
}

pub fn tanh_inplace(map: &mut Array3<f32>) {
    map.mapv_inplace(f32::tanh);
}

/// Evaluation-mode batch normalization over the channel axis.
pub fn batchnorm_inplace(map: &mut Array3<f32>, norm: &BatchNorm) {
    for (c, mut channel) in map.axis_iter_mut(Axis(0)).enumerate() {
        let scale = norm.gamma[c] / (norm.var[c] + norm.eps).sqrt();
        let shift = norm.beta[c] - norm.mean[c] * scale;
        channel.mapv_inplace(|v| v * scale + shift);
    }
}

/// Softmax over the channel (class) axis, numerically stabilized.
pub fn softmax_channels(map: &Array3<f32>) -> Array3<f32> {
    let (k, h, w) = map.dim();
    let mut out = map.clone();
    for y in 0..h {
        for x in 0..w {
            let mut max = f32::NEG_INFINITY;
            for c in 0..k {
                max = max.max(out[[c, y, x]]);
            }
            let mut sum = 0.0;
            for c in 0..k {
                let e = (out[[c, y, x]] - max).exp();
                out[[c, y, x]] = e;
                sum += e;
            }
            for c in 0..k {
                out[[c, y, x]] /= sum;
            }
        }
    }
    out
}

/// 1-D Gaussian kernel, normalized to sum 1.
///
/// Sigma follows the torch convention for a given kernel size:
/// `0.3 * ((k - 1) * 0.5 - 1) + 0.8`.
pub fn gaussian_kernel(size: usize) -> Array1<f32> {
    debug_assert!(size % 2 == 1, "kernel size must be odd");
    let sigma = 0.3 * ((size as f32 - 1.0) * 0.5 - 1.0) + 0.8;
    let half = (size / 2) as isize;
    let mut kernel = Array1::<f32>::zeros(size);
    for (i, k) in kernel.iter_mut().enumerate() {
        let d = (i as isize - half) as f32;
        *k = (-d * d / (2.0 * sigma * sigma)).exp();
    }
    let sum = kernel.sum();
    kernel.mapv_inplace(|v| v / sum);
    kernel
}

/// Mirror index for reflect padding (no edge repeat).
fn reflect(i: isize, n: isize) -> usize {
    if n == 1 {
        return 0;
    }
    let mut i = i;
    // bounce until inside [0, n)
    loop {
        if i < 0 {
            i = -i;
        } else if i >= n {
            i = 2 * n - 2 - i;
        } else {
            return i as usize;
        }
    }
}

/// Separable Gaussian blur over the spatial axes of each channel.
///
/// Used as pooling over the feature map: smoother than average pooling,
/// fewer block artifacts in the rendered heatmaps. `kernel_size` 0 is a
/// no-op handled by the caller.
pub fn gaussian_blur(map: &Array3<f32>, kernel_size: usize) -> Array3<f32> {
    let kernel = gaussian_kernel(kernel_size);
    let half = (kernel_size / 2) as isize;
    let (c, h, w) = map.dim();
    let (hi, wi) = (h as isize, w as isize);

    // horizontal pass
    let mut pass1 = Array3::<f32>::zeros((c, h, w));
    for ch in 0..c {
        for y in 0..h {
            for x in 0..w {
                let mut acc = 0.0;
                for (k, &kv) in kernel.iter().enumerate() {
                    let sx = reflect(x as isize + k as isize - half, wi);
                    acc += map[[ch, y, sx]] * kv;
                }
                pass1[[ch, y, x]] = acc;
            }
        }
    }

    // vertical pass
    let mut out = Array3::<f32>::zeros((c, h, w));
    for ch in 0..c {
        for y in 0..h {
            for x in 0..w {
                let mut acc = 0.0;
                for (k, &kv) in kernel.iter().enumerate() {
                    let sy = reflect(y as isize + k as isize - half, hi);
                    acc += pass1[[ch, sy, x]] * kv;
                }
                out[[ch, y, x]] = acc;
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn layer(weight: Array2<f32>, bias: Array1<f32>) -> Linear {
        Linear { weight, bias }
    }

    #[test]
    fn conv1x1_matches_hand_computation() {
        // 2 -> 2 layer over a 1x2 map
        let l = layer(array![[1.0, 2.0], [0.5, -1.0]], array![0.1, 0.0]);
        let mut feats = Array3::<f32>::zeros((2, 1, 2));
        feats[[0, 0, 0]] = 1.0;
        feats[[1, 0, 0]] = 2.0;
        feats[[0, 0, 1]] = -1.0;
        feats[[1, 0, 1]] = 0.5;

        let out = conv1x1(&l, &feats).unwrap();
        assert_eq!(out.dim(), (2, 1, 2));
        // position (0,0): [1*1 + 2*2 + 0.1, 0.5*1 - 1*2] = [5.1, -1.5]
        assert!((out[[0, 0, 0]] - 5.1).abs() < 1e-6);
        assert!((out[[1, 0, 0]] + 1.5).abs() < 1e-6);
        // position (0,1): [-1 + 1 + 0.1, -0.5 - 0.5] = [0.1, -1.0]
        assert!((out[[0, 0, 1]] - 0.1).abs() < 1e-6);
        assert!((out[[1, 0, 1]] + 1.0).abs() < 1e-6);
    }

    #[test]
    fn conv1x1_rejects_channel_mismatch() {
        let l = layer(array![[1.0, 2.0]], array![0.0]);
        let feats = Array3::<f32>::zeros((3, 2, 2));
        assert!(conv1x1(&l, &feats).is_err());
    }

    #[test]
    fn relu_clamps_negatives() {
        let mut m = Array3::from_elem((1, 1, 2), -2.0);
        m[[0, 0, 1]] = 3.0;
        relu_inplace(&mut m);
        assert_eq!(m[[0, 0, 0]], 0.0);
        assert_eq!(m[[0, 0, 1]], 3.0);
    }

    #[test]
    fn identity_batchnorm_is_noop() {
        let norm = BatchNorm {
            gamma: array![1.0, 1.0],
            beta: array![0.0, 0.0],
            mean: array![0.0, 0.0],
            var: array![1.0, 1.0],
            eps: 0.0,
        };
        let mut m = Array3::from_elem((2, 2, 2), 0.75);
        let before = m.clone();
        batchnorm_inplace(&mut m, &norm);
        assert_eq!(m, before);
    }

    #[test]
    fn batchnorm_standardizes() {
        let norm = BatchNorm {
            gamma: array![2.0],
            beta: array![1.0],
            mean: array![3.0],
            var: array![4.0],
            eps: 0.0,
        };
        let mut m = Array3::from_elem((1, 1, 1), 5.0);
        batchnorm_inplace(&mut m, &norm);
        // 2 * (5 - 3) / 2 + 1 = 3
        assert!((m[[0, 0, 0]] - 3.0).abs() < 1e-6);
    }

    #[test]
    fn softmax_sums_to_one_per_pixel() {
        let mut m = Array3::<f32>::zeros((3, 2, 2));
        m[[0, 0, 0]] = 10.0;
        m[[1, 1, 1]] = -5.0;
        let s = softmax_channels(&m);
        for y in 0..2 {
            for x in 0..2 {
                let sum: f32 = (0..3).map(|c| s[[c, y, x]]).sum();
                assert!((sum - 1.0).abs() < 1e-5);
            }
        }
        // the dominant logit wins
        assert!(s[[0, 0, 0]] > 0.99);
    }

    #[test]
    fn softmax_survives_large_logits() {
        let mut m = Array3::<f32>::zeros((2, 1, 1));
        m[[0, 0, 0]] = 500.0;
        m[[1, 0, 0]] = 499.0;
        let s = softmax_channels(&m);
        assert!(s[[0, 0, 0]].is_finite());
        assert!((s[[0, 0, 0]] + s[[1, 0, 0]] - 1.0).abs() < 1e-5);
    }

    #[test]
    fn gaussian_kernel_sums_to_one_and_is_symmetric() {
        for size in [3usize, 5, 15] {
            let k = gaussian_kernel(size);
            assert!((k.sum() - 1.0).abs() < 1e-5, "size {size}");
            for i in 0..size / 2 {
                assert!((k[i] - k[size - 1 - i]).abs() < 1e-6);
            }
            // peak at center
            assert!(k[size / 2] >= k[0]);
        }
    }

    #[test]
    fn blur_of_constant_map_is_constant() {
        let m = Array3::from_elem((2, 6, 6), 0.4);
        let b = gaussian_blur(&m, 5);
        for v in b.iter() {
            assert!((v - 0.4).abs() < 1e-5);
        }
    }

    #[test]
    fn blur_preserves_total_mass_of_centered_impulse() {
        // impulse far from the border: reflect padding untouched
        let mut m = Array3::<f32>::zeros((1, 11, 11));
        m[[0, 5, 5]] = 1.0;
        let b = gaussian_blur(&m, 3);
        let total: f32 = b.iter().sum();
        assert!((total - 1.0).abs() < 1e-5);
        // peak stays at the impulse
        assert!(b[[0, 5, 5]] > b[[0, 5, 6]]);
    }

    #[test]
    fn reflect_indexing_bounces() {
        assert_eq!(reflect(-1, 5), 1);
        assert_eq!(reflect(-2, 5), 2);
        assert_eq!(reflect(5, 5), 3);
        assert_eq!(reflect(6, 5), 2);
        assert_eq!(reflect(2, 5), 2);
        assert_eq!(reflect(-3, 1), 0);
    }
}
