//! Cross-slide normalization.
//!
//! Scaling parameters are computed from the masked values of every slide in
//! the batch, so heatmaps of different slides are directly comparable.

use ndarray::{Array2, Axis};
use tracing::{debug, info};

use super::SlideMaps;
use crate::config::HeatmapConfig;
use crate::error::HeatmapError;

/// Quantile with linear interpolation between order statistics
/// (the torch / numpy "linear" convention). `None` for an empty input.
pub fn quantile(values: &[f32], q: f64) -> Option<f32> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

    let pos = q.clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    if lo == hi {
        return Some(sorted[lo]);
    }
    let frac = (pos - lo as f64) as f32;
    Some(sorted[lo] * (1.0 - frac) + sorted[hi] * frac)
}

/// Batch-wide scaling parameters.
#[derive(Debug, Clone, Copy)]
pub struct NormalizationStats {
    /// Attention value mapped to 0.
    pub att_lower: f32,
    /// Attention value mapped to 1.
    pub att_upper: f32,
    /// Mean of masked true-class scores.
    pub score_mean: f32,
    /// Standard deviation of masked true-class scores.
    pub score_std: f32,
}

impl NormalizationStats {
    /// Collect statistics over the masked cells of every slide.
    pub fn collect(
        maps: &[SlideMaps],
        true_class_idx: usize,
        config: &HeatmapConfig,
    ) -> Result<Self, HeatmapError> {
        let mut attentions = Vec::new();
        let mut true_scores = Vec::new();
        for slide in maps {
            let class_scores = slide.scores.index_axis(Axis(0), true_class_idx);
            for ((att, score), &fg) in slide
                .attention
                .iter()
                .zip(class_scores.iter())
                .zip(slide.mask.iter())
            {
                if fg {
                    attentions.push(*att);
                    true_scores.push(*score);
                }
            }
        }

        if attentions.is_empty() {
            return Err(HeatmapError::ImageProcessing(
                "no foreground cells in any slide; lower --mask-threshold?".into(),
            ));
        }

        let att_lower = quantile(&attentions, config.att_lower_threshold)
            .unwrap_or_default();
        let att_upper = quantile(&attentions, config.att_upper_threshold)
            .unwrap_or_default();

        let n = true_scores.len() as f32;
        let score_mean = true_scores.iter().sum::<f32>() / n;
        // unbiased estimator (n - 1), the torch convention
        let score_std = (true_scores
            .iter()
            .map(|s| (s - score_mean).powi(2))
            .sum::<f32>()
            / (n - 1.0).max(1.0))
        .sqrt();

        let min = true_scores.iter().cloned().fold(f32::INFINITY, f32::min);
        let max = true_scores
            .iter()
            .cloned()
            .fold(f32::NEG_INFINITY, f32::max);
        info!(
            min_true_score = format!("{min:.2}"),
            max_true_score = format!("{max:.2}"),
            "Collected score range"
        );
        // quantile-bounded outlier scale, logged for comparison with the
        // mean/std scaling actually applied
        let centered: Vec<f32> = true_scores
            .iter()
            .map(|s| (s - 1.0 / maps[0].scores.len_of(Axis(0)) as f32).abs())
            .collect();
        if let Some(scale) = quantile(&centered, config.score_threshold) {
            debug!(outlier_scale = scale * 2.0, "Quantile score scale");
        }

        Ok(Self {
            att_lower,
            att_upper,
            score_mean,
            score_std,
        })
    }

    /// Scale raw attention to 0..1: clamp between the batch quantiles, zero
    /// out background.
    pub fn scale_attention(&self, attention: &Array2<f32>, mask: &Array2<bool>) -> Array2<f32> {
        let range = self.att_upper - self.att_lower;
        let range = if range.abs() < f32::EPSILON { 1.0 } else { range };
        let mut out = attention.mapv(|a| ((a - self.att_lower) / range).clamp(0.0, 1.0));
        out.zip_mut_with(&mask.mapv(|m| if m { 1.0f32 } else { 0.0 }), |v, m| *v *= m);
        out
    }

    /// Scale true-class scores to 0..1, mapping mean +- 3 sigma onto the
    /// full range with the mean at 0.5.
    pub fn scale_scores(&self, scores: &Array2<f32>) -> Array2<f32> {
        let spread = (3.0 * self.score_std).max(1e-8);
        scores.mapv(|s| (((s - self.score_mean) / spread + 1.0) * 0.5).clamp(0.0, 1.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array2, Array3};

    #[test]
    fn quantile_interpolates_linearly() {
        let values = [0.0f32, 1.0, 2.0, 3.0];
        assert_eq!(quantile(&values, 0.0), Some(0.0));
        assert_eq!(quantile(&values, 1.0), Some(3.0));
        assert_eq!(quantile(&values, 0.5), Some(1.5));
        assert!((quantile(&values, 0.25).unwrap() - 0.75).abs() < 1e-6);
    }

    #[test]
    fn quantile_handles_unsorted_input() {
        let values = [3.0f32, 0.0, 2.0, 1.0];
        assert_eq!(quantile(&values, 0.5), Some(1.5));
    }

    #[test]
    fn quantile_of_empty_is_none() {
        assert_eq!(quantile(&[], 0.5), None);
    }

    #[test]
    fn quantile_of_singleton_is_the_value() {
        assert_eq!(quantile(&[7.5], 0.99), Some(7.5));
    }

    fn slide_with(att: Vec<f32>, score: Vec<f32>, mask: Vec<bool>) -> SlideMaps {
        let n = att.len();
        let scores0 = Array2::from_shape_vec((1, n), score.clone()).unwrap();
        let mut scores = Array3::<f32>::zeros((2, 1, n));
        for i in 0..n {
            scores[[0, 0, i]] = scores0[[0, i]];
            scores[[1, 0, i]] = 1.0 - scores0[[0, i]];
        }
        SlideMaps {
            name: "s".into(),
            attention: Array2::from_shape_vec((1, n), att).unwrap(),
            scores,
            mask: Array2::from_shape_vec((1, n), mask).unwrap(),
        }
    }

    fn cfg() -> HeatmapConfig {
        crate::config::test_config(std::path::Path::new("/tmp/x"))
    }

    #[test]
    fn stats_use_only_masked_cells() {
        let maps = vec![slide_with(
            vec![0.0, 10.0, 1000.0],
            vec![0.2, 0.8, 0.99],
            vec![true, true, false],
        )];
        let mut config = cfg();
        config.att_lower_threshold = 0.0;
        config.att_upper_threshold = 1.0;
        let stats = NormalizationStats::collect(&maps, 0, &config).unwrap();
        assert_eq!(stats.att_lower, 0.0);
        assert_eq!(stats.att_upper, 10.0, "masked-out 1000 must not leak in");
        assert!((stats.score_mean - 0.5).abs() < 1e-6);
    }

    #[test]
    fn stats_pool_across_slides() {
        let maps = vec![
            slide_with(vec![0.0], vec![0.1], vec![true]),
            slide_with(vec![4.0], vec![0.9], vec![true]),
        ];
        let mut config = cfg();
        config.att_lower_threshold = 0.0;
        config.att_upper_threshold = 1.0;
        let stats = NormalizationStats::collect(&maps, 0, &config).unwrap();
        assert_eq!(stats.att_upper, 4.0);
        assert!((stats.score_mean - 0.5).abs() < 1e-6);
        // unbiased std over [0.1, 0.9]
        assert!((stats.score_std - 0.5657).abs() < 1e-3);
    }

    #[test]
    fn empty_foreground_fails_the_run() {
        let maps = vec![slide_with(vec![1.0], vec![0.5], vec![false])];
        assert!(NormalizationStats::collect(&maps, 0, &cfg()).is_err());
    }

    #[test]
    fn attention_scaling_clamps_and_masks() {
        let stats = NormalizationStats {
            att_lower: 1.0,
            att_upper: 3.0,
            score_mean: 0.5,
            score_std: 0.1,
        };
        let att = Array2::from_shape_vec((1, 4), vec![0.0, 2.0, 5.0, 2.0]).unwrap();
        let mask = Array2::from_shape_vec((1, 4), vec![true, true, true, false]).unwrap();
        let scaled = stats.scale_attention(&att, &mask);
        assert_eq!(scaled[[0, 0]], 0.0, "below lower clamps to 0");
        assert!((scaled[[0, 1]] - 0.5).abs() < 1e-6);
        assert_eq!(scaled[[0, 2]], 1.0, "above upper clamps to 1");
        assert_eq!(scaled[[0, 3]], 0.0, "background is zeroed");
    }

    #[test]
    fn score_scaling_centers_mean_at_half() {
        let stats = NormalizationStats {
            att_lower: 0.0,
            att_upper: 1.0,
            score_mean: 0.6,
            score_std: 0.1,
        };
        let scores = Array2::from_shape_vec((1, 3), vec![0.6, 0.9, 0.3]).unwrap();
        let scaled = stats.scale_scores(&scores);
        assert!((scaled[[0, 0]] - 0.5).abs() < 1e-6);
        // +3 sigma maps to 1.0, -3 sigma to 0.0
        assert!((scaled[[0, 1]] - 1.0).abs() < 1e-6);
        assert!((scaled[[0, 2]] - 0.0).abs() < 1e-6);
    }

    #[test]
    fn zero_std_does_not_produce_nan() {
        let stats = NormalizationStats {
            att_lower: 0.0,
            att_upper: 1.0,
            score_mean: 0.5,
            score_std: 0.0,
        };
        let scores = Array2::from_elem((1, 2), 0.5);
        let scaled = stats.scale_scores(&scores);
        assert!(scaled.iter().all(|v| v.is_finite()));
    }
}
