//! Run configuration: CLI-derived settings plus validation.
//!
//! All validation happens up front: a bad threshold or an unknown class
//! fails the whole run before any slide work starts.

use std::path::PathBuf;

use crate::error::HeatmapError;

/// Application-level constants
pub const APP_NAME: &str = "wsi-heatmap";
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default `RUST_LOG`-style filter when the env var is unset.
pub fn default_log_filter() -> String {
    format!("warn,{}=info", APP_NAME.replace('-', "_"))
}

/// Settings for one heatmap run, shared by every pipeline stage.
#[derive(Debug, Clone)]
pub struct HeatmapConfig {
    /// Directory containing `backbone.onnx` and `mil-head.json`.
    pub model_path: PathBuf,
    /// Root of the per-slide output tree.
    pub output_path: PathBuf,
    /// Class rendered as "hot" in the score heatmap.
    pub true_class: String,
    /// Gaussian pooling kernel size. 0 disables pooling. Must be odd otherwise.
    pub blur_kernel_size: usize,
    /// Cache directory for downloaded slides, FOV images and feature tensors.
    pub cache_dir: PathBuf,
    /// Skip GPU execution-provider registration.
    pub force_cpu: bool,
    /// Brightness threshold for background removal (windowed sum).
    pub mask_threshold: u64,
    /// Quantile to squash attention towards 1 during scaling.
    pub att_upper_threshold: f64,
    /// Quantile to squash attention towards 0 during scaling.
    pub att_lower_threshold: f64,
    /// Quantile bounding score outliers during score scaling.
    pub score_threshold: f64,
    /// Colormap name for the attention heatmap.
    pub att_cmap: String,
    /// Colormap name for the score heatmap.
    pub score_cmap: String,
    /// Opaqueness of the attention map in the FOV overlay.
    pub att_alpha: f64,
    /// Opaqueness of the score map at the highest-attention location.
    pub score_alpha: f64,
}

impl HeatmapConfig {
    /// Check threshold ranges and kernel geometry.
    ///
    /// Class membership is validated later, once the model export is loaded.
    pub fn validate(&self) -> Result<(), HeatmapError> {
        for (name, value) in [
            ("att-upper-threshold", self.att_upper_threshold),
            ("att-lower-threshold", self.att_lower_threshold),
            ("score-threshold", self.score_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(HeatmapError::Config(format!(
                    "{name} needs to be between 0 and 1, got {value}"
                )));
            }
        }
        if self.att_lower_threshold >= self.att_upper_threshold {
            return Err(HeatmapError::Config(
                "lower attention threshold needs to be lower than upper attention threshold"
                    .into(),
            ));
        }
        if self.blur_kernel_size != 0 && self.blur_kernel_size % 2 == 0 {
            return Err(HeatmapError::Config(format!(
                "blur-kernel-size must be odd (or 0 to disable), got {}",
                self.blur_kernel_size
            )));
        }
        for (name, value) in [
            ("att-alpha", self.att_alpha),
            ("score-alpha", self.score_alpha),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(HeatmapError::Config(format!(
                    "{name} needs to be between 0 and 1, got {value}"
                )));
            }
        }
        Ok(())
    }

    /// Cache directory for one slide, keyed by slide name.
    pub fn slide_cache_dir(&self, slide_name: &str) -> PathBuf {
        self.cache_dir.join(slide_name)
    }

    /// Output directory for one slide, keyed by slide name.
    pub fn slide_output_dir(&self, slide_name: &str) -> PathBuf {
        self.output_path.join(slide_name)
    }
}

#[cfg(test)]
pub(crate) fn test_config(root: &std::path::Path) -> HeatmapConfig {
    HeatmapConfig {
        model_path: root.join("model"),
        output_path: root.join("out"),
        true_class: "tumor".into(),
        blur_kernel_size: 0,
        cache_dir: root.join("cache"),
        force_cpu: true,
        mask_threshold: 20,
        att_upper_threshold: 1.0,
        att_lower_threshold: 0.01,
        score_threshold: 0.95,
        att_cmap: "magma".into(),
        score_cmap: "coolwarm".into(),
        att_alpha: 0.5,
        score_alpha: 1.0,
    }
}
