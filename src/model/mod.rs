//! The MIL classifier head: attention and score evaluation over feature maps.

pub mod heads;
pub mod weights;

pub use weights::{MilHeadExport, MilWeights, MIL_HEAD_FILE};

use std::path::Path;

use ndarray::{Array2, Array3, Axis};
use tracing::info;

use crate::error::HeatmapError;
use heads::{batchnorm_inplace, conv1x1, relu_inplace, softmax_channels, tanh_inplace};

/// A loaded MIL model, evaluated fully convolutionally:
/// every exported fully connected layer acts as a 1x1 convolution, so the
/// heads map a C x H x W feature map to per-tile attention and class scores.
pub struct MilModel {
    weights: MilWeights,
}

impl MilModel {
    pub fn load(model_dir: &Path) -> Result<Self, HeatmapError> {
        let export = MilHeadExport::load(model_dir)?;
        let weights = MilWeights::compile(&export)?;
        info!(
            classes = ?weights.classes,
            feature_dim = weights.encoder.in_features(),
            "MIL head loaded"
        );
        Ok(Self { weights })
    }

    pub fn from_weights(weights: MilWeights) -> Self {
        Self { weights }
    }

    pub fn classes(&self) -> &[String] {
        &self.weights.classes
    }

    pub fn num_classes(&self) -> usize {
        self.weights.classes.len()
    }

    /// Channel count the heads expect from the backbone.
    pub fn feature_dim(&self) -> usize {
        self.weights.encoder.in_features()
    }

    /// Index of a class by name; the error lists the valid classes.
    pub fn class_index(&self, class: &str) -> Result<usize, HeatmapError> {
        self.weights
            .classes
            .iter()
            .position(|c| c == class)
            .ok_or_else(|| HeatmapError::UnknownClass {
                class: class.to_string(),
                available: self.weights.classes.clone(),
            })
    }

    /// Raw (unnormalized) attention map:
    /// encoder -> ReLU -> attention.pre -> tanh -> attention.post.
    pub fn attention_map(&self, feats: &Array3<f32>) -> Result<Array2<f32>, HeatmapError> {
        let mut x = conv1x1(&self.weights.encoder, feats)?;
        relu_inplace(&mut x);
        let mut x = conv1x1(&self.weights.att_pre, &x)?;
        tanh_inplace(&mut x);
        let x = conv1x1(&self.weights.att_post, &x)?;
        Ok(x.index_axis(Axis(0), 0).to_owned())
    }

    /// Per-class score map (softmax over classes):
    /// encoder -> ReLU -> batch norm -> head.linear -> softmax.
    /// Dropout is identity in evaluation mode and is skipped.
    pub fn score_map(&self, feats: &Array3<f32>) -> Result<Array3<f32>, HeatmapError> {
        let mut x = conv1x1(&self.weights.encoder, feats)?;
        relu_inplace(&mut x);
        batchnorm_inplace(&mut x, &self.weights.norm);
        let x = conv1x1(&self.weights.score, &x)?;
        Ok(softmax_channels(&x))
    }
}
