//! MIL head export format.
//!
//! The trained MIL classifier is exported as a JSON file (`mil-head.json`)
//! next to the ONNX backbone: the class list plus the weights of the shared
//! encoder layer, the two-layer attention head and the batch-norm + linear
//! score head. Dropout runs in evaluation mode (identity) and is therefore
//! not part of the export.

use std::path::Path;

use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};

use crate::error::HeatmapError;

/// File name of the head export inside the model directory.
pub const MIL_HEAD_FILE: &str = "mil-head.json";

fn default_eps() -> f32 {
    1e-5
}

/// A fully connected layer as exported: row-major `[out][in]` weights.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinearExport {
    pub weight: Vec<Vec<f32>>,
    pub bias: Vec<f32>,
}

/// Batch-norm statistics (evaluation mode: running mean / variance).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NormExport {
    pub gamma: Vec<f32>,
    pub beta: Vec<f32>,
    pub mean: Vec<f32>,
    pub var: Vec<f32>,
    #[serde(default = "default_eps")]
    pub eps: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttentionExport {
    /// encoder output -> attention hidden (followed by tanh)
    pub pre: LinearExport,
    /// attention hidden -> scalar
    pub post: LinearExport,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeadExport {
    pub norm: NormExport,
    /// encoder output -> class logits
    pub linear: LinearExport,
}

/// On-disk representation of `mil-head.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MilHeadExport {
    pub classes: Vec<String>,
    pub encoder: LinearExport,
    pub attention: AttentionExport,
    pub head: HeadExport,
}

impl MilHeadExport {
    pub fn load(model_dir: &Path) -> Result<Self, HeatmapError> {
        let path = model_dir.join(MIL_HEAD_FILE);
        if !path.exists() {
            return Err(HeatmapError::ModelNotFound(path));
        }
        let text = std::fs::read_to_string(&path)?;
        serde_json::from_str(&text)
            .map_err(|e| HeatmapError::ModelLoad(format!("{}: {e}", path.display())))
    }
}

/// A fully connected layer with validated, ndarray-backed weights.
#[derive(Debug, Clone)]
pub struct Linear {
    /// `[out, in]`
    pub weight: Array2<f32>,
    pub bias: Array1<f32>,
}

impl Linear {
    pub fn in_features(&self) -> usize {
        self.weight.ncols()
    }

    pub fn out_features(&self) -> usize {
        self.weight.nrows()
    }

    fn from_export(name: &str, export: &LinearExport) -> Result<Self, HeatmapError> {
        let rows = export.weight.len();
        if rows == 0 {
            return Err(HeatmapError::ModelLoad(format!(
                "{name}: empty weight matrix"
            )));
        }
        let cols = export.weight[0].len();
        if cols == 0 || export.weight.iter().any(|r| r.len() != cols) {
            return Err(HeatmapError::ModelLoad(format!(
                "{name}: ragged weight matrix"
            )));
        }
        if export.bias.len() != rows {
            return Err(HeatmapError::ModelLoad(format!(
                "{name}: bias length {} does not match {rows} output features",
                export.bias.len()
            )));
        }

        let flat: Vec<f32> = export.weight.iter().flatten().copied().collect();
        let weight = Array2::from_shape_vec((rows, cols), flat)
            .map_err(|e| HeatmapError::ModelLoad(format!("{name}: {e}")))?;
        Ok(Self {
            weight,
            bias: Array1::from_vec(export.bias.clone()),
        })
    }
}

/// Per-channel batch normalization in evaluation mode.
#[derive(Debug, Clone)]
pub struct BatchNorm {
    pub gamma: Array1<f32>,
    pub beta: Array1<f32>,
    pub mean: Array1<f32>,
    pub var: Array1<f32>,
    pub eps: f32,
}

impl BatchNorm {
    fn from_export(export: &NormExport, features: usize) -> Result<Self, HeatmapError> {
        for (field, values) in [
            ("gamma", &export.gamma),
            ("beta", &export.beta),
            ("mean", &export.mean),
            ("var", &export.var),
        ] {
            if values.len() != features {
                return Err(HeatmapError::ModelLoad(format!(
                    "head.norm.{field}: length {} does not match {features} encoder features",
                    values.len()
                )));
            }
        }
        Ok(Self {
            gamma: Array1::from_vec(export.gamma.clone()),
            beta: Array1::from_vec(export.beta.clone()),
            mean: Array1::from_vec(export.mean.clone()),
            var: Array1::from_vec(export.var.clone()),
            eps: export.eps,
        })
    }
}

/// Compiled MIL head: shape-checked weights ready for evaluation.
#[derive(Debug, Clone)]
pub struct MilWeights {
    pub classes: Vec<String>,
    pub encoder: Linear,
    pub att_pre: Linear,
    pub att_post: Linear,
    pub norm: BatchNorm,
    pub score: Linear,
}

impl MilWeights {
    pub fn compile(export: &MilHeadExport) -> Result<Self, HeatmapError> {
        if export.classes.len() < 2 {
            return Err(HeatmapError::ModelLoad(format!(
                "model declares {} classes, need at least 2",
                export.classes.len()
            )));
        }

        let encoder = Linear::from_export("encoder", &export.encoder)?;
        let att_pre = Linear::from_export("attention.pre", &export.attention.pre)?;
        let att_post = Linear::from_export("attention.post", &export.attention.post)?;
        let score = Linear::from_export("head.linear", &export.head.linear)?;
        let norm = BatchNorm::from_export(&export.head.norm, encoder.out_features())?;

        let e = encoder.out_features();
        if att_pre.in_features() != e {
            return Err(HeatmapError::ModelLoad(format!(
                "attention.pre expects {} inputs, encoder outputs {e}",
                att_pre.in_features()
            )));
        }
        if att_post.in_features() != att_pre.out_features() {
            return Err(HeatmapError::ModelLoad(format!(
                "attention.post expects {} inputs, attention.pre outputs {}",
                att_post.in_features(),
                att_pre.out_features()
            )));
        }
        if att_post.out_features() != 1 {
            return Err(HeatmapError::ModelLoad(format!(
                "attention.post must output a scalar, got {} features",
                att_post.out_features()
            )));
        }
        if score.in_features() != e {
            return Err(HeatmapError::ModelLoad(format!(
                "head.linear expects {} inputs, encoder outputs {e}",
                score.in_features()
            )));
        }
        if score.out_features() != export.classes.len() {
            return Err(HeatmapError::ModelLoad(format!(
                "head.linear outputs {} logits for {} classes",
                score.out_features(),
                export.classes.len()
            )));
        }

        Ok(Self {
            classes: export.classes.clone(),
            encoder,
            att_pre,
            att_post,
            norm,
            score,
        })
    }
}
