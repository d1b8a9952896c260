//! Error type shared across the heatmap pipeline.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum HeatmapError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("slide fetch failed: {0}")]
    SlideFetch(String),

    #[error("image processing error: {0}")]
    ImageProcessing(String),

    #[error("model file not found: {0}")]
    ModelNotFound(PathBuf),

    #[error("model loading failed: {0}")]
    ModelLoad(String),

    #[error("{class:?} is not a target of this model (did you mean any of {available:?}?)")]
    UnknownClass {
        class: String,
        available: Vec<String>,
    },

    #[error("feature extraction failed: {0}")]
    Inference(String),

    #[error("feature cache error: {0}")]
    Cache(String),

    #[error("unknown colormap {0:?} (available: {1})")]
    UnknownColormap(String, String),
}
