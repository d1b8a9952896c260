//! Attention and score heatmaps for whole-slide images.
//!
//! The pipeline turns a batch of gigapixel slides and a trained MIL
//! classifier into per-slide heatmap images: slides are tile-loaded to the
//! backbone's working resolution, pushed through a fully convolutional
//! feature extractor, evaluated by the MIL attention and score heads, and
//! rendered with batch-wide normalization so the heatmaps of different
//! slides are comparable.

pub mod config;
pub mod error;
pub mod features; // backbone inference + on-disk feature cache
pub mod maps; // attention/score/mask maps + cross-slide normalization
pub mod model; // MIL head weights and per-pixel evaluation
pub mod render; // colormaps, upscaling, compositing
pub mod runner; // two-pass batch orchestrator
pub mod slide; // source parsing, fetching, tiled loading

pub use config::HeatmapConfig;
pub use error::HeatmapError;
pub use runner::HeatmapRunner;
