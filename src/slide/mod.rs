//! Slide inputs: source parsing, fetching and tiled loading.

pub mod fetch;
pub mod tiles;

pub use fetch::{CachingFetcher, SlideFetcher};
pub use tiles::{load_slide, tile_pool_size, TileGrid};

use std::path::{Path, PathBuf};

use crate::error::HeatmapError;

/// One slide input, as given on the command line or in a `--from-file` list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlideSource {
    /// Plain filesystem path.
    Local(PathBuf),
    /// HTTP(S) URL, downloaded into the cache directory before use.
    Remote(String),
}

impl SlideSource {
    /// Parse a CLI argument into a slide source.
    ///
    /// Anything starting with `http://` or `https://` is remote; everything
    /// else is treated as a local path.
    pub fn parse(input: &str) -> Result<Self, HeatmapError> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(HeatmapError::Config("empty slide entry".into()));
        }
        if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
            Ok(SlideSource::Remote(trimmed.to_string()))
        } else {
            Ok(SlideSource::Local(PathBuf::from(trimmed)))
        }
    }

    /// Slide name: file stem of the path component. Used to key the cache
    /// and output directory trees.
    pub fn name(&self) -> String {
        let path: &Path = match self {
            SlideSource::Local(p) => p,
            SlideSource::Remote(url) => {
                // strip query string, keep the last path segment
                let without_query = url.split(['?', '#']).next().unwrap_or(url);
                Path::new(without_query)
            }
        };
        path.file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "slide".to_string())
    }
}

/// Read a slide list file: one entry per line, blank lines and `#` comments
/// are skipped.
pub fn read_slide_list(path: &Path) -> Result<Vec<SlideSource>, HeatmapError> {
    let text = std::fs::read_to_string(path)?;
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(SlideSource::parse)
        .collect()
}
