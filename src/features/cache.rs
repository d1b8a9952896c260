//! On-disk feature memoization.
//!
//! One gzip-compressed binary tensor file per slide. If the file exists it
//! is reused verbatim: a flat existence check, no eviction, no staleness
//! tracking. Delete the cache directory to recompute.
//!
//! Layout (before compression): 4-byte magic, u32 format version, three u32
//! dimensions (C, H, W), then C*H*W little-endian f32 values.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use ndarray::Array3;
use tracing::debug;

use crate::error::HeatmapError;

const MAGIC: &[u8; 4] = b"WSHF";
const FORMAT_VERSION: u32 = 1;

/// File name of the cached tensor inside a slide's cache directory.
pub const FEATURES_FILE: &str = "feats.bin.gz";

/// Feature tensor cache rooted at the run's cache directory.
pub struct FeatureCache {
    root: PathBuf,
}

impl FeatureCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn tensor_path(&self, slide_name: &str) -> PathBuf {
        self.root.join(slide_name).join(FEATURES_FILE)
    }

    /// Load the cached feature map for a slide, or `None` on cache miss.
    pub fn load(&self, slide_name: &str) -> Result<Option<Array3<f32>>, HeatmapError> {
        let path = self.tensor_path(slide_name);
        if !path.exists() {
            return Ok(None);
        }
        let feats = read_tensor(&path)?;
        debug!(slide = slide_name, shape = ?feats.shape(), "Feature cache hit");
        Ok(Some(feats))
    }

    /// Store a feature map for a slide, creating the slide directory.
    pub fn store(&self, slide_name: &str, feats: &Array3<f32>) -> Result<(), HeatmapError> {
        let path = self.tensor_path(slide_name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        write_tensor(&path, feats)?;
        debug!(slide = slide_name, shape = ?feats.shape(), "Features cached");
        Ok(())
    }
}

fn write_tensor(path: &Path, feats: &Array3<f32>) -> Result<(), HeatmapError> {
    let file = File::create(path)?;
    let mut out = GzEncoder::new(BufWriter::new(file), Compression::default());

    out.write_all(MAGIC)?;
    out.write_all(&FORMAT_VERSION.to_le_bytes())?;
    let shape = feats.shape();
    for &dim in shape {
        out.write_all(&(dim as u32).to_le_bytes())?;
    }
    // ndarray iteration is logical (row-major) order regardless of layout
    for &v in feats.iter() {
        out.write_all(&v.to_le_bytes())?;
    }
    out.finish()?.flush()?;
    Ok(())
}

fn read_tensor(path: &Path) -> Result<Array3<f32>, HeatmapError> {
    let file = File::open(path)?;
    let mut input = GzDecoder::new(BufReader::new(file));

    let mut magic = [0u8; 4];
    input.read_exact(&mut magic)?;
    if &magic != MAGIC {
        return Err(HeatmapError::Cache(format!(
            "{}: not a feature tensor file",
            path.display()
        )));
    }

    let version = read_u32(&mut input)?;
    if version != FORMAT_VERSION {
        return Err(HeatmapError::Cache(format!(
            "{}: unsupported format version {version}",
            path.display()
        )));
    }

    let c = read_u32(&mut input)? as usize;
    let h = read_u32(&mut input)? as usize;
    let w = read_u32(&mut input)? as usize;

    let count = c
        .checked_mul(h)
        .and_then(|n| n.checked_mul(w))
        .ok_or_else(|| HeatmapError::Cache(format!("{}: corrupt shape header", path.display())))?;

    let mut data = Vec::with_capacity(count);
    let mut buf = [0u8; 4];
    for _ in 0..count {
        input.read_exact(&mut buf)?;
        data.push(f32::from_le_bytes(buf));
    }

    Array3::from_shape_vec((c, h, w), data)
        .map_err(|e| HeatmapError::Cache(format!("{}: {e}", path.display())))
}

fn read_u32(input: &mut impl Read) -> Result<u32, HeatmapError> {
    let mut buf = [0u8; 4];
    input.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}
