//! Tiled slide loading.
//!
//! Slides are loaded as an 8x8 tile grid so that (1) tile reads can run on
//! a bounded worker pool and (2) each tile is rescaled from slide resolution
//! to the network's working resolution before assembly, keeping peak memory
//! proportional to the output image rather than the raw slide.

use image::imageops::{self, FilterType};
use image::{GrayImage, Rgb, RgbImage};
use rayon::prelude::*;
use tracing::debug;

use crate::error::HeatmapError;

/// Number of tile rows / columns in the grid.
pub const GRID_STEPS: u32 = 8;

/// Microns per pixel of the input slides.
pub const SLIDE_MPP: f64 = 0.1;

/// Microns per pixel the backbone was trained at (256 um tiles at 224 px).
pub const TARGET_MPP: f64 = 256.0 / 224.0;

/// Worker pool size for tile loading: min(32, available cores).
pub fn tile_pool_size() -> usize {
    let cores = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    cores.min(32)
}

/// Geometry of the 8x8 tile grid for one slide.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileGrid {
    /// Tile stride in slide pixels (width, height), `ceil(dim / 8)`.
    pub stride: (u32, u32),
    /// Per-tile output size in working-resolution pixels (width, height).
    pub tile_target: (u32, u32),
}

impl TileGrid {
    pub fn new(slide_width: u32, slide_height: u32, slide_mpp: f64, target_mpp: f64) -> Self {
        let stride_w = slide_width.div_ceil(GRID_STEPS);
        let stride_h = slide_height.div_ceil(GRID_STEPS);
        let scale = slide_mpp / target_mpp;
        let tile_w = ((stride_w as f64 * scale).round() as u32).max(1);
        let tile_h = ((stride_h as f64 * scale).round() as u32).max(1);
        Self {
            stride: (stride_w, stride_h),
            tile_target: (tile_w, tile_h),
        }
    }

    /// Dimensions of the assembled working-resolution image (width, height).
    pub fn output_size(&self) -> (u32, u32) {
        (
            self.tile_target.0 * GRID_STEPS,
            self.tile_target.1 * GRID_STEPS,
        )
    }
}

/// Load one tile: crop at the grid position (clamped at the slide border)
/// and resize to the working-resolution tile size.
fn load_tile(slide: &GrayImage, grid: &TileGrid, row: u32, col: u32) -> GrayImage {
    let (stride_w, stride_h) = grid.stride;
    let (tile_w, tile_h) = grid.tile_target;

    // Clamp inside the slide: with a rounded-up stride the last grid column
    // can start past the border on small slides.
    let x0 = (col * stride_w).min(slide.width() - 1);
    let y0 = (row * stride_h).min(slide.height() - 1);
    let crop_w = stride_w.min(slide.width().saturating_sub(x0)).max(1);
    let crop_h = stride_h.min(slide.height().saturating_sub(y0)).max(1);

    let tile = imageops::crop_imm(slide, x0, y0, crop_w, crop_h).to_image();
    imageops::resize(&tile, tile_w, tile_h, FilterType::Triangle)
}

/// Load a grayscale slide into a working-resolution RGB image.
///
/// Tile loads run on a dedicated bounded pool; all 64 tiles complete before
/// assembly starts. The grayscale channel is replicated to 3 channels for
/// the backbone.
pub fn load_slide(
    slide: &GrayImage,
    slide_mpp: f64,
    target_mpp: f64,
) -> Result<RgbImage, HeatmapError> {
    let grid = TileGrid::new(slide.width(), slide.height(), slide_mpp, target_mpp);
    let (out_w, out_h) = grid.output_size();

    let coords: Vec<(u32, u32)> = (0..GRID_STEPS)
        .flat_map(|row| (0..GRID_STEPS).map(move |col| (row, col)))
        .collect();

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(tile_pool_size())
        .build()
        .map_err(|e| HeatmapError::ImageProcessing(format!("tile pool: {e}")))?;

    let tiles: Vec<((u32, u32), GrayImage)> = pool.install(|| {
        coords
            .par_iter()
            .map(|&(row, col)| ((row, col), load_tile(slide, &grid, row, col)))
            .collect()
    });

    let (tile_w, tile_h) = grid.tile_target;
    let mut assembled = RgbImage::new(out_w, out_h);
    for ((row, col), tile) in tiles {
        let x_off = col * tile_w;
        let y_off = row * tile_h;
        for y in 0..tile.height() {
            for x in 0..tile.width() {
                let v = tile.get_pixel(x, y).0[0];
                assembled.put_pixel(x_off + x, y_off + y, Rgb([v, v, v]));
            }
        }
    }

    debug!(
        slide = format!("{}x{}", slide.width(), slide.height()),
        assembled = format!("{out_w}x{out_h}"),
        workers = tile_pool_size(),
        "Slide loaded"
    );

    Ok(assembled)
}
