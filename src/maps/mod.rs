//! Per-slide maps: attention, class scores and the foreground mask.

pub mod normalize;

pub use normalize::{quantile, NormalizationStats};

use image::RgbImage;
use ndarray::{Array2, Array3};

use crate::features::DOWNSAMPLE;

/// Tiles at the slide border that are never marked foreground.
pub const EDGE_MARGIN_TILES: usize = 4;

/// Half-width (in tiles) of the brightness window around each grid cell.
/// 3 tiles on each side plus the cell itself: a 7x7-tile (224 px) window.
const WINDOW_HALF_TILES: u32 = 3;

/// Everything computed for one slide during the collection pass. Held in
/// memory for the whole batch so the scaling statistics can be computed
/// across slides before anything is rendered.
pub struct SlideMaps {
    pub name: String,
    /// Raw attention, one value per feature-grid cell.
    pub attention: Array2<f32>,
    /// Softmax class scores, `[class, row, col]`.
    pub scores: Array3<f32>,
    /// Foreground mask on the same grid.
    pub mask: Array2<bool>,
}

/// Compute the foreground mask for a slide on the feature grid.
///
/// A cell is foreground when the summed brightness of the surrounding
/// 7x7-tile window exceeds the threshold. Cells within
/// [`EDGE_MARGIN_TILES`] of the border stay background.
pub fn foreground_mask(
    slide: &RgbImage,
    grid_rows: usize,
    grid_cols: usize,
    threshold: u64,
) -> Array2<bool> {
    let mut mask = Array2::from_elem((grid_rows, grid_cols), false);
    let d = DOWNSAMPLE;
    let margin = EDGE_MARGIN_TILES;
    if grid_rows <= 2 * margin || grid_cols <= 2 * margin {
        return mask;
    }

    for row in margin..grid_rows - margin {
        for col in margin..grid_cols - margin {
            let y0 = (row as u32 - WINDOW_HALF_TILES) * d;
            let y1 = ((row as u32 + WINDOW_HALF_TILES + 1) * d).min(slide.height());
            let x0 = (col as u32 - WINDOW_HALF_TILES) * d;
            let x1 = ((col as u32 + WINDOW_HALF_TILES + 1) * d).min(slide.width());

            let mut sum = 0u64;
            for y in y0..y1 {
                for x in x0..x1 {
                    sum += slide.get_pixel(x, y).0[0] as u64;
                }
            }
            mask[[row, col]] = sum > threshold;
        }
    }
    mask
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    // 512x512 slide: 16x16 feature grid, maskable cells in rows/cols 4..12
    fn blank_slide() -> RgbImage {
        RgbImage::from_pixel(512, 512, Rgb([0, 0, 0]))
    }

    #[test]
    fn blank_slide_has_empty_mask() {
        let mask = foreground_mask(&blank_slide(), 16, 16, 20);
        assert!(!mask.iter().any(|&m| m));
    }

    #[test]
    fn bright_slide_sets_interior_cells_only() {
        let slide = RgbImage::from_pixel(512, 512, Rgb([200, 200, 200]));
        let mask = foreground_mask(&slide, 16, 16, 20);

        assert!(mask[[4, 4]]);
        assert!(mask[[8, 8]]);
        assert!(mask[[11, 11]]);
        // edge margin stays background
        for i in 0..16 {
            assert!(!mask[[0, i]]);
            assert!(!mask[[3, i]]);
            assert!(!mask[[12, i]]);
            assert!(!mask[[i, 0]]);
            assert!(!mask[[i, 15]]);
        }
    }

    #[test]
    fn single_bright_pixel_lights_its_window() {
        let mut slide = blank_slide();
        // brightness 30 > threshold 20, in the middle of cell (8, 8)
        slide.put_pixel(8 * 32 + 16, 8 * 32 + 16, Rgb([30, 0, 0]));
        let mask = foreground_mask(&slide, 16, 16, 20);

        // every cell whose 7x7-tile window covers the pixel is foreground
        assert!(mask[[8, 8]]);
        assert!(mask[[5, 8]]);
        assert!(mask[[11, 8]]);
        assert!(!mask[[4, 4]], "window does not reach the pixel");
    }

    #[test]
    fn threshold_is_strict() {
        let mut slide = blank_slide();
        slide.put_pixel(8 * 32, 8 * 32, Rgb([20, 0, 0]));
        let mask = foreground_mask(&slide, 16, 16, 20);
        assert!(!mask[[8, 8]], "sum == threshold is background");
    }

    #[test]
    fn tiny_grid_is_all_background() {
        let slide = RgbImage::from_pixel(128, 128, Rgb([255, 255, 255]));
        let mask = foreground_mask(&slide, 4, 4, 20);
        assert!(!mask.iter().any(|&m| m));
    }

    #[test]
    fn only_channel_zero_counts() {
        let slide = RgbImage::from_pixel(512, 512, Rgb([0, 255, 255]));
        let mask = foreground_mask(&slide, 16, 16, 20);
        assert!(!mask.iter().any(|&m| m));
    }
}
