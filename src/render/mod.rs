//! Heatmap rendering: colorization, upscaling and alpha compositing.

pub mod colormap;

pub use colormap::Colormap;

use image::imageops::{self, FilterType};
use image::{Rgb, RgbImage, Rgba, RgbaImage};
use ndarray::Array2;

use crate::maps::quantile;

/// Fraction of nonzero pixels saturated to full brightness in the FOV
/// visualization export.
pub const SATURATION_FRACTION: f64 = 0.2;

/// File name of the saturated FOV export, e.g. `fov-sat20pc.tif`.
pub fn fov_sat_file_name() -> String {
    format!("fov-sat{}pc.tif", (SATURATION_FRACTION * 100.0).round() as u32)
}

/// Brighten a dim FOV image for visualization: the brightness level at the
/// (1 - fraction) quantile of nonzero pixels is scaled to 255, everything
/// above is clipped.
pub fn saturate_fov(slide: &RgbImage, fraction: f64) -> RgbImage {
    let nonzero: Vec<f32> = slide
        .pixels()
        .map(|p| p.0[0] as f32)
        .filter(|&v| v > 0.0)
        .collect();
    let level = match quantile(&nonzero, 1.0 - fraction) {
        Some(level) if level > 0.0 => level,
        _ => return slide.clone(),
    };

    let scale = 255.0 / level;
    let mut out = RgbImage::new(slide.width(), slide.height());
    for (x, y, pixel) in slide.enumerate_pixels() {
        let mut scaled = [0u8; 3];
        for c in 0..3 {
            scaled[c] = (pixel.0[c] as f32 * scale).round().min(255.0) as u8;
        }
        out.put_pixel(x, y, Rgb(scaled));
    }
    out
}

/// Render a 0..1 map through a colormap, with a per-cell 0..1 alpha map.
/// Array rows map to image rows.
pub fn colorize(values: &Array2<f32>, alpha: &Array2<f32>, cmap: &Colormap) -> RgbaImage {
    let (rows, cols) = values.dim();
    debug_assert_eq!(values.dim(), alpha.dim());

    let mut out = RgbaImage::new(cols as u32, rows as u32);
    for ((row, col), &v) in values.indexed_iter() {
        let [r, g, b] = cmap.sample(v);
        let a = (alpha[[row, col]].clamp(0.0, 1.0) * 255.0).round() as u8;
        out.put_pixel(col as u32, row as u32, Rgba([r, g, b, a]));
    }
    out
}

/// Convert a boolean mask to a 0/1 alpha map.
pub fn mask_to_alpha(mask: &Array2<bool>) -> Array2<f32> {
    mask.mapv(|m| if m { 1.0 } else { 0.0 })
}

/// Nearest-neighbor upscale by an integer factor, cropped so the result
/// never exceeds the slide dimensions (the feature grid rounds down, so the
/// upscaled map can overshoot by up to factor - 1 pixels).
pub fn upscale_nearest(img: &RgbaImage, factor: u32, max_w: u32, max_h: u32) -> RgbaImage {
    let up_w = img.width() * factor;
    let up_h = img.height() * factor;
    let upscaled = imageops::resize(img, up_w, up_h, FilterType::Nearest);
    let crop_w = up_w.min(max_w);
    let crop_h = up_h.min(max_h);
    imageops::crop_imm(&upscaled, 0, 0, crop_w, crop_h).to_image()
}

/// Replace the alpha channel with a uniform value.
pub fn with_uniform_alpha(img: &RgbaImage, alpha: u8) -> RgbaImage {
    let mut out = img.clone();
    for pixel in out.pixels_mut() {
        pixel.0[3] = alpha;
    }
    out
}

/// Alpha-blend an RGBA overlay onto an RGB base image (at the origin).
pub fn blend_over(base: &RgbImage, overlay: &RgbaImage) -> RgbImage {
    let mut canvas = RgbaImage::new(base.width(), base.height());
    for (x, y, pixel) in base.enumerate_pixels() {
        let [r, g, b] = pixel.0;
        canvas.put_pixel(x, y, Rgba([r, g, b, 255]));
    }
    imageops::overlay(&mut canvas, overlay, 0, 0);

    let mut out = RgbImage::new(base.width(), base.height());
    for (x, y, pixel) in canvas.enumerate_pixels() {
        out.put_pixel(x, y, Rgb([pixel.0[0], pixel.0[1], pixel.0[2]]));
    }
    out
}

/// Composite an RGBA overlay onto an opaque white canvas of the same size.
pub fn composite_on_white(overlay: &RgbaImage) -> RgbaImage {
    let mut canvas = RgbaImage::from_pixel(
        overlay.width(),
        overlay.height(),
        Rgba([255, 255, 255, 255]),
    );
    imageops::overlay(&mut canvas, overlay, 0, 0);
    canvas
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn saturation_scales_the_quantile_to_full_brightness() {
        // 100 pixels: values 1..=100; 80th percentile of nonzeros ~ 80.2
        let mut img = RgbImage::new(10, 10);
        for (i, pixel) in img.pixels_mut().enumerate() {
            let v = (i + 1) as u8;
            *pixel = Rgb([v, v, v]);
        }
        let out = saturate_fov(&img, SATURATION_FRACTION);
        // brightest pixel clips at 255
        assert_eq!(out.get_pixel(9, 9).0[0], 255);
        // the quantile level itself maps to ~255
        let level = out.get_pixel(9, 7).0[0]; // source value 80
        assert!(level >= 253, "got {level}");
        // dim pixels scale linearly: 40 -> ~127
        let mid = out.get_pixel(9, 3).0[0]; // source value 40
        assert!((mid as i32 - 127).abs() <= 3, "got {mid}");
    }

    #[test]
    fn saturation_of_black_image_is_identity() {
        let img = RgbImage::from_pixel(4, 4, Rgb([0, 0, 0]));
        let out = saturate_fov(&img, SATURATION_FRACTION);
        assert_eq!(out, img);
    }

    #[test]
    fn fov_sat_name_encodes_percentage() {
        assert_eq!(fov_sat_file_name(), "fov-sat20pc.tif");
    }

    #[test]
    fn colorize_maps_rows_to_image_rows() {
        let values = array![[0.0f32, 0.0], [1.0, 1.0]];
        let alpha = array![[1.0f32, 1.0], [0.5, 0.0]];
        let cmap = Colormap::by_name("gray").unwrap();
        let img = colorize(&values, &alpha, &cmap);

        assert_eq!(img.dimensions(), (2, 2));
        assert_eq!(img.get_pixel(0, 0).0, [0, 0, 0, 255]);
        assert_eq!(img.get_pixel(0, 1).0, [255, 255, 255, 128]);
        assert_eq!(img.get_pixel(1, 1).0[3], 0);
    }

    #[test]
    fn upscale_crops_to_slide_dimensions() {
        let img = RgbaImage::from_pixel(3, 2, Rgba([9, 9, 9, 255]));
        let up = upscale_nearest(&img, 32, 90, 60);
        assert_eq!(up.dimensions(), (90, 60));
    }

    #[test]
    fn upscale_never_exceeds_its_own_extent() {
        let img = RgbaImage::from_pixel(2, 2, Rgba([1, 2, 3, 4]));
        let up = upscale_nearest(&img, 32, 1000, 1000);
        assert_eq!(up.dimensions(), (64, 64));
        assert_eq!(up.get_pixel(63, 63).0, [1, 2, 3, 4]);
    }

    #[test]
    fn uniform_alpha_overwrites_existing_alpha() {
        let img = RgbaImage::from_pixel(2, 2, Rgba([10, 20, 30, 0]));
        let out = with_uniform_alpha(&img, 128);
        assert_eq!(out.get_pixel(0, 0).0, [10, 20, 30, 128]);
    }

    #[test]
    fn blend_over_mixes_by_alpha() {
        let base = RgbImage::from_pixel(1, 1, Rgb([0, 0, 0]));
        let overlay = RgbaImage::from_pixel(1, 1, Rgba([255, 255, 255, 128]));
        let out = blend_over(&base, &overlay);
        let v = out.get_pixel(0, 0).0[0];
        assert!((v as i32 - 128).abs() <= 2, "half-alpha white over black, got {v}");
    }

    #[test]
    fn blend_over_with_zero_alpha_keeps_base() {
        let base = RgbImage::from_pixel(1, 1, Rgb([40, 50, 60]));
        let overlay = RgbaImage::from_pixel(1, 1, Rgba([255, 0, 0, 0]));
        let out = blend_over(&base, &overlay);
        assert_eq!(out.get_pixel(0, 0).0, [40, 50, 60]);
    }

    #[test]
    fn white_composite_fills_transparent_regions() {
        let mut overlay = RgbaImage::from_pixel(2, 1, Rgba([0, 0, 0, 255]));
        overlay.put_pixel(1, 0, Rgba([0, 0, 0, 0]));
        let out = composite_on_white(&overlay);
        assert_eq!(out.get_pixel(0, 0).0, [0, 0, 0, 255]);
        assert_eq!(out.get_pixel(1, 0).0, [255, 255, 255, 255]);
    }
}
