//! Two-pass batch orchestrator.
//!
//! Pass 1 collects attention, score and mask maps for every slide (through
//! the FOV and feature caches). Pass 2 computes batch-wide scaling
//! statistics and writes the per-slide image exports. All maps stay in
//! memory between the passes; slides are processed one at a time.

use std::fs;
use std::path::Path;

use image::{RgbImage, RgbaImage};
use ndarray::Axis;
use tracing::{debug, info, info_span};

use crate::config::HeatmapConfig;
use crate::error::HeatmapError;
use crate::features::{FeatureCache, FeatureExtractor, DOWNSAMPLE};
use crate::maps::{foreground_mask, NormalizationStats, SlideMaps};
use crate::model::heads::gaussian_blur;
use crate::model::MilModel;
use crate::render::{
    blend_over, colorize, composite_on_white, fov_sat_file_name, mask_to_alpha, saturate_fov,
    upscale_nearest, with_uniform_alpha, Colormap, SATURATION_FRACTION,
};
use crate::slide::{load_slide, SlideFetcher, SlideSource};
use crate::slide::tiles::{SLIDE_MPP, TARGET_MPP};

/// Cached working-resolution slide image file name.
pub const FOV_FILE: &str = "fov.tif";

pub struct HeatmapRunner {
    config: HeatmapConfig,
    fetcher: Box<dyn SlideFetcher>,
    extractor: Box<dyn FeatureExtractor>,
    model: MilModel,
    att_cmap: Colormap,
    score_cmap: Colormap,
    true_class_idx: usize,
}

impl HeatmapRunner {
    /// Build a runner, failing fast on any invalid setting: thresholds,
    /// colormap names and class membership are all checked here.
    pub fn new(
        config: HeatmapConfig,
        fetcher: Box<dyn SlideFetcher>,
        extractor: Box<dyn FeatureExtractor>,
        model: MilModel,
    ) -> Result<Self, HeatmapError> {
        config.validate()?;
        let att_cmap = Colormap::by_name(&config.att_cmap)?;
        let score_cmap = Colormap::by_name(&config.score_cmap)?;
        let true_class_idx = model.class_index(&config.true_class)?;
        Ok(Self {
            config,
            fetcher,
            extractor,
            model,
            att_cmap,
            score_cmap,
            true_class_idx,
        })
    }

    pub fn run(&self, slides: &[SlideSource]) -> Result<(), HeatmapError> {
        if slides.is_empty() {
            return Err(HeatmapError::Config("no slides given".into()));
        }

        info!(slides = slides.len(), "Extracting features, attentions and scores");
        let cache = FeatureCache::new(&self.config.cache_dir);
        let mut maps = Vec::with_capacity(slides.len());
        for source in slides {
            let name = source.name();
            let _span = info_span!("slide", name = %name).entered();
            maps.push(self.collect_maps(source, &name, &cache)?);
        }

        let stats = NormalizationStats::collect(&maps, self.true_class_idx, &self.config)?;
        debug!(?stats, "Scaling statistics");

        info!("Writing heatmaps");
        for slide in &maps {
            let _span = info_span!("slide", name = %slide.name).entered();
            self.render_slide(slide, &stats)?;
        }
        Ok(())
    }

    /// Pass 1 for one slide: FOV (cached), features (cached), heads, mask.
    fn collect_maps(
        &self,
        source: &SlideSource,
        name: &str,
        cache: &FeatureCache,
    ) -> Result<SlideMaps, HeatmapError> {
        let slide_cache_dir = self.config.slide_cache_dir(name);
        fs::create_dir_all(&slide_cache_dir)?;

        let fov = self.load_or_build_fov(source, &slide_cache_dir)?;

        let feats = match cache.load(name)? {
            Some(feats) => feats,
            None => {
                let feats = self.extractor.extract(&fov)?;
                cache.store(name, &feats)?;
                feats
            }
        };
        if feats.len_of(Axis(0)) != self.model.feature_dim() {
            return Err(HeatmapError::Inference(format!(
                "backbone produced {} channels, MIL head expects {}",
                feats.len_of(Axis(0)),
                self.model.feature_dim()
            )));
        }

        let feats = if self.config.blur_kernel_size > 0 {
            gaussian_blur(&feats, self.config.blur_kernel_size)
        } else {
            feats
        };

        let attention = self.model.attention_map(&feats)?;
        let scores = self.model.score_map(&feats)?;
        let (rows, cols) = attention.dim();
        let mask = foreground_mask(&fov, rows, cols, self.config.mask_threshold);

        debug!(
            grid = format!("{rows}x{cols}"),
            foreground = mask.iter().filter(|&&m| m).count(),
            "Maps collected"
        );

        Ok(SlideMaps {
            name: name.to_string(),
            attention,
            scores,
            mask,
        })
    }

    /// The cached FOV image is reused verbatim when present; otherwise the
    /// slide is fetched, tile-loaded to working resolution and cached.
    fn load_or_build_fov(
        &self,
        source: &SlideSource,
        slide_cache_dir: &Path,
    ) -> Result<RgbImage, HeatmapError> {
        let fov_path = slide_cache_dir.join(FOV_FILE);
        if fov_path.exists() {
            debug!(path = %fov_path.display(), "Using cached FOV");
            return open_rgb(&fov_path);
        }

        let slide_path = self.fetcher.fetch(source, &self.config.cache_dir)?;
        let slide = image::open(&slide_path)
            .map_err(|e| {
                HeatmapError::ImageProcessing(format!("{}: {e}", slide_path.display()))
            })?
            .to_luma8();
        let fov = load_slide(&slide, SLIDE_MPP, TARGET_MPP)?;
        save_image(&fov_path, || fov.save(&fov_path))?;
        Ok(fov)
    }

    /// Pass 2 for one slide: scale, colorize, composite and write the
    /// seven export images.
    fn render_slide(
        &self,
        slide: &SlideMaps,
        stats: &NormalizationStats,
    ) -> Result<(), HeatmapError> {
        let out_dir = self.config.slide_output_dir(&slide.name);
        fs::create_dir_all(&out_dir)?;

        let fov_path = self.config.slide_cache_dir(&slide.name).join(FOV_FILE);
        let fov = open_rgb(&fov_path)?;
        let (fov_w, fov_h) = fov.dimensions();

        let fov_sat = saturate_fov(&fov, SATURATION_FRACTION);
        let sat_path = out_dir.join(fov_sat_file_name());
        save_image(&sat_path, || fov_sat.save(&sat_path))?;

        // attention map, masked foreground only
        let att_scaled = stats.scale_attention(&slide.attention, &slide.mask);
        let att_img = colorize(&att_scaled, &mask_to_alpha(&slide.mask), &self.att_cmap);
        let att_path = out_dir.join("attention.png");
        save_image(&att_path, || att_img.save(&att_path))?;

        let att_up = upscale_nearest(&att_img, DOWNSAMPLE, fov_w, fov_h);
        let att_up_path = out_dir.join("upscaled_attention.png");
        save_image(&att_up_path, || att_up.save(&att_up_path))?;

        // FOV blend with uniform opacity
        let att_overlay_src =
            with_uniform_alpha(&att_up, (self.config.att_alpha * 255.0).round() as u8);
        let att_overlay = blend_over(&fov_sat, &att_overlay_src);
        let att_overlay_path = out_dir.join("attention-map-overlay.png");
        save_image(&att_overlay_path, || att_overlay.save(&att_overlay_path))?;

        // score map: color from scaled scores, opacity from attention
        let true_scores = slide.scores.index_axis(Axis(0), self.true_class_idx);
        let scaled_scores = stats.scale_scores(&true_scores.to_owned());
        let score_alpha = att_scaled.mapv(|a| a * self.config.score_alpha as f32);
        let score_img = colorize(&scaled_scores, &score_alpha, &self.score_cmap);
        let score_path = out_dir.join("score-map.png");
        save_image(&score_path, || score_img.save(&score_path))?;

        let score_up = upscale_nearest(&score_img, DOWNSAMPLE, fov_w, fov_h);
        let score_up_white: RgbaImage = composite_on_white(&score_up);
        let score_up_path = out_dir.join("upscaled_score-map.png");
        save_image(&score_up_path, || score_up_white.save(&score_up_path))?;

        let score_overlay = blend_over(&fov_sat, &score_up);
        let score_overlay_path = out_dir.join("score-map-overlay.png");
        save_image(&score_overlay_path, || score_overlay.save(&score_overlay_path))?;

        debug!(dir = %out_dir.display(), "Heatmaps written");
        Ok(())
    }
}

fn open_rgb(path: &Path) -> Result<RgbImage, HeatmapError> {
    Ok(image::open(path)
        .map_err(|e| HeatmapError::ImageProcessing(format!("{}: {e}", path.display())))?
        .to_rgb8())
}

fn save_image(
    path: &Path,
    save: impl FnOnce() -> image::ImageResult<()>,
) -> Result<(), HeatmapError> {
    save().map_err(|e| HeatmapError::ImageProcessing(format!("{}: {e}", path.display())))
}
