use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use wsi_heatmap::config::{default_log_filter, HeatmapConfig, APP_VERSION};
use wsi_heatmap::error::HeatmapError;
use wsi_heatmap::features::FeatureExtractor;
use wsi_heatmap::model::MilModel;
use wsi_heatmap::runner::HeatmapRunner;
use wsi_heatmap::slide::{read_slide_list, CachingFetcher, SlideSource};

/// Create attention and score heatmaps for whole-slide images with a
/// trained MIL classifier.
#[derive(Parser, Debug)]
#[command(name = "wsi-heatmap", version = APP_VERSION, about)]
struct Cli {
    /// Slides to create heatmaps for, as paths or http(s) URLs.
    #[arg(value_name = "SLIDE")]
    slides: Vec<String>,

    /// Directory containing the model export (backbone.onnx, mil-head.json).
    #[arg(short = 'm', long, value_name = "DIR")]
    model_path: PathBuf,

    /// Root directory the per-slide heatmaps are written to.
    #[arg(short = 'o', long, value_name = "DIR")]
    output_path: PathBuf,

    /// Class to render as "hot" in the score heatmap.
    #[arg(short = 't', long, value_name = "CLASS")]
    true_class: String,

    /// File with additional slides to process, one path or URL per line.
    #[arg(long, value_name = "FILE")]
    from_file: Option<PathBuf>,

    /// Gaussian pooling kernel size over the feature map. Must be odd;
    /// 0 disables pooling.
    #[arg(long, default_value_t = 15, value_name = "N")]
    blur_kernel_size: usize,

    /// Cache directory for downloads, FOV images and feature tensors.
    /// Defaults to <OUTPUT>/cache.
    #[arg(long, value_name = "DIR")]
    cache_dir: Option<PathBuf>,

    /// Skip GPU execution-provider registration and run on the CPU.
    #[arg(long)]
    force_cpu: bool,

    /// Brightness threshold for the foreground mask (windowed sum).
    #[arg(long, default_value_t = 20, value_name = "N")]
    mask_threshold: u64,

    /// Quantile to squash attention towards 1 when scaling.
    #[arg(long, default_value_t = 1.0, value_name = "Q")]
    att_upper_threshold: f64,

    /// Quantile to squash attention towards 0 when scaling.
    #[arg(long, default_value_t = 0.01, value_name = "Q")]
    att_lower_threshold: f64,

    /// Quantile bounding score outliers.
    #[arg(long, default_value_t = 0.95, value_name = "Q")]
    score_threshold: f64,

    /// Colormap of the attention heatmap.
    #[arg(long, default_value = "magma", value_name = "NAME")]
    att_cmap: String,

    /// Colormap of the score heatmap.
    #[arg(long, default_value = "coolwarm", value_name = "NAME")]
    score_cmap: String,

    /// Opaqueness of the attention map in the FOV overlay.
    #[arg(long, default_value_t = 0.5, value_name = "A")]
    att_alpha: f64,

    /// Opaqueness of the score map at the highest-attention location.
    #[arg(long, default_value_t = 1.0, value_name = "A")]
    score_alpha: f64,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(default_log_filter())),
        )
        .init();

    match run(Cli::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<(), HeatmapError> {
    let cache_dir = match cli.cache_dir {
        Some(dir) => dir,
        None => {
            let dir = cli.output_path.join("cache");
            warn!(
                dir = %dir.display(),
                "No cache directory specified; caching to the output directory"
            );
            dir
        }
    };

    let config = HeatmapConfig {
        model_path: cli.model_path,
        output_path: cli.output_path,
        true_class: cli.true_class,
        blur_kernel_size: cli.blur_kernel_size,
        cache_dir,
        force_cpu: cli.force_cpu,
        mask_threshold: cli.mask_threshold,
        att_upper_threshold: cli.att_upper_threshold,
        att_lower_threshold: cli.att_lower_threshold,
        score_threshold: cli.score_threshold,
        att_cmap: cli.att_cmap,
        score_cmap: cli.score_cmap,
        att_alpha: cli.att_alpha,
        score_alpha: cli.score_alpha,
    };
    config.validate()?;

    let mut slides: Vec<SlideSource> = cli
        .slides
        .iter()
        .map(|s| SlideSource::parse(s))
        .collect::<Result<_, _>>()?;
    if let Some(list) = &cli.from_file {
        slides.extend(read_slide_list(list)?);
    }
    if slides.is_empty() {
        return Err(HeatmapError::Config(
            "no slides given (positional arguments or --from-file)".into(),
        ));
    }

    info!(
        version = APP_VERSION,
        slides = slides.len(),
        model = %config.model_path.display(),
        "Starting heatmap run"
    );

    let model = MilModel::load(&config.model_path)?;
    let extractor = build_extractor(&config)?;
    let runner = HeatmapRunner::new(config, Box::new(CachingFetcher::new()), extractor, model)?;
    runner.run(&slides)
}

#[cfg(feature = "onnx")]
fn build_extractor(config: &HeatmapConfig) -> Result<Box<dyn FeatureExtractor>, HeatmapError> {
    use wsi_heatmap::features::OnnxBackbone;
    Ok(Box::new(OnnxBackbone::load(
        &config.model_path,
        config.force_cpu,
    )?))
}

#[cfg(not(feature = "onnx"))]
fn build_extractor(_config: &HeatmapConfig) -> Result<Box<dyn FeatureExtractor>, HeatmapError> {
    Err(HeatmapError::Config(
        "this build has no inference backend; rebuild with `--features onnx`".into(),
    ))
}
