// ============================================================================
// TokenStudio CLI — headless batch processing via command-line arguments
// ============================================================================
//
// Usage examples:
//   tokenstudio -i token.png --hue 40 --saturation 20 -o out.png
//   tokenstudio -i art/*.png --recolor-hue 200 --crop-threshold 12 --pad 8 --output-dir out/
//   tokenstudio -i portrait.jpg --mask portrait_mask.png --store ~/tokens --link hero-42
//
// Files are processed on the filter worker pool; results are written as PNG.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Instant;

use clap::Parser;
use image::{GrayImage, Rgba, RgbaImage};

use crate::assets::{AssetStore, AssetType, NewAsset};
use crate::io;
use crate::logger;
use crate::ops::FilterError;
use crate::ops::adjustments::Adjustments;
use crate::ops::canvas_ops::{self, Padding};
use crate::ops::filters;
use crate::ops::recolor::{self, RecolorTarget, SelectiveRecolor};
use crate::ops::segmentation;
use crate::ops::worker::{CancelToken, FilterWorkerPool, JobOutcome};
use crate::settings::EngineSettings;

// ============================================================================
// CLI argument definition (clap Derive)
// ============================================================================

/// TokenStudio headless token processor.
#[derive(Parser, Debug)]
#[command(
    name = "tokenstudio",
    about = "TokenStudio headless batch token processor",
    long_about = "Run colour adjustments, recolouring, filters, masking, cropping and\n\
                  padding on image files and write the result as PNG. Optionally\n\
                  store each result in a deduplicating asset store.\n\n\
                  Example:\n  \
                  tokenstudio -i token.png --recolor-hue 120 -o green.png\n  \
                  tokenstudio -i *.png --crop-threshold 10 --pad 4 --output-dir out/"
)]
pub struct CliArgs {
    /// Input file(s). Glob patterns accepted (e.g. "*.png", "tokens/*.jpg").
    #[arg(short, long, required = true, num_args = 1..)]
    pub input: Vec<String>,

    /// Output file path. Only valid for single-file input.
    #[arg(short, long, value_name = "FILE")]
    pub output: Option<PathBuf>,

    /// Output directory for batch processing.
    #[arg(long, value_name = "DIR")]
    pub output_dir: Option<PathBuf>,

    /// Brightness shift (-100..100).
    #[arg(long, default_value_t = 0.0, allow_negative_numbers = true)]
    pub brightness: f32,

    /// Contrast (-100..100).
    #[arg(long, default_value_t = 0.0, allow_negative_numbers = true)]
    pub contrast: f32,

    /// Saturation (-100..100).
    #[arg(long, default_value_t = 0.0, allow_negative_numbers = true)]
    pub saturation: f32,

    /// Hue rotation in degrees.
    #[arg(long, default_value_t = 0.0, allow_negative_numbers = true)]
    pub hue: f32,

    /// Replace the hue of coloured pixels with this hue (degrees).
    #[arg(long, value_name = "DEG")]
    pub recolor_hue: Option<f32>,

    /// Hue for the right half of the image (split recolor).
    #[arg(long, value_name = "DEG", requires = "recolor_hue")]
    pub recolor_right_hue: Option<f32>,

    /// Saturation (0..1) at or below which pixels count as neutral.
    /// Suggested from the image when omitted.
    #[arg(long, value_name = "0-1")]
    pub saturation_threshold: Option<f32>,

    /// Grayscale the image and tint it with this colour (#rrggbb).
    #[arg(long, value_name = "COLOR")]
    pub overlay: Option<String>,

    /// Bottom colour for a vertical gradient overlay.
    #[arg(long, value_name = "COLOR", requires = "overlay")]
    pub overlay_bottom: Option<String>,

    /// Overlay strength (0..1).
    #[arg(long, default_value_t = 1.0)]
    pub intensity: f32,

    /// Box blur radius in pixels.
    #[arg(long, value_name = "PX")]
    pub blur: Option<u32>,

    /// Sharpen amount.
    #[arg(long)]
    pub sharpen: Option<f32>,

    /// Sobel edge detection.
    #[arg(long)]
    pub edges: bool,

    /// Grayscale mask image applied to the alpha channel (white keeps).
    #[arg(long, value_name = "FILE")]
    pub mask: Option<PathBuf>,

    /// Crop to content that differs from the top-left pixel by more than this.
    #[arg(long, value_name = "DIST")]
    pub crop_threshold: Option<f32>,

    /// Uniform padding in pixels.
    #[arg(long, value_name = "PX")]
    pub pad: Option<u32>,

    /// Padding colour (default transparent).
    #[arg(long, value_name = "COLOR", default_value = "#00000000")]
    pub pad_color: String,

    /// Save each result into the asset store at DIR and print its id.
    #[arg(long, value_name = "DIR")]
    pub store: Option<PathBuf>,

    /// Project scope for stored results (global when omitted).
    #[arg(long, value_name = "ID", requires = "store")]
    pub project: Option<String>,

    /// Entity id to link stored results to.
    #[arg(long, value_name = "ID", requires = "store")]
    pub link: Option<String>,

    /// Asset category for stored results (icon, background, texture, ...).
    #[arg(long, value_name = "TYPE", default_value = "export", value_parser = parse_asset_type)]
    pub asset_type: AssetType,

    /// Settings file to use instead of the default location.
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Log file to write instead of the default location.
    #[arg(long, value_name = "FILE")]
    pub log: Option<PathBuf>,

    /// Print per-file timing and echo log output to stderr.
    #[arg(short, long)]
    pub verbose: bool,
}

// ============================================================================
// Pipeline
// ============================================================================

/// The per-file processing steps selected on the command line, in the order
/// they run.
#[derive(Debug, Default)]
pub struct Pipeline {
    pub adjustments: Adjustments,
    pub recolor: Option<SelectiveRecolor>,
    /// `recolor` has no explicit threshold: suggest one per image.
    pub auto_threshold: bool,
    pub overlay: Option<(RecolorTarget, f32)>,
    pub blur: Option<u32>,
    pub sharpen: Option<f32>,
    pub edges: bool,
    pub mask: Option<GrayImage>,
    pub crop_threshold: Option<f32>,
    pub padding: Option<(Padding, Rgba<u8>)>,
}

impl Pipeline {
    pub fn from_args(args: &CliArgs) -> Result<Self, String> {
        let color = |s: &str| recolor::parse_hex_color(s).map_err(|e| e.to_string());

        let overlay = match &args.overlay {
            Some(top) => {
                let top = color(top)?;
                let target = match &args.overlay_bottom {
                    Some(bottom) => RecolorTarget::VerticalGradient { top, bottom: color(bottom)? },
                    None => RecolorTarget::Solid(top),
                };
                Some((target, args.intensity))
            }
            None => None,
        };

        let recolor = args.recolor_hue.map(|hue| SelectiveRecolor {
            target_hue: hue,
            right_hue: args.recolor_right_hue,
            saturation_threshold: args
                .saturation_threshold
                .unwrap_or(recolor::DEFAULT_SATURATION_THRESHOLD),
            ..SelectiveRecolor::default()
        });

        let mask = match &args.mask {
            Some(path) => Some(
                image::open(path)
                    .map_err(|e| format!("could not read mask '{}': {}", path.display(), e))?
                    .into_luma8(),
            ),
            None => None,
        };

        let padding = match args.pad {
            Some(px) => Some((Padding::uniform(px), color(&args.pad_color)?)),
            None => None,
        };

        Ok(Self {
            adjustments: Adjustments {
                brightness: args.brightness,
                contrast: args.contrast,
                saturation: args.saturation,
                hue: args.hue,
            },
            recolor,
            auto_threshold: args.saturation_threshold.is_none(),
            overlay,
            blur: args.blur,
            sharpen: args.sharpen,
            edges: args.edges,
            mask,
            crop_threshold: args.crop_threshold,
            padding,
        })
    }

    pub fn apply(&self, input: &RgbaImage) -> Result<RgbaImage, FilterError> {
        let mut img = if self.adjustments.is_identity() {
            input.clone()
        } else {
            self.adjustments.apply(input)
        };
        if let Some(params) = &self.recolor {
            let mut params = *params;
            if self.auto_threshold {
                params.saturation_threshold = recolor::suggest_saturation_threshold(&img);
            }
            img = recolor::replace_icon_color(&img, &params);
        }
        if let Some((target, intensity)) = self.overlay {
            img = recolor::grayscale_overlay(&img, target, intensity);
        }
        if let Some(radius) = self.blur {
            img = filters::box_blur(&img, radius);
        }
        if let Some(amount) = self.sharpen {
            img = filters::sharpen(&img, amount);
        }
        if self.edges {
            img = filters::edge_detect(&img);
        }
        if let Some(mask) = &self.mask {
            img = segmentation::apply_manual_mask(&img, mask)?;
        }
        if let Some(threshold) = self.crop_threshold {
            img = canvas_ops::crop_to_content(&img, threshold).0;
        }
        if let Some((padding, fill)) = self.padding {
            img = canvas_ops::pad(&img, padding, fill)?;
        }
        Ok(img)
    }
}

// ============================================================================
// Public entry point
// ============================================================================

/// Run all CLI processing and return an OS exit code.
/// `0` = all files succeeded, `1` = one or more files failed.
pub fn run(args: CliArgs) -> ExitCode {
    let settings = match &args.config {
        Some(path) => EngineSettings::load_from(path),
        None => EngineSettings::load(),
    };

    logger::set_echo_stderr(args.verbose);
    match (&args.log, settings.log_path.is_empty()) {
        (Some(path), _) => logger::init_at(path),
        (None, false) => logger::init_at(Path::new(&settings.log_path)),
        (None, true) => logger::init(),
    };

    // Resolve glob patterns / literal paths → concrete PathBufs
    let inputs = resolve_inputs(&args.input);
    if inputs.is_empty() {
        eprintln!("error: no input files matched the given pattern(s).");
        return ExitCode::FAILURE;
    }

    // Multiple inputs require --output-dir, not --output
    if inputs.len() > 1 && args.output.is_some() && args.output_dir.is_none() {
        eprintln!(
            "error: {} input files given but --output only accepts a single file path.\n\
             Use --output-dir to specify a destination directory for batch processing.",
            inputs.len()
        );
        return ExitCode::FAILURE;
    }

    let pipeline = match Pipeline::from_args(&args) {
        Ok(p) => Arc::new(p),
        Err(e) => {
            eprintln!("error: {}", e);
            return ExitCode::FAILURE;
        }
    };

    if let Some(dir) = &args.output_dir
        && let Err(e) = std::fs::create_dir_all(dir)
    {
        eprintln!("error: could not create output directory '{}': {}", dir.display(), e);
        return ExitCode::FAILURE;
    }

    let mut store = match &args.store {
        Some(dir) => match AssetStore::open_dir(dir) {
            Ok(s) => Some(s.with_settings(&settings)),
            Err(e) => {
                eprintln!("error: could not open asset store '{}': {}", dir.display(), e);
                return ExitCode::FAILURE;
            }
        },
        None => None,
    };

    let workers = match FilterWorkerPool::from_settings(&settings) {
        Ok(w) => w,
        Err(e) => {
            eprintln!("error: {}", e);
            return ExitCode::FAILURE;
        }
    };

    log_info!("CLI: {} input(s) on {} worker(s)", inputs.len(), workers.threads());

    // Queue every file, then collect in input order.
    let started = Instant::now();
    let tickets: Vec<_> = inputs
        .iter()
        .map(|input| {
            let path = input.clone();
            let pipeline = Arc::clone(&pipeline);
            workers.submit_job(input.display().to_string(), CancelToken::new(), move |_| {
                let img = io::load_image(&path).map_err(|e| format!("load failed: {}", e))?;
                pipeline.apply(&img).map_err(|e| format!("processing failed: {}", e))
            })
        })
        .collect();

    let total = inputs.len();
    let multi = total > 1;
    let mut any_failure = false;

    for (idx, (input_path, ticket)) in inputs.iter().zip(tickets).enumerate() {
        if multi || args.verbose {
            println!("[{}/{}] {}", idx + 1, total, input_path.display());
        }

        let Some(output_path) = build_output_path(input_path, args.output.as_deref(), args.output_dir.as_deref()) else {
            eprintln!("  error: cannot determine output path for '{}'.", input_path.display());
            any_failure = true;
            continue;
        };

        let result = match ticket.wait() {
            JobOutcome::Completed(r) => r,
            JobOutcome::Cancelled => Err("cancelled".to_string()),
            JobOutcome::Failed(msg) => Err(format!("worker failed: {}", msg)),
        };

        match result.and_then(|img| finish_one(&img, &output_path, store.as_mut(), &args)) {
            Ok(()) => {
                if args.verbose || multi {
                    println!(
                        "  → {} ({:.0}ms)",
                        output_path.display(),
                        started.elapsed().as_secs_f64() * 1000.0
                    );
                }
            }
            Err(e) => {
                log_err!("CLI: {}: {}", input_path.display(), e);
                eprintln!("  error: {}", e);
                any_failure = true;
            }
        }
    }

    if any_failure { ExitCode::FAILURE } else { ExitCode::SUCCESS }
}

fn parse_asset_type(name: &str) -> Result<AssetType, String> {
    AssetType::from_name(name).ok_or_else(|| {
        let known: Vec<&str> = AssetType::all().iter().map(AssetType::name).collect();
        format!("unknown asset type '{}' (expected one of: {})", name, known.join(", "))
    })
}

/// Write the processed image and, with `--store`, save it as an asset.
fn finish_one(img: &RgbaImage, output: &Path, store: Option<&mut AssetStore>, args: &CliArgs) -> Result<(), String> {
    let png = io::encode_png(img).map_err(|e| format!("encode failed: {}", e))?;
    std::fs::write(output, &png).map_err(|e| format!("save failed: {}", e))?;

    if let Some(store) = store {
        let filename = output
            .file_name()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "export.png".to_string());
        let mut new = NewAsset::new(args.asset_type, filename, png);
        if let Some(p) = &args.project {
            new = new.in_project(p.clone());
        }
        if let Some(l) = &args.link {
            new = new.linked_to(l.clone());
        }
        let options = store.default_options();
        let id = store.save(new, options).map_err(|e| format!("store failed: {}", e))?;
        println!("  stored as {}", id);
    }
    Ok(())
}

// ============================================================================
// Helpers
// ============================================================================

/// Expand glob patterns and literal paths into a deduplicated, ordered list.
fn resolve_inputs(patterns: &[String]) -> Vec<PathBuf> {
    let mut result: Vec<PathBuf> = Vec::new();

    for pattern in patterns {
        let as_path = Path::new(pattern);

        if as_path.exists() {
            // Literal path, used directly
            if !result.iter().any(|p| p.as_path() == as_path) {
                result.push(as_path.to_path_buf());
            }
            continue;
        }

        // Treat as glob pattern
        match glob::glob(pattern) {
            Ok(entries) => {
                let mut matched = false;
                for entry in entries.flatten() {
                    if !result.contains(&entry) {
                        result.push(entry);
                    }
                    matched = true;
                }
                if !matched {
                    eprintln!("warning: pattern '{}' matched no files.", pattern);
                }
            }
            Err(e) => {
                eprintln!("warning: invalid glob '{}': {}", pattern, e);
            }
        }
    }

    result
}

/// Compute the output path for a single input file.
///
/// Priority:
/// 1. `--output` (explicit path, used for single-file input)
/// 2. `--output-dir` (batch directory, derives filename from input stem)
/// 3. Fallback: next to the input as `<stem>.png`, or `<stem>_out.png`
///    when that would overwrite the input
fn build_output_path(input: &Path, output: Option<&Path>, output_dir: Option<&Path>) -> Option<PathBuf> {
    if let Some(out) = output {
        return Some(out.to_path_buf());
    }

    let stem = input.file_stem()?.to_string_lossy().into_owned();

    if let Some(dir) = output_dir {
        return Some(dir.join(format!("{}.png", stem)));
    }

    let parent = input.parent().unwrap_or(Path::new("."));
    let candidate = parent.join(format!("{}.png", stem));

    // Avoid silent overwrite of the input
    if candidate == input {
        Some(parent.join(format!("{}_out.png", stem)))
    } else {
        Some(candidate)
    }
}
