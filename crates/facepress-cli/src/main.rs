use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use facepress_core::{load_image, CascadeDetector, Config, FaceLocator, Pipeline};
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(
    name = "facepress",
    version,
    about = "Compress photo batches while keeping faces at full quality"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compress every image in the input directory
    Run {
        #[command(flatten)]
        dirs: DirArgs,
        #[command(flatten)]
        detect: DetectArgs,
        /// JPEG quality of the compressed background (0-100)
        #[arg(short, long)]
        quality: Option<u8>,
        /// JPEG quality for .jpg/.jpeg outputs (encoder default if unset)
        #[arg(long)]
        output_quality: Option<u8>,
        /// Outline restored face regions in blue
        #[arg(long)]
        draw_outlines: bool,
        /// Print a size comparison after the run
        #[arg(long)]
        analyze: bool,
        /// Keep the scratch directory after the run
        #[arg(long)]
        keep_scratch: bool,
        /// Skip images that fail instead of aborting
        #[arg(long)]
        continue_on_error: bool,
    },
    /// Print the face regions found in the given images
    Detect {
        #[command(flatten)]
        detect: DetectArgs,
        #[arg(long)]
        config: Option<PathBuf>,
        /// Emit one JSON object per image
        #[arg(long)]
        json: bool,
        #[arg(required = true)]
        images: Vec<PathBuf>,
    },
    /// Compare file sizes of an earlier run (needs its scratch directory)
    Analyze {
        #[command(flatten)]
        dirs: DirArgs,
        /// Emit the report as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Args)]
struct DirArgs {
    /// TOML config file
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Directory of source images
    #[arg(short, long)]
    input: Option<PathBuf>,
    /// Directory for the composites
    #[arg(short, long)]
    output: Option<PathBuf>,
    /// Directory for the compressed intermediates
    #[arg(long)]
    scratch: Option<PathBuf>,
}

#[derive(Args)]
struct DetectArgs {
    /// OpenCV Haar cascade XML
    #[arg(long)]
    cascade: Option<PathBuf>,
    #[arg(long)]
    scale_factor: Option<f64>,
    #[arg(long)]
    min_neighbors: Option<u32>,
    /// Smallest face size in pixels
    #[arg(long)]
    min_size: Option<u32>,
    /// Largest face size in pixels
    #[arg(long)]
    max_size: Option<u32>,
}

impl DirArgs {
    fn apply(self, cfg: &mut Config) {
        if let Some(v) = self.input {
            cfg.input_dir = v;
        }
        if let Some(v) = self.output {
            cfg.output_dir = v;
        }
        if let Some(v) = self.scratch {
            cfg.scratch_dir = v;
        }
    }
}

impl DetectArgs {
    fn apply(self, cfg: &mut Config) {
        if let Some(v) = self.cascade {
            cfg.cascade_path = v;
        }
        if let Some(v) = self.scale_factor {
            cfg.scale_factor = v;
        }
        if let Some(v) = self.min_neighbors {
            cfg.min_neighbors = v;
        }
        if let Some(v) = self.min_size {
            cfg.min_size = v;
        }
        if self.max_size.is_some() {
            cfg.max_size = self.max_size;
        }
    }
}

/// Defaults, then the config file, then `FACEPRESS_*` variables.
/// Command-line flags are applied by the caller.
fn base_config(path: Option<&Path>) -> Result<Config> {
    let mut cfg = match path {
        Some(p) => Config::load(p).with_context(|| format!("loading {}", p.display()))?,
        None => Config::default(),
    };
    cfg.apply_env();
    Ok(cfg)
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            dirs,
            detect,
            quality,
            output_quality,
            draw_outlines,
            analyze,
            keep_scratch,
            continue_on_error,
        } => {
            let mut cfg = base_config(dirs.config.as_deref())?;
            dirs.apply(&mut cfg);
            detect.apply(&mut cfg);
            if let Some(q) = quality {
                cfg.jpeg_quality = q;
            }
            if output_quality.is_some() {
                cfg.output_quality = output_quality;
            }
            cfg.draw_outlines |= draw_outlines;
            cfg.analyze |= analyze;
            cfg.keep_scratch |= keep_scratch;
            cfg.continue_on_error |= continue_on_error;
            run(cfg)
        }
        Commands::Detect {
            detect,
            config,
            json,
            images,
        } => {
            let mut cfg = base_config(config.as_deref())?;
            detect.apply(&mut cfg);
            detect_images(&cfg, &images, json)
        }
        Commands::Analyze { dirs, json } => {
            let mut cfg = base_config(dirs.config.as_deref())?;
            dirs.apply(&mut cfg);
            let analysis =
                facepress_core::analyze(&cfg.input_dir, &cfg.scratch_dir, &cfg.output_dir)
                    .context("size analysis failed (was the run made with --keep-scratch?)")?;
            if json {
                println!("{}", serde_json::to_string_pretty(&analysis)?);
            } else {
                print!("{analysis}");
            }
            Ok(())
        }
    }
}

fn run(cfg: Config) -> Result<()> {
    tracing::debug!(config = ?cfg, "resolved configuration");
    let pipeline = Pipeline::from_config(cfg).context("failed to start pipeline")?;
    let summary = pipeline
        .run(|outcome| println!("Compressed {}", outcome.name))
        .context("batch aborted")?;

    if let Some(analysis) = &summary.analysis {
        println!();
        print!("{analysis}");
    }

    if !summary.failed.is_empty() {
        for failed in &summary.failed {
            eprintln!("failed: {}: {}", failed.source.display(), failed.error);
        }
        bail!(
            "{} of {} images failed",
            summary.failed.len(),
            summary.failed.len() + summary.processed.len()
        );
    }
    Ok(())
}

fn detect_images(cfg: &Config, images: &[PathBuf], json: bool) -> Result<()> {
    cfg.validate()?;
    tracing::debug!(config = ?cfg, images = images.len(), "resolved configuration");
    let detector = CascadeDetector::load(&cfg.cascade_path, cfg.detector_params())
        .context("failed to load cascade")?;

    for path in images {
        let image = load_image(path)?;
        let regions = detector
            .locate(&image)
            .with_context(|| format!("detecting faces in {}", path.display()))?;

        if json {
            let line = serde_json::json!({
                "path": path.display().to_string(),
                "width": image.width(),
                "height": image.height(),
                "regions": regions,
            });
            println!("{line}");
        } else {
            println!("{}: {} face(s)", path.display(), regions.len());
            for r in &regions {
                println!("  x={} y={} w={} h={}", r.x, r.y, r.width, r.height);
            }
        }
    }
    Ok(())
}
