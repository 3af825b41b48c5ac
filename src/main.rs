//! SnapText - extract text from an image file
//!
//! Runs detection and recognition on one image and prints the words found.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use snaptext::config::{self, AppConfig};
use snaptext::{capture, storage, VisionPipeline};

/// SnapText - text extraction from images
#[derive(Parser, Debug)]
#[command(name = "snaptext")]
#[command(about = "Detect and recognize text in an image")]
struct Args {
    /// Image file to process
    image: PathBuf,

    /// Configuration file (defaults to the user config directory)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Number of execution contexts (0 = available parallelism)
    #[arg(long)]
    pool_size: Option<usize>,

    /// Force constrained device mode
    #[arg(long)]
    constrained: bool,

    /// Sort words into reading order
    #[arg(long)]
    sorted: bool,

    /// Print the full result as JSON
    #[arg(long)]
    json: bool,

    /// Refuse to download missing models
    #[arg(long)]
    offline: bool,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging, RUST_LOG wins over --verbose
    let default_level = if args.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let mut config = load_or_create_config(args.config.as_deref())?;
    if let Some(size) = args.pool_size {
        config.pool.size = size;
    }
    if args.constrained {
        config.device.force_constrained = Some(true);
    }
    if args.sorted {
        config.pipeline.sort_output = true;
    }
    if args.offline {
        config.models.offline = true;
    }

    let frame = capture::load_frame(&args.image)?;
    info!("Loaded {:?} ({}x{})", args.image, frame.width, frame.height);

    let pipeline = VisionPipeline::new(config).context("Failed to start vision pipeline")?;
    let result = pipeline.process(frame).context("Text extraction failed")?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        for word in &result.words {
            let b = result.to_frame_pixels(&word.bounding_box);
            println!("{}\t{},{} {}x{}", word.word, b.x, b.y, b.width, b.height);
        }
    }

    info!("Done in {}ms", result.processing_time_ms);
    Ok(())
}

/// Load configuration from file or create default
fn load_or_create_config(path: Option<&std::path::Path>) -> Result<AppConfig> {
    if let Some(path) = path {
        let config = config::load_config(path)?;
        info!("Loaded configuration from {:?}", path);
        return Ok(config);
    }

    if let Ok(config_path) = storage::default_config_path() {
        if config_path.exists() {
            if let Ok(config) = config::load_config(&config_path) {
                info!("Loaded configuration from {:?}", config_path);
                return Ok(config);
            }
        } else {
            let config = AppConfig::default();
            if config::save_config(&config, &config_path).is_ok() {
                info!("Wrote default configuration to {:?}", config_path);
            }
            return Ok(config);
        }
    }

    info!("Using default configuration");
    Ok(AppConfig::default())
}
