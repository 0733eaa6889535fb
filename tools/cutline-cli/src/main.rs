//! Cutline CLI: hardware checks, source probing, and rendering.
//!
//! Usage:
//!   cutline check [--self-test]      Report GPU backends and codec sessions
//!   cutline probe <FILE>             Show stream information
//!   cutline render <FILE> -o <OUT>   Re-encode a frame range of one source

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

mod commands;

#[derive(Parser)]
#[command(
    name = "cutline",
    about = "Hardware-accelerated timeline renderer",
    version,
    author
)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Report available GPU backends and codec sessions
    Check {
        /// Also run the whole pipeline against in-memory media and devices
        #[arg(long)]
        self_test: bool,
    },

    /// Show stream information for a source file
    Probe {
        path: PathBuf,

        /// Print the stream description as JSON
        #[arg(long)]
        json: bool,
    },

    /// Render a frame range of one source into a new file
    Render(RenderArgs),
}

/// Options of `cutline render`.
#[derive(Args, Debug)]
pub struct RenderArgs {
    /// Source file
    pub input: PathBuf,

    /// Output file
    #[arg(short, long)]
    pub output: PathBuf,

    /// First source frame
    #[arg(long, default_value = "0")]
    pub start: u64,

    /// Source frame to stop before (defaults to the end of the source)
    #[arg(long)]
    pub end: Option<u64>,

    /// JSON instruction list to render instead of a plain range; source id "main" is the input
    #[arg(long)]
    pub instructions: Option<PathBuf>,

    /// Hardware backend: auto, none, cuda, vaapi, videotoolbox
    #[arg(long)]
    pub hwaccel: Option<String>,

    /// GPU device index
    #[arg(long)]
    pub device: Option<u32>,

    /// Decode in software
    #[arg(long)]
    pub no_hw_decode: bool,

    /// Encode in software
    #[arg(long)]
    pub no_hw_encode: bool,

    /// Output codec: h264, hevc, av1
    #[arg(long)]
    pub codec: Option<String>,

    /// Target bitrate in kbit/s (wins over --quality)
    #[arg(long)]
    pub bitrate: Option<u32>,

    /// Constant-quality factor
    #[arg(long)]
    pub quality: Option<u32>,

    /// Encoder preset
    #[arg(long)]
    pub preset: Option<String>,

    /// Codec threads (0 = auto)
    #[arg(long)]
    pub threads: Option<u32>,

    /// Output width (defaults to the source width)
    #[arg(long)]
    pub width: Option<u32>,

    /// Output height (defaults to the source height)
    #[arg(long)]
    pub height: Option<u32>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose { "debug" } else { "info" };
    cutline_common::logging::init_logging(&cutline_common::config::LoggingConfig {
        level: log_level.to_string(),
        json: cli.log_json,
        file: None,
    });

    match cli.command {
        Commands::Check { self_test } => commands::check::run(self_test),
        Commands::Probe { path, json } => commands::probe::run(path, json),
        Commands::Render(args) => commands::render::run(args).await,
    }
}
