use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use mf_core::config::{ProgressMode, WorkerCount};

#[derive(Parser)]
#[command(name = "mp3forge")]
#[command(author, version, about = "Extract MP3 audio from video files in parallel")]
pub struct Cli {
    /// Config file (JSON or TOML) applied over the user and project files
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Only log errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Also write logs to this file
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Convert video files (or directories of them) to MP3
    Convert(ConvertArgs),

    /// Check that required external tools are available
    CheckTools,

    /// Validate configuration file
    Validate {
        /// Config file to validate (defaults to the merged configuration)
        config: Option<PathBuf>,
    },

    /// Display version information
    Version,
}

#[derive(Args)]
pub struct ConvertArgs {
    /// Input files or directories
    #[arg(required = true)]
    pub inputs: Vec<PathBuf>,

    /// Directory for the MP3 files (defaults to next to each input)
    #[arg(short, long)]
    pub output_dir: Option<PathBuf>,

    /// Audio bitrate, e.g. 192k
    #[arg(short, long)]
    pub bitrate: Option<String>,

    /// Output sample rate in Hz
    #[arg(short, long)]
    pub sample_rate: Option<u32>,

    /// Worker count: a number or "auto"
    #[arg(short, long)]
    pub workers: Option<WorkerCount>,

    /// Stop at the first failed file
    #[arg(long)]
    pub fail_fast: bool,

    /// Convert one file at a time, in order
    #[arg(long)]
    pub sequential: bool,

    /// Do not copy source metadata
    #[arg(long)]
    pub no_metadata: bool,

    /// Per-file timeout in seconds
    #[arg(long, value_name = "SECS")]
    pub timeout: Option<u64>,

    /// Progress display: rich, plain or none
    #[arg(long)]
    pub progress: Option<ProgressMode>,

    /// Print the summary as JSON
    #[arg(long)]
    pub json: bool,
}
