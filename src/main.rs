mod cli;
mod inputs;

use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use cli::{Cli, Commands, ConvertArgs};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use mf_av::{Mp3Encoder, ToolRegistry};
use mf_batch::{BatchProcessor, BatchSummary};
use mf_core::config::{Config, ConfigSources, LayeredConfig, ProgressMode, WorkerCount};

const CRATES: &[&str] = &["mp3forge", "mf_core", "mf_av", "mf_engine", "mf_batch"];

fn main() -> ExitCode {
    let cli = Cli::parse();

    let layered = match load_config(cli.config.clone()) {
        Ok(layered) => layered,
        Err(e) => {
            eprintln!("Error: {e:#}");
            return ExitCode::from(2);
        }
    };

    if let Err(e) = init_logging(&cli, &layered.config) {
        eprintln!("Error: {e:#}");
        return ExitCode::from(2);
    }
    for path in &layered.loaded {
        tracing::debug!("Loaded config layer {}", path.display());
    }
    for warning in &layered.warnings {
        tracing::warn!("{warning}");
    }

    let result = match cli.command {
        Commands::Convert(args) => convert(args, layered.config),
        Commands::CheckTools => check_tools(&layered.config),
        Commands::Validate {
            config: config_path,
        } => validate_config(config_path.as_deref(), &layered),
        Commands::Version => {
            println!("mp3forge {}", env!("CARGO_PKG_VERSION"));
            Ok(ExitCode::SUCCESS)
        }
    };

    result.unwrap_or_else(|e| {
        eprintln!("Error: {e:#}");
        ExitCode::from(2)
    })
}

/// User, project and `--config` layers merged over the defaults.
fn load_config(explicit: Option<PathBuf>) -> Result<LayeredConfig> {
    let described = explicit.as_ref().map(|p| p.display().to_string());
    Config::load_layered(&ConfigSources::discover(explicit)).with_context(|| match described {
        Some(p) => format!("failed to load config {p}"),
        None => "failed to load config".to_string(),
    })
}

/// `RUST_LOG` wins; otherwise the level comes from the flags or the config.
fn init_logging(cli: &Cli, config: &Config) -> Result<()> {
    let env_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| {
        let level = if cli.verbose {
            "debug"
        } else if cli.quiet {
            "error"
        } else {
            config.logging.level.as_str()
        };
        CRATES
            .iter()
            .map(|c| format!("{c}={level}"))
            .collect::<Vec<_>>()
            .join(",")
    });

    let file_layer = match cli.log_file.as_ref().or(config.logging.file.as_ref()) {
        Some(path) => {
            let file = File::create(path)
                .with_context(|| format!("failed to open log file {}", path.display()))?;
            Some(
                fmt::layer()
                    .with_ansi(false)
                    .with_writer(Mutex::new(file)),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(EnvFilter::new(&env_filter))
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .init();
    Ok(())
}

fn apply_overrides(config: &mut Config, args: &ConvertArgs) {
    if let Some(bitrate) = &args.bitrate {
        config.encoding.bitrate = bitrate.clone();
    }
    if args.sample_rate.is_some() {
        config.encoding.sample_rate = args.sample_rate;
    }
    if args.no_metadata {
        config.encoding.preserve_metadata = false;
    }
    if let Some(workers) = args.workers {
        config.batch.workers = workers;
    }
    config.batch.fail_fast |= args.fail_fast;
    config.batch.sequential |= args.sequential;
    if let Some(secs) = args.timeout {
        config.batch.item_timeout_secs = secs;
    }
    if let Some(mode) = args.progress {
        config.batch.progress = mode;
    }
}

fn convert(args: ConvertArgs, mut config: Config) -> Result<ExitCode> {
    apply_overrides(&mut config, &args);
    config.validate()?;
    for warning in config.warnings() {
        tracing::warn!("{warning}");
    }

    let files = inputs::expand_inputs(&args.inputs);
    if files.is_empty() {
        anyhow::bail!("no video files found in the given inputs");
    }
    if let Some(dir) = &args.output_dir {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create output directory {}", dir.display()))?;
    }
    let tasks = inputs::build_tasks(files, args.output_dir.as_deref(), &config.encoding);
    let total = tasks.len();

    let item_timeout = Duration::from_secs(config.batch.item_timeout_secs);
    let registry = ToolRegistry::discover(&config.tools);
    let encoder = Mp3Encoder::from_registry(&registry)?.with_timeout(item_timeout);

    let progress = if args.json {
        ProgressMode::None
    } else {
        config.batch.progress
    };
    let workers = if config.batch.sequential {
        WorkerCount::Fixed(1)
    } else {
        config.batch.workers
    };

    let processor = BatchProcessor::new(Arc::new(encoder))
        .with_item_timeout(item_timeout)
        .with_progress(progress);
    tracing::info!(
        files = total,
        workers = processor.worker_count(workers),
        "Starting conversion"
    );

    let rt = tokio::runtime::Runtime::new()?;
    let run = rt.block_on(processor.process(tasks, workers, config.batch.fail_fast));
    let summary = run.summary(total);

    if args.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        print_summary(&summary);
    }

    Ok(if summary.all_succeeded() {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(1)
    })
}

fn print_summary(summary: &BatchSummary) {
    println!();
    println!("Converted {}/{} file(s)", summary.succeeded, summary.total);
    if summary.failed > 0 {
        println!("  Failed: {}", summary.failed);
    }
    if summary.not_attempted > 0 {
        println!("  Not attempted: {}", summary.not_attempted);
    }
    if !summary.failures.is_empty() {
        println!("\nFailures:");
        for failure in &summary.failures {
            println!("  ✗ {failure}");
        }
    }
}

fn check_tools(config: &Config) -> Result<ExitCode> {
    println!("Checking external tools...\n");

    let registry = ToolRegistry::discover(&config.tools);
    let tools = registry.check_all();
    let mut all_ok = true;

    for tool in &tools {
        let status = if tool.available {
            "✓"
        } else {
            all_ok = false;
            "✗"
        };

        print!("{} {}", status, tool.name);
        if let Some(ref version) = tool.version {
            print!(" ({})", version.lines().next().unwrap_or(""));
        }
        if let Some(ref path) = tool.path {
            print!(" - {}", path.display());
        }
        println!();
    }

    println!();
    if all_ok {
        println!("All required tools are available!");
        Ok(ExitCode::SUCCESS)
    } else {
        println!("Some tools are missing. Install ffmpeg to convert files.");
        Ok(ExitCode::from(1))
    }
}

/// Validate one file, or the effective layered config when none is named.
fn validate_config(path: Option<&Path>, layered: &LayeredConfig) -> Result<ExitCode> {
    let config = match path {
        Some(p) => {
            println!("Validating config: {}", p.display());
            Config::load(p).with_context(|| format!("failed to load config {}", p.display()))?
        }
        None if layered.loaded.is_empty() => {
            println!("No config file found, using defaults");
            layered.config.clone()
        }
        None => {
            for p in &layered.loaded {
                println!("Validating config: {}", p.display());
            }
            layered.config.clone()
        }
    };

    if let Err(e) = config.validate() {
        println!("✗ {e}");
        return Ok(ExitCode::from(2));
    }

    println!("✓ Configuration is valid");
    println!("  Bitrate: {}", config.encoding.bitrate);
    match config.encoding.sample_rate {
        Some(rate) => println!("  Sample rate: {rate} Hz"),
        None => println!("  Sample rate: source"),
    }
    println!("  Workers: {}", config.batch.workers);
    println!("  Scheduler limit: {}", config.scheduler.max_concurrent_items);
    for warning in config.warnings() {
        println!("  ! {warning}");
    }
    Ok(ExitCode::SUCCESS)
}
