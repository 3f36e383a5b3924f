use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use ejmetrics::config::PipelineConfig;
use ejmetrics::engine::ExportDirEngine;
use ejmetrics::keyspace::Keyspace;
use ejmetrics::pipeline::{self, RunPaths};

#[derive(Parser, Debug)]
#[command(name = "ejmetrics")]
#[command(about = "Prepare environmental-justice indicators and percentiles for regional mapping")]
struct Args {
    /// Log at debug level (RUST_LOG takes precedence)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Write an annotated default configuration
    Init {
        /// Where to write the config file
        #[arg(default_value = "ejmetrics.toml")]
        path: PathBuf,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Run the full pipeline and write every export target
    Run {
        /// Path to configuration file
        #[arg(short, long, default_value = "ejmetrics.toml")]
        config: PathBuf,

        /// Output directory (overrides output.dir)
        #[arg(short, long)]
        output_dir: Option<PathBuf>,
    },

    /// List the towns with at least one unit inside the study area
    Towns {
        /// Path to configuration file
        #[arg(short, long, default_value = "ejmetrics.toml")]
        config: PathBuf,
    },
}

fn init_tracing(verbose: bool) -> anyhow::Result<()> {
    let level = if verbose { "ejmetrics=debug" } else { "ejmetrics=info" };
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(level))?;
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
    Ok(())
}

/// Relative paths in a config file are resolved against the file's directory.
fn base_dir(config_path: &Path) -> PathBuf {
    match config_path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

fn engine_for(config: &PipelineConfig, base: &Path) -> ExportDirEngine {
    if config.engine.exports_dir.is_absolute() {
        ExportDirEngine::new(&config.engine.exports_dir)
    } else {
        ExportDirEngine::new(base.join(&config.engine.exports_dir))
    }
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.verbose)?;

    match args.command {
        Command::Init { path, force } => {
            if path.exists() && !force {
                anyhow::bail!("{} already exists (use --force to overwrite)", path.display());
            }
            PipelineConfig::write_default(&path)?;
            println!("Wrote default configuration to {}", path.display());
        }
        Command::Run { config, output_dir } => {
            let cfg = PipelineConfig::load(&config)
                .with_context(|| format!("loading {}", config.display()))?;
            let base = base_dir(&config);
            let engine = engine_for(&cfg, &base);
            info!(config = %config.display(), sources = cfg.sources.len(), "starting run");

            let paths = RunPaths {
                base_dir: base,
                output_dir,
            };
            let summary = pipeline::run(&cfg, &engine, &paths)?;

            println!(
                "Processed {} units, {} indicators ({} in study-area towns, {} towns)",
                summary.units, summary.indicators, summary.study_area_units, summary.towns
            );
            for file in &summary.written {
                println!("  {}", file.path.display());
            }
        }
        Command::Towns { config } => {
            let cfg = PipelineConfig::load(&config)
                .with_context(|| format!("loading {}", config.display()))?;
            let engine = engine_for(&cfg, &base_dir(&config));
            let keyspace = Keyspace::build(&cfg, &engine)?;
            let towns = keyspace.study_area_towns(&cfg.study_area);
            for town in &towns {
                println!("{}\t{}\t{}", town.code(), town.state, town.town);
            }
            println!("{} towns", towns.len());
        }
    }
    Ok(())
}
