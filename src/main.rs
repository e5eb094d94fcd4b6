//! poolrun CLI - parallel test scheduling across device pools.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use poolrun::config::{self, Config};
use poolrun::orchestrator::Orchestrator;
use poolrun::registry::PluginRegistry;
use poolrun::report::{ConsoleReporter, JUnitReporter, JsonReporter, MultiReporter, NullReporter};

#[derive(Parser)]
#[command(name = "poolrun")]
#[command(about = "Retry-aware parallel test scheduler for device pools", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "poolrun.toml")]
    config: PathBuf,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the suite on every pool
    Run {
        /// Exit with 0 even if failures remain
        #[arg(long)]
        ignore_failures: bool,

        /// JUnit XML output path
        #[arg(long)]
        junit: Option<PathBuf>,
    },

    /// Validate configuration, devices, suite and plugins without running
    Validate,

    /// List devices and the pools they are partitioned into
    Devices,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Run {
            ignore_failures,
            junit,
        } => run_tests(&cli.config, ignore_failures, junit, cli.verbose).await,
        Commands::Validate => validate_config(&cli.config).await,
        Commands::Devices => list_devices(&cli.config).await,
    }
}

fn load(config_path: &Path) -> Result<Config> {
    let config = config::load_config(config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;
    info!("Loaded configuration from {}", config_path.display());
    Ok(config)
}

async fn run_tests(
    config_path: &Path,
    ignore_failures: bool,
    junit_path: Option<PathBuf>,
    verbose: bool,
) -> Result<()> {
    let mut config = load(config_path)?;
    if ignore_failures {
        config.run.ignore_failures = true;
    }

    let mut reporter = MultiReporter::new();
    if config.report.console {
        reporter = reporter.with_reporter(ConsoleReporter::new(verbose));
    }
    if config.report.json {
        reporter = reporter.with_reporter(JsonReporter::new(config.run.output_dir().join("results.json")));
    }
    if let Some(path) = junit_path.or_else(|| config.report.junit.clone()) {
        reporter = reporter.with_reporter(JUnitReporter::new(path).with_name(config.run.name.clone()));
    }

    let orchestrator = Orchestrator::new(config, PluginRegistry::with_builtins(), Arc::new(reporter));
    let result = orchestrator.run().await.context("Run failed")?;

    std::process::exit(result.exit_code());
}

async fn validate_config(config_path: &Path) -> Result<()> {
    let config = load(config_path)?;
    let orchestrator = Orchestrator::new(config, PluginRegistry::with_builtins(), Arc::new(NullReporter));
    let plan = orchestrator.plan().await.context("Invalid configuration")?;

    println!("Configuration valid");
    for pool in &plan.pools {
        println!(
            "  {}: {} device(s), {} test(s)",
            pool.pool.id(),
            pool.pool.len(),
            pool.items.len()
        );
    }
    Ok(())
}

async fn list_devices(config_path: &Path) -> Result<()> {
    let config = load(config_path)?;
    let orchestrator = Orchestrator::new(config, PluginRegistry::with_builtins(), Arc::new(NullReporter));
    let pools = orchestrator.discover_pools().await?;

    for pool in &pools {
        println!("{} ({} device(s))", pool.id(), pool.len());
        for device in pool.devices() {
            let model = if device.model.is_empty() { "-" } else { device.model.as_str() };
            println!(
                "  {:<24} {:<20} api {:<4} {}",
                device.id().as_str(),
                model,
                device.platform_version,
                device.display.as_str()
            );
        }
    }
    Ok(())
}
