//! docscope CLI - Main Entry Point
//!
//! Runs documentation test specs and reports PASS/FAIL/SKIPPED per context.
//! Exit codes: 0 when every context passed, 1 when any failed, 2 on engine
//! errors, 128 + signal number when interrupted.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use docscope_engine::{CleanupCoordinator, EngineConfig, ScopeRegistry};
use tracing::debug;

mod commands;
mod output;

use commands::{config, list, run};

/// docscope - run documentation as tests
#[derive(Parser)]
#[command(name = "docscope")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Config file
    #[arg(short, long, default_value = "docscope.toml", env = "DOCSCOPE_CONFIG", global = true)]
    config: PathBuf,

    /// Output format
    #[arg(long, default_value = "table", global = true)]
    format: output::OutputFormat,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run test specs
    Run(run::RunArgs),

    /// List the contexts a run would execute
    List(list::ListArgs),

    /// Show the effective configuration
    Config(config::ConfigArgs),
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config = match load_config(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            output::print_error(&format!("{:#}", e));
            std::process::exit(docscope_engine::cleanup::FATAL_EXIT_CODE);
        }
    };

    // Initialize logging
    let log_level = if cli.verbose { "debug" } else { config.log_level.as_str() };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .with_target(false)
        .init();
    debug!("Using config {}", cli.config.display());

    let registry = ScopeRegistry::new();
    let coordinator =
        CleanupCoordinator::new(registry.clone()).with_grace(config.terminate_grace());
    coordinator.install_panic_hook();
    let signals = match coordinator.install() {
        Ok(handle) => handle,
        Err(e) => coordinator.fail(&e),
    };

    match dispatch(cli, config, registry).await {
        Ok(success) => {
            signals.uninstall();
            coordinator.shutdown();
            std::process::exit(if success { 0 } else { 1 });
        }
        Err(e) => {
            output::print_error(&format!("{:#}", e));
            coordinator.fail(&e)
        }
    }
}

async fn dispatch(cli: Cli, config: EngineConfig, registry: ScopeRegistry) -> Result<bool> {
    match cli.command {
        Commands::Run(args) => run::execute(args, config, registry, cli.format).await,
        Commands::List(args) => {
            list::execute(args, &config, cli.format)?;
            Ok(true)
        }
        Commands::Config(args) => {
            config::execute(args, &config, &cli.config, cli.format)?;
            Ok(true)
        }
    }
}

fn load_config(path: &Path) -> Result<EngineConfig> {
    EngineConfig::load(path)
        .with_context(|| format!("Failed to load config from {}", path.display()))
}
