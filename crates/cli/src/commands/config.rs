//! Config Command

use std::path::Path;

use anyhow::{Context, Result};
use clap::Args;
use docscope_engine::EngineConfig;

use crate::output::{print_structured, print_success, OutputFormat};

#[derive(Args)]
pub struct ConfigArgs {
    /// Write the effective configuration to the config file path
    #[arg(long)]
    pub write: bool,
}

pub fn execute(
    args: ConfigArgs,
    config: &EngineConfig,
    path: &Path,
    format: OutputFormat,
) -> Result<()> {
    if args.write {
        config
            .save(path)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        print_success(&format!("Configuration written to {}", path.display()));
        return Ok(());
    }

    if !print_structured(config, format) {
        print!("{}", config.to_toml()?);
    }
    Ok(())
}
