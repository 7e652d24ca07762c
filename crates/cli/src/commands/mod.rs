//! CLI Commands

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use docscope_engine::{resolve_contexts, EngineConfig, TestContext, TestSpec};
use tracing::debug;

pub mod config;
pub mod list;
pub mod run;

/// Resolve contexts from explicit inputs, falling back to the configured ones
pub(crate) fn load_contexts(inputs: &[PathBuf], config: &EngineConfig) -> Result<Vec<TestContext>> {
    let inputs = if inputs.is_empty() { &config.input } else { inputs };
    if inputs.is_empty() {
        bail!("No test specs given; pass a file or directory, or set `input` in the config file");
    }

    let specs = TestSpec::load_inputs(inputs).context("Failed to load test specs")?;
    let contexts = resolve_contexts(&specs);
    debug!("Resolved {} context(s) from {} spec(s)", contexts.len(), specs.len());
    Ok(contexts)
}
