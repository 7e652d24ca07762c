//! List Command
//!
//! Shows the contexts a run would execute, in queue order.

use std::path::PathBuf;

use anyhow::Result;
use clap::Args;
use docscope_engine::{EngineConfig, TestContext};
use serde::Serialize;

use crate::output::{print_list, OutputFormat, TableDisplay};

#[derive(Args)]
pub struct ListArgs {
    /// Spec files or directories (defaults to `input` from the config file)
    pub inputs: Vec<PathBuf>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextInfo {
    pub spec_id: String,
    pub test_id: String,
    pub context_id: String,
    pub platforms: Vec<String>,
    pub steps: usize,
}

impl From<&TestContext> for ContextInfo {
    fn from(context: &TestContext) -> Self {
        Self {
            spec_id: context.spec_id.clone(),
            test_id: context.test_id.clone(),
            context_id: context.context_id.clone(),
            platforms: context.platforms.clone(),
            steps: context.steps.len(),
        }
    }
}

impl TableDisplay for ContextInfo {
    fn headers() -> Vec<&'static str> {
        vec!["Spec", "Test", "Context", "Platforms", "Steps"]
    }

    fn row(&self) -> Vec<String> {
        vec![
            self.spec_id.clone(),
            self.test_id.clone(),
            self.context_id.clone(),
            if self.platforms.is_empty() {
                "any".to_string()
            } else {
                self.platforms.join(", ")
            },
            self.steps.to_string(),
        ]
    }
}

pub fn execute(args: ListArgs, config: &EngineConfig, format: OutputFormat) -> Result<()> {
    let contexts = super::load_contexts(&args.inputs, config)?;
    let rows: Vec<ContextInfo> = contexts.iter().map(ContextInfo::from).collect();
    print_list(&rows, format);
    Ok(())
}
