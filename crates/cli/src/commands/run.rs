//! Run Command
//!
//! Loads specs, runs every context on the worker pool and writes the results.

use std::path::PathBuf;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;
use docscope_engine::report::Tally;
use docscope_engine::{
    run_contexts, ContextReport, EngineConfig, RunParams, RunReport, ScopeRegistry, Status,
};
use serde::Serialize;
use tracing::info;

use crate::output::{
    print_list, print_structured, print_warning, status_label, OutputFormat, TableDisplay,
};

#[derive(Args)]
pub struct RunArgs {
    /// Spec files or directories (defaults to `input` from the config file)
    pub inputs: Vec<PathBuf>,

    /// Number of contexts to run concurrently
    #[arg(short, long, env = "DOCSCOPE_WORKERS")]
    pub workers: Option<usize>,

    /// Directory for results.json
    #[arg(short, long)]
    pub output: Option<PathBuf>,
}

/// One row of the results table
#[derive(Serialize)]
struct ContextRow {
    spec: String,
    test: String,
    context: String,
    status: Status,
    steps: String,
    duration_ms: u64,
}

impl From<&ContextReport> for ContextRow {
    fn from(report: &ContextReport) -> Self {
        Self {
            spec: report.spec_id.clone(),
            test: report.test_id.clone(),
            context: report.context_id.clone(),
            status: report.status,
            steps: format!(
                "{}/{}/{}",
                report.count(Status::Pass),
                report.count(Status::Fail),
                report.count(Status::Skipped)
            ),
            duration_ms: report.duration_ms,
        }
    }
}

impl TableDisplay for ContextRow {
    fn headers() -> Vec<&'static str> {
        vec!["Spec", "Test", "Context", "Status", "Steps (P/F/S)", "Duration"]
    }

    fn row(&self) -> Vec<String> {
        vec![
            self.spec.clone(),
            self.test.clone(),
            self.context.clone(),
            status_label(self.status),
            self.steps.clone(),
            format!("{} ms", self.duration_ms),
        ]
    }
}

/// Run the specs and report. Returns whether every context passed.
pub async fn execute(
    args: RunArgs,
    mut config: EngineConfig,
    registry: ScopeRegistry,
    format: OutputFormat,
) -> Result<bool> {
    if let Some(workers) = args.workers {
        config.concurrent_runners = workers;
    }
    if let Some(output) = args.output {
        config.output_dir = output;
    }

    let contexts = super::load_contexts(&args.inputs, &config)?;
    if contexts.is_empty() {
        print_warning("No test contexts found.");
        return Ok(true);
    }

    let params = RunParams::from_config(&config, registry);
    let start = Instant::now();
    let reports = run_contexts(contexts, &params, config.concurrent_runners).await;
    let report = RunReport::from_contexts(reports, start.elapsed().as_millis() as u64);

    let path = report
        .write_json(&config.output_dir)
        .with_context(|| format!("Failed to write results to {}", config.output_dir.display()))?;

    if !print_structured(&report, format) {
        print_report(&report, format);
        println!("Results: {}", path.display());
    }

    info!(
        passed = report.summary.contexts.pass,
        failed = report.summary.contexts.fail,
        skipped = report.summary.contexts.skipped,
        "Run complete in {} ms",
        report.duration_ms
    );
    Ok(report.success())
}

fn print_report(report: &RunReport, format: OutputFormat) {
    let rows: Vec<ContextRow> = report.contexts().map(ContextRow::from).collect();
    print_list(&rows, format);

    let failures: Vec<&ContextReport> = report
        .contexts()
        .filter(|c| c.status == Status::Fail)
        .collect();
    if !failures.is_empty() {
        println!();
        println!("{}", "Failures:".red().bold());
        for context in failures {
            println!("  {} / {} / {}", context.spec_id, context.test_id, context.context_id);
            if let Some(error) = &context.error {
                println!("    {}", error);
            }
            for step in context.steps.iter().filter(|s| s.outcome.status == Status::Fail) {
                println!("    step {} ({}): {}", step.index, step.action, step.outcome.description);
            }
        }
    }

    println!();
    let summary = &report.summary;
    for (label, tally) in [
        ("Specs", summary.specs),
        ("Tests", summary.tests),
        ("Contexts", summary.contexts),
        ("Steps", summary.steps),
    ] {
        println!("{:<9} {}", label, tally_line(&tally));
    }
    println!("Duration  {} ms", report.duration_ms);
}

fn tally_line(tally: &Tally) -> String {
    format!(
        "{} passed, {} failed, {} skipped ({} total)",
        tally.pass.to_string().green(),
        tally.fail.to_string().red(),
        tally.skipped.to_string().yellow(),
        tally.total()
    )
}
