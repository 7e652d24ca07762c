//! Step, context and run results
//!
//! Every context produces exactly one [`ContextReport`]. Reports are
//! immutable once built; [`RunReport`] aggregates them into per-spec,
//! per-test and overall summaries.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use crate::error::EngineResult;

/// Outcome of a step, context, test or spec
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Status {
    Pass,
    Fail,
    Skipped,
}

impl Status {
    /// Roll up child statuses: any failure fails, any pass passes, else skipped
    pub fn combine<I: IntoIterator<Item = Status>>(statuses: I) -> Status {
        let mut any_pass = false;
        for status in statuses {
            match status {
                Status::Fail => return Status::Fail,
                Status::Pass => any_pass = true,
                Status::Skipped => {}
            }
        }
        if any_pass {
            Status::Pass
        } else {
            Status::Skipped
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Status::Pass => "PASS",
            Status::Fail => "FAIL",
            Status::Skipped => "SKIPPED",
        };
        f.write_str(s)
    }
}

/// Uniform result of a single step action
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepOutcome {
    pub status: Status,
    pub description: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub outputs: BTreeMap<String, Value>,
}

impl StepOutcome {
    pub fn pass(description: impl Into<String>) -> Self {
        Self::new(Status::Pass, description)
    }

    pub fn fail(description: impl Into<String>) -> Self {
        Self::new(Status::Fail, description)
    }

    pub fn skipped(description: impl Into<String>) -> Self {
        Self::new(Status::Skipped, description)
    }

    fn new(status: Status, description: impl Into<String>) -> Self {
        Self {
            status,
            description: description.into(),
            outputs: BTreeMap::new(),
        }
    }

    pub fn with_output(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.outputs.insert(key.to_string(), value.into());
        self
    }

    pub fn output_str(&self, key: &str) -> Option<&str> {
        self.outputs.get(key).and_then(Value::as_str)
    }

    pub fn is_pass(&self) -> bool {
        self.status == Status::Pass
    }
}

/// A step outcome tagged with its position and action
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepReport {
    pub index: usize,
    pub action: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    pub duration_ms: u64,
    #[serde(flatten)]
    pub outcome: StepOutcome,
}

/// Result of running one context
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextReport {
    pub spec_id: String,
    pub test_id: String,
    pub context_id: String,
    pub status: Status,
    pub duration_ms: u64,
    pub steps: Vec<StepReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ContextReport {
    pub fn count(&self, status: Status) -> usize {
        self.steps.iter().filter(|s| s.outcome.status == status).count()
    }
}

/// Pass/fail/skip counts at one level of the hierarchy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tally {
    pub pass: usize,
    pub fail: usize,
    pub skipped: usize,
}

impl Tally {
    pub fn add(&mut self, status: Status) {
        match status {
            Status::Pass => self.pass += 1,
            Status::Fail => self.fail += 1,
            Status::Skipped => self.skipped += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.pass + self.fail + self.skipped
    }
}

/// Counts for every level of a run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Summary {
    pub specs: Tally,
    pub tests: Tally,
    pub contexts: Tally,
    pub steps: Tally,
}

/// Contexts of one test, in queue order
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestReport {
    pub test_id: String,
    pub status: Status,
    pub contexts: Vec<ContextReport>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpecReport {
    pub spec_id: String,
    pub status: Status,
    pub tests: Vec<TestReport>,
}

/// Aggregated result of a whole run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunReport {
    pub summary: Summary,
    pub duration_ms: u64,
    pub specs: Vec<SpecReport>,
}

impl RunReport {
    /// Group context reports by spec and test, keeping first-seen order
    pub fn from_contexts(contexts: Vec<ContextReport>, duration_ms: u64) -> Self {
        let mut specs: Vec<SpecReport> = Vec::new();

        for context in contexts {
            let spec_idx = match specs.iter().position(|s| s.spec_id == context.spec_id) {
                Some(idx) => idx,
                None => {
                    specs.push(SpecReport {
                        spec_id: context.spec_id.clone(),
                        status: Status::Skipped,
                        tests: Vec::new(),
                    });
                    specs.len() - 1
                }
            };
            let tests = &mut specs[spec_idx].tests;
            let test_idx = match tests.iter().position(|t| t.test_id == context.test_id) {
                Some(idx) => idx,
                None => {
                    tests.push(TestReport {
                        test_id: context.test_id.clone(),
                        status: Status::Skipped,
                        contexts: Vec::new(),
                    });
                    tests.len() - 1
                }
            };
            tests[test_idx].contexts.push(context);
        }

        let mut summary = Summary::default();
        for spec in &mut specs {
            for test in &mut spec.tests {
                for context in &test.contexts {
                    summary.contexts.add(context.status);
                    for step in &context.steps {
                        summary.steps.add(step.outcome.status);
                    }
                }
                test.status = Status::combine(test.contexts.iter().map(|c| c.status));
                summary.tests.add(test.status);
            }
            spec.status = Status::combine(spec.tests.iter().map(|t| t.status));
            summary.specs.add(spec.status);
        }

        Self {
            summary,
            duration_ms,
            specs,
        }
    }

    pub fn success(&self) -> bool {
        self.summary.contexts.fail == 0
    }

    pub fn contexts(&self) -> impl Iterator<Item = &ContextReport> {
        self.specs
            .iter()
            .flat_map(|s| s.tests.iter())
            .flat_map(|t| t.contexts.iter())
    }

    /// Write the report as pretty JSON into `output_dir`
    pub fn write_json(&self, output_dir: &Path) -> EngineResult<PathBuf> {
        std::fs::create_dir_all(output_dir)?;

        let path = output_dir.join("results.json");
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(&path, json)?;

        info!("Results written to: {}", path.display());
        Ok(path)
    }
}
