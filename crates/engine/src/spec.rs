//! Declarative test specifications
//!
//! A spec holds tests, a test holds steps and the contexts (platform
//! combinations) to run them in. Specs arrive already normalized, as YAML or
//! JSON documents.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;
use uuid::Uuid;

use crate::error::{EngineError, EngineResult};
use crate::matcher::WaitCondition;

/// A complete test specification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestSpec {
    /// Unique id; defaults to the file stem when loaded from disk
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spec_id: Option<String>,

    #[serde(default)]
    pub description: String,

    pub tests: Vec<TestDefinition>,
}

/// One test: an ordered list of steps run once per context
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestDefinition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_id: Option<String>,

    #[serde(default)]
    pub description: String,

    /// Contexts to run in; a single unrestricted context when empty
    #[serde(default)]
    pub contexts: Vec<ContextDef>,

    #[serde(default)]
    pub steps: Vec<Step>,
}

/// Where a test runs
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextDef {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_id: Option<String>,

    /// Platforms this context may run on (`linux`, `mac`, `windows`); any when empty
    #[serde(default)]
    pub platforms: Vec<String>,
}

/// A single step: common fields plus its action
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawStep", into = "RawStep")]
pub struct Step {
    pub step_id: Option<String>,
    pub description: Option<String>,
    /// Run even after an earlier step failed
    pub always_run: bool,
    pub action: StepAction,
}

/// Actions the built-in executor understands
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "camelCase")]
pub enum StepAction {
    /// Run a command line, optionally in a named scope
    RunShell(ShellStep),

    /// Send keys to a running scope
    Type(TypeStep),

    /// Stop a running scope
    TerminateScope { scope: String },

    /// Pause for a fixed time
    Wait { ms: u64 },

    /// Log a message
    Log { message: String },

    /// Any other action, served by an external executor
    #[serde(skip)]
    External { name: String, params: Map<String, Value> },
}

impl StepAction {
    pub fn name(&self) -> &str {
        match self {
            StepAction::RunShell(_) => "runShell",
            StepAction::Type(_) => "type",
            StepAction::TerminateScope { .. } => "terminateScope",
            StepAction::Wait { .. } => "wait",
            StepAction::Log { .. } => "log",
            StepAction::External { name, .. } => name,
        }
    }
}

const BUILTIN_ACTIONS: &[&str] = &["runShell", "type", "terminateScope", "wait", "log"];

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShellStep {
    /// Command line, run through the configured shell
    pub command: String,

    /// Run the program directly with these arguments instead of a shell
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Vec<String>>,

    /// Named scope to keep the process in
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,

    /// Leave the process running once this matches
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wait_until: Option<WaitCondition>,

    /// Accepted exit codes for foreground commands
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_codes: Option<Vec<i32>>,

    /// Pattern the foreground output must match
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,

    /// Step timeout in milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<PathBuf>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypeStep {
    pub scope: String,
    pub keys: Keys,
}

/// One key string or a sequence of them
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Keys {
    One(String),
    Many(Vec<String>),
}

impl Keys {
    pub fn as_slice(&self) -> &[String] {
        match self {
            Keys::One(key) => std::slice::from_ref(key),
            Keys::Many(keys) => keys,
        }
    }
}

/// Wire shape of a step
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawStep {
    action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    step_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    description: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    always_run: bool,
    #[serde(flatten)]
    params: Map<String, Value>,
}

impl TryFrom<RawStep> for Step {
    type Error = String;

    fn try_from(raw: RawStep) -> Result<Self, Self::Error> {
        let action = if BUILTIN_ACTIONS.contains(&raw.action.as_str()) {
            let mut object = raw.params;
            object.insert("action".to_string(), Value::String(raw.action.clone()));
            serde_json::from_value(Value::Object(object))
                .map_err(|e| format!("invalid '{}' step: {}", raw.action, e))?
        } else {
            StepAction::External {
                name: raw.action,
                params: raw.params,
            }
        };

        Ok(Step {
            step_id: raw.step_id,
            description: raw.description,
            always_run: raw.always_run,
            action,
        })
    }
}

impl From<Step> for RawStep {
    fn from(step: Step) -> Self {
        let (action, params) = match step.action {
            StepAction::External { name, params } => (name, params),
            builtin => {
                let name = builtin.name().to_string();
                let mut params = match serde_json::to_value(&builtin) {
                    Ok(Value::Object(map)) => map,
                    _ => Map::new(),
                };
                params.remove("action");
                (name, params)
            }
        };
        RawStep {
            action,
            step_id: step.step_id,
            description: step.description,
            always_run: step.always_run,
            params,
        }
    }
}

impl Step {
    pub fn new(action: StepAction) -> Self {
        Self {
            step_id: None,
            description: None,
            always_run: false,
            action,
        }
    }

    pub fn always_run(mut self) -> Self {
        self.always_run = true;
        self
    }
}

impl TestSpec {
    /// Parse a test spec from a YAML string
    pub fn from_yaml(yaml: &str) -> EngineResult<Self> {
        serde_yaml::from_str(yaml).map_err(EngineError::from)
    }

    /// Parse a test spec from a JSON string
    pub fn from_json(json: &str) -> EngineResult<Self> {
        serde_json::from_str(json).map_err(EngineError::from)
    }

    /// Parse a spec file, choosing the format by extension
    pub fn from_file(path: &Path) -> EngineResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let mut spec = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json(&content),
            _ => Self::from_yaml(&content),
        }
        .map_err(|e| EngineError::SpecParse(format!("{}: {}", path.display(), e)))?;

        if spec.spec_id.is_none() {
            spec.spec_id = path.file_stem().map(|s| s.to_string_lossy().into_owned());
        }
        Ok(spec)
    }

    /// Load a spec file, or every spec under a directory in path order
    pub fn load_all(path: &Path) -> EngineResult<Vec<Self>> {
        if path.is_file() {
            return Ok(vec![Self::from_file(path)?]);
        }
        if !path.exists() {
            return Err(EngineError::SpecParse(format!(
                "no such file or directory: {}",
                path.display()
            )));
        }

        let mut specs = Vec::new();
        for entry in walkdir::WalkDir::new(path)
            .sort_by_file_name()
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file() && is_spec_file(e.path()))
        {
            debug!("Loading spec {}", entry.path().display());
            specs.push(Self::from_file(entry.path())?);
        }

        Ok(specs)
    }

    /// Load specs from several files or directories
    pub fn load_inputs(inputs: &[PathBuf]) -> EngineResult<Vec<Self>> {
        let mut specs = Vec::new();
        for input in inputs {
            specs.extend(Self::load_all(input)?);
        }
        Ok(specs)
    }
}

fn is_spec_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| matches!(ext, "yaml" | "yml" | "json"))
        .unwrap_or(false)
}

/// The platform name contexts are matched against
pub fn current_platform() -> &'static str {
    if cfg!(target_os = "macos") {
        "mac"
    } else if cfg!(windows) {
        "windows"
    } else {
        "linux"
    }
}

fn normalize_platform(name: &str) -> String {
    match name.to_ascii_lowercase().as_str() {
        "macos" | "darwin" | "osx" => "mac".to_string(),
        "win32" | "win" => "windows".to_string(),
        other => other.to_string(),
    }
}

/// One unit of scheduling: a test's steps bound to a context
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TestContext {
    pub spec_id: String,
    pub test_id: String,
    pub context_id: String,
    pub platforms: Vec<String>,
    pub steps: Vec<Step>,
}

impl TestContext {
    pub fn new(
        spec_id: impl Into<String>,
        test_id: impl Into<String>,
        context_id: impl Into<String>,
    ) -> Self {
        Self {
            spec_id: spec_id.into(),
            test_id: test_id.into(),
            context_id: context_id.into(),
            platforms: Vec::new(),
            steps: Vec::new(),
        }
    }

    pub fn with_steps(mut self, steps: Vec<Step>) -> Self {
        self.steps = steps;
        self
    }

    pub fn with_platforms<I, S>(mut self, platforms: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.platforms = platforms.into_iter().map(Into::into).collect();
        self
    }

    pub fn supports_platform(&self, platform: &str) -> bool {
        self.platforms.is_empty()
            || self.platforms.iter().any(|p| normalize_platform(p) == platform)
    }
}

/// Flatten specs into the ordered list of contexts to run
pub fn resolve_contexts(specs: &[TestSpec]) -> Vec<TestContext> {
    let mut contexts = Vec::new();

    for spec in specs {
        let spec_id = spec.spec_id.clone().unwrap_or_else(generated_id);
        for test in &spec.tests {
            let test_id = test.test_id.clone().unwrap_or_else(generated_id);
            let defaults = [ContextDef::default()];
            let defs = if test.contexts.is_empty() {
                &defaults[..]
            } else {
                &test.contexts[..]
            };

            for def in defs {
                contexts.push(
                    TestContext::new(
                        spec_id.clone(),
                        test_id.clone(),
                        def.context_id.clone().unwrap_or_else(generated_id),
                    )
                    .with_platforms(def.platforms.iter().cloned())
                    .with_steps(test.steps.clone()),
                );
            }
        }
    }

    contexts
}

fn generated_id() -> String {
    Uuid::new_v4().to_string()
}
