//! Error types for the execution engine

use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Invalid scope name: {0:?}")]
    InvalidName(String),

    #[error("Scope already exists: {0}")]
    DuplicateScope(String),

    #[error("Scope not found: {0}")]
    ScopeNotFound(String),

    #[error("Scope does not accept input: {0}")]
    NotWritable(String),

    #[error("Invalid pattern {pattern}: {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("Process exited with code {exit_code} before its wait condition was met. Last output: {output_tail}")]
    EarlyExit { exit_code: i32, output_tail: String },

    #[error("Timed out after {elapsed_ms} ms waiting for {waited_for}. Last output: {output_tail}")]
    Timeout {
        waited_for: String,
        elapsed_ms: u64,
        output_tail: String,
    },

    #[error("Exit code {actual} not in accepted codes {expected:?}")]
    ExitCodeMismatch { actual: i32, expected: Vec<i32> },

    #[error("Failed to spawn {command}: {reason}")]
    SpawnFailure { command: String, reason: String },

    #[error("Test spec parse error: {0}")]
    SpecParse(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
}

pub type EngineResult<T> = Result<T, EngineError>;
