//! Engine configuration

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};

/// Engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Number of contexts run concurrently
    pub concurrent_runners: usize,

    /// Timeout for foreground commands
    pub default_timeout_ms: u64,

    /// Timeout for wait conditions that don't set their own
    pub wait_timeout_ms: u64,

    /// Grace period between terminate and kill
    pub terminate_grace_ms: u64,

    /// Shell used to run command lines
    pub shell: String,

    /// Log filter used when RUST_LOG is unset
    pub log_level: String,

    /// Where result files are written
    pub output_dir: PathBuf,

    /// Spec files or directories to run
    pub input: Vec<PathBuf>,

    /// Pseudo-terminal size
    pub terminal: TerminalConfig,

    /// Extra environment for every session
    pub env: BTreeMap<String, String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            concurrent_runners: 1,
            default_timeout_ms: 60_000,
            wait_timeout_ms: 60_000,
            terminate_grace_ms: 2_000,
            shell: default_shell().to_string(),
            log_level: "info".to_string(),
            output_dir: PathBuf::from("test-results"),
            input: Vec::new(),
            terminal: TerminalConfig::default(),
            env: BTreeMap::new(),
        }
    }
}

fn default_shell() -> &'static str {
    if cfg!(windows) {
        "cmd"
    } else {
        "sh"
    }
}

/// Pseudo-terminal dimensions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TerminalConfig {
    pub cols: u16,
    pub rows: u16,
}

impl Default for TerminalConfig {
    fn default() -> Self {
        Self { cols: 80, rows: 24 }
    }
}

impl EngineConfig {
    /// Load configuration from file, falling back to defaults if it doesn't exist
    pub fn load(path: &Path) -> EngineResult<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Self = toml::from_str(&content)?;
            config.validate()?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to file
    pub fn save(&self, path: &Path) -> EngineResult<()> {
        let content = self.to_toml()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn to_toml(&self) -> EngineResult<String> {
        toml::to_string_pretty(self).map_err(|e| EngineError::Config(e.to_string()))
    }

    pub fn validate(&self) -> EngineResult<()> {
        if self.shell.trim().is_empty() {
            return Err(EngineError::Config("shell must not be empty".into()));
        }
        if self.terminal.cols == 0 || self.terminal.rows == 0 {
            return Err(EngineError::Config(format!(
                "terminal size must be non-zero, got {}x{}",
                self.terminal.cols, self.terminal.rows
            )));
        }
        Ok(())
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    pub fn wait_timeout(&self) -> Duration {
        Duration::from_millis(self.wait_timeout_ms)
    }

    pub fn terminate_grace(&self) -> Duration {
        Duration::from_millis(self.terminate_grace_ms)
    }
}
