//! Named scope registry
//!
//! A scope is a long-lived process addressed by name. The registry maps those
//! names to process handles and the output captured from them so far. It is
//! shared by every worker and is the only cross-context mutable state.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::error::{EngineError, EngineResult};
use crate::POLL_INTERVAL;

/// Signal delivered to a scoped process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessSignal {
    /// Ask the process to exit (SIGTERM)
    Terminate,
    /// Interrupt, as if Ctrl+C was pressed (SIGINT)
    Interrupt,
    /// Kill unconditionally (SIGKILL)
    Kill,
}

/// Handle to a process owned by a scope
pub trait ScopeProcess: Send + Sync {
    /// OS process id, unique among live processes
    fn id(&self) -> u32;

    /// Write raw bytes to the process input
    fn write(&self, bytes: &[u8]) -> EngineResult<()>;

    /// Deliver a signal. `None` kills unconditionally.
    fn kill(&self, signal: Option<ProcessSignal>) -> EngineResult<()>;

    /// Exit code once the process has exited, `None` while it runs
    fn exit_code(&self) -> Option<i32>;

    /// Whether `write` can succeed at all
    fn is_writable(&self) -> bool {
        true
    }
}

/// A named, running process and its captured output
#[derive(Clone)]
pub struct Scope {
    pub name: String,
    pub process: Arc<dyn ScopeProcess>,
    pub stdout: String,
    /// Stays empty for terminal-backed processes, which merge both streams
    pub stderr: String,
    pub created_at: DateTime<Utc>,
}

impl fmt::Debug for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scope")
            .field("name", &self.name)
            .field("pid", &self.process.id())
            .field("stdout_len", &self.stdout.len())
            .field("stderr_len", &self.stderr.len())
            .field("created_at", &self.created_at)
            .finish()
    }
}

/// Thread-safe table of scopes, cheap to clone
#[derive(Clone, Default)]
pub struct ScopeRegistry {
    scopes: Arc<Mutex<HashMap<String, Scope>>>,
}

impl ScopeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has(&self, name: &str) -> bool {
        self.scopes.lock().contains_key(name)
    }

    /// Snapshot of a scope, buffers included
    pub fn get(&self, name: &str) -> Option<Scope> {
        self.scopes.lock().get(name).cloned()
    }

    /// Run `f` against a scope under the lock, without copying its buffers
    pub fn inspect<R>(&self, name: &str, f: impl FnOnce(&Scope) -> R) -> Option<R> {
        self.scopes.lock().get(name).map(f)
    }

    /// Register a new scope with empty buffers
    pub fn create(&self, name: &str, process: Arc<dyn ScopeProcess>) -> EngineResult<()> {
        if name.trim().is_empty() {
            return Err(EngineError::InvalidName(name.to_string()));
        }

        let mut scopes = self.scopes.lock();
        if scopes.contains_key(name) {
            return Err(EngineError::DuplicateScope(name.to_string()));
        }

        debug!(scope = %name, pid = process.id(), "Registered scope");
        scopes.insert(
            name.to_string(),
            Scope {
                name: name.to_string(),
                process,
                stdout: String::new(),
                stderr: String::new(),
                created_at: Utc::now(),
            },
        );
        Ok(())
    }

    /// Remove a scope and hand it back. The process is not signaled.
    pub fn remove(&self, name: &str) -> Option<Scope> {
        let removed = self.scopes.lock().remove(name);
        if removed.is_some() {
            debug!(scope = %name, "Deregistered scope");
        }
        removed
    }

    /// Remove a scope if present
    pub fn delete(&self, name: &str) {
        self.remove(name);
    }

    /// Append process output. Output for unknown scopes is dropped.
    pub fn append_stdout(&self, name: &str, chunk: &str) {
        if let Some(scope) = self.scopes.lock().get_mut(name) {
            scope.stdout.push_str(chunk);
        }
    }

    pub fn append_stderr(&self, name: &str, chunk: &str) {
        if let Some(scope) = self.scopes.lock().get_mut(name) {
            scope.stderr.push_str(chunk);
        }
    }

    /// Sorted snapshot of registered names
    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.scopes.lock().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.scopes.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.scopes.lock().is_empty()
    }

    /// Signal every registered process to terminate and empty the table.
    ///
    /// The table is drained under the lock, so a concurrent `create` lands
    /// either before (and is signaled) or after (and survives).
    pub fn cleanup(&self) -> usize {
        self.drain_and_terminate().len()
    }

    /// Same as [`cleanup`](Self::cleanup), then kill whatever is still
    /// running once `grace` has passed. Blocks the calling thread.
    pub fn cleanup_within(&self, grace: Duration) -> usize {
        let scopes = self.drain_and_terminate();
        let deadline = Instant::now() + grace;

        loop {
            let running: Vec<&Scope> = scopes
                .iter()
                .filter(|s| s.process.exit_code().is_none())
                .collect();
            if running.is_empty() {
                break;
            }
            if Instant::now() >= deadline {
                for scope in running {
                    warn!(
                        scope = %scope.name,
                        pid = scope.process.id(),
                        "Scope ignored terminate, killing"
                    );
                    if let Err(e) = scope.process.kill(Some(ProcessSignal::Kill)) {
                        warn!(scope = %scope.name, "Failed to kill scope during cleanup: {}", e);
                    }
                }
                break;
            }
            std::thread::sleep(POLL_INTERVAL);
        }

        scopes.len()
    }

    fn drain_and_terminate(&self) -> Vec<Scope> {
        let scopes: Vec<Scope> = self.scopes.lock().drain().map(|(_, scope)| scope).collect();

        for scope in &scopes {
            if let Err(e) = scope.process.kill(Some(ProcessSignal::Terminate)) {
                warn!(scope = %scope.name, "Failed to signal scope during cleanup: {}", e);
            }
        }

        if !scopes.is_empty() {
            info!("Cleaned up {} scope(s)", scopes.len());
        }
        scopes
    }
}
