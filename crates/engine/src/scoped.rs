//! Scoped command protocol
//!
//! A shell step either runs to completion (foreground) or launches something
//! that keeps running once a wait condition matches (background). Both modes
//! share one spawn and capture path and differ only in how they finish:
//!
//! ```text
//! Start ──► spawn + register ──┬─ Foreground ─► AwaitExit ──┬─► Completed (deregistered)
//!                              │                            └─► Failed    (killed, deregistered)
//!                              └─ Background ─► AwaitCondition ─┬─► Running (left alive)
//!                                                               └─► Failed  (killed, deregistered)
//! ```

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::EngineError;
use crate::keys::translate_all;
use crate::matcher::{tail, wait_for_conditions, OutputPattern, WaitCondition, WaitOptions};
use crate::registry::{ScopeProcess, ScopeRegistry};
use crate::report::StepOutcome;
use crate::session::{
    create_session, terminate_session, wait_for_exit, OutputStream, SessionRequest,
};

/// Exit codes a foreground command may return by default
pub const DEFAULT_EXIT_CODES: &[i32] = &[0];

/// Upper bound on waiting for trailing output after a foreground exit
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Characters of output quoted in failure descriptions
const FAILURE_TAIL_CHARS: usize = 300;

/// How a scoped command finishes, decided once when the step is interpreted
#[derive(Debug, Clone)]
pub enum ShellMode {
    /// Run to completion and check the exit code
    Foreground {
        timeout: Duration,
        exit_codes: Vec<i32>,
        /// Pattern the captured stdout must match after a successful exit
        expected_output: Option<String>,
    },
    /// Keep running once `condition` matches
    Background {
        condition: WaitCondition,
        timeout: Duration,
    },
}

impl ShellMode {
    pub fn foreground(timeout: Duration) -> Self {
        Self::Foreground {
            timeout,
            exit_codes: DEFAULT_EXIT_CODES.to_vec(),
            expected_output: None,
        }
    }

    pub fn background(condition: WaitCondition, timeout: Duration) -> Self {
        Self::Background { condition, timeout }
    }
}

/// A command bound to a scope name
#[derive(Debug, Clone)]
pub struct ScopedCommand {
    pub scope: String,
    pub request: SessionRequest,
    pub mode: ShellMode,
    /// Grace period between terminate and kill on failure paths
    pub terminate_timeout: Duration,
}

/// Run a scoped command according to its mode.
///
/// Every error becomes a failed outcome; nothing escapes to the caller.
pub async fn run_scoped_command(registry: &ScopeRegistry, command: ScopedCommand) -> StepOutcome {
    let scope = command.scope.as_str();

    if registry.has(scope) {
        return StepOutcome::fail(EngineError::DuplicateScope(scope.to_string()).to_string());
    }
    if let ShellMode::Background { condition, .. } = &command.mode {
        if let Err(e) = validate_condition(condition) {
            return StepOutcome::fail(e.to_string());
        }
    }

    let session = match create_session(&command.request) {
        Ok(session) => session,
        Err(e) => {
            warn!(scope, "Failed to spawn scoped command: {}", e);
            return StepOutcome::fail(e.to_string());
        }
    };
    let process: Arc<dyn ScopeProcess> = session.process;

    if let Err(e) = registry.create(scope, process.clone()) {
        // Another context claimed the name between the check and the spawn
        terminate_session(process.as_ref(), command.terminate_timeout).await;
        return StepOutcome::fail(e.to_string());
    }
    registry.append_stdout(scope, &session.initial_stdout);
    registry.append_stderr(scope, &session.initial_stderr);
    let pump = spawn_output_pump(registry.clone(), scope.to_string(), session.output);

    match command.mode {
        ShellMode::Background { condition, timeout } => {
            let grace = command.terminate_timeout;
            await_condition(registry, scope, process, &condition, timeout, grace).await
        }
        ShellMode::Foreground {
            timeout,
            exit_codes,
            expected_output,
        } => {
            await_exit(
                registry,
                scope,
                process,
                pump,
                timeout,
                &exit_codes,
                expected_output.as_deref(),
                command.terminate_timeout,
            )
            .await
        }
    }
}

fn validate_condition(condition: &WaitCondition) -> Result<(), EngineError> {
    for pattern in [&condition.stdout, &condition.stderr].into_iter().flatten() {
        OutputPattern::parse(pattern)?;
    }
    Ok(())
}

/// Forward session output into the scope's buffer until the terminal closes
fn spawn_output_pump(
    registry: ScopeRegistry,
    scope: String,
    mut output: OutputStream,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(text) = output.recv().await {
            registry.append_stdout(&scope, &text);
        }
        debug!(scope = %scope, "Output pump finished");
    })
}

async fn await_condition(
    registry: &ScopeRegistry,
    scope: &str,
    process: Arc<dyn ScopeProcess>,
    condition: &WaitCondition,
    timeout: Duration,
    terminate_timeout: Duration,
) -> StepOutcome {
    let options = WaitOptions::from_condition(condition, timeout).watch_exit(process.clone());

    match wait_for_conditions(registry, scope, options).await {
        Ok(_) => {
            info!(scope, pid = process.id(), "Scope is running");
            let stdout = registry.inspect(scope, |s| s.stdout.clone()).unwrap_or_default();
            StepOutcome::pass(format!("Scope '{}' is running", scope))
                .with_output("scope", scope)
                .with_output("pid", process.id())
                .with_output("stdout", stdout)
        }
        Err(e) => {
            warn!(scope, "Scope failed to reach its wait condition: {}", e);
            terminate_session(process.as_ref(), terminate_timeout).await;
            let stdout = registry.remove(scope).map(|s| s.stdout).unwrap_or_default();
            let mut outcome =
                StepOutcome::fail(format!("Scope '{}' did not become ready: {}", scope, e))
                    .with_output("stdout", stdout);
            if let EngineError::EarlyExit { exit_code, .. } = e {
                outcome = outcome.with_output("exitCode", exit_code);
            }
            outcome
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn await_exit(
    registry: &ScopeRegistry,
    scope: &str,
    process: Arc<dyn ScopeProcess>,
    mut pump: JoinHandle<()>,
    timeout: Duration,
    exit_codes: &[i32],
    expected_output: Option<&str>,
    terminate_timeout: Duration,
) -> StepOutcome {
    let Some(exit_code) = wait_for_exit(process.as_ref(), timeout).await else {
        warn!(
            scope,
            timeout_ms = timeout.as_millis() as u64,
            "Command did not complete, terminating"
        );
        terminate_session(process.as_ref(), terminate_timeout).await;
        pump.abort();
        let stdout = registry.remove(scope).map(|s| s.stdout).unwrap_or_default();
        return StepOutcome::fail(format!(
            "Command did not complete within {} ms; use a wait condition for long-running \
             processes. Last output: {}",
            timeout.as_millis(),
            tail(&stdout, FAILURE_TAIL_CHARS)
        ))
        .with_output("stdout", stdout);
    };

    // The terminal closes shortly after exit; collect what is still in flight
    if tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, &mut pump).await.is_err() {
        debug!(scope, "Output still open after exit, detaching");
        pump.abort();
    }

    let (stdout, stderr) = registry
        .remove(scope)
        .map(|s| (s.stdout, s.stderr))
        .unwrap_or_default();
    debug!(scope, exit_code, "Scoped command completed");

    let outcome = |base: StepOutcome| {
        base.with_output("stdout", stdout.clone())
            .with_output("stderr", stderr.clone())
            .with_output("exitCode", exit_code)
    };

    if !exit_codes.contains(&exit_code) {
        let err = EngineError::ExitCodeMismatch {
            actual: exit_code,
            expected: exit_codes.to_vec(),
        };
        return outcome(StepOutcome::fail(format!(
            "{}. Last output: {}",
            err,
            tail(&stdout, FAILURE_TAIL_CHARS)
        )));
    }

    if let Some(expected) = expected_output {
        match OutputPattern::parse(expected) {
            Ok(pattern) if pattern.is_match(&stdout) => {}
            Ok(pattern) => {
                return outcome(StepOutcome::fail(format!(
                    "Command output did not match {}",
                    pattern
                )));
            }
            Err(e) => return outcome(StepOutcome::fail(e.to_string())),
        }
    }

    outcome(StepOutcome::pass(format!(
        "Command completed with exit code {}",
        exit_code
    )))
}

/// Stop a scope's process and deregister it, returning its final output
pub async fn terminate_scope(
    registry: &ScopeRegistry,
    scope: &str,
    timeout: Duration,
) -> StepOutcome {
    let Some(process) = registry.inspect(scope, |s| s.process.clone()) else {
        return StepOutcome::fail(EngineError::ScopeNotFound(scope.to_string()).to_string());
    };

    let exited = terminate_session(process.as_ref(), timeout).await;
    let Some(final_scope) = registry.remove(scope) else {
        // Someone else tore it down while we waited
        return StepOutcome::pass(format!("Scope '{}' already terminated", scope));
    };

    if !exited {
        warn!(scope, pid = process.id(), "Scope did not confirm exit after kill");
    }
    info!(scope, "Terminated scope");

    let mut outcome = StepOutcome::pass(format!("Terminated scope '{}'", scope))
        .with_output("stdout", final_scope.stdout)
        .with_output("stderr", final_scope.stderr);
    if let Some(code) = process.exit_code() {
        outcome = outcome.with_output("exitCode", code);
    }
    outcome
}

/// Translate key tokens and write them to a scope's input
pub async fn type_into_scope<S: AsRef<str>>(
    registry: &ScopeRegistry,
    scope: &str,
    keys: &[S],
) -> StepOutcome {
    let Some(process) = registry.inspect(scope, |s| s.process.clone()) else {
        return StepOutcome::fail(EngineError::ScopeNotFound(scope.to_string()).to_string());
    };
    if !process.is_writable() {
        return StepOutcome::fail(EngineError::NotWritable(scope.to_string()).to_string());
    }

    let input = translate_all(keys);
    let len = input.len();
    let writer = process.clone();
    let written = tokio::task::spawn_blocking(move || writer.write(input.as_bytes())).await;

    match written {
        Ok(Ok(())) => {
            debug!(scope, bytes = len, "Typed into scope");
            StepOutcome::pass(format!("Typed {} byte(s) into scope '{}'", len, scope))
        }
        Ok(Err(e)) => StepOutcome::fail(format!("Failed to type into scope '{}': {}", scope, e)),
        Err(e) => StepOutcome::fail(format!("Failed to type into scope '{}': {}", scope, e)),
    }
}
