//! Step execution
//!
//! [`StepExecutor`] is the seam between the scheduler and whatever performs a
//! step. [`ShellStepExecutor`] covers the process actions; browser and other
//! actions belong to external executors.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::registry::ScopeRegistry;
use crate::report::StepOutcome;
use crate::scoped::{
    run_scoped_command, terminate_scope, type_into_scope, ScopedCommand, ShellMode,
    DEFAULT_EXIT_CODES,
};
use crate::session::SessionRequest;
use crate::spec::{ShellStep, Step, StepAction};

/// Per-context state handed to every step of that context.
///
/// Clones share the owned-scope list, so the scheduler can reclaim scopes
/// even when a step panics.
#[derive(Clone)]
pub struct ContextState {
    pub registry: ScopeRegistry,
    pub context_id: String,
    owned_scopes: Arc<Mutex<Vec<String>>>,
}

impl ContextState {
    pub fn new(registry: ScopeRegistry, context_id: impl Into<String>) -> Self {
        Self {
            registry,
            context_id: context_id.into(),
            owned_scopes: Arc::default(),
        }
    }

    /// Record a scope this context started, to be reclaimed when it ends
    pub fn own_scope(&self, name: &str) {
        let mut owned = self.owned_scopes.lock();
        if !owned.iter().any(|s| s == name) {
            owned.push(name.to_string());
        }
    }

    pub fn release_scope(&self, name: &str) {
        self.owned_scopes.lock().retain(|s| s != name);
    }

    pub fn owned_scopes(&self) -> Vec<String> {
        self.owned_scopes.lock().clone()
    }

    /// Hand over every owned scope name, leaving none owned
    pub fn take_owned_scopes(&self) -> Vec<String> {
        std::mem::take(&mut *self.owned_scopes.lock())
    }
}

/// Performs one step and reports its outcome. Never fails outright: every
/// error is a failed outcome.
#[async_trait]
pub trait StepExecutor: Send + Sync {
    async fn execute(&self, step: &Step, ctx: &mut ContextState) -> StepOutcome;
}

/// Settings shared by every shell step
#[derive(Debug, Clone)]
pub struct ShellConfig {
    pub shell: String,
    pub default_timeout: Duration,
    pub wait_timeout: Duration,
    pub terminate_grace: Duration,
    pub cols: u16,
    pub rows: u16,
    pub env: BTreeMap<String, String>,
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self::from(&EngineConfig::default())
    }
}

impl From<&EngineConfig> for ShellConfig {
    fn from(config: &EngineConfig) -> Self {
        Self {
            shell: config.shell.clone(),
            default_timeout: config.default_timeout(),
            wait_timeout: config.wait_timeout(),
            terminate_grace: config.terminate_grace(),
            cols: config.terminal.cols,
            rows: config.terminal.rows,
            env: config.env.clone(),
        }
    }
}

/// Built-in executor for process, wait and log actions
#[derive(Debug, Clone, Default)]
pub struct ShellStepExecutor {
    config: ShellConfig,
}

impl ShellStepExecutor {
    pub fn new(config: ShellConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ShellConfig {
        &self.config
    }

    fn scoped_command(&self, step: &ShellStep, scope: String) -> ScopedCommand {
        let mut env = self.config.env.clone();
        env.extend(step.env.iter().map(|(k, v)| (k.clone(), v.clone())));

        let request = match &step.args {
            Some(args) => SessionRequest::new(&step.command).args(args),
            None => SessionRequest::shell(&self.config.shell, &step.command),
        }
        .cwd(step.cwd.clone())
        .envs(&env)
        .size(self.config.cols, self.config.rows);

        let step_timeout = step.timeout.map(Duration::from_millis);
        let mode = match &step.wait_until {
            Some(condition) => ShellMode::background(
                condition.clone(),
                step_timeout.unwrap_or(self.config.wait_timeout),
            ),
            None => ShellMode::Foreground {
                timeout: step_timeout.unwrap_or(self.config.default_timeout),
                exit_codes: step
                    .exit_codes
                    .clone()
                    .unwrap_or_else(|| DEFAULT_EXIT_CODES.to_vec()),
                expected_output: step.output.clone(),
            },
        };

        ScopedCommand {
            scope,
            request,
            mode,
            terminate_timeout: self.config.terminate_grace,
        }
    }

    async fn run_shell(&self, step: &ShellStep, ctx: &mut ContextState) -> StepOutcome {
        let scope = step
            .scope
            .clone()
            .unwrap_or_else(|| format!("{}-shell-{}", ctx.context_id, Uuid::new_v4().simple()));
        let command = self.scoped_command(step, scope.clone());

        // Claim a free name up front so the scope is reclaimed even if this
        // step never returns
        let claimed = !ctx.registry.has(&scope);
        if claimed {
            ctx.own_scope(&scope);
        }

        let outcome = run_scoped_command(&ctx.registry, command).await;
        if claimed && !(outcome.is_pass() && ctx.registry.has(&scope)) {
            ctx.release_scope(&scope);
        }
        outcome
    }
}

#[async_trait]
impl StepExecutor for ShellStepExecutor {
    async fn execute(&self, step: &Step, ctx: &mut ContextState) -> StepOutcome {
        match &step.action {
            StepAction::RunShell(shell) => self.run_shell(shell, ctx).await,
            StepAction::Type(typed) => {
                type_into_scope(&ctx.registry, &typed.scope, typed.keys.as_slice()).await
            }
            StepAction::TerminateScope { scope } => {
                let grace = self.config.terminate_grace;
                let outcome = terminate_scope(&ctx.registry, scope, grace).await;
                ctx.release_scope(scope);
                outcome
            }
            StepAction::Wait { ms } => {
                debug!(context = %ctx.context_id, ms, "Waiting");
                tokio::time::sleep(Duration::from_millis(*ms)).await;
                StepOutcome::pass(format!("Waited {} ms", ms))
            }
            StepAction::Log { message } => {
                info!(context = %ctx.context_id, "{}", message);
                StepOutcome::pass(message.clone())
            }
            StepAction::External { name, .. } => {
                StepOutcome::fail(format!("Unsupported action: {}", name))
            }
        }
    }
}
