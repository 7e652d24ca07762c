//! docscope execution engine
//!
//! Runs declarative documentation tests: contexts are scheduled across a
//! bounded worker pool, and shell steps run in named, terminal-backed process
//! scopes that can outlive a single step.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  Scheduler          run_contexts(contexts, params, workers) │
//! │    └── worker ──► context ──► StepExecutor::execute(step)   │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Scoped commands    run_scoped_command / type / terminate   │
//! │    ├── Session      PTY spawn, output pump, terminate       │
//! │    └── Matcher      wait for output, early exit, timeout    │
//! ├─────────────────────────────────────────────────────────────┤
//! │  ScopeRegistry      name ──► process + captured output      │
//! │  CleanupCoordinator signals / fatal error ──► cleanup once  │
//! └─────────────────────────────────────────────────────────────┘
//! ```

use std::time::Duration;

pub mod cleanup;
pub mod config;
pub mod error;
pub mod executor;
pub mod keys;
pub mod matcher;
pub mod registry;
pub mod report;
pub mod scheduler;
pub mod scoped;
pub mod session;
pub mod spec;

#[cfg(test)]
mod test_support;

/// How often exit codes and output buffers are polled
pub const POLL_INTERVAL: Duration = Duration::from_millis(50);

pub use cleanup::{CleanupCoordinator, CleanupHandle};
pub use config::EngineConfig;
pub use error::{EngineError, EngineResult};
pub use executor::{ContextState, ShellConfig, ShellStepExecutor, StepExecutor};
pub use matcher::{wait_for_conditions, WaitCondition, WaitOptions};
pub use registry::{ProcessSignal, Scope, ScopeProcess, ScopeRegistry};
pub use report::{ContextReport, RunReport, Status, StepOutcome};
pub use scheduler::{run_contexts, RunParams};
pub use scoped::{run_scoped_command, terminate_scope, type_into_scope, ScopedCommand, ShellMode};
pub use session::{create_session, terminate_session, SessionRequest};
pub use spec::{resolve_contexts, Step, StepAction, TestContext, TestSpec};
