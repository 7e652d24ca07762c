//! Process-wide cleanup
//!
//! Interrupts, termination signals, fatal errors and explicit shutdown all
//! funnel into one routine that drains the scope registry. A one-shot flag
//! makes sure it runs once no matter how many of them fire.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::error::EngineResult;
use crate::registry::ScopeRegistry;

/// Exit code after a fatal engine error
pub const FATAL_EXIT_CODE: i32 = 2;

/// How long drained scopes get to exit before they are killed
pub const DEFAULT_CLEANUP_GRACE: Duration = Duration::from_secs(2);

/// Drains the registry exactly once, from whichever path gets there first
#[derive(Clone)]
pub struct CleanupCoordinator {
    registry: ScopeRegistry,
    grace: Duration,
    fired: Arc<AtomicBool>,
}

impl CleanupCoordinator {
    pub fn new(registry: ScopeRegistry) -> Self {
        Self {
            registry,
            grace: DEFAULT_CLEANUP_GRACE,
            fired: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    /// Run cleanup unless it already ran. Returns whether this call ran it.
    ///
    /// Scopes still alive after the grace period are killed, so this blocks
    /// for at most that long.
    pub fn run_once(&self) -> bool {
        if self.fired.swap(true, Ordering::SeqCst) {
            return false;
        }
        let drained = self.registry.cleanup_within(self.grace);
        info!("Cleanup complete ({} scope(s) terminated)", drained);
        true
    }

    pub fn has_run(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }

    /// Explicit shutdown at the end of a run
    pub fn shutdown(&self) -> bool {
        self.run_once()
    }

    /// Clean up after an unrecoverable error and exit
    pub fn fail(&self, err: &dyn fmt::Display) -> ! {
        error!("Fatal error: {}", err);
        self.run_once();
        std::process::exit(FATAL_EXIT_CODE);
    }

    /// Listen for termination signals until the returned handle is dropped.
    ///
    /// On SIGINT, SIGTERM or SIGHUP the registry is drained and the process
    /// exits with `128 + signal number`. Must be called inside a runtime.
    pub fn install(&self) -> EngineResult<CleanupHandle> {
        let signals = TerminationSignals::register()?;
        let coordinator = self.clone();

        let task = tokio::spawn(async move {
            let signo = signals.recv().await;
            warn!("Received signal {}, cleaning up", signo);
            if let Err(e) = tokio::task::spawn_blocking(move || coordinator.run_once()).await {
                error!("Cleanup after signal failed: {}", e);
            }
            std::process::exit(128 + signo);
        });

        Ok(CleanupHandle { task: Some(task) })
    }

    /// Run cleanup when the main thread panics.
    ///
    /// Panics on worker threads are isolated per context and leave the
    /// registry alone.
    pub fn install_panic_hook(&self) {
        let coordinator = self.clone();
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            if std::thread::current().name() == Some("main") {
                coordinator.run_once();
            }
            previous(info);
        }));
    }
}

/// Keeps signal listening alive; dropping it stops listening
pub struct CleanupHandle {
    task: Option<JoinHandle<()>>,
}

impl CleanupHandle {
    pub fn uninstall(mut self) {
        self.abort();
    }

    pub fn is_listening(&self) -> bool {
        self.task.as_ref().map_or(false, |t| !t.is_finished())
    }

    fn abort(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for CleanupHandle {
    fn drop(&mut self) {
        self.abort();
    }
}

#[cfg(unix)]
struct TerminationSignals {
    interrupt: tokio::signal::unix::Signal,
    terminate: tokio::signal::unix::Signal,
    hangup: tokio::signal::unix::Signal,
}

#[cfg(unix)]
impl TerminationSignals {
    fn register() -> EngineResult<Self> {
        use tokio::signal::unix::{signal, SignalKind};

        Ok(Self {
            interrupt: signal(SignalKind::interrupt())?,
            terminate: signal(SignalKind::terminate())?,
            hangup: signal(SignalKind::hangup())?,
        })
    }

    async fn recv(mut self) -> i32 {
        use nix::sys::signal::Signal;

        tokio::select! {
            _ = self.interrupt.recv() => Signal::SIGINT as i32,
            _ = self.terminate.recv() => Signal::SIGTERM as i32,
            _ = self.hangup.recv() => Signal::SIGHUP as i32,
        }
    }
}

#[cfg(not(unix))]
struct TerminationSignals;

#[cfg(not(unix))]
impl TerminationSignals {
    fn register() -> EngineResult<Self> {
        Ok(Self)
    }

    async fn recv(self) -> i32 {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
        // SIGINT
        2
    }
}
