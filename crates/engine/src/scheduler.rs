//! Context scheduler
//!
//! Every context of every test goes into one FIFO queue. A fixed number of
//! workers pull from it until it is empty; each context runs its steps in
//! order on its own task, so a failing or panicking context only affects its
//! own report.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::config::EngineConfig;
use crate::executor::{ContextState, ShellConfig, ShellStepExecutor, StepExecutor};
use crate::registry::ScopeRegistry;
use crate::report::{ContextReport, Status, StepOutcome, StepReport};
use crate::scoped::terminate_scope;
use crate::spec::{current_platform, TestContext};

/// Everything workers share while running contexts
#[derive(Clone)]
pub struct RunParams {
    pub registry: ScopeRegistry,
    pub executor: Arc<dyn StepExecutor>,
    /// Grace period when reclaiming scopes a context left running
    pub terminate_grace: Duration,
    /// Platform name contexts are gated on
    pub platform: String,
}

impl RunParams {
    pub fn new(registry: ScopeRegistry, executor: Arc<dyn StepExecutor>) -> Self {
        Self {
            registry,
            executor,
            terminate_grace: Duration::from_secs(2),
            platform: current_platform().to_string(),
        }
    }

    /// Run with the built-in shell executor configured from `config`
    pub fn from_config(config: &EngineConfig, registry: ScopeRegistry) -> Self {
        let executor = ShellStepExecutor::new(ShellConfig::from(config));
        Self::new(registry, Arc::new(executor)).terminate_grace(config.terminate_grace())
    }

    pub fn terminate_grace(mut self, grace: Duration) -> Self {
        self.terminate_grace = grace;
        self
    }

    pub fn platform(mut self, platform: impl Into<String>) -> Self {
        self.platform = platform.into();
        self
    }
}

/// Run every context on a pool of `worker_count` workers.
///
/// Returns exactly one report per context, in queue order.
pub async fn run_contexts(
    contexts: Vec<TestContext>,
    params: &RunParams,
    worker_count: usize,
) -> Vec<ContextReport> {
    let total = contexts.len();
    if total == 0 {
        return Vec::new();
    }
    let workers = worker_count.clamp(1, total);
    info!("Running {} context(s) on {} worker(s)", total, workers);

    let queue: Arc<Mutex<VecDeque<(usize, TestContext)>>> =
        Arc::new(Mutex::new(contexts.into_iter().enumerate().collect()));
    let reports: Arc<Mutex<Vec<(usize, ContextReport)>>> =
        Arc::new(Mutex::new(Vec::with_capacity(total)));

    let handles = (0..workers).map(|worker| {
        let queue = queue.clone();
        let reports = reports.clone();
        let params = params.clone();
        tokio::spawn(async move {
            loop {
                let next = queue.lock().pop_front();
                let Some((index, context)) = next else {
                    break;
                };
                debug!(worker, context = %context.context_id, "Picked up context");
                let report = run_isolated(context, &params).await;
                reports.lock().push((index, report));
            }
            debug!(worker, "Worker finished");
        })
    });

    for result in join_all(handles).await {
        if let Err(e) = result {
            error!("Worker task failed: {}", e);
        }
    }

    let mut reports = std::mem::take(&mut *reports.lock());
    reports.sort_by_key(|(index, _)| *index);
    reports.into_iter().map(|(_, report)| report).collect()
}

/// Run one context on its own task, turning a panic into a failed report
async fn run_isolated(context: TestContext, params: &RunParams) -> ContextReport {
    let state = ContextState::new(params.registry.clone(), context.context_id.clone());
    let ids = (
        context.spec_id.clone(),
        context.test_id.clone(),
        context.context_id.clone(),
    );
    let start = Instant::now();

    let task = {
        let state = state.clone();
        let params = params.clone();
        tokio::spawn(async move { run_context(context, state, &params).await })
    };

    let report = match task.await {
        Ok(report) => report,
        Err(e) => {
            let (spec_id, test_id, context_id) = ids;
            error!(context = %context_id, "Context aborted: {}", e);
            ContextReport {
                spec_id,
                test_id,
                context_id,
                status: Status::Fail,
                duration_ms: start.elapsed().as_millis() as u64,
                steps: Vec::new(),
                error: Some(format!("Context aborted: {}", e)),
            }
        }
    };

    reclaim_scopes(&state, params.terminate_grace).await;
    report
}

async fn run_context(
    context: TestContext,
    mut state: ContextState,
    params: &RunParams,
) -> ContextReport {
    let start = Instant::now();
    let mut steps = Vec::with_capacity(context.steps.len());

    if !context.supports_platform(&params.platform) {
        info!(
            context = %context.context_id,
            "Skipping context: platform {} not in {:?}",
            params.platform, context.platforms
        );
        for (index, step) in context.steps.iter().enumerate() {
            steps.push(StepReport {
                index,
                action: step.action.name().to_string(),
                step_id: step.step_id.clone(),
                duration_ms: 0,
                outcome: StepOutcome::skipped(format!(
                    "Platform {} not supported by this context",
                    params.platform
                )),
            });
        }
    } else {
        info!(
            spec = %context.spec_id,
            test = %context.test_id,
            context = %context.context_id,
            "Running context"
        );
        let mut failed = false;
        for (index, step) in context.steps.iter().enumerate() {
            let step_start = Instant::now();
            let outcome = if failed && !step.always_run {
                StepOutcome::skipped("Skipped after an earlier step failed")
            } else {
                params.executor.execute(step, &mut state).await
            };

            if outcome.status == Status::Fail {
                warn!(
                    context = %context.context_id,
                    step = index,
                    action = step.action.name(),
                    "Step failed: {}",
                    outcome.description
                );
                failed = true;
            } else {
                debug!(
                    context = %context.context_id,
                    step = index,
                    status = %outcome.status,
                    "Step finished"
                );
            }

            steps.push(StepReport {
                index,
                action: step.action.name().to_string(),
                step_id: step.step_id.clone(),
                duration_ms: step_start.elapsed().as_millis() as u64,
                outcome,
            });
        }
    }

    let status = Status::combine(steps.iter().map(|s: &StepReport| s.outcome.status));
    info!(context = %context.context_id, %status, "Context finished");

    ContextReport {
        spec_id: context.spec_id,
        test_id: context.test_id,
        context_id: context.context_id,
        status,
        duration_ms: start.elapsed().as_millis() as u64,
        steps,
        error: None,
    }
}

/// Terminate scopes the context started and left running
async fn reclaim_scopes(state: &ContextState, grace: Duration) {
    for scope in state.take_owned_scopes() {
        if !state.registry.has(&scope) {
            continue;
        }
        debug!(context = %state.context_id, scope = %scope, "Reclaiming scope left running");
        let outcome = terminate_scope(&state.registry, &scope, grace).await;
        if !outcome.is_pass() {
            warn!(scope = %scope, "Failed to reclaim scope: {}", outcome.description);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::{Step, StepAction};
    use crate::test_support::MockProcess;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Interprets `log` messages as instructions: "fail", "panic", "sleep",
    /// "spawn:<scope>", anything else passes
    #[derive(Default)]
    struct ScriptedExecutor {
        executed: AtomicUsize,
        running: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl StepExecutor for ScriptedExecutor {
        async fn execute(&self, step: &Step, ctx: &mut ContextState) -> StepOutcome {
            self.executed.fetch_add(1, Ordering::SeqCst);
            let StepAction::Log { message } = &step.action else {
                return StepOutcome::fail("unexpected action");
            };

            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            let outcome = match message.as_str() {
                "fail" => StepOutcome::fail("scripted failure"),
                "panic" => panic!("scripted panic"),
                "sleep" => {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    StepOutcome::pass("slept")
                }
                other => match other.strip_prefix("spawn:") {
                    Some(scope) => {
                        ctx.registry.create(scope, MockProcess::running(1)).unwrap();
                        ctx.own_scope(scope);
                        StepOutcome::pass("spawned")
                    }
                    None => StepOutcome::pass(other.to_string()),
                },
            };
            self.running.fetch_sub(1, Ordering::SeqCst);
            outcome
        }
    }

    fn log(message: &str) -> Step {
        Step::new(StepAction::Log {
            message: message.to_string(),
        })
    }

    fn context(id: &str, steps: Vec<Step>) -> TestContext {
        TestContext::new("spec", "test", id).with_steps(steps)
    }

    fn params(executor: Arc<ScriptedExecutor>) -> RunParams {
        RunParams::new(ScopeRegistry::new(), executor)
            .terminate_grace(Duration::from_millis(100))
            .platform("linux")
    }

    #[tokio::test]
    async fn test_skips_after_failure_except_always_run() {
        let executor = Arc::new(ScriptedExecutor::default());
        let contexts = vec![context(
            "c",
            vec![log("ok"), log("fail"), log("never"), log("teardown").always_run()],
        )];

        let reports = run_contexts(contexts, &params(executor.clone()), 1).await;

        let statuses: Vec<Status> = reports[0].steps.iter().map(|s| s.outcome.status).collect();
        assert_eq!(statuses, vec![Status::Pass, Status::Fail, Status::Skipped, Status::Pass]);
        assert_eq!(reports[0].status, Status::Fail);
        assert_eq!(executor.executed.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_one_report_per_context_in_queue_order() {
        let executor = Arc::new(ScriptedExecutor::default());
        let contexts = (0..6)
            .map(|i| context(&format!("c{}", i), vec![log("sleep")]))
            .collect();

        let reports = run_contexts(contexts, &params(executor), 3).await;

        let ids: Vec<&str> = reports.iter().map(|r| r.context_id.as_str()).collect();
        assert_eq!(ids, vec!["c0", "c1", "c2", "c3", "c4", "c5"]);
        assert!(reports.iter().all(|r| r.status == Status::Pass));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_workers_run_concurrently() {
        let executor = Arc::new(ScriptedExecutor::default());
        let contexts = (0..4).map(|i| context(&format!("c{}", i), vec![log("sleep")])).collect();

        run_contexts(contexts, &params(executor.clone()), 4).await;
        assert!(executor.peak.load(Ordering::SeqCst) > 1);
    }

    #[tokio::test]
    async fn test_worker_count_is_clamped() {
        let executor = Arc::new(ScriptedExecutor::default());
        let contexts = vec![context("only", vec![log("ok")])];

        let reports = run_contexts(contexts.clone(), &params(executor.clone()), 0).await;
        assert_eq!(reports.len(), 1);

        let reports = run_contexts(contexts, &params(executor), 64).await;
        assert_eq!(reports.len(), 1);
    }

    #[tokio::test]
    async fn test_panic_becomes_failed_report() {
        let executor = Arc::new(ScriptedExecutor::default());
        let contexts = vec![
            context("first", vec![log("ok")]),
            context("boom", vec![log("spawn:leaked"), log("panic")]),
            context("last", vec![log("ok")]),
        ];
        let params = params(executor);

        let reports = run_contexts(contexts, &params, 1).await;

        assert_eq!(reports.len(), 3);
        assert_eq!(reports[0].status, Status::Pass);
        assert_eq!(reports[1].status, Status::Fail);
        assert!(reports[1].error.as_deref().unwrap_or_default().contains("aborted"));
        assert_eq!(reports[2].status, Status::Pass);
        assert!(params.registry.is_empty());
    }

    #[tokio::test]
    async fn test_scopes_left_running_are_reclaimed() {
        let executor = Arc::new(ScriptedExecutor::default());
        let contexts = vec![context("c", vec![log("spawn:server"), log("ok")])];
        let params = params(executor);

        let reports = run_contexts(contexts, &params, 1).await;

        assert_eq!(reports[0].status, Status::Pass);
        assert!(params.registry.is_empty());
    }

    #[tokio::test]
    async fn test_platform_gating() {
        let executor = Arc::new(ScriptedExecutor::default());
        let contexts = vec![
            context("win", vec![log("ok"), log("ok")]).with_platforms(["windows"]),
            context("any", vec![log("ok")]),
        ];

        let reports = run_contexts(contexts, &params(executor.clone()), 2).await;

        assert_eq!(reports[0].status, Status::Skipped);
        assert_eq!(reports[0].count(Status::Skipped), 2);
        assert_eq!(reports[1].status, Status::Pass);
        assert_eq!(executor.executed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_empty_queue() {
        let executor = Arc::new(ScriptedExecutor::default());
        assert!(run_contexts(Vec::new(), &params(executor), 4).await.is_empty());
    }
}
