//! Scoped commands against real shell processes
//!
//! Run with: cargo test --package docscope-engine --test scopes

#![cfg(unix)]

use std::time::{Duration, Instant};

use docscope_engine::matcher::wait_for_conditions;
use docscope_engine::spec::ShellStep;
use docscope_engine::{
    run_scoped_command, terminate_scope, type_into_scope, ContextState, ScopeRegistry,
    ScopedCommand, SessionRequest, ShellMode, ShellStepExecutor, Status, Step, StepAction,
    StepExecutor, WaitCondition, WaitOptions,
};

fn shell(scope: &str, line: &str, mode: ShellMode) -> ScopedCommand {
    ScopedCommand {
        scope: scope.to_string(),
        request: SessionRequest::shell("sh", line),
        mode,
        terminate_timeout: Duration::from_millis(500),
    }
}

fn wait_for(pattern: &str) -> WaitCondition {
    WaitCondition {
        stdout: Some(pattern.to_string()),
        ..Default::default()
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn foreground_success_captures_output() {
    let registry = ScopeRegistry::new();

    let outcome = run_scoped_command(
        &registry,
        shell("fg", "echo done && exit 0", ShellMode::foreground(Duration::from_secs(10))),
    )
    .await;

    assert_eq!(outcome.status, Status::Pass, "{}", outcome.description);
    assert!(outcome.output_str("stdout").unwrap_or_default().contains("done"));
    assert_eq!(outcome.outputs["exitCode"], 0);
    assert!(!registry.has("fg"));
}

#[tokio::test(flavor = "multi_thread")]
async fn foreground_nonzero_exit_fails() {
    let registry = ScopeRegistry::new();

    let outcome = run_scoped_command(
        &registry,
        shell("fg", "exit 1", ShellMode::foreground(Duration::from_secs(10))),
    )
    .await;

    assert_eq!(outcome.status, Status::Fail);
    assert!(outcome.description.contains("Exit code 1"), "{}", outcome.description);
    assert!(registry.is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn foreground_accepts_declared_exit_codes() {
    let registry = ScopeRegistry::new();

    let outcome = run_scoped_command(
        &registry,
        shell(
            "fg",
            "echo partial; exit 3",
            ShellMode::Foreground {
                timeout: Duration::from_secs(10),
                exit_codes: vec![0, 3],
                expected_output: Some("/part\\w+/".to_string()),
            },
        ),
    )
    .await;

    assert_eq!(outcome.status, Status::Pass, "{}", outcome.description);
    assert_eq!(outcome.outputs["exitCode"], 3);
}

#[tokio::test(flavor = "multi_thread")]
async fn foreground_output_mismatch_fails() {
    let registry = ScopeRegistry::new();

    let outcome = run_scoped_command(
        &registry,
        shell(
            "fg",
            "echo hello",
            ShellMode::Foreground {
                timeout: Duration::from_secs(10),
                exit_codes: vec![0],
                expected_output: Some("goodbye".to_string()),
            },
        ),
    )
    .await;

    assert_eq!(outcome.status, Status::Fail);
    assert!(outcome.description.contains("goodbye"));
}

#[tokio::test(flavor = "multi_thread")]
async fn foreground_timeout_kills_process() {
    let registry = ScopeRegistry::new();
    let start = Instant::now();

    let outcome = run_scoped_command(
        &registry,
        shell("slow", "sleep 30", ShellMode::foreground(Duration::from_millis(300))),
    )
    .await;

    assert_eq!(outcome.status, Status::Fail);
    assert!(outcome.description.contains("did not complete within 300 ms"));
    assert!(start.elapsed() < Duration::from_secs(5));
    assert!(!registry.has("slow"));
}

#[tokio::test(flavor = "multi_thread")]
async fn background_scope_stays_alive_until_terminated() {
    let registry = ScopeRegistry::new();

    let outcome = run_scoped_command(
        &registry,
        shell(
            "server",
            "echo READY; sleep 30",
            ShellMode::background(wait_for("READY"), Duration::from_secs(10)),
        ),
    )
    .await;

    assert_eq!(outcome.status, Status::Pass, "{}", outcome.description);
    assert!(registry.has("server"));
    let process = registry.get("server").unwrap().process;
    assert_eq!(process.exit_code(), None);

    let terminated = terminate_scope(&registry, "server", Duration::from_secs(2)).await;
    assert_eq!(terminated.status, Status::Pass, "{}", terminated.description);
    assert!(terminated.output_str("stdout").unwrap_or_default().contains("READY"));
    assert!(!registry.has("server"));
}

#[tokio::test(flavor = "multi_thread")]
async fn background_regex_condition() {
    let registry = ScopeRegistry::new();

    let outcome = run_scoped_command(
        &registry,
        shell(
            "web",
            "echo 'Listening on port 8080'; sleep 30",
            ShellMode::background(wait_for("/port \\d+/"), Duration::from_secs(10)),
        ),
    )
    .await;

    assert_eq!(outcome.status, Status::Pass, "{}", outcome.description);
    assert_eq!(registry.cleanup(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn background_early_exit_is_reported_quickly() {
    let registry = ScopeRegistry::new();
    let start = Instant::now();

    let outcome = run_scoped_command(
        &registry,
        shell(
            "crash",
            "echo starting; exit 3",
            ShellMode::background(wait_for("READY"), Duration::from_secs(10)),
        ),
    )
    .await;

    assert_eq!(outcome.status, Status::Fail);
    assert!(outcome.description.contains("code 3"), "{}", outcome.description);
    assert!(start.elapsed() < Duration::from_secs(3));
    assert!(!registry.has("crash"));
}

#[tokio::test(flavor = "multi_thread")]
async fn background_timeout_reclaims_scope() {
    let registry = ScopeRegistry::new();

    let outcome = run_scoped_command(
        &registry,
        shell(
            "quiet",
            "sleep 30",
            ShellMode::background(wait_for("NEVER"), Duration::from_millis(300)),
        ),
    )
    .await;

    assert_eq!(outcome.status, Status::Fail);
    assert!(outcome.description.contains("NEVER"), "{}", outcome.description);
    assert!(!registry.has("quiet"));
}

#[tokio::test(flavor = "multi_thread")]
async fn typed_keys_reach_the_process() {
    let registry = ScopeRegistry::new();

    let started = run_scoped_command(
        &registry,
        shell(
            "repl",
            "echo READY; read line; echo \"got $line\"; sleep 30",
            ShellMode::background(wait_for("READY"), Duration::from_secs(10)),
        ),
    )
    .await;
    assert_eq!(started.status, Status::Pass, "{}", started.description);

    let typed = type_into_scope(&registry, "repl", &["hello", "$ENTER$"]).await;
    assert_eq!(typed.status, Status::Pass, "{}", typed.description);

    let matched = wait_for_conditions(
        &registry,
        "repl",
        WaitOptions::new(Duration::from_secs(5)).stdout("got hello"),
    )
    .await;
    assert!(matched.is_ok(), "{:?}", matched);

    terminate_scope(&registry, "repl", Duration::from_secs(2)).await;
    assert!(registry.is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn duplicate_scope_leaves_original_running() {
    let registry = ScopeRegistry::new();
    let background = || ShellMode::background(wait_for("READY"), Duration::from_secs(10));

    let first =
        run_scoped_command(&registry, shell("svc", "echo READY; sleep 30", background())).await;
    assert_eq!(first.status, Status::Pass, "{}", first.description);
    let pid = registry.get("svc").unwrap().process.id();

    let second =
        run_scoped_command(&registry, shell("svc", "echo READY; sleep 30", background())).await;
    assert_eq!(second.status, Status::Fail);
    assert_eq!(registry.get("svc").unwrap().process.id(), pid);

    registry.cleanup();
}

#[tokio::test(flavor = "multi_thread")]
async fn spawn_failure_is_a_step_failure() {
    let registry = ScopeRegistry::new();
    let command = ScopedCommand {
        scope: "missing".to_string(),
        request: SessionRequest::new("/nonexistent/docscope-binary"),
        mode: ShellMode::foreground(Duration::from_secs(2)),
        terminate_timeout: Duration::from_millis(200),
    };

    let outcome = run_scoped_command(&registry, command).await;

    assert_eq!(outcome.status, Status::Fail);
    assert!(
        outcome.description.contains("Failed to spawn"),
        "{}",
        outcome.description
    );
    assert!(outcome.description.contains("/nonexistent/docscope-binary"));
    assert!(registry.is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn scope_is_owned_while_its_step_is_waiting() {
    let registry = ScopeRegistry::new();
    let ctx = ContextState::new(registry.clone(), "ctx");
    let step = Step::new(StepAction::RunShell(ShellStep {
        command: "sleep 30".to_string(),
        scope: Some("pending".to_string()),
        wait_until: Some(wait_for("NEVER")),
        timeout: Some(20_000),
        ..Default::default()
    }));

    let task = {
        let mut ctx = ctx.clone();
        tokio::spawn(async move { ShellStepExecutor::default().execute(&step, &mut ctx).await })
    };

    let deadline = Instant::now() + Duration::from_secs(5);
    while !registry.has("pending") {
        assert!(Instant::now() < deadline, "scope never registered");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(ctx.owned_scopes(), vec!["pending".to_string()]);

    // Abandon the step mid-wait, then reclaim what the context owns
    task.abort();
    assert!(task.await.is_err());
    for scope in ctx.take_owned_scopes() {
        let outcome = terminate_scope(&registry, &scope, Duration::from_millis(500)).await;
        assert_eq!(outcome.status, Status::Pass, "{}", outcome.description);
    }
    assert!(registry.is_empty());
}
