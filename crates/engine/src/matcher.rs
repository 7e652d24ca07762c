//! Output wait conditions
//!
//! Polls a scope's captured output until every declared pattern matches, the
//! watched process exits first, or the timeout elapses. A crashed dependency
//! surfaces within one poll interval instead of after the full timeout.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::error::{EngineError, EngineResult};
use crate::registry::{ScopeProcess, ScopeRegistry};
use crate::POLL_INTERVAL;

/// Characters of output quoted in wait failures
const OUTPUT_TAIL_CHARS: usize = 500;

/// Flags accepted after a `/regex/`. JavaScript-only flags are accepted and ignored.
const REGEX_FLAGS: &str = "imsxguy";

/// Declarative wait condition as written in a test spec
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WaitCondition {
    /// Pattern the scope's stdout must contain
    #[serde(default, alias = "stdio")]
    pub stdout: Option<String>,

    /// Pattern the scope's stderr must contain
    #[serde(default)]
    pub stderr: Option<String>,

    /// Overrides the step timeout while waiting
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

/// A literal substring or a compiled `/regex/flags` pattern
#[derive(Debug, Clone)]
pub enum OutputPattern {
    Contains(String),
    Regex { source: String, regex: Regex },
}

impl OutputPattern {
    /// Parse `/body/flags` as a regex, anything else as a literal
    pub fn parse(pattern: &str) -> EngineResult<Self> {
        let Some((body, flags)) = split_regex(pattern) else {
            return Ok(Self::Contains(pattern.to_string()));
        };

        let mut builder = RegexBuilder::new(body);
        for flag in flags.chars() {
            match flag {
                'i' => builder.case_insensitive(true),
                'm' => builder.multi_line(true),
                's' => builder.dot_matches_new_line(true),
                'x' => builder.ignore_whitespace(true),
                _ => &mut builder,
            };
        }

        let regex = builder.build().map_err(|e| EngineError::InvalidPattern {
            pattern: pattern.to_string(),
            reason: e.to_string(),
        })?;

        Ok(Self::Regex {
            source: pattern.to_string(),
            regex,
        })
    }

    pub fn is_match(&self, text: &str) -> bool {
        match self {
            Self::Contains(needle) => text.contains(needle.as_str()),
            Self::Regex { regex, .. } => regex.is_match(text),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Contains(needle) => needle,
            Self::Regex { source, .. } => source,
        }
    }
}

impl fmt::Display for OutputPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.as_str())
    }
}

/// `/body/flags` when `pattern` is regex-shaped and every flag is known
fn split_regex(pattern: &str) -> Option<(&str, &str)> {
    let rest = pattern.strip_prefix('/')?;
    let close = rest.rfind('/')?;
    let (body, flags) = (&rest[..close], &rest[close + 1..]);
    if body.is_empty() || !flags.chars().all(|c| REGEX_FLAGS.contains(c)) {
        return None;
    }
    Some((body, flags))
}

/// Options for [`wait_for_conditions`]
#[derive(Clone)]
pub struct WaitOptions {
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    pub timeout: Duration,
    /// When set, the wait fails as soon as this process exits
    pub exit_source: Option<Arc<dyn ScopeProcess>>,
}

impl WaitOptions {
    pub fn new(timeout: Duration) -> Self {
        Self {
            stdout: None,
            stderr: None,
            timeout,
            exit_source: None,
        }
    }

    pub fn from_condition(condition: &WaitCondition, default_timeout: Duration) -> Self {
        Self {
            stdout: condition.stdout.clone(),
            stderr: condition.stderr.clone(),
            timeout: condition
                .timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(default_timeout),
            exit_source: None,
        }
    }

    pub fn stdout(mut self, pattern: impl Into<String>) -> Self {
        self.stdout = Some(pattern.into());
        self
    }

    pub fn stderr(mut self, pattern: impl Into<String>) -> Self {
        self.stderr = Some(pattern.into());
        self
    }

    pub fn watch_exit(mut self, process: Arc<dyn ScopeProcess>) -> Self {
        self.exit_source = Some(process);
        self
    }
}

/// Wait until the scope's output satisfies every declared pattern.
///
/// Patterns are compiled before the first poll, so a malformed regex fails
/// immediately with `InvalidPattern`.
pub async fn wait_for_conditions(
    registry: &ScopeRegistry,
    scope: &str,
    options: WaitOptions,
) -> EngineResult<bool> {
    let stdout = options.stdout.as_deref().map(OutputPattern::parse).transpose()?;
    let stderr = options.stderr.as_deref().map(OutputPattern::parse).transpose()?;
    let waited_for = describe(stdout.as_ref(), stderr.as_ref());

    let start = Instant::now();
    loop {
        let matched = registry
            .inspect(scope, |s| {
                stdout.as_ref().map_or(true, |p| p.is_match(&s.stdout))
                    && stderr.as_ref().map_or(true, |p| p.is_match(&s.stderr))
            })
            .ok_or_else(|| EngineError::ScopeNotFound(scope.to_string()))?;

        if matched {
            debug!(scope, elapsed_ms = start.elapsed().as_millis() as u64, "Wait condition met");
            return Ok(true);
        }

        if let Some(exit_code) = options.exit_source.as_ref().and_then(|p| p.exit_code()) {
            debug!(scope, exit_code, "Process exited before wait condition was met");
            return Err(EngineError::EarlyExit {
                exit_code,
                output_tail: output_tail(registry, scope),
            });
        }

        let elapsed = start.elapsed();
        if elapsed >= options.timeout {
            return Err(EngineError::Timeout {
                waited_for,
                elapsed_ms: elapsed.as_millis() as u64,
                output_tail: output_tail(registry, scope),
            });
        }

        trace!(scope, "Wait condition not met yet");
        tokio::time::sleep(POLL_INTERVAL.min(options.timeout - elapsed)).await;
    }
}

fn describe(stdout: Option<&OutputPattern>, stderr: Option<&OutputPattern>) -> String {
    match (stdout, stderr) {
        (Some(out), Some(err)) => format!("stdout matching {} and stderr matching {}", out, err),
        (Some(out), None) => format!("stdout matching {}", out),
        (None, Some(err)) => format!("stderr matching {}", err),
        (None, None) => "no condition".to_string(),
    }
}

fn output_tail(registry: &ScopeRegistry, scope: &str) -> String {
    registry
        .inspect(scope, |s| {
            let mut combined = tail(&s.stdout, OUTPUT_TAIL_CHARS);
            if !s.stderr.is_empty() {
                combined.push_str("\n[stderr] ");
                combined.push_str(&tail(&s.stderr, OUTPUT_TAIL_CHARS));
            }
            combined
        })
        .unwrap_or_default()
}

/// Last `max_chars` characters of `text`
pub(crate) fn tail(text: &str, max_chars: usize) -> String {
    let count = text.chars().count();
    if count <= max_chars {
        return text.to_string();
    }
    text.chars().skip(count - max_chars).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::MockProcess;

    fn registry_with(name: &str) -> (ScopeRegistry, Arc<MockProcess>) {
        let registry = ScopeRegistry::new();
        let process = MockProcess::running(1);
        registry.create(name, process.clone()).unwrap();
        (registry, process)
    }

    #[test]
    fn test_regex_pattern_matches() {
        let pattern = OutputPattern::parse("/port \\d+/").unwrap();
        assert!(matches!(pattern, OutputPattern::Regex { .. }));
        assert!(pattern.is_match("Listening on port 8080"));
        assert!(!pattern.is_match("Listening on no ports"));
    }

    #[test]
    fn test_regex_flags() {
        let pattern = OutputPattern::parse("/ready/i").unwrap();
        assert!(pattern.is_match("Server READY"));

        let pattern = OutputPattern::parse("/^done$/m").unwrap();
        assert!(pattern.is_match("building\ndone\n"));

        // JavaScript global flag has no meaning for a single match
        let pattern = OutputPattern::parse("/ok/g").unwrap();
        assert!(pattern.is_match("ok"));
    }

    #[test]
    fn test_literal_pattern() {
        let pattern = OutputPattern::parse("port \\d+").unwrap();
        assert!(matches!(pattern, OutputPattern::Contains(_)));
        assert!(pattern.is_match("port \\d+ literally"));
        assert!(!pattern.is_match("port 8080"));

        // Paths are not regexes
        let pattern = OutputPattern::parse("/usr/bin").unwrap();
        assert!(matches!(pattern, OutputPattern::Contains(_)));
    }

    #[test]
    fn test_malformed_regex_fails_fast() {
        let err = OutputPattern::parse("/(unclosed/").unwrap_err();
        assert!(matches!(err, EngineError::InvalidPattern { .. }));
    }

    #[test]
    fn test_tail_is_char_safe() {
        assert_eq!(tail("abcdef", 3), "def");
        assert_eq!(tail("ab", 3), "ab");
        assert_eq!(tail("ééé", 2), "éé");
    }

    #[tokio::test]
    async fn test_resolves_when_output_appears() {
        let (registry, _process) = registry_with("server");

        let writer = registry.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            writer.append_stdout("server", "booting...\nREADY\n");
        });

        let options = WaitOptions::new(Duration::from_secs(2)).stdout("READY");
        assert!(wait_for_conditions(&registry, "server", options).await.unwrap());
    }

    #[tokio::test]
    async fn test_timeout_mentions_pattern() {
        let (registry, _process) = registry_with("server");

        let writer = registry.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            writer.append_stdout("server", "READY");
        });

        let options = WaitOptions::new(Duration::from_millis(100)).stdout("READY");
        let err = wait_for_conditions(&registry, "server", options)
            .await
            .unwrap_err();

        assert!(matches!(err, EngineError::Timeout { .. }));
        assert!(err.to_string().contains("READY"));
    }

    #[tokio::test]
    async fn test_early_exit_fails_fast() {
        let (registry, process) = registry_with("server");
        registry.append_stdout("server", "fatal: address in use\n");

        let exiting = process.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            exiting.set_exit_code(1);
        });

        let start = Instant::now();
        let options = WaitOptions::new(Duration::from_secs(10))
            .stdout("READY")
            .watch_exit(process.clone());
        let err = wait_for_conditions(&registry, "server", options)
            .await
            .unwrap_err();

        assert!(start.elapsed() < Duration::from_millis(500));
        match err {
            EngineError::EarlyExit { exit_code, output_tail } => {
                assert_eq!(exit_code, 1);
                assert!(output_tail.contains("address in use"));
            }
            other => panic!("expected early exit, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_all_conditions_must_match() {
        let (registry, _process) = registry_with("svc");
        registry.append_stdout("svc", "READY");

        let options = WaitOptions::new(Duration::from_millis(150))
            .stdout("READY")
            .stderr("warming");
        assert!(wait_for_conditions(&registry, "svc", options.clone()).await.is_err());

        registry.append_stderr("svc", "warming caches");
        assert!(wait_for_conditions(&registry, "svc", options).await.unwrap());
    }

    #[tokio::test]
    async fn test_no_conditions_resolve_immediately() {
        let (registry, _process) = registry_with("svc");
        let options = WaitOptions::new(Duration::from_secs(5));
        assert!(wait_for_conditions(&registry, "svc", options).await.unwrap());
    }

    #[tokio::test]
    async fn test_missing_scope() {
        let registry = ScopeRegistry::new();
        let options = WaitOptions::new(Duration::from_millis(100)).stdout("x");
        let err = wait_for_conditions(&registry, "nope", options).await.unwrap_err();
        assert!(matches!(err, EngineError::ScopeNotFound(_)));
    }

    #[test]
    fn test_condition_from_yaml() {
        let condition: WaitCondition =
            serde_yaml::from_str("stdio: \"/listening/i\"\ntimeoutMs: 3000\n").unwrap();
        assert_eq!(condition.stdout.as_deref(), Some("/listening/i"));

        let options = WaitOptions::from_condition(&condition, Duration::from_secs(60));
        assert_eq!(options.timeout, Duration::from_millis(3000));
    }
}
