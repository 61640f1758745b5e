//! Executor: drives one submission end to end.
//!
//! `submit` registers a session and returns its id immediately; the actual
//! execution runs in a background task that acquires a sandbox (warm pool
//! first, on-demand creation as the slow path), streams output into the
//! session table, commits the terminal state, and retires the sandbox on
//! every exit path. `run_tests` is the synchronous sibling for pytest
//! suites: same acquisition and retirement, but the caller waits for the
//! verdict.
//!
//! Transient engine errors during acquisition are retried with bounded
//! exponential backoff. Execution-level failures are never retried:
//! re-running untrusted code is not a decision this daemon makes for the
//! caller.

use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::error::RuntimeError;
use crate::pool::PrewarmPool;
use crate::runtime::{ResourceLimits, SandboxHandle, SandboxRuntime};
use crate::session::{Outcome, SessionId, SessionTable};

/// One uploaded file of a test suite.
#[derive(Debug, Clone)]
pub struct TestFile {
    pub name: String,
    pub content: String,
}

/// Pass/fail counts parsed from pytest's closing summary line.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TestSummary {
    pub passed: u32,
    pub failed: u32,
    pub total: u32,
    pub duration: f64,
}

/// Outcome of one synchronous test-suite run.
#[derive(Debug)]
pub struct TestRun {
    pub id: Uuid,
    pub exit_code: i64,
    pub output: String,
    pub summary: Option<TestSummary>,
}

pub struct Executor {
    runtime: Arc<dyn SandboxRuntime>,
    pool: Arc<PrewarmPool>,
    sessions: Arc<SessionTable>,
    limits: ResourceLimits,
    exec_timeout: Duration,
    max_attempts: u32,
    initial_backoff: Duration,
}

impl Executor {
    pub fn new(
        runtime: Arc<dyn SandboxRuntime>,
        pool: Arc<PrewarmPool>,
        sessions: Arc<SessionTable>,
        config: &Config,
    ) -> Arc<Self> {
        Arc::new(Self {
            runtime,
            pool,
            sessions,
            limits: ResourceLimits::from(config),
            exec_timeout: config.exec_timeout(),
            max_attempts: config.acquire_max_attempts.max(1),
            initial_backoff: config.acquire_backoff(),
        })
    }

    /// Register a session for `script` and kick off background execution.
    /// Never blocks on the execution itself.
    pub async fn submit(self: &Arc<Self>, script: String) -> SessionId {
        let id = self.sessions.create().await;
        info!(session = %id, script_len = script.len(), "Accepted submission");
        let executor = Arc::clone(self);
        tokio::spawn(async move {
            executor.run(id, &script).await;
        });
        id
    }

    #[instrument(skip(self, script), fields(session = %id))]
    async fn run(&self, id: SessionId, script: &str) {
        let sandbox = match self.acquire_sandbox().await {
            Ok(sandbox) => sandbox,
            Err(e) => {
                warn!(error = %e, "Sandbox acquisition failed");
                self.fail(id, &e).await;
                return;
            }
        };

        // An explicit cleanup may already have won; if so the sandbox is
        // surplus and goes straight to retirement.
        match self.sessions.set_running(id, sandbox.clone()).await {
            Ok(true) => {}
            Ok(false) | Err(_) => {
                debug!(sandbox = %sandbox, "Session gone before execution; retiring sandbox");
                self.retire(&sandbox).await;
                return;
            }
        }
        self.pool.mark_executing(&sandbox);

        match self.stream_execution(id, &sandbox, script).await {
            Ok(()) => {
                let committed = self
                    .sessions
                    .complete(id, Outcome::Completed)
                    .await
                    .unwrap_or(false);
                debug!(committed, "Execution completed");
            }
            Err(e) => {
                warn!(error = %e, "Execution failed");
                self.fail(id, &e).await;
            }
        }

        // Scoped acquisition: released on success, crash and timeout alike.
        self.retire(&sandbox).await;
    }

    /// Run an uploaded pytest suite to completion and report its outcome.
    ///
    /// Unlike `submit` this blocks until the suite finishes; the run never
    /// enters the session table and the returned id only labels it in logs
    /// and the response. The sandbox is acquired and retired exactly like a
    /// script execution's.
    #[instrument(skip(self, files, targets), fields(files = files.len()))]
    pub async fn run_tests(
        &self,
        files: &[TestFile],
        targets: &[String],
    ) -> Result<TestRun, RuntimeError> {
        let id = Uuid::new_v4();
        let sandbox = self.acquire_sandbox().await?;
        self.pool.mark_executing(&sandbox);

        let script = pytest_driver(files, targets);
        let outcome = self.collect_run(&sandbox, &script).await;
        self.retire(&sandbox).await;

        let (exit_code, output) = outcome?;
        let summary = parse_pytest_summary(&output);
        info!(run = %id, exit_code, "Test run finished");
        Ok(TestRun {
            id,
            exit_code,
            output,
            summary,
        })
    }

    /// Drain an execution into a buffer, folding a nonzero exit into the
    /// return value instead of an error: a failing test suite is a verdict,
    /// not an engine problem.
    async fn collect_run(
        &self,
        sandbox: &SandboxHandle,
        script: &str,
    ) -> Result<(i64, String), RuntimeError> {
        let mut rx = self.runtime.exec(sandbox, script, self.exec_timeout).await?;
        let mut output = String::new();
        let mut exit_code = 0;
        while let Some(item) = rx.recv().await {
            match item {
                Ok(chunk) => output.push_str(&chunk),
                Err(RuntimeError::SandboxCrashed { exit_code: code }) => exit_code = code,
                Err(e) => return Err(e),
            }
        }
        Ok((exit_code, output))
    }

    async fn stream_execution(
        &self,
        id: SessionId,
        sandbox: &SandboxHandle,
        script: &str,
    ) -> Result<(), RuntimeError> {
        let mut rx = self.runtime.exec(sandbox, script, self.exec_timeout).await?;
        while let Some(item) = rx.recv().await {
            match item {
                Ok(chunk) => {
                    // No-op once the session is terminal (e.g. cleaned up)
                    let _ = self.sessions.append_output(id, &chunk).await;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Take a warm sandbox if one is ready; otherwise create one on demand,
    /// retrying transient engine errors with doubling backoff.
    async fn acquire_sandbox(&self) -> Result<SandboxHandle, RuntimeError> {
        if let Some(handle) = self.pool.acquire() {
            return Ok(handle);
        }

        let mut backoff = self.initial_backoff;
        let mut attempt = 1;
        loop {
            match self.create_on_demand().await {
                Ok(handle) => {
                    self.pool.adopt(&handle);
                    return Ok(handle);
                }
                Err(e) if e.is_transient() && attempt < self.max_attempts => {
                    warn!(error = %e, attempt, "Transient engine error; backing off");
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn create_on_demand(&self) -> Result<SandboxHandle, RuntimeError> {
        let handle = self.runtime.create(&self.limits).await?;
        if let Err(e) = self.runtime.start(&handle).await {
            let _ = self.runtime.remove(&handle).await;
            return Err(e);
        }
        Ok(handle)
    }

    /// Record the failure reason in the session output and commit `Failed`.
    async fn fail(&self, id: SessionId, error: &RuntimeError) {
        let _ = self
            .sessions
            .append_output(id, &format!("execution failed: {error}\n"))
            .await;
        let _ = self.sessions.complete(id, Outcome::Failed).await;
    }

    /// Retire a sandbox: drop it from the pool registry and reclaim its
    /// engine resources. Safe to race with reaper cleanup (stop/remove are
    /// idempotent).
    async fn retire(&self, sandbox: &SandboxHandle) {
        self.pool.release(sandbox);
        if let Err(e) = self.runtime.stop(sandbox).await {
            warn!(sandbox = %sandbox, error = %e, "Failed to stop sandbox");
        }
        if let Err(e) = self.runtime.remove(sandbox).await {
            warn!(sandbox = %sandbox, error = %e, "Failed to remove sandbox");
        }
    }
}

/// Build the script that stages the uploaded files inside the sandbox and
/// hands the test files to pytest. Staging goes through the same stdin
/// channel as a plain script, so no archive upload is needed.
fn pytest_driver(files: &[TestFile], targets: &[String]) -> String {
    let mut script = String::from("import pathlib\nimport sys\n\n");
    script.push_str("base = pathlib.Path(\"/tmp/suite\")\n");
    script.push_str("base.mkdir(parents=True, exist_ok=True)\n");
    for file in files {
        let _ = writeln!(
            script,
            "(base / {}).write_text({}, encoding=\"utf-8\")",
            py_string(&file.name),
            py_string(&file.content),
        );
    }
    script.push_str("\ntry:\n");
    script.push_str("    import pytest\n");
    script.push_str("except ImportError:\n");
    script.push_str(
        "    print(\"pytest is not installed in the sandbox image\", file=sys.stderr)\n",
    );
    script.push_str("    sys.exit(2)\n\n");
    script.push_str("args = [\"-v\", \"--no-header\"]\n");
    for target in targets {
        let _ = writeln!(script, "args.append(str(base / {}))", py_string(target));
    }
    script.push_str("sys.exit(pytest.main(args))\n");
    script
}

/// Escape `s` as a double-quoted Python string literal.
fn py_string(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c => out.push(c),
        }
    }
    out.push('"');
    out
}

/// Pull counts out of pytest's closing summary line
/// (`== 2 passed, 1 failed in 0.12s ==`). `None` when the run produced no
/// such line, e.g. when it aborted before collecting tests.
fn parse_pytest_summary(output: &str) -> Option<TestSummary> {
    for raw in output.lines().rev() {
        let line = raw.trim().trim_matches('=').trim();
        let Some((counts, elapsed)) = line.rsplit_once(" in ") else {
            continue;
        };
        let mut passed = 0;
        let mut failed = 0;
        let mut matched = false;
        for part in counts.split(',') {
            let mut words = part.split_whitespace();
            let (Some(count), Some(label)) = (words.next(), words.next()) else {
                continue;
            };
            let Ok(count) = count.parse::<u32>() else {
                continue;
            };
            match label {
                "passed" => {
                    passed = count;
                    matched = true;
                }
                "failed" | "error" | "errors" => {
                    failed += count;
                    matched = true;
                }
                _ => {}
            }
        }
        if matched {
            let duration = elapsed.trim_end_matches('s').parse().unwrap_or(0.0);
            return Some(TestSummary {
                passed,
                failed,
                total: passed + failed,
                duration,
            });
        }
    }
    None
}
