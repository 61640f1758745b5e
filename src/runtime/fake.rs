//! In-memory sandbox runtime for tests.
//!
//! Interprets a tiny line-oriented script language instead of talking to an
//! engine:
//!
//! - `echo <text>` yields `<text>\n` as an output chunk
//! - `sleep <ms>` advances (virtual) time
//! - `exit <code>` with a nonzero code terminates abnormally
//!
//! The wall-clock bound is enforced the same way the Docker runtime does:
//! a final `Timeout` item on the output channel.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{OutputRx, ResourceLimits, SandboxHandle, SandboxRuntime};
use crate::error::RuntimeError;

#[derive(Default)]
pub struct FakeRuntime {
    next_id: AtomicU64,
    /// Remaining `create` calls that fail with `EngineUnavailable`.
    create_failures: AtomicUsize,
    created: Mutex<Vec<String>>,
    started: Mutex<Vec<String>>,
    stopped: Mutex<Vec<String>>,
    removed: Mutex<Vec<String>>,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` create calls fail with a transient error.
    pub fn fail_next_creates(&self, n: usize) {
        self.create_failures.store(n, Ordering::SeqCst);
    }

    pub fn created_ids(&self) -> Vec<String> {
        self.created.lock().unwrap().clone()
    }

    pub fn was_stopped(&self, id: &str) -> bool {
        self.stopped.lock().unwrap().iter().any(|s| s == id)
    }

    pub fn was_removed(&self, id: &str) -> bool {
        self.removed.lock().unwrap().iter().any(|s| s == id)
    }
}

async fn interpret(
    script: String,
    tx: mpsc::Sender<Result<String, RuntimeError>>,
) -> Result<(), RuntimeError> {
    for line in script.lines() {
        let line = line.trim();
        if let Some(text) = line.strip_prefix("echo ") {
            if tx.send(Ok(format!("{text}\n"))).await.is_err() {
                return Ok(());
            }
        } else if let Some(ms) = line.strip_prefix("sleep ") {
            let ms: u64 = ms.parse().unwrap_or(0);
            tokio::time::sleep(Duration::from_millis(ms)).await;
        } else if let Some(code) = line.strip_prefix("exit ") {
            let exit_code: i64 = code.parse().unwrap_or(1);
            if exit_code != 0 {
                return Err(RuntimeError::SandboxCrashed { exit_code });
            }
            return Ok(());
        }
    }
    Ok(())
}

#[async_trait]
impl SandboxRuntime for FakeRuntime {
    async fn create(&self, _limits: &ResourceLimits) -> Result<SandboxHandle, RuntimeError> {
        let remaining = self.create_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.create_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(RuntimeError::EngineUnavailable("engine offline".to_string()));
        }
        let id = format!("fake-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        self.created.lock().unwrap().push(id.clone());
        Ok(SandboxHandle::new(id))
    }

    async fn start(&self, handle: &SandboxHandle) -> Result<(), RuntimeError> {
        self.started.lock().unwrap().push(handle.id.clone());
        Ok(())
    }

    async fn exec(
        &self,
        _handle: &SandboxHandle,
        script: &str,
        timeout: Duration,
    ) -> Result<OutputRx, RuntimeError> {
        let (tx, rx) = mpsc::channel(32);
        let script = script.to_string();
        tokio::spawn(async move {
            match tokio::time::timeout(timeout, interpret(script, tx.clone())).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    let _ = tx.send(Err(e)).await;
                }
                Err(_) => {
                    let _ = tx
                        .send(Err(RuntimeError::Timeout {
                            limit_secs: timeout.as_secs(),
                        }))
                        .await;
                }
            }
        });
        Ok(rx)
    }

    async fn stop(&self, handle: &SandboxHandle) -> Result<(), RuntimeError> {
        self.stopped.lock().unwrap().push(handle.id.clone());
        Ok(())
    }

    async fn remove(&self, handle: &SandboxHandle) -> Result<(), RuntimeError> {
        self.removed.lock().unwrap().push(handle.id.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn drain(mut rx: OutputRx) -> (String, Option<RuntimeError>) {
        let mut output = String::new();
        let mut failure = None;
        while let Some(item) = rx.recv().await {
            match item {
                Ok(chunk) => output.push_str(&chunk),
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }
        (output, failure)
    }

    #[tokio::test]
    async fn echo_yields_chunks_in_order() {
        let runtime = FakeRuntime::new();
        let handle = runtime.create(&test_limits()).await.unwrap();
        let rx = runtime
            .exec(&handle, "echo one\necho two", Duration::from_secs(5))
            .await
            .unwrap();
        let (output, failure) = drain(rx).await;
        assert_eq!(output, "one\ntwo\n");
        assert!(failure.is_none());
    }

    #[tokio::test]
    async fn nonzero_exit_is_a_crash() {
        let runtime = FakeRuntime::new();
        let handle = runtime.create(&test_limits()).await.unwrap();
        let rx = runtime
            .exec(&handle, "echo partial\nexit 2", Duration::from_secs(5))
            .await
            .unwrap();
        let (output, failure) = drain(rx).await;
        assert_eq!(output, "partial\n");
        assert!(matches!(
            failure,
            Some(RuntimeError::SandboxCrashed { exit_code: 2 })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn overlong_sleep_times_out() {
        let runtime = FakeRuntime::new();
        let handle = runtime.create(&test_limits()).await.unwrap();
        let rx = runtime
            .exec(&handle, "sleep 10000", Duration::from_secs(1))
            .await
            .unwrap();
        let (_, failure) = drain(rx).await;
        assert!(matches!(failure, Some(RuntimeError::Timeout { .. })));
    }

    #[tokio::test]
    async fn create_failures_are_consumed() {
        let runtime = FakeRuntime::new();
        runtime.fail_next_creates(1);
        assert!(runtime.create(&test_limits()).await.is_err());
        assert!(runtime.create(&test_limits()).await.is_ok());
    }

    fn test_limits() -> ResourceLimits {
        ResourceLimits {
            cpu_quota: 50_000,
            cpu_period: 100_000,
            memory_bytes: 128 * 1024 * 1024,
        }
    }
}
