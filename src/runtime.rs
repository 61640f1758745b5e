//! Sandbox runtime trait and implementations.
//!
//! The runtime is a thin capability interface over the container engine:
//! create/start/stop/remove a sandbox and run a script inside it while
//! streaming captured output. Engine calls are blocking I/O from the
//! daemon's point of view; callers must not hold shared locks across them.

mod docker;
#[cfg(test)]
pub(crate) mod fake;

pub use docker::DockerRuntime;

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::config::Config;
use crate::error::RuntimeError;

/// CPU and memory bounds for one sandbox, fixed at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceLimits {
    /// CPU quota in microseconds per scheduling period.
    pub cpu_quota: i64,
    /// CPU scheduling period in microseconds.
    pub cpu_period: i64,
    /// Memory ceiling in bytes.
    pub memory_bytes: i64,
}

impl From<&Config> for ResourceLimits {
    fn from(config: &Config) -> Self {
        Self {
            cpu_quota: config.cpu_quota,
            cpu_period: config.cpu_period,
            memory_bytes: config.memory_bytes(),
        }
    }
}

/// Engine-assigned identifier of one sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SandboxHandle {
    pub id: String,
}

impl SandboxHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

impl std::fmt::Display for SandboxHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.id)
    }
}

/// Receiving end of an execution's output.
///
/// Chunks arrive in production order, stdout and stderr interleaved. The
/// channel closing without an error means the script exited normally; an
/// `Err` item (`SandboxCrashed` or `Timeout`) is always the final item.
pub type OutputRx = mpsc::Receiver<Result<String, RuntimeError>>;

/// Capability interface over the container engine.
///
/// One production implementation talks to Docker; tests use an in-memory
/// fake. `stop` and `remove` are idempotent: calling them on a sandbox
/// that is already stopped or gone is a no-op, never an error, so cleanup
/// races cannot escalate into crashes.
#[async_trait]
pub trait SandboxRuntime: Send + Sync {
    /// Create a sandbox with the given limits. Fails with
    /// `EngineUnavailable` or `ResourceExhausted` on engine trouble.
    async fn create(&self, limits: &ResourceLimits) -> Result<SandboxHandle, RuntimeError>;

    /// Start a created sandbox.
    async fn start(&self, handle: &SandboxHandle) -> Result<(), RuntimeError>;

    /// Run a script inside a started sandbox, streaming output chunks.
    ///
    /// The returned channel yields chunks as they are produced. Abnormal
    /// termination surfaces as a final `SandboxCrashed` item; exceeding
    /// `timeout` surfaces as a final `Timeout` item.
    async fn exec(
        &self,
        handle: &SandboxHandle,
        script: &str,
        timeout: Duration,
    ) -> Result<OutputRx, RuntimeError>;

    /// Force-stop a running sandbox. No-op if already stopped.
    async fn stop(&self, handle: &SandboxHandle) -> Result<(), RuntimeError>;

    /// Remove a sandbox's engine resources. No-op if already removed.
    async fn remove(&self, handle: &SandboxHandle) -> Result<(), RuntimeError>;
}
