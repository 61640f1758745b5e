//! Error taxonomy for the execution daemon.
//!
//! Engine-level errors (`EngineUnavailable`, `ResourceExhausted`) are
//! transient and retried by the executor with bounded backoff. Execution
//! failures (`SandboxCrashed`, `Timeout`) are terminal for that run and
//! never retried.

use thiserror::Error;

/// Errors surfaced by a [`SandboxRuntime`](crate::runtime::SandboxRuntime).
#[derive(Debug, Clone, Error)]
pub enum RuntimeError {
    /// The container engine cannot be reached.
    #[error("container engine unavailable: {0}")]
    EngineUnavailable(String),

    /// The host refused to allocate another sandbox.
    #[error("host resources exhausted: {0}")]
    ResourceExhausted(String),

    /// The process inside the sandbox terminated abnormally.
    #[error("sandbox process exited abnormally (exit code {exit_code})")]
    SandboxCrashed { exit_code: i64 },

    /// Execution exceeded its wall-clock bound.
    #[error("execution timed out after {limit_secs}s")]
    Timeout { limit_secs: u64 },

    /// Any other engine API failure (treated as non-transient).
    #[error("container engine error: {0}")]
    Engine(String),
}

impl RuntimeError {
    /// Whether the executor should retry acquisition after this error.
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::EngineUnavailable(_) | Self::ResourceExhausted(_)
        )
    }
}

/// Lookup of an unknown session id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("session not found")]
pub struct SessionNotFound;
