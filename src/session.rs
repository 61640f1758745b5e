//! Session table: the source of truth for what is running and what finished.
//!
//! A session tracks one execution request from submission to cleanup. All
//! mutation goes through the table's accessor operations; each record sits
//! behind its own lock so two sessions never contend on each other's
//! critical section. State only moves forward through
//! `Pending -> Running -> {Completed|Failed} -> CleanedUp`; a write against
//! an already-terminal record is a silent no-op, which is how the
//! executor/reaper completion race resolves.
//!
//! Captured output interleaves stdout and stderr in arrival order, matching
//! what the container engine's log endpoint returns.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;
use uuid::Uuid;

use crate::error::SessionNotFound;
use crate::runtime::SandboxHandle;

/// Opaque session identifier, generated at submission time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(Uuid);

impl SessionId {
    fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for SessionId {
    type Err = SessionNotFound;

    /// Malformed ids map to `SessionNotFound`: an id this daemon never
    /// issued cannot name a session.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self).map_err(|_| SessionNotFound)
    }
}

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Pending,
    Running,
    Completed,
    Failed,
    CleanedUp,
}

impl SessionState {
    /// Whether no further transition can occur except cleanup.
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::CleanedUp)
    }
}

/// Terminal outcome the executor can commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Completed,
    Failed,
}

#[derive(Debug)]
struct Record {
    state: SessionState,
    sandbox: Option<SandboxHandle>,
    output: String,
    created_at: Instant,
    last_accessed: Instant,
}

/// Read-only snapshot of a session, as returned by [`SessionTable::get`].
#[derive(Debug, Clone)]
pub struct SessionView {
    pub id: SessionId,
    pub state: SessionState,
    pub sandbox: Option<SandboxHandle>,
    pub output: String,
    pub created_at: Instant,
}

/// Mapping from session id to execution state and result data.
#[derive(Default)]
pub struct SessionTable {
    records: RwLock<HashMap<SessionId, Arc<Mutex<Record>>>>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new pending session and return its id.
    pub async fn create(&self) -> SessionId {
        let id = SessionId::generate();
        let now = Instant::now();
        let record = Record {
            state: SessionState::Pending,
            sandbox: None,
            output: String::new(),
            created_at: now,
            last_accessed: now,
        };
        self.records
            .write()
            .await
            .insert(id, Arc::new(Mutex::new(record)));
        id
    }

    async fn record(&self, id: SessionId) -> Result<Arc<Mutex<Record>>, SessionNotFound> {
        self.records
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(SessionNotFound)
    }

    /// Bind a sandbox and move the session to `Running`.
    ///
    /// Returns `false` without touching the record if the session is no
    /// longer `Pending` (an explicit cleanup won the race).
    pub async fn set_running(
        &self,
        id: SessionId,
        sandbox: SandboxHandle,
    ) -> Result<bool, SessionNotFound> {
        let record = self.record(id).await?;
        let mut record = record.lock().await;
        if record.state != SessionState::Pending {
            return Ok(false);
        }
        record.state = SessionState::Running;
        record.sandbox = Some(sandbox);
        Ok(true)
    }

    /// Append an output chunk. Ignored once the session is terminal, so a
    /// poller's view of the output is monotonically append-only.
    pub async fn append_output(&self, id: SessionId, chunk: &str) -> Result<(), SessionNotFound> {
        let record = self.record(id).await?;
        let mut record = record.lock().await;
        if !record.state.is_terminal() {
            record.output.push_str(chunk);
        }
        Ok(())
    }

    /// Commit a terminal outcome for a running session.
    ///
    /// `Failed` is additionally reachable from `Pending` (acquisition
    /// retries exhausted before a sandbox was ever bound). Returns `false`
    /// if the session was already terminal; the caller's outcome is then
    /// discarded.
    pub async fn complete(&self, id: SessionId, outcome: Outcome) -> Result<bool, SessionNotFound> {
        let record = self.record(id).await?;
        let mut record = record.lock().await;
        let allowed = match outcome {
            Outcome::Completed => record.state == SessionState::Running,
            Outcome::Failed => {
                matches!(record.state, SessionState::Pending | SessionState::Running)
            }
        };
        if !allowed {
            return Ok(false);
        }
        record.state = match outcome {
            Outcome::Completed => SessionState::Completed,
            Outcome::Failed => SessionState::Failed,
        };
        Ok(true)
    }

    /// Transition to `CleanedUp` from any earlier state, bypassing
    /// `Completed`/`Failed` when invoked on a running session.
    ///
    /// Surrenders the sandbox bound at commit time so the caller can
    /// force-stop it; the handle read here, under the record lock, cannot
    /// miss a binding that a stale earlier snapshot predates. Returns
    /// `Ok(None)` when nothing committed (already cleaned up) or no sandbox
    /// was ever bound.
    pub async fn mark_cleaned(
        &self,
        id: SessionId,
    ) -> Result<Option<SandboxHandle>, SessionNotFound> {
        let record = self.record(id).await?;
        let mut record = record.lock().await;
        if record.state == SessionState::CleanedUp {
            return Ok(None);
        }
        record.state = SessionState::CleanedUp;
        // Restart the purge window from the cleanup transition
        record.last_accessed = Instant::now();
        Ok(record.sandbox.take())
    }

    /// Snapshot a session and refresh its `last_accessed` timestamp.
    pub async fn get(&self, id: SessionId) -> Result<SessionView, SessionNotFound> {
        let record = self.record(id).await?;
        let mut record = record.lock().await;
        record.last_accessed = Instant::now();
        Ok(SessionView {
            id,
            state: record.state,
            sandbox: record.sandbox.clone(),
            output: record.output.clone(),
            created_at: record.created_at,
        })
    }

    /// Sessions sitting in `Completed`/`Failed` untouched for longer than
    /// `retention` — candidates for the reaper's cleanup transition.
    pub async fn expired_terminal(&self, retention: Duration) -> Vec<SessionId> {
        let records = self.records.read().await;
        let mut expired = Vec::new();
        for (id, record) in records.iter() {
            let record = record.lock().await;
            if matches!(record.state, SessionState::Completed | SessionState::Failed)
                && record.last_accessed.elapsed() > retention
            {
                expired.push(*id);
            }
        }
        expired
    }

    /// Drop `CleanedUp` records untouched for longer than `purge_after`.
    /// Bounds table memory while leaving a short audit window.
    pub async fn purge_cleaned(&self, purge_after: Duration) -> usize {
        let mut records = self.records.write().await;
        let mut doomed = Vec::new();
        for (id, record) in records.iter() {
            let record = record.lock().await;
            if record.state == SessionState::CleanedUp
                && record.last_accessed.elapsed() > purge_after
            {
                doomed.push(*id);
            }
        }
        for id in &doomed {
            records.remove(id);
        }
        doomed.len()
    }

    #[cfg(test)]
    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }
}
