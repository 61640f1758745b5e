//! Cleanup reaper: explicit and time-based resource reclamation.
//!
//! The explicit path is the only way to abort a running session: it
//! force-stops the bound sandbox and moves the session straight to
//! `CleanedUp`, bypassing `Completed`/`Failed`. The periodic sweep retires
//! idle terminal sessions, purges old cleaned-up records, and force-retires
//! sandboxes stuck reserved or executing past a hard bound (an executor
//! that died mid-run must not leak containers).

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::SessionNotFound;
use crate::pool::PrewarmPool;
use crate::runtime::{SandboxHandle, SandboxRuntime};
use crate::session::{SessionId, SessionTable};

pub struct CleanupReaper {
    runtime: Arc<dyn SandboxRuntime>,
    pool: Arc<PrewarmPool>,
    sessions: Arc<SessionTable>,
    interval: Duration,
    session_retention: Duration,
    purge_after: Duration,
    sandbox_busy_timeout: Duration,
}

impl CleanupReaper {
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
            interval: config.reaper_interval(),
            session_retention: config.session_retention(),
            purge_after: config.purge_after(),
            sandbox_busy_timeout: config.sandbox_busy_timeout(),
        })
    }

    /// Explicitly clean up one session, aborting it if still running.
    ///
    /// Races with an in-flight executor resolve through the session table:
    /// the cleanup commit surrenders whatever sandbox is bound at that
    /// instant, so a binding that lands just before the commit is still
    /// force-stopped, and one that lands just after makes the executor's
    /// `set_running` fail and retire the sandbox itself. Idempotent on
    /// already-cleaned sessions.
    pub async fn cleanup(&self, id: SessionId) -> Result<(), SessionNotFound> {
        let sandbox = self.sessions.mark_cleaned(id).await?;
        debug!(session = %id, bound = sandbox.is_some(), "Explicit cleanup requested");

        if let Some(sandbox) = sandbox {
            self.force_retire(&sandbox).await;
        }
        info!(session = %id, "Session cleaned up");
        Ok(())
    }

    /// One pass of time-based reclamation.
    pub async fn sweep(&self) {
        for id in self.sessions.expired_terminal(self.session_retention).await {
            if let Ok(sandbox) = self.sessions.mark_cleaned(id).await {
                info!(session = %id, "Reaped idle terminal session");
                // Normally retired by the executor already; stop/remove
                // tolerate a sandbox that is long gone.
                if let Some(sandbox) = sandbox {
                    self.force_retire(&sandbox).await;
                }
            }
        }

        let purged = self.sessions.purge_cleaned(self.purge_after).await;
        if purged > 0 {
            debug!(purged, "Purged cleaned-up session records");
        }

        for sandbox in self.pool.stale_busy(self.sandbox_busy_timeout) {
            warn!(sandbox = %sandbox, "Force-retiring sandbox stuck busy");
            self.force_retire(&sandbox).await;
        }
    }

    async fn force_retire(&self, sandbox: &SandboxHandle) {
        self.pool.release(sandbox);
        if let Err(e) = self.runtime.stop(sandbox).await {
            warn!(sandbox = %sandbox, error = %e, "Failed to stop sandbox");
        }
        if let Err(e) = self.runtime.remove(sandbox).await {
            warn!(sandbox = %sandbox, error = %e, "Failed to remove sandbox");
        }
    }

    /// Start the periodic sweep task.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let reaper = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(reaper.interval);
            ticker.tick().await; // First tick is immediate, skip it
            loop {
                ticker.tick().await;
                debug!("Reaper sweep");
                reaper.sweep().await;
            }
        })
    }
}
