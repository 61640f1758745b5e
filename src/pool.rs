//! Prewarm pool: warm idle sandboxes created ahead of demand.
//!
//! The pool keeps up to `target_size` started sandboxes ready so a
//! submission does not pay container-start latency. Sandboxes are strictly
//! single-use: once released they are retired and never handed out again,
//! since they have run arbitrary untrusted code. The registry also tracks
//! reserved/executing sandboxes (including on-demand ones adopted by the
//! executor) so the reaper can spot leaked ones.
//!
//! The registry sits behind one short-lived mutex; engine calls for
//! replenishment always happen outside the critical section.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::runtime::{ResourceLimits, SandboxHandle, SandboxRuntime};

/// Pool-visible state of one sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolState {
    WarmIdle,
    Reserved,
    Executing,
}

#[derive(Debug)]
struct Entry {
    handle: SandboxHandle,
    state: PoolState,
    /// When the sandbox entered its current state; drives the stale scan.
    since: Instant,
}

#[derive(Default)]
struct Registry {
    entries: HashMap<String, Entry>,
    /// Creations in flight, counted so concurrent replenish passes do not
    /// overshoot the target.
    creating: usize,
}

impl Registry {
    fn warm_count(&self) -> usize {
        self.entries
            .values()
            .filter(|e| e.state == PoolState::WarmIdle)
            .count()
    }
}

/// Maintains the supply of warm idle sandboxes.
pub struct PrewarmPool {
    runtime: Arc<dyn SandboxRuntime>,
    limits: ResourceLimits,
    target_size: usize,
    registry: Mutex<Registry>,
}

impl PrewarmPool {
    pub fn new(
        runtime: Arc<dyn SandboxRuntime>,
        limits: ResourceLimits,
        target_size: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            runtime,
            limits,
            target_size,
            registry: Mutex::new(Registry::default()),
        })
    }

    /// Non-blocking attempt to take one warm sandbox, reserving it for the
    /// caller. Kicks off background replenishment for the vacated slot.
    pub fn acquire(self: &Arc<Self>) -> Option<SandboxHandle> {
        let taken = {
            let mut registry = self.registry.lock().unwrap();
            let id = registry
                .entries
                .values()
                .find(|e| e.state == PoolState::WarmIdle)
                .map(|e| e.handle.id.clone())?;
            let entry = registry.entries.get_mut(&id).unwrap();
            entry.state = PoolState::Reserved;
            entry.since = Instant::now();
            entry.handle.clone()
        };
        debug!(sandbox = %taken, "Acquired warm sandbox");
        self.spawn_replenish();
        Some(taken)
    }

    /// Track an on-demand sandbox the executor created itself (pool was
    /// empty), so the stale scan covers it too.
    pub fn adopt(&self, handle: &SandboxHandle) {
        let mut registry = self.registry.lock().unwrap();
        registry.entries.insert(
            handle.id.clone(),
            Entry {
                handle: handle.clone(),
                state: PoolState::Reserved,
                since: Instant::now(),
            },
        );
    }

    /// Mark a reserved sandbox as executing a session's payload.
    pub fn mark_executing(&self, handle: &SandboxHandle) {
        let mut registry = self.registry.lock().unwrap();
        if let Some(entry) = registry.entries.get_mut(&handle.id) {
            entry.state = PoolState::Executing;
            entry.since = Instant::now();
        }
    }

    /// Retire a sandbox. It leaves the registry for good; a subsequent
    /// `acquire` can only ever return a fresh replacement.
    pub fn release(&self, handle: &SandboxHandle) {
        let mut registry = self.registry.lock().unwrap();
        if registry.entries.remove(&handle.id).is_some() {
            debug!(sandbox = %handle, "Retired sandbox");
        }
    }

    /// Top the pool back up to `target_size`, creating and starting new
    /// sandboxes outside the registry lock. Returns how many creations
    /// this pass kicked off (zero when already at target).
    pub async fn replenish(self: &Arc<Self>) -> usize {
        let deficit = {
            let mut registry = self.registry.lock().unwrap();
            let available = registry.warm_count() + registry.creating;
            let deficit = self.target_size.saturating_sub(available);
            registry.creating += deficit;
            deficit
        };

        for _ in 0..deficit {
            match self.create_warm().await {
                Ok(handle) => {
                    let mut registry = self.registry.lock().unwrap();
                    registry.creating -= 1;
                    registry.entries.insert(
                        handle.id.clone(),
                        Entry {
                            handle: handle.clone(),
                            state: PoolState::WarmIdle,
                            since: Instant::now(),
                        },
                    );
                    info!(sandbox = %handle, "Prewarmed sandbox ready");
                }
                Err(e) => {
                    self.registry.lock().unwrap().creating -= 1;
                    warn!(error = %e, "Failed to prewarm sandbox");
                }
            }
        }
        deficit
    }

    /// Fire-and-forget replenishment, so pool maintenance never blocks a
    /// submission.
    pub fn spawn_replenish(self: &Arc<Self>) {
        let pool = Arc::clone(self);
        tokio::spawn(async move {
            pool.replenish().await;
        });
    }

    async fn create_warm(&self) -> Result<SandboxHandle, crate::error::RuntimeError> {
        let handle = self.runtime.create(&self.limits).await?;
        if let Err(e) = self.runtime.start(&handle).await {
            // Half-built sandbox; best effort removal before reporting
            let _ = self.runtime.remove(&handle).await;
            return Err(e);
        }
        Ok(handle)
    }

    /// Sandboxes stuck reserved or executing beyond `timeout`. The reaper
    /// force-retires these to defend against executor crashes.
    pub fn stale_busy(&self, timeout: Duration) -> Vec<SandboxHandle> {
        let registry = self.registry.lock().unwrap();
        registry
            .entries
            .values()
            .filter(|e| e.state != PoolState::WarmIdle && e.since.elapsed() > timeout)
            .map(|e| e.handle.clone())
            .collect()
    }

    /// Number of warm idle sandboxes currently available.
    pub fn warm_count(&self) -> usize {
        self.registry.lock().unwrap().warm_count()
    }

    /// Empty the registry and return every handle, for shutdown teardown.
    pub fn drain(&self) -> Vec<SandboxHandle> {
        let mut registry = self.registry.lock().unwrap();
        registry
            .entries
            .drain()
            .map(|(_, entry)| entry.handle)
            .collect()
    }
}
