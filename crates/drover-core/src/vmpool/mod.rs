//! VM pool abstraction.
//!
//! The scheduler treats execution environments as opaque slots with a max
//! concurrency; whether a slot is a micro-VM, a container, or a sandboxed
//! process is the backend's business. Backends implement [`VmPool`] so
//! tests can substitute [`NullVmPool`].

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use uuid::Uuid;

use drover_db::models::Ticket;

/// An acquired execution slot.
#[derive(Debug, Clone)]
pub struct VmSlot {
    /// Opaque slot identifier, recorded as the ticket's `vm_id`.
    pub id: String,
    /// Scratch workspace for the slot, when the backend has one.
    pub workdir: Option<PathBuf>,
}

/// Result of a health probe. Never called on the hot path.
#[derive(Debug, Clone)]
pub struct SlotHealth {
    pub alive: bool,
    pub ip: Option<String>,
}

/// Trait for execution-slot backends.
#[async_trait]
pub trait VmPool: Send + Sync {
    /// Human-readable name of the backend (e.g. "process", "null").
    fn name(&self) -> &str;

    /// Obtain a slot for a ticket. Blocks up to the backend's bounded
    /// wait; returns `None` when capacity is exhausted (the scheduler
    /// backs off).
    async fn acquire(&self, ticket: &Ticket) -> Result<Option<VmSlot>>;

    /// Return a slot to the pool. Idempotent; every code path that
    /// acquired must release.
    async fn release(&self, slot_id: &str) -> Result<()>;

    /// Forcefully terminate whatever is running in the slot. Used by the
    /// lease reaper and explicit terminate.
    async fn kill(&self, slot_id: &str) -> Result<()>;

    /// Probe a slot.
    async fn health(&self, slot_id: &str) -> Result<SlotHealth>;

    /// Record the PID of the process occupying a slot, for backends whose
    /// `kill` signals a process. Default: no-op.
    fn register_pid(&self, _slot_id: &str, _pid: u32) {}
}

// Compile-time assertion: VmPool must be object-safe.
const _: () = {
    fn _assert_object_safe(_: &dyn VmPool) {}
};

// ---------------------------------------------------------------------------
// Process-backed pool
// ---------------------------------------------------------------------------

/// Book-keeping for one live process slot.
struct ProcessSlot {
    _permit: OwnedSemaphorePermit,
    workdir: PathBuf,
    /// PID of the agent process, once the runner registers it.
    pid: Option<u32>,
}

/// A bounded pool of sandboxed-process slots.
///
/// Each slot is a scratch directory plus a concurrency permit; the direct
/// runner registers the spawned agent's PID so `kill` can reach it.
pub struct ProcessVmPool {
    base_dir: PathBuf,
    semaphore: Arc<Semaphore>,
    acquire_timeout: Duration,
    slots: Mutex<HashMap<String, ProcessSlot>>,
}

impl ProcessVmPool {
    pub fn new(base_dir: impl Into<PathBuf>, capacity: usize, acquire_timeout: Duration) -> Self {
        Self {
            base_dir: base_dir.into(),
            semaphore: Arc::new(Semaphore::new(capacity)),
            acquire_timeout,
            slots: Mutex::new(HashMap::new()),
        }
    }

    fn take_slot(&self, slot_id: &str) -> Option<ProcessSlot> {
        self.slots
            .lock()
            .expect("vm pool lock poisoned")
            .remove(slot_id)
    }
}

#[async_trait]
impl VmPool for ProcessVmPool {
    fn name(&self) -> &str {
        "process"
    }

    async fn acquire(&self, ticket: &Ticket) -> Result<Option<VmSlot>> {
        let permit = match tokio::time::timeout(
            self.acquire_timeout,
            Arc::clone(&self.semaphore).acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_closed)) => bail!("vm pool semaphore closed"),
            Err(_elapsed) => return Ok(None),
        };

        let slot_id = format!("vm-{}", Uuid::new_v4().simple());
        let workdir = self.base_dir.join(&slot_id);
        tokio::fs::create_dir_all(&workdir)
            .await
            .with_context(|| {
                format!(
                    "failed to create slot workdir {} for ticket {}",
                    workdir.display(),
                    ticket.id
                )
            })?;

        let slot = VmSlot {
            id: slot_id.clone(),
            workdir: Some(workdir.clone()),
        };

        self.slots.lock().expect("vm pool lock poisoned").insert(
            slot_id,
            ProcessSlot {
                _permit: permit,
                workdir,
                pid: None,
            },
        );

        Ok(Some(slot))
    }

    async fn release(&self, slot_id: &str) -> Result<()> {
        // Idempotent: a second release finds nothing and does nothing.
        if let Some(slot) = self.take_slot(slot_id) {
            if let Err(e) = tokio::fs::remove_dir_all(&slot.workdir).await {
                tracing::warn!(
                    slot_id = %slot_id,
                    error = %e,
                    "failed to remove slot workdir"
                );
            }
        }
        Ok(())
    }

    async fn kill(&self, slot_id: &str) -> Result<()> {
        let pid = {
            let slots = self.slots.lock().expect("vm pool lock poisoned");
            slots.get(slot_id).and_then(|s| s.pid)
        };

        #[cfg(unix)]
        if let Some(pid) = pid {
            // SIGKILL: the reaper only reaches here after the lease
            // already expired, the process had its grace period.
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGKILL);
            }
        }
        #[cfg(not(unix))]
        let _ = pid;

        self.release(slot_id).await
    }

    async fn health(&self, slot_id: &str) -> Result<SlotHealth> {
        let slots = self.slots.lock().expect("vm pool lock poisoned");
        let alive = slots.contains_key(slot_id);
        Ok(SlotHealth { alive, ip: None })
    }

    fn register_pid(&self, slot_id: &str, pid: u32) {
        let mut slots = self.slots.lock().expect("vm pool lock poisoned");
        if let Some(slot) = slots.get_mut(slot_id) {
            slot.pid = Some(pid);
        }
    }
}

// ---------------------------------------------------------------------------
// Null pool (tests, pull-only deployments)
// ---------------------------------------------------------------------------

/// A pool that hands out bare identifiers with no backing resources.
///
/// Capacity still applies, so scheduler backpressure is testable.
pub struct NullVmPool {
    semaphore: Arc<Semaphore>,
    permits: Mutex<HashMap<String, OwnedSemaphorePermit>>,
}

impl NullVmPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            permits: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl VmPool for NullVmPool {
    fn name(&self) -> &str {
        "null"
    }

    async fn acquire(&self, _ticket: &Ticket) -> Result<Option<VmSlot>> {
        let Ok(permit) = Arc::clone(&self.semaphore).try_acquire_owned() else {
            return Ok(None);
        };
        let slot_id = format!("vm-{}", Uuid::new_v4().simple());
        self.permits
            .lock()
            .expect("null pool lock poisoned")
            .insert(slot_id.clone(), permit);
        Ok(Some(VmSlot {
            id: slot_id,
            workdir: None,
        }))
    }

    async fn release(&self, slot_id: &str) -> Result<()> {
        self.permits
            .lock()
            .expect("null pool lock poisoned")
            .remove(slot_id);
        Ok(())
    }

    async fn kill(&self, slot_id: &str) -> Result<()> {
        self.release(slot_id).await
    }

    async fn health(&self, slot_id: &str) -> Result<SlotHealth> {
        let alive = self
            .permits
            .lock()
            .expect("null pool lock poisoned")
            .contains_key(slot_id);
        Ok(SlotHealth { alive, ip: None })
    }
}

/// Factory function: create a pool backend from a mode string.
pub fn create_vm_pool(
    mode: &str,
    base_dir: &std::path::Path,
    capacity: usize,
) -> Result<Arc<dyn VmPool>> {
    match mode {
        "process" => Ok(Arc::new(ProcessVmPool::new(
            base_dir,
            capacity,
            Duration::from_secs(30),
        ))),
        "null" => Ok(Arc::new(NullVmPool::new(capacity))),
        other => {
            bail!("unknown vm pool mode: {other:?} (expected \"process\" or \"null\")")
        }
    }
}
