//! Scheduler loop: adaptive poll, atomic claim, supervised dispatch,
//! graceful drain.
//!
//! Exactly one scheduler instance is active per deployment; internal
//! concurrency comes from fire-and-forget execution tasks tracked in the
//! in-memory `active` map, which is the authoritative view of how many
//! slots are in flight. The DB-level conditional claim is the safety net
//! if that assumption is ever violated.

pub mod execute;
pub mod reaper;

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use chrono::Utc;
use rand::Rng;
use sqlx::PgPool;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use drover_db::models::{Ticket, TicketState};
use drover_db::queries::tickets::{self as ticket_db, TransitionFields};

use crate::github::PrCreator;
use crate::retry::{RetryDecision, RetryPolicies};
use crate::verify::Verifier;
use crate::vmpool::VmPool;
use execute::{ExecutionContext, ExecutionDone};

/// Scheduler tunables.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Maximum tickets dispatched in parallel.
    pub max_concurrent: usize,
    /// Poll interval when work is flowing.
    pub base_poll: Duration,
    /// Cap for the adaptive backoff when polls come back empty.
    pub backoff_max: Duration,
    /// Lease window granted on claim and extended by heartbeats.
    pub lease_secs: f64,
    /// Wall-time limit for one direct-mode execution.
    pub ticket_timeout: Duration,
    /// How long a graceful shutdown waits for in-flight tasks.
    pub drain_timeout: Duration,
    /// Lease reaper scan interval.
    pub reaper_interval: Duration,
    /// Dependency-unblock sweep interval.
    pub sweep_interval: Duration,
    /// Command run inside the slot for direct-mode tickets.
    pub agent_command: Option<String>,
    /// Retry policy table applied to execution failures.
    pub policies: RetryPolicies,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 4,
            base_poll: Duration::from_secs(1),
            backoff_max: Duration::from_secs(30),
            lease_secs: 120.0,
            ticket_timeout: Duration::from_secs(300),
            drain_timeout: Duration::from_secs(10),
            reaper_interval: Duration::from_secs(10),
            sweep_interval: Duration::from_secs(15),
            agent_command: None,
            policies: RetryPolicies::default(),
        }
    }
}

/// One tracked in-flight execution.
pub struct ActiveExecution {
    pub vm_id: String,
    abort: AbortHandle,
}

/// State shared between the scheduler, the reaper, and the HTTP surface.
///
/// Confined to the single engine process; created at boot, drained on
/// shutdown, never serialized.
pub struct EngineShared {
    active: Mutex<HashMap<Uuid, ActiveExecution>>,
    pub reaped_total: AtomicU64,
    pub running: AtomicBool,
    pub started_at: Instant,
    pub max_concurrent: usize,
}

impl EngineShared {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            active: Mutex::new(HashMap::new()),
            reaped_total: AtomicU64::new(0),
            running: AtomicBool::new(false),
            started_at: Instant::now(),
            max_concurrent,
        }
    }

    pub fn active_count(&self) -> usize {
        self.active.lock().expect("active map lock poisoned").len()
    }

    fn insert(&self, ticket_id: Uuid, execution: ActiveExecution) {
        self.active
            .lock()
            .expect("active map lock poisoned")
            .insert(ticket_id, execution);
    }

    fn remove(&self, ticket_id: Uuid) -> Option<ActiveExecution> {
        self.active
            .lock()
            .expect("active map lock poisoned")
            .remove(&ticket_id)
    }

    fn drain_all(&self) -> Vec<(Uuid, ActiveExecution)> {
        self.active
            .lock()
            .expect("active map lock poisoned")
            .drain()
            .collect()
    }
}

/// The scheduler: polls the store for `ready` direct-mode tickets, claims
/// them atomically, and supervises their execution tasks.
pub struct Scheduler {
    pool: PgPool,
    vm_pool: Arc<dyn VmPool>,
    verifier: Arc<dyn Verifier>,
    pr_creator: Arc<dyn PrCreator>,
    config: SchedulerConfig,
    shared: Arc<EngineShared>,
}

impl Scheduler {
    pub fn new(
        pool: PgPool,
        vm_pool: Arc<dyn VmPool>,
        verifier: Arc<dyn Verifier>,
        pr_creator: Arc<dyn PrCreator>,
        config: SchedulerConfig,
        shared: Arc<EngineShared>,
    ) -> Self {
        Self {
            pool,
            vm_pool,
            verifier,
            pr_creator,
            config,
            shared,
        }
    }

    /// Run the scheduler loop until cancelled, then drain.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        self.shared.running.store(true, Ordering::SeqCst);
        let (done_tx, mut done_rx) = mpsc::channel::<ExecutionDone>(self.config.max_concurrent * 2);
        let mut poll = self.config.base_poll;

        loop {
            if cancel.is_cancelled() {
                self.drain(&mut done_rx).await;
                self.shared.running.store(false, Ordering::SeqCst);
                return Ok(());
            }

            // Settle completed executions before computing capacity.
            while let Ok(done) = done_rx.try_recv() {
                self.settle(done).await;
            }

            let active = self.shared.active_count();
            let capacity = self.config.max_concurrent.saturating_sub(active);
            if capacity == 0 {
                self.sleep_or_cancel(self.config.base_poll, &cancel).await;
                continue;
            }

            let candidates =
                match ticket_db::reserve_ready(&self.pool, capacity as i64, &[]).await {
                    Ok(candidates) => candidates,
                    Err(e) => {
                        // Storage unavailable: back off, never drop state.
                        tracing::warn!(error = %e, "reserve_ready failed, backing off");
                        poll = grow(poll, self.config.backoff_max);
                        self.sleep_or_cancel(poll, &cancel).await;
                        continue;
                    }
                };

            let mut claimed = 0usize;
            for ticket in candidates {
                if retry_delay_pending(&ticket) {
                    tracing::debug!(ticket_id = %ticket.id, "retry backoff pending, skipping");
                    continue;
                }

                let slot = match self.vm_pool.acquire(&ticket).await {
                    Ok(Some(slot)) => slot,
                    Ok(None) => {
                        tracing::debug!("vm pool capacity exhausted");
                        break;
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "vm acquire failed");
                        break;
                    }
                };

                match ticket_db::claim(&self.pool, ticket.id, &slot.id, self.config.lease_secs)
                    .await
                {
                    Ok(true) => {
                        claimed += 1;
                        self.spawn_execution(ticket, slot, done_tx.clone());
                    }
                    Ok(false) => {
                        // Another worker got it, or the row moved.
                        tracing::debug!(ticket_id = %ticket.id, "claim lost, skipping");
                        let _ = self.vm_pool.release(&slot.id).await;
                    }
                    Err(e) => {
                        tracing::warn!(ticket_id = %ticket.id, error = %e, "claim failed");
                        let _ = self.vm_pool.release(&slot.id).await;
                    }
                }
            }

            // Adaptive backoff: empty polls stretch the interval, any
            // claim resets it.
            poll = if claimed == 0 {
                grow(poll, self.config.backoff_max)
            } else {
                self.config.base_poll
            };

            self.sleep_or_cancel(jittered(poll), &cancel).await;
        }
    }

    fn spawn_execution(&self, ticket: Ticket, slot: crate::vmpool::VmSlot, tx: mpsc::Sender<ExecutionDone>) {
        let ticket_id = ticket.id;
        let vm_id = slot.id.clone();
        let ctx = ExecutionContext {
            pool: self.pool.clone(),
            vm_pool: Arc::clone(&self.vm_pool),
            verifier: Arc::clone(&self.verifier),
            pr_creator: Arc::clone(&self.pr_creator),
            policies: self.config.policies.clone(),
            lease_secs: self.config.lease_secs,
            ticket_timeout: self.config.ticket_timeout,
            agent_command: self.config.agent_command.clone(),
        };

        tracing::info!(ticket_id = %ticket_id, vm_id = %vm_id, "dispatching ticket");
        let handle = tokio::spawn(execute::execute_ticket(ctx, ticket, slot, tx));
        self.shared.insert(
            ticket_id,
            ActiveExecution {
                vm_id,
                abort: handle.abort_handle(),
            },
        );
    }

    /// Remove a finished execution from the map and return its slot.
    async fn settle(&self, done: ExecutionDone) {
        self.shared.remove(done.ticket_id);
        if let Err(e) = self.vm_pool.release(&done.vm_id).await {
            tracing::warn!(vm_id = %done.vm_id, error = %e, "slot release failed");
        }
    }

    /// Graceful shutdown: stop dispatching, wait up to `drain_timeout`
    /// for in-flight tasks, then abort the stragglers, force-release
    /// their slots, and write their tickets back to `ready`.
    async fn drain(&self, done_rx: &mut mpsc::Receiver<ExecutionDone>) {
        tracing::info!(
            in_flight = self.shared.active_count(),
            "scheduler cancelled, draining"
        );
        let deadline = tokio::time::Instant::now() + self.config.drain_timeout;
        while self.shared.active_count() > 0 {
            match tokio::time::timeout_at(deadline, done_rx.recv()).await {
                Ok(Some(done)) => self.settle(done).await,
                _ => break,
            }
        }

        let stragglers = self.shared.drain_all();
        if stragglers.is_empty() {
            return;
        }

        tracing::warn!(
            remaining = stragglers.len(),
            "drain timeout expired, force-releasing"
        );
        for (ticket_id, execution) in stragglers {
            execution.abort.abort();
            let _ = self.vm_pool.kill(&execution.vm_id).await;
            match ticket_db::transition(
                &self.pool,
                ticket_id,
                &[TicketState::Assigned, TicketState::InProgress],
                TicketState::Ready,
                &TransitionFields::back_to_ready(),
            )
            .await
            {
                Ok(true) => {
                    tracing::info!(ticket_id = %ticket_id, "in-flight ticket returned to ready")
                }
                Ok(false) => {
                    tracing::debug!(ticket_id = %ticket_id, "in-flight ticket already moved on")
                }
                Err(e) => {
                    tracing::warn!(ticket_id = %ticket_id, error = %e, "force-release failed")
                }
            }
        }
    }

    async fn sleep_or_cancel(&self, duration: Duration, cancel: &CancellationToken) {
        tokio::select! {
            _ = tokio::time::sleep(duration) => {}
            _ = cancel.cancelled() => {}
        }
    }
}

/// Multiply a poll interval by 1.5, capped.
fn grow(poll: Duration, cap: Duration) -> Duration {
    poll.mul_f64(1.5).min(cap)
}

/// Add up to 10% random jitter so restarted fleets do not poll in phase.
fn jittered(poll: Duration) -> Duration {
    let jitter = rand::rng().random_range(0.0..0.1);
    poll.mul_f64(1.0 + jitter)
}

/// Whether the ticket's advisory retry delay has not yet elapsed.
///
/// `updated_at` was stamped by the failure transition that wrote the
/// strategy, so `updated_at + next_delay_ms` is the earliest dispatch
/// time.
fn retry_delay_pending(ticket: &Ticket) -> bool {
    let Some(strategy) = &ticket.retry_strategy else {
        return false;
    };
    let Ok(decision) = serde_json::from_value::<RetryDecision>(strategy.clone()) else {
        return false;
    };
    if decision.next_delay_ms == 0 {
        return false;
    }
    let earliest =
        ticket.updated_at + chrono::Duration::milliseconds(decision.next_delay_ms as i64);
    Utc::now() < earliest
}
