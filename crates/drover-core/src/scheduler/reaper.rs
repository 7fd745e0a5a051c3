//! Background watchdogs: the lease reaper and the dependency-unblock
//! sweep.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use sqlx::PgPool;
use tokio_util::sync::CancellationToken;

use drover_db::queries::artifacts::{self, NewArtifact};
use drover_db::queries::tickets as ticket_db;

use crate::vmpool::VmPool;

use super::EngineShared;

/// Scan for expired leases and return their tickets to `ready`.
///
/// Equivalent to a `release` with reason "lease expired": the slot is
/// killed, the row is rebound to the forge agent, and a reap artifact
/// records what happened for the operator.
pub async fn run_reaper(
    pool: PgPool,
    vm_pool: Arc<dyn VmPool>,
    shared: Arc<EngineShared>,
    interval: Duration,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = cancel.cancelled() => return,
        }

        let reaped = match ticket_db::release_expired_leases(&pool).await {
            Ok(reaped) => reaped,
            Err(e) => {
                tracing::warn!(error = %e, "lease reap scan failed");
                continue;
            }
        };

        for lease in &reaped {
            tracing::warn!(
                ticket_id = %lease.ticket_id,
                vm_id = ?lease.vm_id,
                agent_id = ?lease.assignee_id,
                last_heartbeat = ?lease.last_heartbeat,
                "lease expired, ticket reaped back to ready"
            );

            if let Some(vm_id) = &lease.vm_id {
                if let Err(e) = vm_pool.kill(vm_id).await {
                    tracing::warn!(vm_id = %vm_id, error = %e, "failed to kill reaped slot");
                }
            }

            let artifact = NewArtifact {
                ticket_id: lease.ticket_id,
                attempt: 0,
                kind: "lease_reaped".to_owned(),
                content: serde_json::json!({
                    "vm_id": lease.vm_id,
                    "agent_id": lease.assignee_id,
                    "last_heartbeat": lease.last_heartbeat,
                }),
            };
            if let Err(e) = artifacts::insert_artifact(&pool, &artifact).await {
                tracing::debug!(
                    ticket_id = %lease.ticket_id,
                    error = %e,
                    "failed to record reap artifact (best-effort)"
                );
            }

            shared.reaped_total.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Periodically release `blocked` tickets whose dependencies are all
/// `done`.
///
/// The sweep is a single guarded UPDATE, so running it concurrently with
/// scheduling (or with a second sweep) is safe and idempotent.
pub async fn run_unblock_sweep(pool: PgPool, interval: Duration, cancel: CancellationToken) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = cancel.cancelled() => return,
        }

        match ticket_db::unblock_ready_dependents(&pool).await {
            Ok(0) => {}
            Ok(n) => tracing::info!(unblocked = n, "dependency sweep released tickets"),
            Err(e) => tracing::warn!(error = %e, "dependency sweep failed"),
        }
    }
}
