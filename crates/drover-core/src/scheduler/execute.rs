//! Direct-mode execution task: runs one claimed ticket inside its VM slot
//! from agent spawn through the post-execution pipeline.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use sqlx::PgPool;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use uuid::Uuid;

use drover_db::models::{Ticket, FORGE_AGENT};
use drover_db::queries::{progress, tickets as ticket_db};

use crate::github::PrCreator;
use crate::pipeline;
use crate::retry::{classify, RetryPolicies};
use crate::state::{dispatch, StateError};
use crate::verify::Verifier;
use crate::vmpool::{VmPool, VmSlot};

/// Everything an execution task needs, cloned per dispatch.
pub struct ExecutionContext {
    pub pool: PgPool,
    pub vm_pool: Arc<dyn VmPool>,
    pub verifier: Arc<dyn Verifier>,
    pub pr_creator: Arc<dyn PrCreator>,
    pub policies: RetryPolicies,
    pub lease_secs: f64,
    pub ticket_timeout: Duration,
    pub agent_command: Option<String>,
}

/// Completion message sent back to the scheduler loop.
pub struct ExecutionDone {
    pub ticket_id: Uuid,
    pub vm_id: String,
}

/// Run one ticket to a settled state, then report back.
///
/// Every exit path sends [`ExecutionDone`] so the scheduler's active map
/// and the VM slot are reclaimed even when the ticket errored.
pub async fn execute_ticket(
    ctx: ExecutionContext,
    ticket: Ticket,
    slot: VmSlot,
    done_tx: mpsc::Sender<ExecutionDone>,
) {
    let ticket_id = ticket.id;
    let vm_id = slot.id.clone();

    if let Err(e) = run(&ctx, ticket, &slot).await {
        tracing::error!(ticket_id = %ticket_id, error = %e, "execution task failed");
    }

    let _ = done_tx
        .send(ExecutionDone {
            ticket_id,
            vm_id,
        })
        .await;
}

async fn run(ctx: &ExecutionContext, ticket: Ticket, slot: &VmSlot) -> anyhow::Result<()> {
    let ticket_id = ticket.id;

    let Some(agent_command) = ctx.agent_command.clone() else {
        // Operator error: a direct ticket with no agent to run it.
        // Parked for human intervention rather than thrashing the queue.
        tracing::error!(ticket_id = %ticket_id, "no direct-dispatch agent command configured");
        swallow_conflict(
            dispatch::hold_ticket(
                &ctx.pool,
                ticket_id,
                "no direct-dispatch agent command configured",
                "engine misconfiguration: agent_command unset",
                serde_json::Value::Null,
            )
            .await,
        )?;
        return Ok(());
    };

    // Keep the lease warm while the agent runs. The guard on agent
    // identity means a reaped ticket stops accepting beats.
    let beat_pool = ctx.pool.clone();
    let beat_secs = ctx.lease_secs;
    let heartbeat = tokio::spawn(async move {
        let interval = Duration::from_secs_f64((beat_secs / 3.0).max(1.0));
        loop {
            tokio::time::sleep(interval).await;
            match ticket_db::heartbeat(&beat_pool, ticket_id, FORGE_AGENT, beat_secs).await {
                Ok(true) => {}
                Ok(false) => {
                    tracing::warn!(ticket_id = %ticket_id, "heartbeat rejected, lease lost");
                    break;
                }
                Err(e) => {
                    tracing::warn!(ticket_id = %ticket_id, error = %e, "heartbeat failed");
                }
            }
        }
    });

    let outcome = run_agent(ctx, &ticket, slot, &agent_command).await;
    heartbeat.abort();

    match outcome {
        AgentOutcome::Succeeded => {
            let branch = ticket
                .branch_name
                .clone()
                .unwrap_or_else(|| format!("drover/{}", short_id(ticket_id)));
            swallow_conflict(
                dispatch::complete_to_verifying(&ctx.pool, ticket_id, Some(&branch), None).await,
            )?;
            if let Err(e) = pipeline::run_post_execution(
                &ctx.pool,
                ctx.verifier.as_ref(),
                ctx.pr_creator.as_ref(),
                ticket_id,
            )
            .await
            {
                tracing::error!(ticket_id = %ticket_id, error = %e, "post-execution pipeline failed");
            }
        }
        AgentOutcome::Failed { error } => {
            fail_ticket(ctx, &ticket, &error).await?;
        }
        AgentOutcome::TimedOut => {
            tracing::warn!(ticket_id = %ticket_id, "agent exceeded ticket timeout");
            let _ = ctx.vm_pool.kill(&slot.id).await;
            let error = format!(
                "agent timed out after {}s of wall time",
                ctx.ticket_timeout.as_secs()
            );
            fail_ticket(ctx, &ticket, &error).await?;
        }
    }

    Ok(())
}

enum AgentOutcome {
    Succeeded,
    Failed { error: String },
    TimedOut,
}

/// Spawn the agent command in the slot workspace and stream its stdout
/// into the progress log.
async fn run_agent(
    ctx: &ExecutionContext,
    ticket: &Ticket,
    slot: &VmSlot,
    agent_command: &str,
) -> AgentOutcome {
    let mut command = Command::new("sh");
    command
        .arg("-c")
        .arg(agent_command)
        .env("DROVER_TICKET_ID", ticket.id.to_string())
        .env("DROVER_TICKET_TITLE", &ticket.title)
        .env("DROVER_VM_ID", &slot.id)
        .env(
            "DROVER_BRANCH",
            ticket
                .branch_name
                .clone()
                .unwrap_or_else(|| format!("drover/{}", short_id(ticket.id))),
        )
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(workdir) = &slot.workdir {
        command.current_dir(workdir);
    }

    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(e) => {
            return AgentOutcome::Failed {
                error: format!("failed to spawn agent: {e}"),
            };
        }
    };

    if let Some(pid) = child.id() {
        ctx.vm_pool.register_pid(&slot.id, pid);
    }

    // Stream stdout lines into the progress trace, best-effort.
    let stdout = child.stdout.take();
    let progress_pool = ctx.pool.clone();
    let ticket_id = ticket.id;
    let progress_task = tokio::spawn(async move {
        let Some(stdout) = stdout else { return };
        let mut lines = BufReader::new(stdout).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if line.trim().is_empty() {
                continue;
            }
            if let Err(e) = progress::append(&progress_pool, ticket_id, FORGE_AGENT, &line).await {
                tracing::debug!(ticket_id = %ticket_id, error = %e, "progress append failed");
            }
        }
    });

    let stderr = child.stderr.take();

    let result = tokio::time::timeout(ctx.ticket_timeout, child.wait()).await;
    progress_task.abort();

    match result {
        Ok(Ok(status)) if status.success() => AgentOutcome::Succeeded,
        Ok(Ok(status)) => {
            let mut error = format!("agent exited with {status}");
            if let Some(stderr) = stderr {
                let mut tail = String::new();
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tail.push_str(&line);
                    tail.push('\n');
                    if tail.len() > 4096 {
                        break;
                    }
                }
                if !tail.trim().is_empty() {
                    error.push_str(": ");
                    error.push_str(tail.trim());
                }
            }
            AgentOutcome::Failed { error }
        }
        Ok(Err(e)) => AgentOutcome::Failed {
            error: format!("failed to await agent: {e}"),
        },
        Err(_elapsed) => AgentOutcome::TimedOut,
    }
}

/// Classify a failure and route the ticket through the normal failure
/// path: retriable back to `ready`, otherwise to `on_hold`.
async fn fail_ticket(ctx: &ExecutionContext, ticket: &Ticket, error: &str) -> anyhow::Result<()> {
    // The failure being recorded counts toward the budget.
    let decision = classify(&ctx.policies, error, ticket.retry_count as u32 + 1);
    let strategy = serde_json::to_value(&decision)?;

    tracing::info!(
        ticket_id = %ticket.id,
        category = decision.category.as_str(),
        should_retry = decision.should_retry,
        "classifying execution failure"
    );

    let result = if decision.should_retry {
        dispatch::fail_retriable_to_ready(&ctx.pool, ticket.id, error, strategy).await
    } else {
        dispatch::hold_ticket(
            &ctx.pool,
            ticket.id,
            decision.category.as_str(),
            error,
            strategy,
        )
        .await
    };
    swallow_conflict(result)
}

/// A guard conflict here means the reaper or a terminate beat this task
/// to the row; the world already moved on, so log and stand down.
fn swallow_conflict(result: Result<(), StateError>) -> anyhow::Result<()> {
    match result {
        Ok(()) => Ok(()),
        Err(StateError::Conflict {
            ticket_id, current, ..
        }) => {
            tracing::warn!(
                ticket_id = %ticket_id,
                current = %current,
                "transition lost to a concurrent writer"
            );
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

fn short_id(id: Uuid) -> String {
    id.simple().to_string()[..8].to_owned()
}
