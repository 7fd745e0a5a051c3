//! The `drover ticket` subcommands: inspection and the human
//! intervention paths (cancel, resume, replay, approve).

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use drover_core::state::dispatch;
use drover_db::queries::{artifacts, progress, tickets};

fn parse_id(ticket_id: &str) -> Result<Uuid> {
    ticket_id
        .parse()
        .with_context(|| format!("invalid ticket id: {ticket_id:?}"))
}

pub async fn show(pool: &PgPool, ticket_id: &str) -> Result<()> {
    let id = parse_id(ticket_id)?;
    let ticket = tickets::get_ticket(pool, id)
        .await?
        .with_context(|| format!("ticket {id} not found"))?;

    println!("ticket {}", ticket.id);
    println!("  title        {}", ticket.title);
    println!("  state        {}", ticket.state);
    println!("  size         {}", ticket.size);
    println!("  mode         {}", ticket.execution_mode);
    println!("  project      {}", ticket.project_id);
    println!("  assignee     {}", ticket.assignee_id.as_deref().unwrap_or("-"));
    println!("  vm           {}", ticket.vm_id.as_deref().unwrap_or("-"));
    println!("  branch       {}", ticket.branch_name.as_deref().unwrap_or("-"));
    println!("  pr           {}", ticket.pr_url.as_deref().unwrap_or("-"));
    println!("  retries      {}", ticket.retry_count);
    println!("  rejections   {}", ticket.rejection_count);
    if let Some(reason) = &ticket.hold_reason {
        println!("  hold reason  {reason}");
    }
    if let Some(error) = &ticket.error {
        println!("  last error   {error}");
    }
    if let Some(lease) = ticket.lease_expires {
        println!("  lease until  {}", lease.format("%Y-%m-%d %H:%M:%S"));
    }

    let deps = tickets::get_dependencies(pool, id).await?;
    if !deps.is_empty() {
        println!("  depends on:");
        for dep_id in &deps {
            match tickets::get_ticket(pool, *dep_id).await? {
                Some(dep) => println!("    {}  {}  {}", dep.id, dep.state, dep.title),
                None => println!("    {dep_id}  (missing)"),
            }
        }
    }

    let artifacts = artifacts::list_for_ticket(pool, id).await?;
    if !artifacts.is_empty() {
        println!("  artifacts:");
        for artifact in &artifacts {
            println!(
                "    attempt {} {:<24} {}",
                artifact.attempt,
                artifact.kind,
                artifact.recorded_at.format("%Y-%m-%d %H:%M:%S"),
            );
        }
    }

    let trace = progress::list_for_ticket(pool, id).await?;
    if !trace.is_empty() {
        println!("  progress ({} entries, last 5):", trace.len());
        for entry in trace.iter().rev().take(5).rev() {
            println!(
                "    {} [{}] {}",
                entry.recorded_at.format("%H:%M:%S"),
                entry.agent_id,
                entry.message,
            );
        }
    }
    Ok(())
}

pub async fn cancel(pool: &PgPool, ticket_id: &str) -> Result<()> {
    let id = parse_id(ticket_id)?;
    dispatch::cancel_ticket(pool, id).await?;
    println!("ticket {id} cancelled");
    Ok(())
}

pub async fn resume(pool: &PgPool, ticket_id: &str) -> Result<()> {
    let id = parse_id(ticket_id)?;
    dispatch::resume_ticket(pool, id).await?;
    println!("ticket {id} resumed to ready");
    Ok(())
}

pub async fn replay(pool: &PgPool, ticket_id: &str) -> Result<()> {
    let id = parse_id(ticket_id)?;
    dispatch::replay_ticket(pool, id).await?;
    println!("ticket {id} routed back to ready for another attempt");
    Ok(())
}

pub async fn approve(pool: &PgPool, ticket_id: &str) -> Result<()> {
    let id = parse_id(ticket_id)?;
    dispatch::approve_ticket(pool, id).await?;
    println!("ticket {id} approved and done");
    Ok(())
}
