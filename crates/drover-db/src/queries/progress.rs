//! Database query functions for the append-only `progress_log` stream.

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::ProgressEntry;

/// Append a progress message for a ticket.
pub async fn append(
    pool: &PgPool,
    ticket_id: Uuid,
    agent_id: &str,
    message: &str,
) -> Result<ProgressEntry> {
    let entry = sqlx::query_as::<_, ProgressEntry>(
        "INSERT INTO progress_log (ticket_id, agent_id, message) \
         VALUES ($1, $2, $3) \
         RETURNING *",
    )
    .bind(ticket_id)
    .bind(agent_id)
    .bind(message)
    .fetch_one(pool)
    .await
    .with_context(|| format!("failed to append progress for ticket {ticket_id}"))?;

    Ok(entry)
}

/// Get the progress trace for a ticket, oldest first.
pub async fn list_for_ticket(pool: &PgPool, ticket_id: Uuid) -> Result<Vec<ProgressEntry>> {
    let entries = sqlx::query_as::<_, ProgressEntry>(
        "SELECT * FROM progress_log \
         WHERE ticket_id = $1 \
         ORDER BY recorded_at ASC, id ASC",
    )
    .bind(ticket_id)
    .fetch_all(pool)
    .await
    .with_context(|| format!("failed to list progress for ticket {ticket_id}"))?;

    Ok(entries)
}

/// Count progress entries for a ticket.
pub async fn count_for_ticket(pool: &PgPool, ticket_id: Uuid) -> Result<i64> {
    let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM progress_log WHERE ticket_id = $1")
        .bind(ticket_id)
        .fetch_one(pool)
        .await
        .with_context(|| format!("failed to count progress for ticket {ticket_id}"))?;

    Ok(row.0)
}
