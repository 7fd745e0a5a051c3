//! Database query functions for the append-only `ticket_artifacts` stream.

use anyhow::{Context, Result};
use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::TicketArtifact;

/// Parameters for inserting a new artifact row.
#[derive(Debug, Clone)]
pub struct NewArtifact {
    pub ticket_id: Uuid,
    pub attempt: i32,
    pub kind: String,
    pub content: Value,
}

/// Insert a new artifact row. Returns the inserted row with
/// server-generated defaults (id, recorded_at).
pub async fn insert_artifact(pool: &PgPool, new: &NewArtifact) -> Result<TicketArtifact> {
    let artifact = sqlx::query_as::<_, TicketArtifact>(
        "INSERT INTO ticket_artifacts (ticket_id, attempt, kind, content) \
         VALUES ($1, $2, $3, $4) \
         RETURNING *",
    )
    .bind(new.ticket_id)
    .bind(new.attempt)
    .bind(&new.kind)
    .bind(&new.content)
    .fetch_one(pool)
    .await
    .with_context(|| {
        format!(
            "failed to insert artifact for ticket {} attempt {} kind {}",
            new.ticket_id, new.attempt, new.kind
        )
    })?;

    Ok(artifact)
}

/// Get all artifacts for a ticket across all attempts, ordered by attempt
/// then recording time.
pub async fn list_for_ticket(pool: &PgPool, ticket_id: Uuid) -> Result<Vec<TicketArtifact>> {
    let artifacts = sqlx::query_as::<_, TicketArtifact>(
        "SELECT * FROM ticket_artifacts \
         WHERE ticket_id = $1 \
         ORDER BY attempt ASC, recorded_at ASC",
    )
    .bind(ticket_id)
    .fetch_all(pool)
    .await
    .with_context(|| format!("failed to list artifacts for ticket {ticket_id}"))?;

    Ok(artifacts)
}

/// Get the artifacts of one kind for a given ticket and attempt.
pub async fn list_for_attempt(
    pool: &PgPool,
    ticket_id: Uuid,
    attempt: i32,
    kind: &str,
) -> Result<Vec<TicketArtifact>> {
    let artifacts = sqlx::query_as::<_, TicketArtifact>(
        "SELECT * FROM ticket_artifacts \
         WHERE ticket_id = $1 AND attempt = $2 AND kind = $3 \
         ORDER BY recorded_at ASC",
    )
    .bind(ticket_id)
    .bind(attempt)
    .bind(kind)
    .fetch_all(pool)
    .await
    .with_context(|| {
        format!("failed to list {kind} artifacts for ticket {ticket_id} attempt {attempt}")
    })?;

    Ok(artifacts)
}
