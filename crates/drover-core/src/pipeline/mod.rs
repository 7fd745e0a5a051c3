//! Post-execution pipeline: verification, PR creation, and the
//! `in_review` handoff for tickets an agent has just completed.
//!
//! Invoked after a ticket reaches `verifying`. A ticket that carries a
//! successful code push never loses it here: every verifier or
//! PR-creation failure is recorded as an artifact and the ticket parks in
//! `needs_review`, a deliberate non-terminal re-entry point.

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use drover_db::models::{Project, Ticket, TicketState};
use drover_db::queries::artifacts::{self, NewArtifact};
use drover_db::queries::{projects, tickets as ticket_db};

use crate::github::{PrCreator, PrRequest};
use crate::state::dispatch;
use crate::verify::{VerificationRequest, Verifier, DEFAULT_PHASES};

/// Verification attempts before a ticket stops being replayable.
pub const MAX_ATTEMPTS: i32 = 3;

/// Where the pipeline left the ticket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineOutcome {
    /// Verification passed and a PR was opened; ticket is `in_review`.
    Promoted { pr_url: String },
    /// Verification failed or errored; ticket is `needs_review` with a
    /// feedback artifact for the attempt.
    NeedsReview,
    /// The project has no repository URL; nothing to verify against, so
    /// the ticket completed directly.
    ShortCircuitDone,
}

/// Run the post-execution pipeline for a ticket in `verifying`.
pub async fn run_post_execution(
    pool: &PgPool,
    verifier: &dyn Verifier,
    pr_creator: &dyn PrCreator,
    ticket_id: Uuid,
) -> Result<PipelineOutcome> {
    let ticket = ticket_db::get_ticket(pool, ticket_id)
        .await?
        .with_context(|| format!("ticket {ticket_id} not found"))?;

    // Guard-assert: `complete` already moved the row here.
    if ticket.state != TicketState::Verifying {
        anyhow::bail!(
            "pipeline invoked for ticket {} in state {}, expected verifying",
            ticket_id,
            ticket.state
        );
    }

    let project = projects::get_project(pool, ticket.project_id)
        .await?
        .with_context(|| format!("project {} not found for ticket {}", ticket.project_id, ticket_id))?;

    // No repository means nothing to verify against. Pragmatic exception,
    // not the normal path.
    let Some(repo_url) = project.repo_url.clone() else {
        tracing::warn!(
            ticket_id = %ticket_id,
            project_id = %project.id,
            "project has no repo_url, completing without verification"
        );
        dispatch::short_circuit_done(pool, ticket_id).await?;
        return Ok(PipelineOutcome::ShortCircuitDone);
    };

    // 1-based verification attempt. Counts verdicts consumed, not agent
    // failures; `fail_to_needs_review` advances it so the replay cycle
    // sees 1, 2, 3 rather than a pinned 1.
    let attempt = ticket.verification_attempts + 1;

    let Some(branch_name) = ticket.branch_name.clone() else {
        record_artifact(
            pool,
            ticket_id,
            attempt,
            "pipeline_error",
            serde_json::json!({ "error": "completed without a branch name" }),
        )
        .await;
        dispatch::park_for_review(pool, ticket_id, "completed without a branch name").await?;
        return Ok(PipelineOutcome::NeedsReview);
    };

    let request = VerificationRequest {
        ticket_id,
        branch_name: branch_name.clone(),
        repo_url: repo_url.clone(),
        attempt,
        acceptance_criteria: ticket.acceptance_criteria.clone(),
        phases: DEFAULT_PHASES.iter().map(|p| p.to_string()).collect(),
    };

    let verdict = match verifier.verify(&request).await {
        Ok(verdict) => verdict,
        Err(e) => {
            // No verdict was produced, so the attempt is not charged;
            // the agent's push survives and a human routes the ticket
            // back.
            tracing::error!(ticket_id = %ticket_id, error = %e, "verifier call failed");
            record_artifact(
                pool,
                ticket_id,
                attempt,
                "verifier_error",
                serde_json::json!({ "error": format!("{e:#}") }),
            )
            .await;
            dispatch::park_for_review(pool, ticket_id, &format!("{e:#}")).await?;
            return Ok(PipelineOutcome::NeedsReview);
        }
    };

    if verdict.is_pass() {
        return promote(pool, pr_creator, &ticket, &project, &repo_url, &branch_name, attempt)
            .await;
    }

    // Verification failed: persist the feedback keyed by attempt so a
    // replay driver (or a human) can route the ticket back to ready.
    let replayable = attempt < MAX_ATTEMPTS;
    record_artifact(
        pool,
        ticket_id,
        attempt,
        "verification_feedback",
        serde_json::json!({
            "attempt": attempt,
            "feedback": verdict.feedback_for_agent,
            "evidence": verdict.evidence,
            "replayable": replayable,
        }),
    )
    .await;

    tracing::info!(
        ticket_id = %ticket_id,
        attempt = attempt,
        replayable = replayable,
        "verification failed"
    );
    dispatch::fail_to_needs_review(pool, ticket_id, Some("verification failed")).await?;
    Ok(PipelineOutcome::NeedsReview)
}

/// Open the PR and hand the ticket to the sentinel.
async fn promote(
    pool: &PgPool,
    pr_creator: &dyn PrCreator,
    ticket: &Ticket,
    project: &Project,
    repo_url: &str,
    branch_name: &str,
    attempt: i32,
) -> Result<PipelineOutcome> {
    let request = PrRequest {
        repo_url: repo_url.to_owned(),
        head_branch: branch_name.to_owned(),
        base_branch: project.base_branch.clone(),
        title: ticket.title.clone(),
        body: pr_body(ticket),
    };

    let pr_url = match pr_creator.create_pr(&request).await {
        Ok(url) => url,
        Err(e) => {
            // Verified work with no PR still must not be discarded, and
            // a PR failure is not a failed verification.
            tracing::error!(ticket_id = %ticket.id, error = %e, "PR creation failed");
            record_artifact(
                pool,
                ticket.id,
                attempt,
                "pr_error",
                serde_json::json!({ "error": format!("{e:#}") }),
            )
            .await;
            dispatch::park_for_review(pool, ticket.id, &format!("{e:#}")).await?;
            return Ok(PipelineOutcome::NeedsReview);
        }
    };

    dispatch::pass_to_in_review(pool, ticket.id, &pr_url).await?;
    tracing::info!(
        ticket_id = %ticket.id,
        pr_url = %pr_url,
        "ticket promoted to in_review"
    );
    Ok(PipelineOutcome::Promoted { pr_url })
}

fn pr_body(ticket: &Ticket) -> String {
    let mut body = ticket.description.clone();
    if !ticket.acceptance_criteria.is_empty() {
        if !body.is_empty() {
            body.push_str("\n\n");
        }
        body.push_str("## Acceptance criteria\n\n");
        body.push_str(&ticket.acceptance_criteria);
    }
    body
}

/// Best-effort artifact insert; the pipeline's routing decision must not
/// fail because the evidence write did.
async fn record_artifact(
    pool: &PgPool,
    ticket_id: Uuid,
    attempt: i32,
    kind: &str,
    content: serde_json::Value,
) {
    let new = NewArtifact {
        ticket_id,
        attempt,
        kind: kind.to_owned(),
        content,
    };
    if let Err(e) = artifacts::insert_artifact(pool, &new).await {
        tracing::warn!(
            ticket_id = %ticket_id,
            kind = kind,
            error = %e,
            "failed to record pipeline artifact (best-effort)"
        );
    }
}
