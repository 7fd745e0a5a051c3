//! Convenience dispatch helpers that wrap [`super::TicketStateMachine`]
//! transitions with semantic names.
//!
//! Each helper assembles the [`TransitionFields`] a given edge requires so
//! the lease/VM-binding invariants hold by construction: every path into
//! `ready` unbinds the slot and clears the lease, every path into
//! `in_review` carries the PR URL and the sentinel assignment, terminal
//! paths stamp `completed_at`.

use sqlx::PgPool;
use uuid::Uuid;

use drover_db::models::{AssigneeType, TicketState, SENTINEL_AGENT};
use drover_db::queries::tickets::TransitionFields;

use super::{StateError, TicketStateMachine};

/// Every non-terminal state, the legal sources for an explicit terminate.
const NON_TERMINAL: [TicketState; 9] = [
    TicketState::Draft,
    TicketState::Blocked,
    TicketState::Ready,
    TicketState::Assigned,
    TicketState::InProgress,
    TicketState::Verifying,
    TicketState::InReview,
    TicketState::NeedsReview,
    TicketState::OnHold,
];

/// Confirm the working branch for a running ticket.
///
/// `in_progress -> in_progress`; idempotent on the branch name.
pub async fn start_branch(
    pool: &PgPool,
    ticket_id: Uuid,
    branch_name: &str,
) -> Result<(), StateError> {
    let fields = TransitionFields {
        branch_name: Some(branch_name.to_owned()),
        ..TransitionFields::default()
    };
    TicketStateMachine::transition(
        pool,
        ticket_id,
        TicketState::InProgress,
        TicketState::InProgress,
        &fields,
    )
    .await
}

/// Record completion of agent work: `in_progress -> verifying`.
///
/// The ticket keeps its VM binding and lease while the verifier runs.
pub async fn complete_to_verifying(
    pool: &PgPool,
    ticket_id: Uuid,
    branch_name: Option<&str>,
    pr_url: Option<&str>,
) -> Result<(), StateError> {
    let fields = TransitionFields {
        branch_name: branch_name.map(str::to_owned),
        pr_url: pr_url.map(str::to_owned),
        verification_status: Some("pending".to_owned()),
        ..TransitionFields::default()
    };
    TicketStateMachine::transition(
        pool,
        ticket_id,
        TicketState::InProgress,
        TicketState::Verifying,
        &fields,
    )
    .await
}

/// Promote a verified ticket: `verifying -> in_review`, recording the PR
/// URL and handing the row to the sentinel agent.
pub async fn pass_to_in_review(
    pool: &PgPool,
    ticket_id: Uuid,
    pr_url: &str,
) -> Result<(), StateError> {
    let fields = TransitionFields {
        pr_url: Some(pr_url.to_owned()),
        assignee_id: Some(SENTINEL_AGENT.to_owned()),
        assignee_type: Some(AssigneeType::Agent),
        verification_status: Some("passed".to_owned()),
        clear_vm: true,
        clear_lease: true,
        ..TransitionFields::default()
    };
    TicketStateMachine::transition(
        pool,
        ticket_id,
        TicketState::Verifying,
        TicketState::InReview,
        &fields,
    )
    .await
}

/// Park a ticket whose verification failed: `verifying -> needs_review`.
///
/// A verdict was consumed, so this charges one verification attempt;
/// the replay cycle sees the next attempt number advance.
pub async fn fail_to_needs_review(
    pool: &PgPool,
    ticket_id: Uuid,
    error: Option<&str>,
) -> Result<(), StateError> {
    let fields = TransitionFields {
        verification_status: Some("failed".to_owned()),
        error: error.map(str::to_owned),
        increment_verification: true,
        clear_vm: true,
        clear_lease: true,
        ..TransitionFields::default()
    };
    TicketStateMachine::transition(
        pool,
        ticket_id,
        TicketState::Verifying,
        TicketState::NeedsReview,
        &fields,
    )
    .await
}

/// Park a ticket whose pipeline run produced no verdict (verifier
/// unreachable, PR creation failed, branch missing):
/// `verifying -> needs_review` without charging a verification attempt.
pub async fn park_for_review(
    pool: &PgPool,
    ticket_id: Uuid,
    error: &str,
) -> Result<(), StateError> {
    let fields = TransitionFields {
        error: Some(error.to_owned()),
        clear_vm: true,
        clear_lease: true,
        ..TransitionFields::default()
    };
    TicketStateMachine::transition(
        pool,
        ticket_id,
        TicketState::Verifying,
        TicketState::NeedsReview,
        &fields,
    )
    .await
}

/// Complete a ticket that has nothing to verify against:
/// `verifying -> done`.
pub async fn short_circuit_done(pool: &PgPool, ticket_id: Uuid) -> Result<(), StateError> {
    let fields = TransitionFields {
        set_completed: true,
        clear_vm: true,
        clear_lease: true,
        ..TransitionFields::default()
    };
    TicketStateMachine::transition(
        pool,
        ticket_id,
        TicketState::Verifying,
        TicketState::Done,
        &fields,
    )
    .await
}

/// Voluntary yield: `in_progress -> ready`, slot unbound, lease cleared,
/// ticket discoverable by the scheduler again.
pub async fn release_to_ready(pool: &PgPool, ticket_id: Uuid) -> Result<(), StateError> {
    TicketStateMachine::transition(
        pool,
        ticket_id,
        TicketState::InProgress,
        TicketState::Ready,
        &TransitionFields::back_to_ready(),
    )
    .await
}

/// Retriable failure: `in_progress -> ready` with the classifier's
/// decision persisted and both counters bumped.
pub async fn fail_retriable_to_ready(
    pool: &PgPool,
    ticket_id: Uuid,
    error: &str,
    retry_strategy: serde_json::Value,
) -> Result<(), StateError> {
    let fields = TransitionFields {
        error: Some(error.to_owned()),
        retry_strategy: Some(retry_strategy),
        increment_retry: true,
        increment_rejection: true,
        ..TransitionFields::back_to_ready()
    };
    TicketStateMachine::transition(
        pool,
        ticket_id,
        TicketState::InProgress,
        TicketState::Ready,
        &fields,
    )
    .await
}

/// Non-retriable failure: `in_progress -> on_hold` for human
/// intervention, with the reason recorded.
///
/// The failed attempt still counts: `retry_count` lands at the exhausted
/// budget, not one short of it.
pub async fn hold_ticket(
    pool: &PgPool,
    ticket_id: Uuid,
    hold_reason: &str,
    error: &str,
    retry_strategy: serde_json::Value,
) -> Result<(), StateError> {
    let fields = TransitionFields {
        hold_reason: Some(hold_reason.to_owned()),
        error: Some(error.to_owned()),
        retry_strategy: Some(retry_strategy),
        increment_retry: true,
        increment_rejection: true,
        clear_vm: true,
        clear_lease: true,
        ..TransitionFields::default()
    };
    TicketStateMachine::transition(
        pool,
        ticket_id,
        TicketState::InProgress,
        TicketState::OnHold,
        &fields,
    )
    .await
}

/// Human resume: `on_hold -> ready`.
pub async fn resume_ticket(pool: &PgPool, ticket_id: Uuid) -> Result<(), StateError> {
    TicketStateMachine::transition(
        pool,
        ticket_id,
        TicketState::OnHold,
        TicketState::Ready,
        &TransitionFields::back_to_ready(),
    )
    .await
}

/// Replay driver: route a parked ticket back into the queue.
///
/// Handles `needs_review -> ready` (verification failed, retries remain)
/// and `verifying -> ready` (a ticket orphaned mid-pipeline by a crash).
pub async fn replay_ticket(pool: &PgPool, ticket_id: Uuid) -> Result<(), StateError> {
    let fields = TransitionFields {
        verification_status: Some("pending".to_owned()),
        ..TransitionFields::back_to_ready()
    };
    TicketStateMachine::transition_from_any(
        pool,
        ticket_id,
        &[TicketState::NeedsReview, TicketState::Verifying],
        TicketState::Ready,
        &fields,
    )
    .await
}

/// Sentinel approval: `in_review -> done`.
pub async fn approve_ticket(pool: &PgPool, ticket_id: Uuid) -> Result<(), StateError> {
    let fields = TransitionFields {
        set_completed: true,
        ..TransitionFields::default()
    };
    TicketStateMachine::transition(
        pool,
        ticket_id,
        TicketState::InReview,
        TicketState::Done,
        &fields,
    )
    .await
}

/// Explicit human terminate: any non-terminal state `-> cancelled`.
pub async fn cancel_ticket(pool: &PgPool, ticket_id: Uuid) -> Result<(), StateError> {
    let fields = TransitionFields {
        set_completed: true,
        clear_vm: true,
        clear_lease: true,
        ..TransitionFields::default()
    };
    TicketStateMachine::transition_from_any(
        pool,
        ticket_id,
        &NON_TERMINAL,
        TicketState::Cancelled,
        &fields,
    )
    .await
}
