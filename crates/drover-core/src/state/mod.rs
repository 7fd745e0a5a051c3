//! Ticket state machine transitions.
//!
//! Validates and executes state transitions for tickets, enforcing the
//! allowed transition graph, optimistic locking, lease and VM-binding
//! invariants, and timestamp management.

pub mod dispatch;
pub mod queries;

use sqlx::PgPool;
use uuid::Uuid;

use drover_db::models::TicketState;
use drover_db::queries::tickets::{self as db, TransitionFields};

/// A recognized failure of a state-machine operation.
///
/// Guard conflicts and missing rows are expected outcomes of racing
/// writers, not programming errors; callers match on them (the HTTP
/// surface maps `Conflict` to 409 and `NotFound` to 404) instead of
/// retrying blindly.
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("invalid state transition: {from} -> {to} for ticket {ticket_id}")]
    InvalidTransition {
        ticket_id: Uuid,
        from: TicketState,
        to: TicketState,
    },
    #[error("ticket {ticket_id} not found")]
    NotFound { ticket_id: Uuid },
    #[error("guard conflict: ticket {ticket_id} has state {current}, expected {expected:?}")]
    Conflict {
        ticket_id: Uuid,
        current: TicketState,
        expected: Vec<TicketState>,
    },
    #[error(transparent)]
    Db(#[from] anyhow::Error),
}

/// The ticket state machine.
///
/// Enforces the valid transition graph:
///
/// ```text
/// draft        -> ready | blocked      (activation)
/// blocked      -> ready                (dependency-unblock sweep)
/// ready        -> assigned | in_progress   (claim)
/// assigned     -> in_progress | ready
/// in_progress  -> in_progress          (branch confirmation, idempotent)
/// in_progress  -> verifying            (agent complete)
/// in_progress  -> ready                (release, retriable fail, reap)
/// in_progress  -> on_hold              (non-retriable fail)
/// verifying    -> in_review            (verified, PR created)
/// verifying    -> needs_review         (verification failed)
/// verifying    -> ready                (replay with retries remaining)
/// verifying    -> done                 (nothing to verify against)
/// in_review    -> done                 (sentinel approval)
/// needs_review -> ready                (replay driver)
/// on_hold      -> ready                (human resume)
/// any non-terminal -> cancelled        (explicit terminate)
/// ```
///
/// `done` and `cancelled` are terminal.
pub struct TicketStateMachine;

impl TicketStateMachine {
    /// Check whether a transition from `from` to `to` is a valid edge in
    /// the state graph.
    pub fn is_valid_transition(from: TicketState, to: TicketState) -> bool {
        use TicketState::*;
        if to == Cancelled {
            return !from.is_terminal();
        }
        matches!(
            (from, to),
            (Draft, Ready)
                | (Draft, Blocked)
                | (Blocked, Ready)
                | (Ready, Assigned)
                | (Ready, InProgress)
                | (Assigned, InProgress)
                | (Assigned, Ready)
                | (InProgress, InProgress)
                | (InProgress, Verifying)
                | (InProgress, Ready)
                | (InProgress, OnHold)
                | (Verifying, InReview)
                | (Verifying, NeedsReview)
                | (Verifying, Ready)
                | (Verifying, Done)
                | (InReview, Done)
                | (NeedsReview, Ready)
                | (OnHold, Ready)
        )
    }

    /// Execute a state transition with optimistic locking.
    ///
    /// The UPDATE's WHERE clause gates on `from`, so the row only moves if
    /// its current state still matches. A guard miss is surfaced as
    /// [`StateError::Conflict`] (with the state the row actually holds) or
    /// [`StateError::NotFound`]; the caller must re-read and re-decide,
    /// never blind-retry.
    pub async fn transition(
        pool: &PgPool,
        ticket_id: Uuid,
        from: TicketState,
        to: TicketState,
        fields: &TransitionFields,
    ) -> Result<(), StateError> {
        if !Self::is_valid_transition(from, to) {
            return Err(StateError::InvalidTransition {
                ticket_id,
                from,
                to,
            });
        }

        let moved = db::transition(pool, ticket_id, &[from], to, fields).await?;
        if moved {
            tracing::info!(
                ticket_id = %ticket_id,
                from = %from,
                to = %to,
                "ticket transitioned"
            );
            return Ok(());
        }

        Self::conflict_for(pool, ticket_id, vec![from]).await
    }

    /// Execute a transition whose guard admits several source states
    /// (e.g. terminate, which fires from any non-terminal state).
    pub async fn transition_from_any(
        pool: &PgPool,
        ticket_id: Uuid,
        from: &[TicketState],
        to: TicketState,
        fields: &TransitionFields,
    ) -> Result<(), StateError> {
        let legal: Vec<TicketState> = from
            .iter()
            .copied()
            .filter(|f| Self::is_valid_transition(*f, to))
            .collect();
        if legal.is_empty() {
            return Err(StateError::InvalidTransition {
                ticket_id,
                from: from.first().copied().unwrap_or(to),
                to,
            });
        }

        let moved = db::transition(pool, ticket_id, &legal, to, fields).await?;
        if moved {
            tracing::info!(
                ticket_id = %ticket_id,
                to = %to,
                "ticket transitioned"
            );
            return Ok(());
        }

        Self::conflict_for(pool, ticket_id, legal).await
    }

    /// Distinguish a missing row from a state mismatch after a guard miss.
    async fn conflict_for(
        pool: &PgPool,
        ticket_id: Uuid,
        expected: Vec<TicketState>,
    ) -> Result<(), StateError> {
        match db::get_ticket(pool, ticket_id).await? {
            None => Err(StateError::NotFound { ticket_id }),
            Some(t) => Err(StateError::Conflict {
                ticket_id,
                current: t.state,
                expected,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use TicketState::*;

    #[test]
    fn claim_and_completion_edges_accepted() {
        let valid = [
            (Draft, Ready),
            (Draft, Blocked),
            (Blocked, Ready),
            (Ready, InProgress),
            (InProgress, Verifying),
            (Verifying, InReview),
            (Verifying, NeedsReview),
            (Verifying, Ready),
            (Verifying, Done),
            (InProgress, Ready),
            (InProgress, OnHold),
            (InReview, Done),
            (NeedsReview, Ready),
            (OnHold, Ready),
        ];
        for (from, to) in &valid {
            assert!(
                TicketStateMachine::is_valid_transition(*from, *to),
                "expected {from} -> {to} to be valid"
            );
        }
    }

    #[test]
    fn terminal_states_reject_all_edges() {
        for from in [Done, Cancelled] {
            for to in [
                Draft,
                Blocked,
                Ready,
                Assigned,
                InProgress,
                Verifying,
                InReview,
                NeedsReview,
                Done,
                OnHold,
                Cancelled,
            ] {
                assert!(
                    !TicketStateMachine::is_valid_transition(from, to),
                    "expected terminal {from} -> {to} to be invalid"
                );
            }
        }
    }

    #[test]
    fn cancel_reaches_every_non_terminal_state() {
        for from in [
            Draft,
            Blocked,
            Ready,
            Assigned,
            InProgress,
            Verifying,
            InReview,
            NeedsReview,
            OnHold,
        ] {
            assert!(
                TicketStateMachine::is_valid_transition(from, Cancelled),
                "expected {from} -> cancelled to be valid"
            );
        }
    }

    #[test]
    fn done_only_reachable_from_review_or_verify_short_circuit() {
        for from in [
            Draft,
            Blocked,
            Ready,
            Assigned,
            InProgress,
            NeedsReview,
            OnHold,
        ] {
            assert!(
                !TicketStateMachine::is_valid_transition(from, Done),
                "expected {from} -> done to be invalid"
            );
        }
        assert!(TicketStateMachine::is_valid_transition(InReview, Done));
        assert!(TicketStateMachine::is_valid_transition(Verifying, Done));
    }

    #[test]
    fn skipping_states_rejected() {
        let invalid = [
            (Draft, InProgress),
            (Draft, Verifying),
            (Blocked, InProgress),
            (Ready, Verifying),
            (Ready, InReview),
            (InProgress, InReview),
            (InProgress, NeedsReview),
            (Verifying, OnHold),
            (InReview, Ready),
            (NeedsReview, InProgress),
            (OnHold, InProgress),
        ];
        for (from, to) in &invalid {
            assert!(
                !TicketStateMachine::is_valid_transition(*from, *to),
                "expected {from} -> {to} to be invalid"
            );
        }
    }
}
