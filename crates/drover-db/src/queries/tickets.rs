//! Database query functions for the `tickets` and `ticket_dependencies`
//! tables.
//!
//! Every state write in the workspace flows through the guarded updates in
//! this module: [`claim`], [`claim_next`], [`heartbeat`], [`transition`],
//! [`activate_build`], [`release_expired_leases`], and
//! [`unblock_ready_dependents`]. All of them use optimistic locking -- the
//! WHERE clause carries the expected current state, and `rows_affected`
//! (or a `RETURNING` row) is the only conflict signal. A guard miss is a
//! normal outcome, never an error.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{AssigneeType, Ticket, TicketState, FORGE_AGENT};

/// Parameters for inserting a new ticket row.
///
/// Tickets normally arrive pre-materialized from the spec/ticket-generator
/// collaborator; this insert exists for that boundary and for tests.
#[derive(Debug, Clone)]
pub struct NewTicket {
    pub tenant_id: Uuid,
    pub project_id: Uuid,
    pub build_id: Option<Uuid>,
    pub title: String,
    pub description: String,
    pub acceptance_criteria: String,
    pub size: &'static str,
    pub execution_mode: &'static str,
}

impl NewTicket {
    /// A minimal draft ticket for the given project.
    pub fn draft(tenant_id: Uuid, project_id: Uuid, title: impl Into<String>) -> Self {
        Self {
            tenant_id,
            project_id,
            build_id: None,
            title: title.into(),
            description: String::new(),
            acceptance_criteria: String::new(),
            size: "medium",
            execution_mode: "pull",
        }
    }

    pub fn with_build(mut self, build_id: Uuid) -> Self {
        self.build_id = Some(build_id);
        self
    }

    pub fn with_mode(mut self, mode: &'static str) -> Self {
        self.execution_mode = mode;
        self
    }

    pub fn with_size(mut self, size: &'static str) -> Self {
        self.size = size;
        self
    }
}

/// Insert a new ticket row in `draft` state. Returns the inserted ticket
/// with server-generated defaults (id, timestamps, counters).
pub async fn insert_ticket(pool: &PgPool, new: &NewTicket) -> Result<Ticket> {
    let ticket = sqlx::query_as::<_, Ticket>(
        "INSERT INTO tickets (tenant_id, project_id, build_id, title, description, \
                              acceptance_criteria, size, execution_mode) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
         RETURNING *",
    )
    .bind(new.tenant_id)
    .bind(new.project_id)
    .bind(new.build_id)
    .bind(&new.title)
    .bind(&new.description)
    .bind(&new.acceptance_criteria)
    .bind(new.size)
    .bind(new.execution_mode)
    .fetch_one(pool)
    .await
    .context("failed to insert ticket")?;

    Ok(ticket)
}

/// Fetch a single ticket by ID.
pub async fn get_ticket(pool: &PgPool, id: Uuid) -> Result<Option<Ticket>> {
    let ticket = sqlx::query_as::<_, Ticket>("SELECT * FROM tickets WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch ticket")?;

    Ok(ticket)
}

/// List all tickets in a build batch, ordered by creation time.
pub async fn list_for_build(pool: &PgPool, build_id: Uuid) -> Result<Vec<Ticket>> {
    let tickets = sqlx::query_as::<_, Ticket>(
        "SELECT * FROM tickets WHERE build_id = $1 ORDER BY created_at ASC",
    )
    .bind(build_id)
    .fetch_all(pool)
    .await
    .context("failed to list tickets for build")?;

    Ok(tickets)
}

/// Insert a dependency edge: `ticket_id` depends on `depends_on_id`.
///
/// Uses `ON CONFLICT DO NOTHING` so this is idempotent.
pub async fn insert_dependency(pool: &PgPool, ticket_id: Uuid, depends_on_id: Uuid) -> Result<()> {
    sqlx::query(
        "INSERT INTO ticket_dependencies (ticket_id, depends_on) VALUES ($1, $2) \
         ON CONFLICT DO NOTHING",
    )
    .bind(ticket_id)
    .bind(depends_on_id)
    .execute(pool)
    .await
    .context("failed to insert ticket dependency")?;

    Ok(())
}

/// Get the IDs of all tickets that a given ticket depends on.
pub async fn get_dependencies(pool: &PgPool, ticket_id: Uuid) -> Result<Vec<Uuid>> {
    let rows: Vec<(Uuid,)> =
        sqlx::query_as("SELECT depends_on FROM ticket_dependencies WHERE ticket_id = $1")
            .bind(ticket_id)
            .fetch_all(pool)
            .await
            .context("failed to get ticket dependencies")?;

    Ok(rows.into_iter().map(|(id,)| id).collect())
}

// -----------------------------------------------------------------------
// Scheduler surface: reserve / claim / heartbeat
// -----------------------------------------------------------------------

/// Non-locking read used by the scheduler to find claim candidates.
///
/// Returns tickets in `ready` state with an agent assignee and no VM
/// binding, oldest first. `excluded_vm_ids` is defense in depth: a `ready`
/// ticket never holds a slot, but a row that slipped past the invariant
/// must not be handed a second one.
pub async fn reserve_ready(
    pool: &PgPool,
    limit: i64,
    excluded_vm_ids: &[String],
) -> Result<Vec<Ticket>> {
    let tickets = sqlx::query_as::<_, Ticket>(
        "SELECT * FROM tickets \
         WHERE state = 'ready' \
           AND assignee_id IS NOT NULL \
           AND assignee_type = 'agent' \
           AND (vm_id IS NULL OR NOT (vm_id = ANY($2))) \
           AND execution_mode = 'direct' \
         ORDER BY created_at ASC \
         LIMIT $1",
    )
    .bind(limit)
    .bind(excluded_vm_ids)
    .fetch_all(pool)
    .await
    .context("failed to reserve ready tickets")?;

    Ok(tickets)
}

/// Atomically claim a specific ticket for a VM slot.
///
/// Sets `state = in_progress`, binds the slot, starts the lease -- iff the
/// row is still `ready` with no slot bound. This conditional update is the
/// serialization point between concurrent schedulers (spec: exactly one of
/// two racing claims succeeds).
pub async fn claim(pool: &PgPool, ticket_id: Uuid, vm_id: &str, lease_secs: f64) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE tickets \
         SET state = 'in_progress', \
             vm_id = $2, \
             started_at = NOW(), \
             last_heartbeat = NOW(), \
             lease_expires = NOW() + make_interval(secs => $3), \
             updated_at = NOW() \
         WHERE id = $1 AND state = 'ready' AND vm_id IS NULL",
    )
    .bind(ticket_id)
    .bind(vm_id)
    .bind(lease_secs)
    .execute(pool)
    .await
    .context("failed to claim ticket")?;

    Ok(result.rows_affected() == 1)
}

/// Atomically claim the next eligible `ready` ticket on behalf of a
/// pull-agent, reassigning it to the claiming agent.
///
/// Selection order: oldest first, size tiebreak (small < medium < large).
/// `FOR UPDATE SKIP LOCKED` keeps two racing claimants off the same row;
/// the outer guard re-checks the state so a row that moved between the
/// subselect and the update is simply not returned.
pub async fn claim_next(
    pool: &PgPool,
    agent_id: &str,
    vm_id: &str,
    project_id: Option<Uuid>,
    lease_secs: f64,
) -> Result<Option<Ticket>> {
    let ticket = sqlx::query_as::<_, Ticket>(
        "UPDATE tickets \
         SET state = 'in_progress', \
             assignee_id = $1, \
             assignee_type = 'agent', \
             vm_id = $2, \
             started_at = NOW(), \
             last_heartbeat = NOW(), \
             lease_expires = NOW() + make_interval(secs => $3), \
             updated_at = NOW() \
         WHERE id = ( \
             SELECT id FROM tickets \
             WHERE state = 'ready' \
               AND assignee_id IS NOT NULL \
               AND assignee_type = 'agent' \
               AND vm_id IS NULL \
               AND execution_mode != 'direct' \
               AND ($4::uuid IS NULL OR project_id = $4) \
             ORDER BY created_at ASC, \
                      CASE size WHEN 'small' THEN 0 WHEN 'medium' THEN 1 ELSE 2 END ASC \
             LIMIT 1 \
             FOR UPDATE SKIP LOCKED \
         ) AND state = 'ready' AND vm_id IS NULL \
         RETURNING *",
    )
    .bind(agent_id)
    .bind(vm_id)
    .bind(lease_secs)
    .bind(project_id)
    .fetch_optional(pool)
    .await
    .context("failed to claim next ready ticket")?;

    Ok(ticket)
}

/// Read the oldest `in_review` ticket for a sentinel poller.
///
/// Review claims do not mutate: the row already carries the sentinel
/// assignment (invariant on `in_review`), so this is a discovery read.
pub async fn next_in_review(pool: &PgPool, project_id: Option<Uuid>) -> Result<Option<Ticket>> {
    let ticket = sqlx::query_as::<_, Ticket>(
        "SELECT * FROM tickets \
         WHERE state = 'in_review' \
           AND ($1::uuid IS NULL OR project_id = $1) \
         ORDER BY created_at ASC, \
                  CASE size WHEN 'small' THEN 0 WHEN 'medium' THEN 1 ELSE 2 END ASC \
         LIMIT 1",
    )
    .bind(project_id)
    .fetch_optional(pool)
    .await
    .context("failed to select next in_review ticket")?;

    Ok(ticket)
}

/// Extend a ticket's lease on behalf of the owning agent.
///
/// The update is gated on `assignee_id` and a lease-holding state, so a
/// heartbeat from an agent that lost the ticket (reaped, released,
/// reassigned) affects nothing and returns `false`.
pub async fn heartbeat(
    pool: &PgPool,
    ticket_id: Uuid,
    agent_id: &str,
    lease_secs: f64,
) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE tickets \
         SET lease_expires = NOW() + make_interval(secs => $3), \
             last_heartbeat = NOW(), \
             updated_at = NOW() \
         WHERE id = $1 \
           AND assignee_id = $2 \
           AND state IN ('assigned', 'in_progress')",
    )
    .bind(ticket_id)
    .bind(agent_id)
    .bind(lease_secs)
    .execute(pool)
    .await
    .context("failed to heartbeat ticket")?;

    Ok(result.rows_affected() == 1)
}

// -----------------------------------------------------------------------
// Generic guarded transition
// -----------------------------------------------------------------------

/// Optional field writes carried by a [`transition`].
///
/// `Some` values overwrite, `None` leaves the column untouched; the
/// explicit `clear_*` flags null columns out (a plain COALESCE cannot).
#[derive(Debug, Clone, Default)]
pub struct TransitionFields {
    pub assignee_id: Option<String>,
    pub assignee_type: Option<AssigneeType>,
    pub branch_name: Option<String>,
    pub pr_url: Option<String>,
    pub error: Option<String>,
    pub hold_reason: Option<String>,
    pub verification_status: Option<String>,
    pub retry_strategy: Option<serde_json::Value>,
    pub vm_id: Option<String>,
    /// Null out the VM binding (release paths; invariant on `ready`).
    pub clear_vm: bool,
    /// Null out `lease_expires`.
    pub clear_lease: bool,
    /// Start a fresh lease of this many seconds.
    pub lease_secs: Option<f64>,
    /// Stamp `completed_at = NOW()`.
    pub set_completed: bool,
    pub increment_retry: bool,
    pub increment_rejection: bool,
    /// Charge one verification attempt (a verdict was consumed).
    pub increment_verification: bool,
}

impl TransitionFields {
    /// Fields for a transition back to `ready`: slot unbound, lease
    /// cleared, discoverable by the scheduler again.
    pub fn back_to_ready() -> Self {
        Self {
            assignee_id: Some(FORGE_AGENT.to_owned()),
            assignee_type: Some(AssigneeType::Agent),
            clear_vm: true,
            clear_lease: true,
            ..Self::default()
        }
    }
}

/// Atomically transition a ticket gated on its current state.
///
/// Returns `false` when the row is absent or its state is not in
/// `expected` -- the world moved under the caller, who must re-read and
/// re-decide rather than blind-retry.
pub async fn transition(
    pool: &PgPool,
    ticket_id: Uuid,
    expected: &[TicketState],
    new_state: TicketState,
    fields: &TransitionFields,
) -> Result<bool> {
    let expected: Vec<String> = expected.iter().map(|s| s.to_string()).collect();

    let result = sqlx::query(
        "UPDATE tickets \
         SET state = $2, \
             assignee_id = COALESCE($3, assignee_id), \
             assignee_type = COALESCE($4, assignee_type), \
             branch_name = COALESCE($5, branch_name), \
             pr_url = COALESCE($6, pr_url), \
             error = COALESCE($7, error), \
             hold_reason = COALESCE($8, hold_reason), \
             verification_status = COALESCE($9, verification_status), \
             retry_strategy = COALESCE($10, retry_strategy), \
             vm_id = CASE WHEN $11 THEN NULL ELSE COALESCE($12, vm_id) END, \
             lease_expires = CASE WHEN $13 THEN NULL \
                                  WHEN $14::float8 IS NOT NULL \
                                       THEN NOW() + make_interval(secs => $14) \
                                  ELSE lease_expires END, \
             completed_at = CASE WHEN $15 THEN NOW() ELSE completed_at END, \
             retry_count = retry_count + CASE WHEN $16 THEN 1 ELSE 0 END, \
             rejection_count = rejection_count + CASE WHEN $17 THEN 1 ELSE 0 END, \
             verification_attempts = verification_attempts + CASE WHEN $18 THEN 1 ELSE 0 END, \
             updated_at = NOW() \
         WHERE id = $1 AND state = ANY($19)",
    )
    .bind(ticket_id)
    .bind(new_state)
    .bind(&fields.assignee_id)
    .bind(fields.assignee_type)
    .bind(&fields.branch_name)
    .bind(&fields.pr_url)
    .bind(&fields.error)
    .bind(&fields.hold_reason)
    .bind(&fields.verification_status)
    .bind(&fields.retry_strategy)
    .bind(fields.clear_vm)
    .bind(&fields.vm_id)
    .bind(fields.clear_lease)
    .bind(fields.lease_secs)
    .bind(fields.set_completed)
    .bind(fields.increment_retry)
    .bind(fields.increment_rejection)
    .bind(fields.increment_verification)
    .bind(&expected)
    .execute(pool)
    .await
    .with_context(|| format!("failed to transition ticket {ticket_id} to {new_state}"))?;

    Ok(result.rows_affected() == 1)
}

// -----------------------------------------------------------------------
// Activation, unblocking, reaping
// -----------------------------------------------------------------------

/// Counts returned by [`activate_build`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ActivationCounts {
    pub ready: u64,
    pub blocked: u64,
}

/// Bulk-activate a build batch: every `draft` ticket whose dependencies
/// are all resolved becomes `ready` with the forge-agent assignment;
/// the rest become `blocked`.
///
/// Both statements gate on `state = 'draft'`, so re-running on an
/// already-activated batch is a no-op.
pub async fn activate_build(pool: &PgPool, build_id: Uuid) -> Result<ActivationCounts> {
    let ready = sqlx::query(
        "UPDATE tickets t \
         SET state = 'ready', \
             assignee_id = $2, \
             assignee_type = 'agent', \
             updated_at = NOW() \
         WHERE t.build_id = $1 \
           AND t.state = 'draft' \
           AND NOT EXISTS ( \
               SELECT 1 FROM ticket_dependencies td \
               JOIN tickets dep ON dep.id = td.depends_on \
               WHERE td.ticket_id = t.id AND dep.state != 'done' \
           )",
    )
    .bind(build_id)
    .bind(FORGE_AGENT)
    .execute(pool)
    .await
    .context("failed to activate ready tickets")?
    .rows_affected();

    let blocked = sqlx::query(
        "UPDATE tickets \
         SET state = 'blocked', updated_at = NOW() \
         WHERE build_id = $1 AND state = 'draft'",
    )
    .bind(build_id)
    .execute(pool)
    .await
    .context("failed to activate blocked tickets")?
    .rows_affected();

    Ok(ActivationCounts { ready, blocked })
}

/// Unblock every `blocked` ticket whose dependencies are all `done`.
///
/// A single guarded statement, safe to run concurrently with scheduling:
/// the `state = 'blocked'` guard makes the sweep idempotent. Returns the
/// number of tickets released.
pub async fn unblock_ready_dependents(pool: &PgPool) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tickets t \
         SET state = 'ready', \
             assignee_id = COALESCE(t.assignee_id, $1), \
             assignee_type = 'agent', \
             vm_id = NULL, \
             updated_at = NOW() \
         WHERE t.state = 'blocked' \
           AND NOT EXISTS ( \
               SELECT 1 FROM ticket_dependencies td \
               JOIN tickets dep ON dep.id = td.depends_on \
               WHERE td.ticket_id = t.id AND dep.state != 'done' \
           )",
    )
    .bind(FORGE_AGENT)
    .execute(pool)
    .await
    .context("failed to unblock dependent tickets")?;

    Ok(result.rows_affected())
}

/// A lease the reaper just released, carrying the bindings the row held
/// before the update so the caller can kill the orphaned slot.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ReapedLease {
    pub ticket_id: Uuid,
    pub vm_id: Option<String>,
    pub assignee_id: Option<String>,
    pub last_heartbeat: Option<DateTime<Utc>>,
}

/// Reap every ticket whose lease has expired: back to `ready`, slot
/// unbound, reassigned to the forge agent.
///
/// The `lease_expires < NOW()` guard uses the database clock, so a racing
/// heartbeat either lands first (extending the lease past NOW) or finds
/// its row gone on the next beat.
pub async fn release_expired_leases(pool: &PgPool) -> Result<Vec<ReapedLease>> {
    let reaped = sqlx::query_as::<_, ReapedLease>(
        "WITH expired AS ( \
             SELECT id, vm_id, assignee_id, last_heartbeat FROM tickets \
             WHERE lease_expires < NOW() \
               AND state IN ('assigned', 'in_progress') \
             FOR UPDATE SKIP LOCKED \
         ) \
         UPDATE tickets t \
         SET state = 'ready', \
             assignee_id = $1, \
             assignee_type = 'agent', \
             vm_id = NULL, \
             lease_expires = NULL, \
             updated_at = NOW() \
         FROM expired e \
         WHERE t.id = e.id \
         RETURNING e.id AS ticket_id, e.vm_id, e.assignee_id, e.last_heartbeat",
    )
    .bind(FORGE_AGENT)
    .fetch_all(pool)
    .await
    .context("failed to release expired leases")?;

    Ok(reaped)
}

// -----------------------------------------------------------------------
// Diagnostics
// -----------------------------------------------------------------------

/// Tickets in non-terminal, non-`ready` states that have not been touched
/// since `older_than`.
pub async fn list_stuck(pool: &PgPool, older_than: DateTime<Utc>) -> Result<Vec<Ticket>> {
    let tickets = sqlx::query_as::<_, Ticket>(
        "SELECT * FROM tickets \
         WHERE state NOT IN ('ready', 'done', 'cancelled', 'draft') \
           AND updated_at < $1 \
         ORDER BY updated_at ASC",
    )
    .bind(older_than)
    .fetch_all(pool)
    .await
    .context("failed to list stuck tickets")?;

    Ok(tickets)
}

/// Ticket counts by state, for the `/status` surface and the CLI.
#[derive(Debug, Clone, Default)]
pub struct TicketCounts {
    pub draft: i64,
    pub blocked: i64,
    pub ready: i64,
    pub assigned: i64,
    pub in_progress: i64,
    pub verifying: i64,
    pub in_review: i64,
    pub needs_review: i64,
    pub done: i64,
    pub on_hold: i64,
    pub cancelled: i64,
    pub total: i64,
}

/// Get a summary of ticket counts by state.
pub async fn count_by_state(pool: &PgPool) -> Result<TicketCounts> {
    let rows: Vec<(String, i64)> = sqlx::query_as(
        "SELECT state::text, COUNT(*) as cnt \
         FROM tickets \
         GROUP BY state",
    )
    .fetch_all(pool)
    .await
    .context("failed to count tickets by state")?;

    let mut counts = TicketCounts::default();
    for (state, count) in &rows {
        match state.as_str() {
            "draft" => counts.draft = *count,
            "blocked" => counts.blocked = *count,
            "ready" => counts.ready = *count,
            "assigned" => counts.assigned = *count,
            "in_progress" => counts.in_progress = *count,
            "verifying" => counts.verifying = *count,
            "in_review" => counts.in_review = *count,
            "needs_review" => counts.needs_review = *count,
            "done" => counts.done = *count,
            "on_hold" => counts.on_hold = *count,
            "cancelled" => counts.cancelled = *count,
            _ => {}
        }
        counts.total += count;
    }
    Ok(counts)
}
