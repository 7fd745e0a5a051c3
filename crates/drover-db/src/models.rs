use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Logical assignee id routing work to coder agents.
pub const FORGE_AGENT: &str = "forge-agent";

/// Logical assignee id routing promoted work to review agents.
pub const SENTINEL_AGENT: &str = "sentinel-agent";

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// State of a ticket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TicketState {
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
}

impl TicketState {
    /// Terminal states accept no further state writes.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Cancelled)
    }

    /// States in which a ticket holds a VM slot and a live lease.
    pub fn holds_lease(self) -> bool {
        matches!(self, Self::Assigned | Self::InProgress | Self::Verifying)
    }
}

impl fmt::Display for TicketState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Draft => "draft",
            Self::Blocked => "blocked",
            Self::Ready => "ready",
            Self::Assigned => "assigned",
            Self::InProgress => "in_progress",
            Self::Verifying => "verifying",
            Self::InReview => "in_review",
            Self::NeedsReview => "needs_review",
            Self::Done => "done",
            Self::OnHold => "on_hold",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

impl FromStr for TicketState {
    type Err = TicketStateParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(Self::Draft),
            "blocked" => Ok(Self::Blocked),
            "ready" => Ok(Self::Ready),
            "assigned" => Ok(Self::Assigned),
            "in_progress" => Ok(Self::InProgress),
            "verifying" => Ok(Self::Verifying),
            "in_review" => Ok(Self::InReview),
            "needs_review" => Ok(Self::NeedsReview),
            "done" => Ok(Self::Done),
            "on_hold" => Ok(Self::OnHold),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(TicketStateParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`TicketState`] string.
#[derive(Debug, Clone)]
pub struct TicketStateParseError(pub String);

impl fmt::Display for TicketStateParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid ticket state: {:?}", self.0)
    }
}

impl std::error::Error for TicketStateParseError {}

// ---------------------------------------------------------------------------

/// Kind of assignee bound to a ticket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum AssigneeType {
    Agent,
    Human,
}

impl fmt::Display for AssigneeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Agent => "agent",
            Self::Human => "human",
        };
        f.write_str(s)
    }
}

impl FromStr for AssigneeType {
    type Err = AssigneeTypeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "agent" => Ok(Self::Agent),
            "human" => Ok(Self::Human),
            other => Err(AssigneeTypeParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`AssigneeType`] string.
#[derive(Debug, Clone)]
pub struct AssigneeTypeParseError(pub String);

impl fmt::Display for AssigneeTypeParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid assignee type: {:?}", self.0)
    }
}

impl std::error::Error for AssigneeTypeParseError {}

// ---------------------------------------------------------------------------

/// Rough size of a ticket -- used as a claim-ordering tiebreak.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TicketSize {
    Small,
    Medium,
    Large,
}

impl fmt::Display for TicketSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Small => "small",
            Self::Medium => "medium",
            Self::Large => "large",
        };
        f.write_str(s)
    }
}

impl FromStr for TicketSize {
    type Err = TicketSizeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "small" => Ok(Self::Small),
            "medium" => Ok(Self::Medium),
            "large" => Ok(Self::Large),
            other => Err(TicketSizeParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`TicketSize`] string.
#[derive(Debug, Clone)]
pub struct TicketSizeParseError(pub String);

impl fmt::Display for TicketSizeParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid ticket size: {:?}", self.0)
    }
}

impl std::error::Error for TicketSizeParseError {}

// ---------------------------------------------------------------------------

/// How a ticket reaches its executing agent.
///
/// `direct` tickets are dispatched by the scheduler into a VM slot it owns;
/// `pull` tickets wait for an external agent to claim them over HTTP;
/// `workflow` tickets are claimed by workflow runners and carry an opaque
/// `workflow_id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    Direct,
    Pull,
    Workflow,
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Direct => "direct",
            Self::Pull => "pull",
            Self::Workflow => "workflow",
        };
        f.write_str(s)
    }
}

impl FromStr for ExecutionMode {
    type Err = ExecutionModeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "direct" => Ok(Self::Direct),
            "pull" => Ok(Self::Pull),
            "workflow" => Ok(Self::Workflow),
            other => Err(ExecutionModeParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`ExecutionMode`] string.
#[derive(Debug, Clone)]
pub struct ExecutionModeParseError(pub String);

impl fmt::Display for ExecutionModeParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid execution mode: {:?}", self.0)
    }
}

impl std::error::Error for ExecutionModeParseError {}

// ---------------------------------------------------------------------------

/// Outcome of the verification pipeline for the current attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum VerificationStatus {
    Pending,
    Passed,
    Failed,
}

impl fmt::Display for VerificationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Passed => "passed",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

impl FromStr for VerificationStatus {
    type Err = VerificationStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "passed" => Ok(Self::Passed),
            "failed" => Ok(Self::Failed),
            other => Err(VerificationStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`VerificationStatus`] string.
#[derive(Debug, Clone)]
pub struct VerificationStatusParseError(pub String);

impl fmt::Display for VerificationStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid verification status: {:?}", self.0)
    }
}

impl std::error::Error for VerificationStatusParseError {}

// ---------------------------------------------------------------------------
// Row structs
// ---------------------------------------------------------------------------

/// A project -- joins tickets to a repository URL and settings.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Project {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub name: String,
    pub repo_url: Option<String>,
    pub base_branch: String,
    pub settings: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// A ticket -- the atomic unit of work: one agent, one branch, one PR.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Ticket {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub project_id: Uuid,
    pub build_id: Option<Uuid>,
    pub title: String,
    pub description: String,
    pub acceptance_criteria: String,
    pub state: TicketState,
    pub size: TicketSize,
    pub execution_mode: ExecutionMode,
    pub workflow_id: Option<Uuid>,
    pub assignee_id: Option<String>,
    pub assignee_type: Option<AssigneeType>,
    pub vm_id: Option<String>,
    pub branch_name: Option<String>,
    pub pr_url: Option<String>,
    pub retry_count: i32,
    pub rejection_count: i32,
    /// Verifier verdicts consumed so far. Distinct from `retry_count`,
    /// which counts agent-reported failures.
    pub verification_attempts: i32,
    pub retry_strategy: Option<serde_json::Value>,
    pub verification_status: Option<VerificationStatus>,
    pub hold_reason: Option<String>,
    pub error: Option<String>,
    pub inputs: serde_json::Value,
    pub outputs: serde_json::Value,
    pub metadata: serde_json::Value,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub lease_expires: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// An edge in the ticket dependency DAG.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TicketDependency {
    pub ticket_id: Uuid,
    pub depends_on: Uuid,
}

/// An append-only artifact attached to a ticket attempt (verifier
/// feedback, pipeline errors, reap records).
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TicketArtifact {
    pub id: Uuid,
    pub ticket_id: Uuid,
    pub attempt: i32,
    pub kind: String,
    pub content: serde_json::Value,
    pub recorded_at: DateTime<Utc>,
}

/// One entry in a ticket's append-only progress trace.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ProgressEntry {
    pub id: i64,
    pub ticket_id: Uuid,
    pub agent_id: String,
    pub message: String,
    pub recorded_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
