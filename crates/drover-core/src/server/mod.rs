//! Agent-facing HTTP surface: `claim`, `start`, `heartbeat`, `complete`,
//! `fail`, `release`, plus the `/status` observability endpoint.
//!
//! This is the sole way external pull-agents interact with the engine.
//! Requests are unauthenticated -- agents live inside the isolation
//! perimeter. All operations are idempotent on `(agent_id, ticket_id)` to
//! the extent the state guards allow; a guard mismatch is a 409 carrying
//! the state the row actually holds, an ownership mismatch is 403.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use anyhow::Result;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use uuid::Uuid;

use drover_db::models::{Project, Ticket, TicketState};
use drover_db::queries::artifacts::{self, NewArtifact};
use drover_db::queries::{progress, projects, tickets as ticket_db};

use crate::github::PrCreator;
use crate::pipeline;
use crate::retry::{classify, RetryPolicies};
use crate::scheduler::EngineShared;
use crate::state::{dispatch, StateError};
use crate::verify::Verifier;

/// Advisory backoff returned with an empty claim.
const EMPTY_CLAIM_BACKOFF_MS: u64 = 2_000;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

pub struct AppError {
    status: StatusCode,
    message: String,
}

impl AppError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: msg.into(),
        }
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: msg.into(),
        }
    }

    pub fn forbidden(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::FORBIDDEN,
            message: msg.into(),
        }
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::CONFLICT,
            message: msg.into(),
        }
    }

    pub fn internal(err: anyhow::Error) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: format!("{err:#}"),
        }
    }
}

impl From<StateError> for AppError {
    fn from(err: StateError) -> Self {
        match err {
            StateError::NotFound { .. } => Self::not_found(err.to_string()),
            StateError::Conflict { .. } | StateError::InvalidTransition { .. } => {
                Self::conflict(err.to_string())
            }
            StateError::Db(e) => Self::internal(e),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let body = serde_json::json!({ "error": self.message });
        (self.status, Json(body)).into_response()
    }
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// Shared state for all handlers.
#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub shared: Arc<EngineShared>,
    pub verifier: Arc<dyn Verifier>,
    pub pr_creator: Arc<dyn PrCreator>,
    pub policies: RetryPolicies,
    pub lease_secs: f64,
}

// ---------------------------------------------------------------------------
// Request / response types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct TicketFilter {
    /// Target state to claim from: "ready" (default) or "in_review".
    pub state: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ClaimRequest {
    pub agent_id: String,
    pub vm_id: Option<String>,
    pub project_id: Option<Uuid>,
    pub ticket_filter: Option<TicketFilter>,
}

#[derive(Debug, Serialize)]
pub struct ProjectInfo {
    pub id: Uuid,
    pub name: String,
    pub repo_url: Option<String>,
    pub base_branch: String,
}

impl From<&Project> for ProjectInfo {
    fn from(p: &Project) -> Self {
        Self {
            id: p.id,
            name: p.name.clone(),
            repo_url: p.repo_url.clone(),
            base_branch: p.base_branch.clone(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ClaimResponse {
    pub ticket: Option<Ticket>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project: Option<ProjectInfo>,
    /// Effective settings: project defaults overlaid with ticket
    /// overrides.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub settings: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lease_secs: Option<f64>,
    /// Advisory wait before the next claim when no ticket was available.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backoff_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct StartRequest {
    pub ticket_id: Uuid,
    pub agent_id: String,
    pub branch_name: String,
}

#[derive(Debug, Deserialize)]
pub struct HeartbeatRequest {
    pub agent_id: String,
    pub ticket_id: Uuid,
    pub progress: Option<String>,
    pub status_message: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct HeartbeatResponse {
    pub ok: bool,
    pub lease_expires: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
pub struct CompleteRequest {
    pub agent_id: String,
    pub ticket_id: Uuid,
    pub pr_url: Option<String>,
    pub branch_name: Option<String>,
    pub files_involved: Option<Vec<String>>,
    pub outputs: Option<serde_json::Value>,
}

#[derive(Debug, Serialize)]
pub struct CompleteResponse {
    pub ok: bool,
    pub state: TicketState,
}

#[derive(Debug, Deserialize)]
pub struct FailRequest {
    pub ticket_id: Uuid,
    pub agent_id: String,
    pub error_message: String,
}

#[derive(Debug, Serialize)]
pub struct FailResponse {
    pub ok: bool,
    pub category: String,
    pub retry: bool,
    pub next_delay_ms: u64,
    pub attempts_remaining: u32,
}

#[derive(Debug, Deserialize)]
pub struct ReleaseRequest {
    pub ticket_id: Uuid,
    pub agent_id: String,
    pub reason: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct OkResponse {
    pub ok: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub running: bool,
    pub active_executions: usize,
    pub pending_tickets: i64,
    pub max_concurrent: usize,
    pub uptime: u64,
    pub reaped_total: u64,
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/claim", post(claim))
        .route("/start", post(start))
        .route("/heartbeat", post(heartbeat))
        .route("/complete", post(complete))
        .route("/fail", post(fail))
        .route("/release", post(release))
        .route("/status", get(status))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serve the agent surface until the token is cancelled.
pub async fn run_server(
    state: AppState,
    bind: &str,
    port: u16,
    cancel: CancellationToken,
) -> Result<()> {
    let app = build_router(state);
    let addr: SocketAddr = format!("{bind}:{port}").parse()?;
    tracing::info!("agent surface listening on http://{addr}");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;
    tracing::info!("agent surface shut down");
    Ok(())
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn claim(
    State(state): State<AppState>,
    Json(req): Json<ClaimRequest>,
) -> Result<Json<ClaimResponse>, AppError> {
    if req.agent_id.trim().is_empty() {
        return Err(AppError::bad_request("agent_id must not be empty"));
    }

    let target = match req
        .ticket_filter
        .as_ref()
        .and_then(|f| f.state.as_deref())
        .unwrap_or("ready")
    {
        "ready" => TicketState::Ready,
        "in_review" => TicketState::InReview,
        other => {
            return Err(AppError::bad_request(format!(
                "unsupported claim target state: {other:?}"
            )));
        }
    };

    let ticket = match target {
        TicketState::InReview => {
            // Review rows already carry the sentinel assignment; this is
            // a discovery read, not a transition.
            ticket_db::next_in_review(&state.pool, req.project_id)
                .await
                .map_err(AppError::internal)?
        }
        _ => {
            let vm_id = req
                .vm_id
                .clone()
                .unwrap_or_else(|| format!("agent-{}", req.agent_id));
            ticket_db::claim_next(
                &state.pool,
                &req.agent_id,
                &vm_id,
                req.project_id,
                state.lease_secs,
            )
            .await
            .map_err(AppError::internal)?
        }
    };

    let Some(ticket) = ticket else {
        return Ok(Json(ClaimResponse {
            ticket: None,
            project: None,
            settings: None,
            lease_secs: None,
            backoff_ms: Some(EMPTY_CLAIM_BACKOFF_MS),
        }));
    };

    tracing::info!(
        ticket_id = %ticket.id,
        agent_id = %req.agent_id,
        claim_state = %target,
        "ticket claimed over HTTP"
    );

    let project = projects::get_project(&state.pool, ticket.project_id)
        .await
        .map_err(AppError::internal)?
        .ok_or_else(|| {
            AppError::internal(anyhow::anyhow!(
                "project {} missing for ticket {}",
                ticket.project_id,
                ticket.id
            ))
        })?;

    let settings = effective_settings(&project.settings, &ticket.metadata);

    Ok(Json(ClaimResponse {
        project: Some(ProjectInfo::from(&project)),
        settings: Some(settings),
        lease_secs: Some(state.lease_secs),
        backoff_ms: None,
        ticket: Some(ticket),
    }))
}

async fn start(
    State(state): State<AppState>,
    Json(req): Json<StartRequest>,
) -> Result<Json<OkResponse>, AppError> {
    let ticket = require_owned(&state.pool, req.ticket_id, &req.agent_id).await?;

    if ticket.state != TicketState::InProgress {
        return Err(AppError::conflict(format!(
            "ticket {} is {}, expected in_progress",
            ticket.id, ticket.state
        )));
    }

    dispatch::start_branch(&state.pool, req.ticket_id, &req.branch_name).await?;
    Ok(Json(OkResponse { ok: true }))
}

async fn heartbeat(
    State(state): State<AppState>,
    Json(req): Json<HeartbeatRequest>,
) -> Result<Json<HeartbeatResponse>, AppError> {
    let extended = ticket_db::heartbeat(&state.pool, req.ticket_id, &req.agent_id, state.lease_secs)
        .await
        .map_err(AppError::internal)?;

    if !extended {
        // The agent no longer owns this ticket (reaped, released, or
        // unknown). Not-found, and nothing was mutated.
        return Err(AppError::not_found(format!(
            "no leased ticket {} for agent {}",
            req.ticket_id, req.agent_id
        )));
    }

    if let Some(message) = req.progress.as_deref().or(req.status_message.as_deref()) {
        progress::append(&state.pool, req.ticket_id, &req.agent_id, message)
            .await
            .map_err(AppError::internal)?;
    }

    let ticket = ticket_db::get_ticket(&state.pool, req.ticket_id)
        .await
        .map_err(AppError::internal)?;

    Ok(Json(HeartbeatResponse {
        ok: true,
        lease_expires: ticket.and_then(|t| t.lease_expires),
    }))
}

async fn complete(
    State(state): State<AppState>,
    Json(req): Json<CompleteRequest>,
) -> Result<Json<CompleteResponse>, AppError> {
    let ticket = ticket_db::get_ticket(&state.pool, req.ticket_id)
        .await
        .map_err(AppError::internal)?
        .ok_or_else(|| AppError::not_found(format!("ticket {} not found", req.ticket_id)))?;

    // Idempotence: a duplicate complete after the pipeline already ran
    // (flaky network, agent retry) is a no-op success.
    match ticket.state {
        TicketState::Verifying
        | TicketState::InReview
        | TicketState::NeedsReview
        | TicketState::Done => {
            return Ok(Json(CompleteResponse {
                ok: true,
                state: ticket.state,
            }));
        }
        TicketState::InProgress => {}
        other => {
            return Err(AppError::conflict(format!(
                "ticket {} is {other}, expected in_progress",
                ticket.id
            )));
        }
    }

    require_owner(&ticket, &req.agent_id)?;

    dispatch::complete_to_verifying(
        &state.pool,
        req.ticket_id,
        req.branch_name.as_deref(),
        req.pr_url.as_deref(),
    )
    .await?;

    if req.files_involved.is_some() || req.outputs.is_some() {
        let artifact = NewArtifact {
            ticket_id: req.ticket_id,
            attempt: ticket.verification_attempts + 1,
            kind: "completion".to_owned(),
            content: serde_json::json!({
                "files_involved": req.files_involved,
                "outputs": req.outputs,
            }),
        };
        if let Err(e) = artifacts::insert_artifact(&state.pool, &artifact).await {
            tracing::warn!(
                ticket_id = %req.ticket_id,
                error = %e,
                "failed to record completion artifact (best-effort)"
            );
        }
    }

    pipeline::run_post_execution(
        &state.pool,
        state.verifier.as_ref(),
        state.pr_creator.as_ref(),
        req.ticket_id,
    )
    .await
    .map_err(AppError::internal)?;

    let final_state = ticket_db::get_ticket(&state.pool, req.ticket_id)
        .await
        .map_err(AppError::internal)?
        .map(|t| t.state)
        .unwrap_or(TicketState::Verifying);

    Ok(Json(CompleteResponse {
        ok: true,
        state: final_state,
    }))
}

async fn fail(
    State(state): State<AppState>,
    Json(req): Json<FailRequest>,
) -> Result<Json<FailResponse>, AppError> {
    let ticket = require_owned(&state.pool, req.ticket_id, &req.agent_id).await?;

    if ticket.state != TicketState::InProgress {
        return Err(AppError::conflict(format!(
            "ticket {} is {}, expected in_progress",
            ticket.id, ticket.state
        )));
    }

    // This failure is attempt retry_count + 1; the classifier sees the
    // count as it will stand once the failure is recorded.
    let decision = classify(
        &state.policies,
        &req.error_message,
        ticket.retry_count as u32 + 1,
    );
    let strategy = serde_json::to_value(&decision)
        .map_err(|e| AppError::internal(anyhow::Error::from(e)))?;

    tracing::info!(
        ticket_id = %ticket.id,
        agent_id = %req.agent_id,
        category = decision.category.as_str(),
        should_retry = decision.should_retry,
        "agent reported failure"
    );

    if decision.should_retry {
        dispatch::fail_retriable_to_ready(&state.pool, ticket.id, &req.error_message, strategy)
            .await?;
    } else {
        dispatch::hold_ticket(
            &state.pool,
            ticket.id,
            decision.category.as_str(),
            &req.error_message,
            strategy,
        )
        .await?;
    }

    Ok(Json(FailResponse {
        ok: true,
        category: decision.category.as_str().to_owned(),
        retry: decision.should_retry,
        next_delay_ms: decision.next_delay_ms,
        attempts_remaining: decision.attempts_remaining,
    }))
}

async fn release(
    State(state): State<AppState>,
    Json(req): Json<ReleaseRequest>,
) -> Result<Json<OkResponse>, AppError> {
    let ticket = ticket_db::get_ticket(&state.pool, req.ticket_id)
        .await
        .map_err(AppError::internal)?
        .ok_or_else(|| AppError::not_found(format!("ticket {} not found", req.ticket_id)))?;

    // A retried release after the first one landed.
    if ticket.state == TicketState::Ready {
        return Ok(Json(OkResponse { ok: true }));
    }

    require_owner(&ticket, &req.agent_id)?;
    dispatch::release_to_ready(&state.pool, req.ticket_id).await?;

    let reason = req.reason.as_deref().unwrap_or("voluntary release");
    if let Err(e) =
        progress::append(&state.pool, req.ticket_id, &req.agent_id, &format!("released: {reason}"))
            .await
    {
        tracing::debug!(ticket_id = %req.ticket_id, error = %e, "release note append failed");
    }

    Ok(Json(OkResponse { ok: true }))
}

async fn status(State(state): State<AppState>) -> Result<Json<StatusResponse>, AppError> {
    let counts = ticket_db::count_by_state(&state.pool)
        .await
        .map_err(AppError::internal)?;

    Ok(Json(StatusResponse {
        running: state.shared.running.load(Ordering::SeqCst),
        active_executions: state.shared.active_count(),
        pending_tickets: counts.ready,
        max_concurrent: state.shared.max_concurrent,
        uptime: state.shared.started_at.elapsed().as_secs(),
        reaped_total: state.shared.reaped_total.load(Ordering::Relaxed),
    }))
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Load a ticket and require that `agent_id` owns it.
async fn require_owned(pool: &PgPool, ticket_id: Uuid, agent_id: &str) -> Result<Ticket, AppError> {
    let ticket = ticket_db::get_ticket(pool, ticket_id)
        .await
        .map_err(AppError::internal)?
        .ok_or_else(|| AppError::not_found(format!("ticket {ticket_id} not found")))?;
    require_owner(&ticket, agent_id)?;
    Ok(ticket)
}

fn require_owner(ticket: &Ticket, agent_id: &str) -> Result<(), AppError> {
    if ticket.assignee_id.as_deref() != Some(agent_id) {
        return Err(AppError::forbidden(format!(
            "ticket {} is not assigned to agent {agent_id}",
            ticket.id
        )));
    }
    Ok(())
}

/// Merge project default settings with a ticket's overrides.
///
/// Overrides live under the ticket's `metadata.settings`. Objects merge
/// shallowly with the ticket side winning; the `mcp_servers` lists union
/// instead, preserving project order first.
pub fn effective_settings(
    project_settings: &serde_json::Value,
    ticket_metadata: &serde_json::Value,
) -> serde_json::Value {
    let mut merged = match project_settings {
        serde_json::Value::Object(map) => map.clone(),
        _ => serde_json::Map::new(),
    };

    let overrides = match ticket_metadata.get("settings") {
        Some(serde_json::Value::Object(map)) => map.clone(),
        _ => return serde_json::Value::Object(merged),
    };

    for (key, value) in overrides {
        if key == "mcp_servers" {
            let mut servers: Vec<serde_json::Value> = merged
                .get("mcp_servers")
                .and_then(|v| v.as_array())
                .cloned()
                .unwrap_or_default();
            if let Some(extra) = value.as_array() {
                for server in extra {
                    if !servers.contains(server) {
                        servers.push(server.clone());
                    }
                }
            }
            merged.insert(key, serde_json::Value::Array(servers));
        } else {
            merged.insert(key, value);
        }
    }

    serde_json::Value::Object(merged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn settings_merge_overlays_ticket_values() {
        let project = json!({"model": "default", "timeout_secs": 300});
        let metadata = json!({"settings": {"model": "fast"}});
        let merged = effective_settings(&project, &metadata);
        assert_eq!(merged["model"], "fast");
        assert_eq!(merged["timeout_secs"], 300);
    }

    #[test]
    fn settings_merge_unions_mcp_servers() {
        let project = json!({"mcp_servers": ["search", "docs"]});
        let metadata = json!({"settings": {"mcp_servers": ["docs", "browser"]}});
        let merged = effective_settings(&project, &metadata);
        assert_eq!(merged["mcp_servers"], json!(["search", "docs", "browser"]));
    }

    #[test]
    fn settings_merge_without_overrides_returns_project() {
        let project = json!({"model": "default"});
        let metadata = json!({});
        let merged = effective_settings(&project, &metadata);
        assert_eq!(merged, project);
    }

    #[test]
    fn settings_merge_tolerates_non_object_settings() {
        let project = json!(null);
        let metadata = json!({"settings": {"model": "fast"}});
        let merged = effective_settings(&project, &metadata);
        assert_eq!(merged["model"], "fast");
    }
}
