//! Integration tests for the agent-facing HTTP surface.
//!
//! Drives the router directly with `tower::ServiceExt::oneshot` against a
//! real database, with scripted verifier and PR-creator stubs.

use std::sync::Arc;
use std::sync::Mutex;

use anyhow::Result;
use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use tower::ServiceExt;
use uuid::Uuid;

use drover_core::github::{PrCreator, PrRequest};
use drover_core::retry::RetryPolicies;
use drover_core::scheduler::EngineShared;
use drover_core::server::{build_router, AppState};
use drover_core::verify::{VerificationRequest, Verdict, VerdictStatus, Verifier};
use drover_db::models::{TicketState, SENTINEL_AGENT};
use drover_db::queries::projects::{insert_project, NewProject};
use drover_db::queries::tickets::{self as db, NewTicket};
use drover_test_utils::TestDb;

// ---------------------------------------------------------------------------
// Stub collaborators
// ---------------------------------------------------------------------------

/// Verifier whose verdicts are controlled per test.
struct SwitchVerifier {
    pass: Mutex<bool>,
}

impl SwitchVerifier {
    fn passing() -> Arc<Self> {
        Arc::new(Self {
            pass: Mutex::new(true),
        })
    }

    fn set_pass(&self, pass: bool) {
        *self.pass.lock().unwrap() = pass;
    }
}

#[async_trait]
impl Verifier for SwitchVerifier {
    fn name(&self) -> &str {
        "switch"
    }

    async fn verify(&self, _request: &VerificationRequest) -> Result<Verdict> {
        let pass = *self.pass.lock().unwrap();
        Ok(Verdict {
            status: if pass {
                VerdictStatus::Passed
            } else {
                VerdictStatus::Failed
            },
            ready_for_pr: pass,
            feedback_for_agent: serde_json::json!({"summary": "stub feedback"}),
            evidence: serde_json::Value::Null,
        })
    }
}

struct StubPrCreator;

#[async_trait]
impl PrCreator for StubPrCreator {
    async fn create_pr(&self, request: &PrRequest) -> Result<String> {
        Ok(format!(
            "https://github.com/acme/widgets/pull/1?head={}",
            request.head_branch
        ))
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

struct Harness {
    db: TestDb,
    pool: sqlx::PgPool,
    verifier: Arc<SwitchVerifier>,
    router: Router,
    project_id: Uuid,
}

async fn harness() -> Harness {
    let db = TestDb::create().await;
    let pool = db.pool.clone();

    let project = insert_project(
        &pool,
        &NewProject {
            tenant_id: Uuid::new_v4(),
            name: "server-project",
            repo_url: Some("https://github.com/acme/widgets"),
            base_branch: "main",
            settings: serde_json::json!({"mcp_servers": ["search"], "model": "default"}),
        },
    )
    .await
    .unwrap();

    let verifier = SwitchVerifier::passing();
    let state = AppState {
        pool: pool.clone(),
        shared: Arc::new(EngineShared::new(4)),
        verifier: Arc::clone(&verifier) as Arc<dyn Verifier>,
        pr_creator: Arc::new(StubPrCreator),
        policies: RetryPolicies::default(),
        lease_secs: 120.0,
    };

    Harness {
        db,
        pool,
        verifier,
        router: build_router(state),
        project_id: project.id,
    }
}

impl Harness {
    /// Seed one pull-mode ticket and activate it to ready.
    async fn seed_ready(&self, title: &str) -> Uuid {
        let build_id = Uuid::new_v4();
        let ticket = db::insert_ticket(
            &self.pool,
            &NewTicket::draft(Uuid::new_v4(), self.project_id, title).with_build(build_id),
        )
        .await
        .unwrap();
        db::activate_build(&self.pool, build_id).await.unwrap();
        ticket.id
    }

    async fn post(&self, uri: &str, body: serde_json::Value) -> (StatusCode, serde_json::Value) {
        let request = Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), 1_048_576)
            .await
            .unwrap();
        let json = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, json)
    }

    async fn get(&self, uri: &str) -> (StatusCode, serde_json::Value) {
        let request = Request::builder().uri(uri).body(Body::empty()).unwrap();
        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), 1_048_576)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    async fn state_of(&self, ticket_id: Uuid) -> TicketState {
        db::get_ticket(&self.pool, ticket_id)
            .await
            .unwrap()
            .unwrap()
            .state
    }

    async fn teardown(self) {
        self.db.teardown().await;
    }
}

// ---------------------------------------------------------------------------
// Claim
// ---------------------------------------------------------------------------

#[tokio::test]
async fn claim_empty_queue_returns_null_with_backoff() {
    let h = harness().await;

    let (status, json) = h
        .post("/claim", serde_json::json!({"agent_id": "a1"}))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert!(json["ticket"].is_null());
    assert!(json["backoff_ms"].as_u64().unwrap() > 0);

    h.teardown().await;
}

#[tokio::test]
async fn claim_returns_ticket_with_project_and_merged_settings() {
    let h = harness().await;
    let ticket_id = h.seed_ready("claimable").await;

    // Ticket-level override merged over project defaults.
    sqlx::query(
        "UPDATE tickets SET metadata = '{\"settings\": {\"mcp_servers\": [\"browser\"], \"model\": \"fast\"}}'::jsonb WHERE id = $1",
    )
    .bind(ticket_id)
    .execute(&h.pool)
    .await
    .unwrap();

    let (status, json) = h
        .post("/claim", serde_json::json!({"agent_id": "a1"}))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["ticket"]["id"], ticket_id.to_string());
    assert_eq!(json["ticket"]["state"], "in_progress");
    assert_eq!(json["project"]["base_branch"], "main");
    assert_eq!(json["settings"]["model"], "fast");
    assert_eq!(
        json["settings"]["mcp_servers"],
        serde_json::json!(["search", "browser"])
    );
    assert_eq!(json["lease_secs"], 120.0);

    assert_eq!(h.state_of(ticket_id).await, TicketState::InProgress);

    h.teardown().await;
}

#[tokio::test]
async fn claim_validates_input() {
    let h = harness().await;

    let (status, _) = h.post("/claim", serde_json::json!({"agent_id": ""})).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = h
        .post(
            "/claim",
            serde_json::json!({"agent_id": "a1", "ticket_filter": {"state": "done"}}),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    h.teardown().await;
}

#[tokio::test]
async fn concurrent_http_claims_hand_out_distinct_tickets() {
    let h = harness().await;
    let t1 = h.seed_ready("first").await;

    // Two racing claimants on one ready ticket: exactly one gets it.
    let (r1, r2) = tokio::join!(
        h.post("/claim", serde_json::json!({"agent_id": "a1"})),
        h.post("/claim", serde_json::json!({"agent_id": "a2"})),
    );

    let got: Vec<bool> = [&r1, &r2]
        .iter()
        .map(|(_, json)| !json["ticket"].is_null())
        .collect();
    assert_eq!(
        got.iter().filter(|g| **g).count(),
        1,
        "exactly one claim should win: {r1:?} {r2:?}"
    );

    let t = db::get_ticket(&h.pool, t1).await.unwrap().unwrap();
    assert_eq!(t.state, TicketState::InProgress);

    h.teardown().await;
}

// ---------------------------------------------------------------------------
// Start / heartbeat
// ---------------------------------------------------------------------------

#[tokio::test]
async fn start_confirms_branch_and_enforces_ownership() {
    let h = harness().await;
    let ticket_id = h.seed_ready("branching").await;
    h.post("/claim", serde_json::json!({"agent_id": "a1"})).await;

    let (status, _) = h
        .post(
            "/start",
            serde_json::json!({"ticket_id": ticket_id, "agent_id": "a1", "branch_name": "feat/t1"}),
        )
        .await;
    assert_eq!(status, StatusCode::OK);

    let t = db::get_ticket(&h.pool, ticket_id).await.unwrap().unwrap();
    assert_eq!(t.branch_name.as_deref(), Some("feat/t1"));

    // Someone else's start is forbidden.
    let (status, _) = h
        .post(
            "/start",
            serde_json::json!({"ticket_id": ticket_id, "agent_id": "a2", "branch_name": "feat/x"}),
        )
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    // An unknown ticket is not found.
    let (status, _) = h
        .post(
            "/start",
            serde_json::json!({"ticket_id": Uuid::new_v4(), "agent_id": "a1", "branch_name": "b"}),
        )
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    h.teardown().await;
}

#[tokio::test]
async fn heartbeat_extends_lease_and_appends_progress() {
    let h = harness().await;
    let ticket_id = h.seed_ready("beating").await;
    h.post("/claim", serde_json::json!({"agent_id": "a1"})).await;

    let before = db::get_ticket(&h.pool, ticket_id)
        .await
        .unwrap()
        .unwrap()
        .lease_expires
        .unwrap();

    let (status, json) = h
        .post(
            "/heartbeat",
            serde_json::json!({"agent_id": "a1", "ticket_id": ticket_id, "progress": "half done"}),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["ok"], true);

    // A second identical heartbeat extends again and changes nothing else.
    let (status, _) = h
        .post(
            "/heartbeat",
            serde_json::json!({"agent_id": "a1", "ticket_id": ticket_id, "progress": "half done"}),
        )
        .await;
    assert_eq!(status, StatusCode::OK);

    let t = db::get_ticket(&h.pool, ticket_id).await.unwrap().unwrap();
    assert!(t.lease_expires.unwrap() >= before);
    assert_eq!(t.state, TicketState::InProgress);

    let trace = drover_db::queries::progress::list_for_ticket(&h.pool, ticket_id)
        .await
        .unwrap();
    assert_eq!(trace.len(), 2);
    assert_eq!(trace[0].message, "half done");

    h.teardown().await;
}

#[tokio::test]
async fn heartbeat_after_loss_is_not_found_without_mutation() {
    let h = harness().await;
    let ticket_id = h.seed_ready("lost").await;
    h.post("/claim", serde_json::json!({"agent_id": "a1"})).await;

    // The reaper takes the ticket back.
    sqlx::query("UPDATE tickets SET lease_expires = NOW() - INTERVAL '1 second' WHERE id = $1")
        .bind(ticket_id)
        .execute(&h.pool)
        .await
        .unwrap();
    db::release_expired_leases(&h.pool).await.unwrap();
    assert_eq!(h.state_of(ticket_id).await, TicketState::Ready);

    let (status, _) = h
        .post(
            "/heartbeat",
            serde_json::json!({"agent_id": "a1", "ticket_id": ticket_id, "progress": "late"}),
        )
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    // Nothing mutated: still ready, no late progress entry.
    assert_eq!(h.state_of(ticket_id).await, TicketState::Ready);
    let trace = drover_db::queries::progress::list_for_ticket(&h.pool, ticket_id)
        .await
        .unwrap();
    assert!(trace.is_empty());

    h.teardown().await;
}

// ---------------------------------------------------------------------------
// Complete (scenario 1) and idempotence
// ---------------------------------------------------------------------------

#[tokio::test]
async fn happy_path_single_ticket_ends_in_review() {
    let h = harness().await;
    let ticket_id = h.seed_ready("t1").await;

    let (status, json) = h
        .post("/claim", serde_json::json!({"agent_id": "a1"}))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["ticket"]["id"], ticket_id.to_string());

    let (status, json) = h
        .post(
            "/complete",
            serde_json::json!({
                "agent_id": "a1",
                "ticket_id": ticket_id,
                "branch_name": "feat/t1",
                "files_involved": ["src/lib.rs"],
            }),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["state"], "in_review");

    let t = db::get_ticket(&h.pool, ticket_id).await.unwrap().unwrap();
    assert_eq!(t.state, TicketState::InReview);
    assert!(t.pr_url.as_deref().unwrap().contains("feat/t1"));
    assert_eq!(t.assignee_id.as_deref(), Some(SENTINEL_AGENT));

    h.teardown().await;
}

#[tokio::test]
async fn duplicate_complete_is_noop_success() {
    let h = harness().await;
    let ticket_id = h.seed_ready("flaky-network").await;
    h.post("/claim", serde_json::json!({"agent_id": "a1"})).await;

    let body = serde_json::json!({
        "agent_id": "a1",
        "ticket_id": ticket_id,
        "branch_name": "feat/t1",
    });
    let (status, first) = h.post("/complete", body.clone()).await;
    assert_eq!(status, StatusCode::OK);

    let (status, second) = h.post("/complete", body).await;
    assert_eq!(status, StatusCode::OK, "retried complete is a no-op success");
    assert_eq!(second["state"], first["state"]);

    h.teardown().await;
}

#[tokio::test]
async fn complete_failed_verification_parks_needs_review() {
    let h = harness().await;
    let ticket_id = h.seed_ready("will-fail").await;
    h.verifier.set_pass(false);
    h.post("/claim", serde_json::json!({"agent_id": "a1"})).await;

    let (status, json) = h
        .post(
            "/complete",
            serde_json::json!({"agent_id": "a1", "ticket_id": ticket_id, "branch_name": "feat/f"}),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["state"], "needs_review");

    h.teardown().await;
}

#[tokio::test]
async fn complete_on_ready_ticket_is_conflict() {
    let h = harness().await;
    let ticket_id = h.seed_ready("unclaimed").await;

    let (status, json) = h
        .post(
            "/complete",
            serde_json::json!({"agent_id": "a1", "ticket_id": ticket_id, "branch_name": "b"}),
        )
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert!(
        json["error"].as_str().unwrap().contains("ready"),
        "conflict should carry the current state: {json}"
    );

    h.teardown().await;
}

// ---------------------------------------------------------------------------
// Fail (scenario 5) and release
// ---------------------------------------------------------------------------

#[tokio::test]
async fn three_retriable_failures_end_on_hold_with_exhausted_budget() {
    let h = harness().await;
    let ticket_id = h.seed_ready("t5").await;

    // The default unknown-category budget is 3. Fails one and two route
    // back to ready; the third exhausts the budget and parks the ticket.
    for round in 1..=2 {
        h.post("/claim", serde_json::json!({"agent_id": "a1"})).await;
        let (status, json) = h
            .post(
                "/fail",
                serde_json::json!({
                    "agent_id": "a1",
                    "ticket_id": ticket_id,
                    "error_message": "mysterious agent failure",
                }),
            )
            .await;
        assert_eq!(status, StatusCode::OK, "round {round}");
        assert_eq!(json["retry"], true, "round {round}");
        assert_eq!(h.state_of(ticket_id).await, TicketState::Ready);

        let t = db::get_ticket(&h.pool, ticket_id).await.unwrap().unwrap();
        assert_eq!(t.retry_count, round);
    }

    h.post("/claim", serde_json::json!({"agent_id": "a1"})).await;
    let (status, json) = h
        .post(
            "/fail",
            serde_json::json!({
                "agent_id": "a1",
                "ticket_id": ticket_id,
                "error_message": "mysterious agent failure",
            }),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["retry"], false);
    assert_eq!(json["attempts_remaining"], 0);

    let t = db::get_ticket(&h.pool, ticket_id).await.unwrap().unwrap();
    assert_eq!(t.state, TicketState::OnHold);
    assert_eq!(t.hold_reason.as_deref(), Some("unknown"));
    assert_eq!(t.retry_count, 3, "the exhausting failure still counts");

    h.teardown().await;
}

#[tokio::test]
async fn spec_ambiguity_goes_straight_on_hold() {
    let h = harness().await;
    let ticket_id = h.seed_ready("vague").await;
    h.post("/claim", serde_json::json!({"agent_id": "a1"})).await;

    let (status, json) = h
        .post(
            "/fail",
            serde_json::json!({
                "agent_id": "a1",
                "ticket_id": ticket_id,
                "error_message": "acceptance criteria ambiguous, clarification needed",
            }),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["category"], "spec_ambiguity");
    assert_eq!(json["retry"], false);

    let t = db::get_ticket(&h.pool, ticket_id).await.unwrap().unwrap();
    assert_eq!(t.state, TicketState::OnHold);
    assert_eq!(t.hold_reason.as_deref(), Some("spec_ambiguity"));

    h.teardown().await;
}

#[tokio::test]
async fn release_yields_ticket_back_to_queue() {
    let h = harness().await;
    let ticket_id = h.seed_ready("yielded").await;
    h.post("/claim", serde_json::json!({"agent_id": "a1"})).await;

    let (status, _) = h
        .post(
            "/release",
            serde_json::json!({"agent_id": "a1", "ticket_id": ticket_id, "reason": "shutting down"}),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(h.state_of(ticket_id).await, TicketState::Ready);

    // Released rows are claimable by someone else.
    let (_, json) = h
        .post("/claim", serde_json::json!({"agent_id": "a2"}))
        .await;
    assert_eq!(json["ticket"]["id"], ticket_id.to_string());

    // A duplicate release from the old owner is a no-op... after a2's
    // claim the row is in_progress under a2, so the old owner gets 403.
    let (status, _) = h
        .post(
            "/release",
            serde_json::json!({"agent_id": "a1", "ticket_id": ticket_id}),
        )
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    h.teardown().await;
}

// ---------------------------------------------------------------------------
// Sentinel claim and status
// ---------------------------------------------------------------------------

#[tokio::test]
async fn sentinel_claims_in_review_tickets() {
    let h = harness().await;
    let ticket_id = h.seed_ready("reviewable").await;
    h.post("/claim", serde_json::json!({"agent_id": "a1"})).await;
    h.post(
        "/complete",
        serde_json::json!({"agent_id": "a1", "ticket_id": ticket_id, "branch_name": "feat/t1"}),
    )
    .await;
    assert_eq!(h.state_of(ticket_id).await, TicketState::InReview);

    let (status, json) = h
        .post(
            "/claim",
            serde_json::json!({"agent_id": "sentinel-agent", "ticket_filter": {"state": "in_review"}}),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["ticket"]["id"], ticket_id.to_string());
    assert_eq!(json["ticket"]["state"], "in_review");
    assert_eq!(json["ticket"]["assignee_id"], "sentinel-agent");

    h.teardown().await;
}

#[tokio::test]
async fn status_reports_engine_shape() {
    let h = harness().await;
    h.seed_ready("pending-1").await;
    h.seed_ready("pending-2").await;

    let (status, json) = h.get("/status").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["running"], false, "no scheduler in this harness");
    assert_eq!(json["activeExecutions"], 0);
    assert_eq!(json["pendingTickets"], 2);
    assert_eq!(json["maxConcurrent"], 4);
    assert!(json["uptime"].is_u64());

    h.teardown().await;
}
