//! Integration tests for the post-execution pipeline: verification,
//! PR creation, and the in_review/needs_review/done routing.

use std::sync::Mutex;

use anyhow::Result;
use async_trait::async_trait;
use uuid::Uuid;

use drover_core::github::{PrCreator, PrRequest};
use drover_core::pipeline::{run_post_execution, PipelineOutcome};
use drover_core::state::dispatch;
use drover_core::verify::{VerificationRequest, Verdict, VerdictStatus, Verifier};
use drover_db::models::{TicketState, SENTINEL_AGENT};
use drover_db::queries::artifacts;
use drover_db::queries::projects::{insert_project, NewProject};
use drover_db::queries::tickets::{self as db, NewTicket};
use drover_test_utils::TestDb;

// ---------------------------------------------------------------------------
// Stub collaborators
// ---------------------------------------------------------------------------

/// Verifier returning a scripted sequence of verdicts (or errors).
struct ScriptedVerifier {
    script: Mutex<Vec<Result<Verdict, String>>>,
    requests: Mutex<Vec<VerificationRequest>>,
}

impl ScriptedVerifier {
    fn new(script: Vec<Result<Verdict, String>>) -> Self {
        Self {
            script: Mutex::new(script),
            requests: Mutex::new(Vec::new()),
        }
    }

    fn passing() -> Self {
        Self::new(vec![Ok(passed_verdict())])
    }

    fn seen_requests(&self) -> Vec<VerificationRequest> {
        self.requests.lock().unwrap().clone()
    }
}

fn passed_verdict() -> Verdict {
    Verdict {
        status: VerdictStatus::Passed,
        ready_for_pr: true,
        feedback_for_agent: serde_json::Value::Null,
        evidence: serde_json::json!({"phases": ["static", "automated", "sentinel"]}),
    }
}

fn failed_verdict(feedback: &str) -> Verdict {
    Verdict {
        status: VerdictStatus::Failed,
        ready_for_pr: false,
        feedback_for_agent: serde_json::json!({"summary": feedback}),
        evidence: serde_json::Value::Null,
    }
}

#[async_trait]
impl Verifier for ScriptedVerifier {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn verify(&self, request: &VerificationRequest) -> Result<Verdict> {
        self.requests.lock().unwrap().push(request.clone());
        let mut script = self.script.lock().unwrap();
        if script.is_empty() {
            anyhow::bail!("scripted verifier exhausted");
        }
        script.remove(0).map_err(|msg| anyhow::anyhow!(msg))
    }
}

/// PR creator recording requests; optionally failing.
struct StubPrCreator {
    fail: bool,
    requests: Mutex<Vec<PrRequest>>,
}

impl StubPrCreator {
    fn ok() -> Self {
        Self {
            fail: false,
            requests: Mutex::new(Vec::new()),
        }
    }

    fn failing() -> Self {
        Self {
            fail: true,
            requests: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl PrCreator for StubPrCreator {
    async fn create_pr(&self, request: &PrRequest) -> Result<String> {
        self.requests.lock().unwrap().push(request.clone());
        if self.fail {
            anyhow::bail!("stub PR creation failure");
        }
        Ok(format!(
            "https://github.com/acme/widgets/pull/42?head={}",
            request.head_branch
        ))
    }
}

// ---------------------------------------------------------------------------
// Test helpers
// ---------------------------------------------------------------------------

async fn create_project(pool: &sqlx::PgPool, repo_url: Option<&str>) -> Uuid {
    let project = insert_project(
        pool,
        &NewProject {
            tenant_id: Uuid::new_v4(),
            name: "pipeline-project",
            repo_url,
            base_branch: "main",
            settings: serde_json::json!({}),
        },
    )
    .await
    .unwrap();
    project.id
}

/// Seed a ticket in `verifying` with the given branch.
async fn verifying_ticket(pool: &sqlx::PgPool, project_id: Uuid, branch: Option<&str>) -> Uuid {
    let build_id = Uuid::new_v4();
    let ticket = db::insert_ticket(
        pool,
        &NewTicket::draft(Uuid::new_v4(), project_id, "verify me").with_build(build_id),
    )
    .await
    .unwrap();
    db::activate_build(pool, build_id).await.unwrap();
    assert!(db::claim(pool, ticket.id, "vm-p", 120.0).await.unwrap());
    dispatch::complete_to_verifying(pool, ticket.id, branch, None)
        .await
        .unwrap();
    ticket.id
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn passed_verdict_promotes_to_in_review() {
    let db = TestDb::create().await;
    let pool = db.pool.clone();
    let project_id = create_project(&pool, Some("https://github.com/acme/widgets")).await;
    let ticket_id = verifying_ticket(&pool, project_id, Some("feat/t1")).await;

    let verifier = ScriptedVerifier::passing();
    let pr = StubPrCreator::ok();
    let outcome = run_post_execution(&pool, &verifier, &pr, ticket_id)
        .await
        .unwrap();

    let pr_url = match outcome {
        PipelineOutcome::Promoted { pr_url } => pr_url,
        other => panic!("expected promotion, got {other:?}"),
    };
    assert!(pr_url.contains("feat/t1"));

    let t = db::get_ticket(&pool, ticket_id).await.unwrap().unwrap();
    assert_eq!(t.state, TicketState::InReview);
    assert_eq!(t.pr_url.as_deref(), Some(pr_url.as_str()));
    assert_eq!(t.assignee_id.as_deref(), Some(SENTINEL_AGENT));

    // The verifier saw the right request shape.
    let requests = verifier.seen_requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].branch_name, "feat/t1");
    assert_eq!(requests[0].attempt, 1);
    assert_eq!(requests[0].phases, vec!["static", "automated", "sentinel"]);

    // The PR targeted the project's base branch.
    let prs = pr.requests.lock().unwrap();
    assert_eq!(prs.len(), 1);
    assert_eq!(prs[0].base_branch, "main");

    db.teardown().await;
}

#[tokio::test]
async fn failed_verdict_parks_with_feedback_artifact() {
    let db = TestDb::create().await;
    let pool = db.pool.clone();
    let project_id = create_project(&pool, Some("https://github.com/acme/widgets")).await;
    let ticket_id = verifying_ticket(&pool, project_id, Some("feat/t1")).await;

    let verifier = ScriptedVerifier::new(vec![Ok(failed_verdict("tests are red"))]);
    let pr = StubPrCreator::ok();
    let outcome = run_post_execution(&pool, &verifier, &pr, ticket_id)
        .await
        .unwrap();
    assert_eq!(outcome, PipelineOutcome::NeedsReview);

    let t = db::get_ticket(&pool, ticket_id).await.unwrap().unwrap();
    assert_eq!(t.state, TicketState::NeedsReview);

    let feedback = artifacts::list_for_attempt(&pool, ticket_id, 1, "verification_feedback")
        .await
        .unwrap();
    assert_eq!(feedback.len(), 1);
    assert_eq!(feedback[0].content["feedback"]["summary"], "tests are red");
    assert_eq!(feedback[0].content["replayable"], true);

    assert!(
        pr.requests.lock().unwrap().is_empty(),
        "no PR for a failed verification"
    );

    db.teardown().await;
}

#[tokio::test]
async fn failure_then_replay_then_pass() {
    let db = TestDb::create().await;
    let pool = db.pool.clone();
    let project_id = create_project(&pool, Some("https://github.com/acme/widgets")).await;
    let ticket_id = verifying_ticket(&pool, project_id, Some("feat/t1")).await;

    // Attempt 1 fails; the failed verdict charges the attempt counter.
    let verifier = ScriptedVerifier::new(vec![Ok(failed_verdict("close, not quite"))]);
    let pr = StubPrCreator::ok();
    run_post_execution(&pool, &verifier, &pr, ticket_id)
        .await
        .unwrap();
    let t = db::get_ticket(&pool, ticket_id).await.unwrap().unwrap();
    assert_eq!(t.state, TicketState::NeedsReview);
    assert_eq!(t.verification_attempts, 1);

    // Replay driver routes it back; a second pass through claim and
    // complete lands in verifying again.
    dispatch::replay_ticket(&pool, ticket_id).await.unwrap();
    assert!(db::claim(&pool, ticket_id, "vm-p2", 120.0).await.unwrap());
    dispatch::complete_to_verifying(&pool, ticket_id, Some("feat/t1"), None)
        .await
        .unwrap();

    // The second verification runs as attempt 2 with no manual help.
    let verifier = ScriptedVerifier::passing();
    let outcome = run_post_execution(&pool, &verifier, &pr, ticket_id)
        .await
        .unwrap();
    assert!(matches!(outcome, PipelineOutcome::Promoted { .. }));
    assert_eq!(verifier.seen_requests()[0].attempt, 2);

    let t = db::get_ticket(&pool, ticket_id).await.unwrap().unwrap();
    assert_eq!(t.state, TicketState::InReview);

    db.teardown().await;
}

#[tokio::test]
async fn replay_cycle_exhausts_attempts() {
    let db = TestDb::create().await;
    let pool = db.pool.clone();
    let project_id = create_project(&pool, Some("https://github.com/acme/widgets")).await;
    let ticket_id = verifying_ticket(&pool, project_id, Some("feat/t1")).await;

    let pr = StubPrCreator::ok();
    for expected_attempt in 1..=3 {
        let verifier = ScriptedVerifier::new(vec![Ok(failed_verdict("still wrong"))]);
        run_post_execution(&pool, &verifier, &pr, ticket_id)
            .await
            .unwrap();
        assert_eq!(verifier.seen_requests()[0].attempt, expected_attempt);

        let t = db::get_ticket(&pool, ticket_id).await.unwrap().unwrap();
        assert_eq!(t.state, TicketState::NeedsReview);
        assert_eq!(t.verification_attempts, expected_attempt);

        if expected_attempt < 3 {
            dispatch::replay_ticket(&pool, ticket_id).await.unwrap();
            assert!(
                db::claim(&pool, ticket_id, "vm-again", 120.0).await.unwrap()
            );
            dispatch::complete_to_verifying(&pool, ticket_id, Some("feat/t1"), None)
                .await
                .unwrap();
        }
    }

    // Attempts 1 and 2 are marked replayable; attempt 3 is the end of
    // the budget.
    for (attempt, replayable) in [(1, true), (2, true), (3, false)] {
        let feedback =
            artifacts::list_for_attempt(&pool, ticket_id, attempt, "verification_feedback")
                .await
                .unwrap();
        assert_eq!(feedback.len(), 1, "attempt {attempt}");
        assert_eq!(
            feedback[0].content["replayable"], replayable,
            "attempt {attempt}"
        );
    }

    db.teardown().await;
}

#[tokio::test]
async fn verifier_error_preserves_work_in_needs_review() {
    let db = TestDb::create().await;
    let pool = db.pool.clone();
    let project_id = create_project(&pool, Some("https://github.com/acme/widgets")).await;
    let ticket_id = verifying_ticket(&pool, project_id, Some("feat/t1")).await;

    let verifier = ScriptedVerifier::new(vec![Err("verifier unreachable".to_owned())]);
    let pr = StubPrCreator::ok();
    let outcome = run_post_execution(&pool, &verifier, &pr, ticket_id)
        .await
        .unwrap();
    assert_eq!(outcome, PipelineOutcome::NeedsReview);

    let t = db::get_ticket(&pool, ticket_id).await.unwrap().unwrap();
    assert_eq!(t.state, TicketState::NeedsReview, "the push is not lost");
    assert_eq!(
        t.verification_attempts, 0,
        "no verdict was produced, so no attempt is charged"
    );

    let errors = artifacts::list_for_attempt(&pool, ticket_id, 1, "verifier_error")
        .await
        .unwrap();
    assert_eq!(errors.len(), 1);

    db.teardown().await;
}

#[tokio::test]
async fn pr_failure_preserves_verified_work() {
    let db = TestDb::create().await;
    let pool = db.pool.clone();
    let project_id = create_project(&pool, Some("https://github.com/acme/widgets")).await;
    let ticket_id = verifying_ticket(&pool, project_id, Some("feat/t1")).await;

    let verifier = ScriptedVerifier::passing();
    let pr = StubPrCreator::failing();
    let outcome = run_post_execution(&pool, &verifier, &pr, ticket_id)
        .await
        .unwrap();
    assert_eq!(outcome, PipelineOutcome::NeedsReview);

    let t = db::get_ticket(&pool, ticket_id).await.unwrap().unwrap();
    assert_eq!(t.state, TicketState::NeedsReview);
    assert_eq!(
        t.verification_attempts, 0,
        "a PR failure is not a failed verification"
    );

    let errors = artifacts::list_for_attempt(&pool, ticket_id, 1, "pr_error")
        .await
        .unwrap();
    assert_eq!(errors.len(), 1);

    db.teardown().await;
}

#[tokio::test]
async fn missing_repo_short_circuits_to_done() {
    let db = TestDb::create().await;
    let pool = db.pool.clone();
    let project_id = create_project(&pool, None).await;
    let ticket_id = verifying_ticket(&pool, project_id, Some("feat/t1")).await;

    let verifier = ScriptedVerifier::new(vec![]);
    let pr = StubPrCreator::ok();
    let outcome = run_post_execution(&pool, &verifier, &pr, ticket_id)
        .await
        .unwrap();
    assert_eq!(outcome, PipelineOutcome::ShortCircuitDone);

    let t = db::get_ticket(&pool, ticket_id).await.unwrap().unwrap();
    assert_eq!(t.state, TicketState::Done);
    assert!(t.completed_at.is_some());
    assert!(
        verifier.seen_requests().is_empty(),
        "nothing to verify against"
    );

    db.teardown().await;
}

#[tokio::test]
async fn missing_branch_parks_instead_of_verifying() {
    let db = TestDb::create().await;
    let pool = db.pool.clone();
    let project_id = create_project(&pool, Some("https://github.com/acme/widgets")).await;
    let ticket_id = verifying_ticket(&pool, project_id, None).await;

    let verifier = ScriptedVerifier::new(vec![]);
    let pr = StubPrCreator::ok();
    let outcome = run_post_execution(&pool, &verifier, &pr, ticket_id)
        .await
        .unwrap();
    assert_eq!(outcome, PipelineOutcome::NeedsReview);
    assert!(verifier.seen_requests().is_empty());

    db.teardown().await;
}

#[tokio::test]
async fn pipeline_rejects_ticket_not_in_verifying() {
    let db = TestDb::create().await;
    let pool = db.pool.clone();
    let project_id = create_project(&pool, Some("https://github.com/acme/widgets")).await;

    let build_id = Uuid::new_v4();
    let ticket = db::insert_ticket(
        &pool,
        &NewTicket::draft(Uuid::new_v4(), project_id, "still ready").with_build(build_id),
    )
    .await
    .unwrap();
    db::activate_build(&pool, build_id).await.unwrap();

    let verifier = ScriptedVerifier::new(vec![]);
    let pr = StubPrCreator::ok();
    let result = run_post_execution(&pool, &verifier, &pr, ticket.id).await;
    assert!(result.is_err(), "guard-assert must reject a ready ticket");

    db.teardown().await;
}
